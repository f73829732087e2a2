//! Submission services: validate input, materialize instances from
//! templates, enqueue them, and serve the result/status read path.

use crate::errors::StorageError;
use thiserror::Error;

pub mod task;
pub mod tasklist;

pub use task::TaskService;
pub use tasklist::TaskListService;

/// Error kinds surfaced to the transport layer. The HTTP layer maps these
/// onto status codes; everything the services return flows through here.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("error-taskrelay-service-1 Bad request: {0}")]
    BadRequest(String),

    #[error("error-taskrelay-service-2 Not found: {0}")]
    NotFound(String),

    #[error("error-taskrelay-service-3 Internal error: {0}")]
    Internal(String),

    #[error("error-taskrelay-service-4 {0}")]
    Unknown(#[from] anyhow::Error),
}

impl ServiceError {
    /// Map a storage failure, translating the NotFound sentinel into the
    /// given message and wrapping everything else as Unknown.
    pub(crate) fn from_storage(err: StorageError, not_found_message: &str) -> Self {
        if err.is_not_found() {
            ServiceError::NotFound(not_found_message.to_string())
        } else {
            ServiceError::Unknown(err.into())
        }
    }
}
