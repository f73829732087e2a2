use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error-taskrelay-config-1 Required environment variable not set: {var_name}")]
    EnvVarRequired { var_name: String },

    #[error("error-taskrelay-config-2 Version not available")]
    VersionNotAvailable,

    #[error("error-taskrelay-config-3 Invalid port number: {port}")]
    InvalidPortNumber { port: String },

    #[error("error-taskrelay-config-4 Invalid duration value for {var_name}: {value}")]
    InvalidDuration { var_name: String, value: String },

    #[error("error-taskrelay-config-5 Invalid value for {var_name}: {details}")]
    InvalidValue { var_name: String, details: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("error-taskrelay-storage-1 {entity} not found")]
    NotFound { entity: &'static str },

    #[error("error-taskrelay-storage-2 Query execution failed: {source}")]
    QueryFailed {
        #[source]
        source: sqlx::Error,
    },

    #[error("error-taskrelay-storage-3 Transaction failed: {source}")]
    TransactionFailed {
        #[source]
        source: sqlx::Error,
    },

    #[error("error-taskrelay-storage-4 Invalid stored data: {details}")]
    InvalidData { details: String },
}

impl StorageError {
    /// NotFound is a sentinel callers branch on; everything else is a
    /// transport or data failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("error-taskrelay-policy-1 Policy evaluation request failed: {policy}: {source}")]
    RequestFailed {
        policy: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("error-taskrelay-policy-2 Unexpected response on policy evaluation: {policy}: {status}")]
    UnexpectedStatus { policy: String, status: u16 },

    #[error("error-taskrelay-policy-3 Invalid policy evaluation URL: {url}")]
    InvalidUrl { url: String },

    #[error("error-taskrelay-policy-4 Policy evaluation failed: {policy}: {details}")]
    EvaluationFailed { policy: String, details: String },
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("error-taskrelay-cache-1 Cache request failed: {operation}: {source}")]
    RequestFailed {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("error-taskrelay-cache-2 Unexpected cache response: {operation}: {status}")]
    UnexpectedStatus { operation: &'static str, status: u16 },

    #[error("error-taskrelay-cache-3 Cache entry not found: {key}")]
    NotFound { key: String },
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error(
        "error-taskrelay-execution-1 invalid task: must define either request policy or url and method"
    )]
    InvalidTask,

    #[error("error-taskrelay-execution-2 error evaluating {stage} policy: {source}")]
    Policy {
        stage: &'static str,
        #[source]
        source: PolicyError,
    },

    #[error("error-taskrelay-execution-3 error executing http request: {source}")]
    HttpRequest {
        #[source]
        source: reqwest::Error,
    },

    #[error("error-taskrelay-execution-4 invalid http method: {method}")]
    InvalidMethod { method: String },
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("error-taskrelay-event-1 event data has invalid content type, must be application/json")]
    InvalidContentType,

    #[error("error-taskrelay-event-2 invalid event data key")]
    InvalidDataKey,

    #[error("error-taskrelay-event-3 cache key cannot be empty")]
    EmptyCacheKey,

    #[error("error-taskrelay-event-4 event task must execute a policy")]
    NotPolicyBacked,

    #[error("error-taskrelay-event-5 event payload decode failed: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
    },

    #[error("error-taskrelay-event-6 storage operation failed: {source}")]
    Storage {
        #[source]
        source: StorageError,
    },

    #[error("error-taskrelay-event-7 event bus operation failed: {operation}: {source}")]
    Bus {
        operation: &'static str,
        #[source]
        source: lapin::Error,
    },
}

impl EventError {
    /// Storage transport failures are worth a redelivery; everything else is
    /// a property of the event itself and redelivering cannot fix it.
    pub fn is_retryable(&self) -> bool {
        match self {
            EventError::Storage { source } => !source.is_not_found(),
            EventError::Bus { .. } => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("error-taskrelay-auth-1 Missing or malformed authorization header")]
    MissingBearerToken,

    #[error("error-taskrelay-auth-2 Token validation failed: {details}")]
    TokenValidationFailed { details: String },

    #[error("error-taskrelay-auth-3 JWKS fetch failed: {details}")]
    JwksFetchFailed { details: String },

    #[error("error-taskrelay-auth-4 No usable keys in JWKS document")]
    NoUsableKeys,
}
