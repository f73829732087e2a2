//! # taskrelay
//!
//! taskrelay is a durable task and task-list scheduler. Clients submit
//! named work items ("tasks") or named compositions of work items ("task
//! lists") by reference to pre-registered templates. Each submission is
//! persisted in PostgreSQL, claimed by a worker pool, executed as either an
//! HTTP call or the evaluation of a named policy in an external policy
//! engine, optionally post-processed through response and finalizer
//! policies, stored in an external cache, and archived to history. Clients
//! read results and statuses back through the HTTP API.
//!
//! ## Architecture Overview
//!
//! - **Storage** (`storage`): PostgreSQL tables doubling as durable FIFO
//!   queues with atomic claim semantics (`FOR UPDATE SKIP LOCKED`), plus
//!   templates, history and event bindings.
//! - **Task executor** (`executor`): a polling dispatcher handing claimed
//!   tasks to a worker pool over a rendezvous-style channel; per-task retry
//!   with a cap, then eviction.
//! - **Task-list executor** (`listexecutor`): semaphore-bounded concurrent
//!   list executions; groups run in order, tasks within a group run
//!   sequentially (pipelined) or in parallel; failure propagates task →
//!   group → list.
//! - **Event injector** (`events`): consumes CloudEvents from an AMQP
//!   queue and materializes policy-backed tasks from event bindings.
//! - **Submission services** (`service`): template materialization and the
//!   result/status read path.
//! - **HTTP transport** (`http`): axum routes, JWT bearer auth, status-code
//!   mapping.
//!
//! ## Configuration
//!
//! Everything is configured through environment variables; see
//! [`config::Config`]. `DATABASE_URL`, `POLICY_ADDR` and `CACHE_ADDR` are
//! required.
//!
//! ## Error Handling
//!
//! All error strings use the format:
//! `error-taskrelay-<domain>-<number> <message>: <details>`

/// Lifecycle helpers for background tasks.
pub mod background;

/// Client for the external cache service.
pub mod cache;

/// Environment-driven configuration.
pub mod config;

/// Per-domain error types.
pub mod errors;

/// Event-driven task injector.
pub mod events;

/// Single-task executor: dispatcher and worker pool.
pub mod executor;

/// HTTP transport layer.
pub mod http;

/// Task-list executor: group orchestration.
pub mod listexecutor;

/// Process-local metrics and the Prometheus endpoint.
pub mod metrics;

/// Core data types.
pub mod model;

/// OAuth2 client-credentials token manager for outbound calls.
pub mod oauth;

/// Client for the external policy engine.
pub mod policy;

/// Shared single-task execution semantics.
pub mod runner;

/// Submission services and the read path.
pub mod service;

/// Storage traits and the PostgreSQL implementation.
pub mod storage;

#[cfg(test)]
pub(crate) mod test_helpers;
