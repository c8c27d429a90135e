//! # callflow-infra
//!
//! Shared infrastructure for the callflow stack. This crate carries the
//! concerns every other callflow crate leans on:
//!
//! - **[`events`]**: a typed in-process event bus with an audit tap,
//!   fanning raw PBX events out to the IVR engine and the status
//!   reconciler without coupling them to the telephony session.
//! - **[`kv`]**: the shared, TTL'd key-value state abstraction that lets
//!   any process instance resume in-flight calls after a restart.
//! - **[`retry`]**: a bounded fixed-delay retry combinator for transient
//!   control-protocol failures.
//! - **[`logging`]**: tracing subscriber setup shared by binaries and
//!   integration tests.
//!
//! Nothing in this crate knows about IVR trees, operators, or queues;
//! it is plumbing only.

pub mod error;
pub mod events;
pub mod kv;
pub mod logging;
pub mod retry;

pub use error::{InfraError, Result};
pub use events::{AuditRecord, EventBus};
pub use kv::{get_json, put_json, CachedKvStore, KvStore, MemoryKvStore};
pub use logging::{setup_logging, LoggingConfig};
pub use retry::{retry_fixed, RetryOutcome};
