//! Durable job outbox: store, lock manager, dispatch and the worker loop.
//!
//! ## Design
//!
//! - Jobs are written in the same atomic write as the change they serve
//! - Claims are conditional updates keyed on `locked_by IS NULL`
//! - Crashed workers are recovered by releasing stale locks
//! - Failures back off exponentially until `max_attempts`, then `failed_at`
//!
//! Delivery is at-least-once; handlers must be idempotent.

pub mod lock;
pub mod registry;
pub mod store;
pub mod types;
pub mod worker;

pub use lock::{FailureDisposition, LockManager};
pub use registry::{HandlerError, HandlerRegistry, JobDispatcher};
pub use store::{JobStats, JobStore, OutcomeWrite};
pub use types::{
    EMAIL_SEND, ESCROW_FUND, EmailSendPayload, EscrowFundPayload, Job, JobKind, JobState, NewJob,
    PUSH_SEND, PushSendPayload, RetryPolicy,
};
pub use worker::{OutboxWorker, TickReport, WorkerConfig, WorkerHandle, WorkerStats};
