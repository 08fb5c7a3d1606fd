//! Durable job table, audit log, and the atomic claim protocol.
//!
//! # Architecture
//!
//! ```text
//! Ingress writes a pending row (+ NOTIFY)
//!     │
//!     └─► PostgresJobStore.claim_next()       one statement, skip-locked
//!             └─► pending → queued, worker_id stamped
//!                     └─► JobExecutor drives queued → terminal
//! ```
//!
//! Status changes are conditional updates; a rejected CAS means another
//! actor (cancel, recovery) got there first and is not an error.

pub mod events;
mod job;
mod store;

pub use events::{event_type, JobEventRow, JobLifecycleEvent};
pub use job::{transition_allowed, ErrorCode, Job, JobStatus};
pub use store::{InsertOutcome, PostgresJobStore, StatusPatch};
