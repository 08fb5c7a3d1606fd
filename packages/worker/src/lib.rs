// GhostHands - distributed browser-automation job orchestration.
//
// Durable Postgres-backed job rows, an atomic skip-locked claim, per-job
// executors with budget and rate enforcement, progress streaming, outbound
// callbacks, and a human-in-the-loop pause/resume protocol. The browser
// automation itself lives behind the TaskHandler / BrowserSession seams.

pub mod browser;
pub mod callback;
pub mod config;
pub mod cost;
pub mod dispatch;
pub mod executor;
pub mod handler;
pub mod hitl;
pub mod ingress;
pub mod jobs;
pub mod kernel;
pub mod progress;
pub mod rate_limit;
pub mod registry;
pub mod testing;
pub mod worker;

pub use config::*;
