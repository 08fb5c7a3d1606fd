//! Worker process: registry row, runtime lifecycle, HTTP surface.

mod http;
mod registry;
mod runtime;

pub use http::{router, AppState};
pub use registry::{WorkerRegistry, WorkerRow, WorkerStatus};
pub use runtime::{PoolReport, RuntimeConfig, WorkerRuntime, WorkerStatusReport};
