//! Job pickup.
//!
//! Two interchangeable dispatchers front the same [`JobExecutor`]:
//! LISTEN/NOTIFY with a fallback poll (the default), and a durable-queue
//! consumer for deployments that route work through NATS subjects. Both
//! respect the worker's concurrency cap and claim through the store's
//! conditional updates, so duplicate wake-ups and redelivered messages are
//! no-ops.
//!
//! [`JobExecutor`]: crate::executor::JobExecutor

mod consumer;
mod notify;

pub use consumer::{subject_for, QueueDispatcher, QueueMessage};
pub use notify::{DispatcherConfig, NotifyDispatcher, JOBS_CHANNEL};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use uuid::Uuid;

/// Shared occupancy state: how many executions are in flight and which job
/// currently owns the (conventionally single) slot. Read by the worker
/// heartbeat and the status endpoint.
#[derive(Default)]
pub struct ActiveJobs {
    count: AtomicUsize,
    current: Mutex<Option<Uuid>>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, job_id: Uuid) {
        self.count.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().expect("active jobs poisoned") = Some(job_id);
    }

    pub fn end(&self, job_id: Uuid) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        let mut current = self.current.lock().expect("active jobs poisoned");
        if *current == Some(job_id) {
            *current = None;
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn current_job(&self) -> Option<Uuid> {
        *self.current.lock().expect("active jobs poisoned")
    }

    pub fn is_idle(&self) -> bool {
        self.count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupancy_tracks_begin_and_end() {
        let active = ActiveJobs::new();
        assert!(active.is_idle());

        let job_id = Uuid::new_v4();
        active.begin(job_id);
        assert_eq!(active.count(), 1);
        assert_eq!(active.current_job(), Some(job_id));

        active.end(job_id);
        assert!(active.is_idle());
        assert_eq!(active.current_job(), None);
    }
}
