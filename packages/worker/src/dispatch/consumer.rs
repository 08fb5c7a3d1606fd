//! Durable-queue dispatcher variant.
//!
//! Subscribes to one NATS subject per job type. Delivery is at-least-once,
//! so every message goes through the store's conditional claim: a
//! redelivered or already-claimed job id finds the row no longer
//! `pending` and is dropped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ActiveJobs;
use crate::executor::JobExecutor;
use crate::jobs::PostgresJobStore;

/// Subject prefix; the full subject is `ghosthands.jobs.{job_type}`.
pub const SUBJECT_PREFIX: &str = "ghosthands.jobs";

pub fn subject_for(job_type: &str) -> String {
    format!("{SUBJECT_PREFIX}.{job_type}")
}

/// Wire shape published on insert and consumed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: Uuid,
    pub job_type: String,
}

pub struct QueueDispatcher {
    store: PostgresJobStore,
    executor: Arc<JobExecutor>,
    client: async_nats::Client,
    job_types: Vec<String>,
    worker_id: String,
    max_concurrent: usize,
    active: Arc<ActiveJobs>,
}

impl QueueDispatcher {
    pub fn new(
        store: PostgresJobStore,
        executor: Arc<JobExecutor>,
        client: async_nats::Client,
        job_types: Vec<String>,
        worker_id: String,
        max_concurrent: usize,
        active: Arc<ActiveJobs>,
    ) -> Self {
        Self {
            store,
            executor,
            client,
            job_types,
            worker_id,
            max_concurrent,
            active,
        }
    }

    /// Consume queue messages until `shutdown` fires.
    pub async fn run(
        &self,
        shutdown: CancellationToken,
        force_abort: CancellationToken,
    ) -> Result<()> {
        let mut subscriptions = Vec::with_capacity(self.job_types.len());
        for job_type in &self.job_types {
            let subject = subject_for(job_type);
            subscriptions.push(self.client.subscribe(subject.clone()).await?);
            info!(worker_id = %self.worker_id, subject, "queue consumer subscribed");
        }
        let mut messages = futures::stream::select_all(subscriptions);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = messages.next() => {
                    let Some(message) = message else { break };
                    let parsed: QueueMessage = match serde_json::from_slice(&message.payload) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            warn!(subject = %message.subject, error = %e, "invalid queue message");
                            continue;
                        }
                    };
                    self.handle(parsed, &shutdown, &force_abort).await;
                }
            }
        }

        info!(worker_id = %self.worker_id, "queue consumer stopped");
        Ok(())
    }

    async fn handle(
        &self,
        message: QueueMessage,
        shutdown: &CancellationToken,
        force_abort: &CancellationToken,
    ) {
        // Hold the message until a slot frees up; the conditional claim
        // below keeps waiting harmless if someone else takes the job.
        while self.active.count() >= self.max_concurrent {
            if shutdown.is_cancelled() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let claimed = match self
            .store
            .claim_specific(message.job_id, &self.worker_id)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => {
                // Redelivery, another worker's claim, or not yet due.
                debug!(job_id = %message.job_id, "queue message not claimable, dropping");
                return;
            }
            Err(e) => {
                warn!(job_id = %message.job_id, error = %e, "claim from queue message failed");
                return;
            }
        };

        let job_id = claimed.id;
        self.active.begin(job_id);
        let executor = self.executor.clone();
        let active = self.active.clone();
        let force_abort = force_abort.clone();
        tokio::spawn(async move {
            executor.execute(claimed, &force_abort).await;
            active.end(job_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_keyed_by_job_type() {
        assert_eq!(subject_for("apply"), "ghosthands.jobs.apply");
        assert_eq!(subject_for("smart_apply"), "ghosthands.jobs.smart_apply");
    }

    #[test]
    fn queue_message_round_trips() {
        let message = QueueMessage {
            job_id: Uuid::new_v4(),
            job_type: "scrape".to_string(),
        };
        let bytes = serde_json::to_vec(&message).unwrap();
        let parsed: QueueMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.job_id, message.job_id);
        assert_eq!(parsed.job_type, "scrape");
    }
}
