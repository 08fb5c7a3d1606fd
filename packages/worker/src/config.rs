use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Which pickup path this worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatcherMode {
    /// LISTEN/NOTIFY with a fallback poll (the default).
    #[default]
    Notify,
    /// Durable NATS queue consumer.
    Queue,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub nats_url: Option<String>,
    pub port: u16,
    pub worker_id: String,
    pub dispatcher: DispatcherMode,
    pub stuck_job_threshold_secs: u64,
    pub drain_grace_secs: u64,
    pub lifecycle_hook_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let dispatcher = match env::var("GH_DISPATCHER").as_deref() {
            Ok("queue") => DispatcherMode::Queue,
            _ => DispatcherMode::Notify,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL").ok(),
            nats_url: env::var("NATS_URL").ok(),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            worker_id: env::var("WORKER_ID")
                .unwrap_or_else(|_| format!("worker-{}", uuid::Uuid::new_v4())),
            dispatcher,
            stuck_job_threshold_secs: env::var("STUCK_JOB_THRESHOLD_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            drain_grace_secs: env::var("DRAIN_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            lifecycle_hook_url: env::var("LIFECYCLE_HOOK_URL").ok(),
        })
    }
}
