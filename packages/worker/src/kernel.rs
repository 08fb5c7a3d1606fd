//! Worker kernel: every dependency constructed once at startup with
//! explicit ownership. No hidden singletons; handlers and tests receive
//! the pieces they need by handle.

use std::sync::Arc;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use sqlx::PgPool;

use crate::browser::BrowserFactory;
use crate::callback::CallbackNotifier;
use crate::config::Config;
use crate::cost::CostControl;
use crate::executor::JobExecutor;
use crate::hitl::HitlCoordinator;
use crate::ingress::Ingress;
use crate::jobs::PostgresJobStore;
use crate::progress::{DualWriteSink, ProgressSink};
use crate::rate_limit::{MemoryRateStore, RateGate};
use crate::registry::SharedHandlerRegistry;

pub struct WorkerKernel {
    pub db_pool: PgPool,
    pub store: PostgresJobStore,
    pub cost_control: CostControl,
    pub notifier: CallbackNotifier,
    pub handlers: SharedHandlerRegistry,
    pub rate_store: Arc<MemoryRateStore>,
    pub ingress: Arc<Ingress>,
    pub hitl: Arc<HitlCoordinator>,
    pub progress_sink: Arc<dyn ProgressSink>,
    pub executor: Arc<JobExecutor>,
    pub redis: Option<ConnectionManager>,
    pub nats: Option<async_nats::Client>,
}

impl WorkerKernel {
    /// Wire the full dependency graph. Redis and NATS are optional:
    /// without Redis, progress goes to the event log only; without NATS,
    /// only the LISTEN/NOTIFY dispatcher is available.
    pub async fn build(
        config: &Config,
        pool: PgPool,
        handlers: SharedHandlerRegistry,
        browser_factory: Arc<dyn BrowserFactory>,
    ) -> Result<Self> {
        let redis = match &config.redis_url {
            Some(url) => {
                let client =
                    redis::Client::open(url.as_str()).context("invalid REDIS_URL")?;
                Some(
                    ConnectionManager::new(client)
                        .await
                        .context("failed to connect to redis")?,
                )
            }
            None => None,
        };

        let nats = match &config.nats_url {
            Some(url) => Some(
                async_nats::connect(url.as_str())
                    .await
                    .context("failed to connect to NATS")?,
            ),
            None => None,
        };

        let store = PostgresJobStore::new(pool.clone());
        let cost_control = CostControl::new(pool.clone());
        let notifier = CallbackNotifier::new();
        let rate_store = Arc::new(MemoryRateStore::new());
        let ingress = Arc::new(Ingress::new(
            store.clone(),
            cost_control.clone(),
            RateGate::new(rate_store.clone()),
            nats.clone(),
        ));
        let hitl = Arc::new(HitlCoordinator::new(
            store.clone(),
            notifier.clone(),
            config.worker_id.clone(),
        ));
        let progress_sink: Arc<dyn ProgressSink> =
            Arc::new(DualWriteSink::new(store.clone(), redis.clone()));
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            cost_control.clone(),
            notifier.clone(),
            handlers.clone(),
            browser_factory,
            progress_sink.clone(),
            hitl.clone(),
            config.worker_id.clone(),
        ));

        Ok(Self {
            db_pool: pool,
            store,
            cost_control,
            notifier,
            handlers,
            rate_store,
            ingress,
            hitl,
            progress_sink,
            executor,
            redis,
            nats,
        })
    }
}
