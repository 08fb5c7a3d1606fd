//! Test doubles for the orchestration seams.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::browser::{BrowserFactory, BrowserSession};
use crate::handler::{TaskContext, TaskError, TaskHandler, TaskOutput};
use crate::jobs::Job;
use crate::progress::{ProgressSink, ProgressSnapshot};

/// Progress sink that drops everything. For tests that only care about
/// tracker state.
#[derive(Default)]
pub struct NullProgressSink;

#[async_trait]
impl ProgressSink for NullProgressSink {
    async fn emit(&self, _snapshot: &ProgressSnapshot) -> Result<()> {
        Ok(())
    }

    async fn finalize(&self, _job_id: Uuid) -> Result<()> {
        Ok(())
    }
}

/// Browser session where every operation succeeds and does nothing.
#[derive(Default)]
pub struct NoopBrowserSession;

#[async_trait]
impl BrowserSession for NoopBrowserSession {
    async fn navigate(&self, _url: &str) -> Result<()> {
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        Ok(())
    }

    async fn fill_one_time_code(&self, _code: &str) -> Result<()> {
        Ok(())
    }

    async fn fill_credentials(&self, _username: &str, _password: &str) -> Result<()> {
        Ok(())
    }

    async fn screenshot(&self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn current_url(&self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct NoopBrowserFactory;

#[async_trait]
impl BrowserFactory for NoopBrowserFactory {
    async fn open(&self, _job: &Job) -> Result<Arc<dyn BrowserSession>> {
        Ok(Arc::new(NoopBrowserSession))
    }
}

/// Handler that immediately succeeds with a fixed summary.
pub struct SucceedingHandler {
    job_type: &'static str,
    summary: String,
}

impl SucceedingHandler {
    pub fn new(job_type: &'static str, summary: impl Into<String>) -> Self {
        Self {
            job_type,
            summary: summary.into(),
        }
    }
}

#[async_trait]
impl TaskHandler for SucceedingHandler {
    fn job_type(&self) -> &'static str {
        self.job_type
    }

    async fn execute(&self, _ctx: &TaskContext, _job: &Job) -> Result<TaskOutput, TaskError> {
        Ok(TaskOutput {
            result_summary: Some(self.summary.clone()),
            ..Default::default()
        })
    }
}
