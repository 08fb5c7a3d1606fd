//! Browser automation seam.
//!
//! The orchestration core never drives a page itself; it opens a session
//! per job, hands it to the task handler, and injects HITL resolutions
//! through it. Concrete implementations live outside this crate.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::jobs::Job;

/// One live browser session, owned by a single job execution.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Freeze automation while a human works the page.
    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Fill the visible one-time-code input and submit.
    async fn fill_one_time_code(&self, code: &str) -> Result<()>;

    /// Fill username/password fields and submit.
    async fn fill_credentials(&self, username: &str, password: &str) -> Result<()>;

    /// Capture and upload a screenshot, returning its URL if available.
    async fn screenshot(&self) -> Result<Option<String>>;

    async fn current_url(&self) -> Result<Option<String>>;

    async fn close(&self) -> Result<()>;
}

/// Opens sessions. One per worker; sessions are single-owner.
#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn open(&self, job: &Job) -> Result<Arc<dyn BrowserSession>>;
}
