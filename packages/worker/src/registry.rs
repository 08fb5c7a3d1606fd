//! Handler registry mapping `job_type` strings to task handlers.
//!
//! Adding a capability to the system is a registration at worker startup,
//! not a new dispatch path.

use std::collections::HashMap;
use std::sync::Arc;

use crate::handler::TaskHandler;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its own `job_type`. Later registrations
    /// replace earlier ones for the same type.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.job_type(), handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedHandlerRegistry = Arc<HandlerRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{TaskContext, TaskError, TaskOutput};
    use crate::jobs::Job;
    use async_trait::async_trait;

    struct StubHandler;

    #[async_trait]
    impl TaskHandler for StubHandler {
        fn job_type(&self) -> &'static str {
            "apply"
        }

        async fn execute(&self, _ctx: &TaskContext, _job: &Job) -> Result<TaskOutput, TaskError> {
            Ok(TaskOutput::default())
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(StubHandler));

        assert!(registry.is_registered("apply"));
        assert!(registry.get("apply").is_some());
        assert!(!registry.is_registered("scrape"));
        assert!(registry.get("scrape").is_none());
    }

    #[test]
    fn registered_types_lists_keys() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(StubHandler));
        assert_eq!(registry.registered_types(), vec!["apply"]);
    }
}
