//! Application state shared across request handlers.

use std::sync::Arc;

use crate::orchestrator::Orchestrator;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    orchestrator: Arc<Orchestrator>,
    task_token: Option<String>,
}

impl AppState {
    /// Create a new application state.
    ///
    /// Without a `task_token` every task endpoint call is rejected.
    pub fn new(orchestrator: Arc<Orchestrator>, task_token: Option<String>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                orchestrator,
                task_token,
            }),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    /// Secret the task endpoints require.
    pub fn task_token(&self) -> Option<&str> {
        self.inner.task_token.as_deref()
    }
}
