//! Application state shared across request handlers.

use std::sync::Arc;

use plfm_networking::AllowedNetwork;

use crate::jobs::JobQueue;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    allowed_network: AllowedNetwork,
    jobs: JobQueue,
    prune_schedule: Option<String>,
}

impl AppState {
    /// Create a new application state.
    ///
    /// `prune_schedule` is the cron expression of the running prune
    /// scheduler, if one was started.
    pub fn new(
        allowed_network: AllowedNetwork,
        jobs: JobQueue,
        prune_schedule: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                allowed_network,
                jobs,
                prune_schedule,
            }),
        }
    }

    /// Callers permitted to use the image endpoints.
    pub fn allowed_network(&self) -> &AllowedNetwork {
        &self.inner.allowed_network
    }

    /// Queue for background lifecycle work.
    pub fn jobs(&self) -> &JobQueue {
        &self.inner.jobs
    }

    /// Cron expression of the active prune scheduler.
    pub fn prune_schedule(&self) -> Option<&str> {
        self.inner.prune_schedule.as_deref()
    }
}
