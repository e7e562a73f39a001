//! plfm-vt Image Controller Library
//!
//! The image controller runs on each host next to the container runtime and
//! exposes two privileged operations over HTTP: pulling an image into the
//! node's image store and pruning images that are old and unused.
//!
//! ## Architecture
//!
//! ```text
//! HTTP API ──► JobQueue ──► JobWorker ─┐
//!                                      ├──► LifecycleController ──► RuntimeGateway (crictl)
//! PruneScheduler (cron) ───────────────┘        │
//!                                               ├── ImageInventory
//!                                               ├── Eviction policy
//!                                               └── DiskSpaceProbe
//! ```
//!
//! All image-store mutation goes through `LifecycleController`, which
//! serializes pulls and prunes behind a single lock.
//!
//! ## Modules
//!
//! - `api`: HTTP routes and request validation
//! - `lifecycle`: pull and prune operations
//! - `inventory`: image and container queries
//! - `policy`: eviction decision
//! - `runtime`: crictl command gateway
//! - `scheduler`: cron-driven prunes

pub mod api;
pub mod config;
pub mod disk;
pub mod inventory;
pub mod jobs;
pub mod lifecycle;
pub mod policy;
pub mod reference;
pub mod runtime;
pub mod scheduler;
pub mod state;

// Re-export commonly used types
pub use jobs::{Job, JobQueue, JobWorker};
pub use lifecycle::{
    LifecycleController, LifecycleSettings, PruneItemResult, PruneSummary, PullOutcome,
};
pub use policy::{decide, EvictionDecision, ImageRecord, KeepReason, UsedImageSet};
pub use runtime::{CommandOutput, CrictlGateway, MockGateway, RuntimeGateway};
