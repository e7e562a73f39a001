//! Image lifecycle operations: pull and prune.
//!
//! Both operations mutate the host image store and are serialized by a
//! single store lock owned by [`LifecycleController`]. The lock is held for
//! the entire operation, so a prune pass never removes an image that a
//! concurrent pull is fetching and two prune passes never race on `rmi`.
//!
//! Operations report their outcome through logs and a returned value; they
//! never fail. Callers that only need fire-and-forget semantics can ignore
//! the result.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::disk::{DiskSpaceProbe, GIB};
use crate::inventory::ImageInventory;
use crate::policy::{decide, EvictionDecision, KeepReason};
use crate::runtime::{GatewayError, RuntimeGateway};

/// Default free-space floor for pulls (50 GiB).
pub const DEFAULT_MIN_FREE_BYTES: u64 = 50 * GIB;

/// Default bound on a single pull (30 minutes).
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Tunables for lifecycle operations.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Pulls are refused when fewer bytes than this are free.
    pub min_free_bytes: u64,
    /// Pulls running longer than this are killed.
    pub pull_timeout: Duration,
    /// Path whose filesystem is checked for free space.
    pub disk_path: PathBuf,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
            disk_path: PathBuf::from("/"),
        }
    }
}

/// How a pull ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// The runtime pulled the image.
    Pulled,
    /// The runtime exited non-zero.
    RuntimeFailed { exit_code: i32, stderr: String },
    /// Not enough free disk; the runtime was not invoked.
    InsufficientDisk { available: u64, required: u64 },
    /// Free space could not be measured; the runtime was not invoked.
    DiskCheckFailed(String),
    /// The runtime could not be launched.
    ExecutionFailed(String),
    /// The pull exceeded its timeout and was killed.
    TimedOut(Duration),
}

/// How one image fared in a prune pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneItemResult {
    Removed,
    Kept(KeepReason),
    Failed(String),
}

/// Result of a prune pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneSummary {
    /// Per-image results in inventory order.
    pub items: Vec<(String, PruneItemResult)>,
}

impl PruneSummary {
    fn record(&mut self, image_id: String, result: PruneItemResult) {
        self.items.push((image_id, result));
    }

    pub fn removed(&self) -> usize {
        self.count(|r| matches!(r, PruneItemResult::Removed))
    }

    pub fn kept(&self) -> usize {
        self.count(|r| matches!(r, PruneItemResult::Kept(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|r| matches!(r, PruneItemResult::Failed(_)))
    }

    /// Ids of the images removed in this pass.
    pub fn removed_ids(&self) -> Vec<&str> {
        self.items
            .iter()
            .filter(|(_, r)| matches!(r, PruneItemResult::Removed))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    fn count(&self, pred: impl Fn(&PruneItemResult) -> bool) -> usize {
        self.items.iter().filter(|(_, r)| pred(r)).count()
    }
}

/// Owner of the image-store lock and the two mutating operations.
pub struct LifecycleController {
    gateway: Arc<dyn RuntimeGateway>,
    inventory: ImageInventory,
    disk: Arc<dyn DiskSpaceProbe>,
    settings: LifecycleSettings,
    store_lock: Mutex<()>,
}

impl LifecycleController {
    /// Create a new controller.
    pub fn new(
        gateway: Arc<dyn RuntimeGateway>,
        disk: Arc<dyn DiskSpaceProbe>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            inventory: ImageInventory::new(Arc::clone(&gateway)),
            gateway,
            disk,
            settings,
            store_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Pull `image` into the host image store.
    #[instrument(skip(self))]
    pub async fn pull(&self, image: &str) -> PullOutcome {
        let _guard = self.store_lock.lock().await;

        let required = self.settings.min_free_bytes;
        match self.disk.available_bytes(&self.settings.disk_path) {
            Ok(available) if available < required => {
                warn!(
                    available_gib = available / GIB,
                    required_gib = required / GIB,
                    "Not enough free disk space, skipping pull"
                );
                return PullOutcome::InsufficientDisk {
                    available,
                    required,
                };
            }
            Ok(_) => {}
            Err(e) => {
                error!(
                    path = %self.settings.disk_path.display(),
                    error = %e,
                    "Failed to measure free disk space, skipping pull"
                );
                return PullOutcome::DiskCheckFailed(e.to_string());
            }
        }

        info!("Pulling image");

        match self
            .gateway
            .execute(&["pull", image], Some(self.settings.pull_timeout))
            .await
        {
            Ok(output) if output.success() => {
                info!("Image pulled");
                PullOutcome::Pulled
            }
            Ok(output) => {
                error!(
                    exit_code = output.exit_code,
                    stderr = %output.stderr.trim(),
                    "Image pull failed"
                );
                PullOutcome::RuntimeFailed {
                    exit_code: output.exit_code,
                    stderr: output.stderr,
                }
            }
            Err(GatewayError::Timeout(limit)) => {
                warn!(timeout_secs = limit.as_secs(), "Image pull timed out");
                PullOutcome::TimedOut(limit)
            }
            Err(e) => {
                error!(error = %e, "Container runtime could not be launched");
                PullOutcome::ExecutionFailed(e.to_string())
            }
        }
    }

    /// Remove every image older than `threshold_days` that no container uses.
    ///
    /// A failure on one image is recorded and the pass continues.
    #[instrument(skip(self))]
    pub async fn prune(&self, threshold_days: u32) -> PruneSummary {
        let _guard = self.store_lock.lock().await;

        let now = Utc::now();
        let used = self.inventory.list_used_images().await;
        let image_ids = self.inventory.list_all_images().await;

        info!(
            images = image_ids.len(),
            used_refs = used.len(),
            "Starting prune pass"
        );

        let mut summary = PruneSummary::default();

        for image_id in image_ids {
            let record = self.inventory.inspect_image(&image_id).await;

            let result = match decide(&record, now, threshold_days, &used) {
                EvictionDecision::Keep(reason) => PruneItemResult::Kept(reason),
                EvictionDecision::Evict => self.remove_image(&image_id).await,
            };

            summary.record(image_id, result);
        }

        info!(
            removed = summary.removed(),
            kept = summary.kept(),
            errors = summary.failed(),
            "Prune pass complete"
        );

        summary
    }

    async fn remove_image(&self, image_id: &str) -> PruneItemResult {
        match self.gateway.execute(&["rmi", image_id], None).await {
            Ok(output) if output.success() => {
                info!(image_id = %image_id, "Removed image");
                PruneItemResult::Removed
            }
            Ok(output) => {
                warn!(
                    image_id = %image_id,
                    exit_code = output.exit_code,
                    stderr = %output.stderr.trim(),
                    "Failed to remove image"
                );
                PruneItemResult::Failed(format!(
                    "rmi exited with {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ))
            }
            Err(e) => {
                warn!(image_id = %image_id, error = %e, "Failed to remove image");
                PruneItemResult::Failed(e.to_string())
            }
        }
    }
}
