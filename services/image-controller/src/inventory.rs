//! Image inventory queries.
//!
//! Reads the host image store through the runtime gateway. Every query is
//! best-effort: failures are logged and produce empty or partial results,
//! never errors, so a prune pass can always proceed with what it has.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::policy::{ImageRecord, UsedImageSet};
use crate::runtime::RuntimeGateway;

/// Read-only view of the host image store.
#[derive(Clone)]
pub struct ImageInventory {
    gateway: Arc<dyn RuntimeGateway>,
}

impl ImageInventory {
    /// Create a new inventory over `gateway`.
    pub fn new(gateway: Arc<dyn RuntimeGateway>) -> Self {
        Self { gateway }
    }

    /// List the ids of all images in the store.
    pub async fn list_all_images(&self) -> Vec<String> {
        match self.gateway.execute(&["images", "-q"], None).await {
            Ok(output) if output.success() => parse_id_list(&output.stdout),
            Ok(output) => {
                warn!(
                    exit_code = output.exit_code,
                    stderr = %output.stderr.trim(),
                    "Listing images failed"
                );
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "Listing images failed");
                Vec::new()
            }
        }
    }

    /// Collect the image references of every container, running or stopped.
    ///
    /// Containers that cannot be inspected are skipped.
    pub async fn list_used_images(&self) -> UsedImageSet {
        let mut used = UsedImageSet::new();

        let container_ids = match self.gateway.execute(&["ps", "-a", "-q"], None).await {
            Ok(output) if output.success() => parse_id_list(&output.stdout),
            Ok(output) => {
                warn!(
                    exit_code = output.exit_code,
                    stderr = %output.stderr.trim(),
                    "Listing containers failed"
                );
                return used;
            }
            Err(e) => {
                warn!(error = %e, "Listing containers failed");
                return used;
            }
        };

        for container_id in container_ids {
            let output = match self
                .gateway
                .execute(&["inspect", &container_id], None)
                .await
            {
                Ok(output) if output.success() => output,
                Ok(output) => {
                    warn!(
                        container_id = %container_id,
                        exit_code = output.exit_code,
                        stderr = %output.stderr.trim(),
                        "Inspecting container failed, skipping"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        container_id = %container_id,
                        error = %e,
                        "Inspecting container failed, skipping"
                    );
                    continue;
                }
            };

            let refs = parse_container_image_refs(&output.stdout);
            if refs.is_empty() {
                warn!(container_id = %container_id, "Container has no image reference, skipping");
                continue;
            }

            for image_ref in refs {
                debug!(container_id = %container_id, image_ref = %image_ref, "Image in use");
                used.insert(image_ref);
            }
        }

        used
    }

    /// Creation time of an image, or `None` if it cannot be determined.
    pub async fn get_image_created(&self, image_id: &str) -> Option<DateTime<Utc>> {
        self.inspect_image(image_id).await.created_at
    }

    /// Inspect one image.
    ///
    /// Inspection failures yield a record with unknown age, which the
    /// eviction policy always keeps.
    pub async fn inspect_image(&self, image_id: &str) -> ImageRecord {
        let output = match self.gateway.execute(&["inspecti", image_id], None).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                warn!(
                    image_id = %image_id,
                    exit_code = output.exit_code,
                    stderr = %output.stderr.trim(),
                    "Inspecting image failed"
                );
                return ImageRecord::new(image_id, None);
            }
            Err(e) => {
                warn!(image_id = %image_id, error = %e, "Inspecting image failed");
                return ImageRecord::new(image_id, None);
            }
        };

        let record = parse_image_record(image_id, &output.stdout);
        if record.created_at.is_none() {
            warn!(image_id = %image_id, "Image has no parsable creation time");
        }
        record
    }
}

/// Parse newline-separated ids, dropping blanks and duplicates.
pub fn parse_id_list(stdout: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !ids.iter().any(|id| id == line) {
            ids.push(line.to_string());
        }
    }
    ids
}

/// Extract the image references from `crictl inspect` output.
///
/// The resolved reference (`status.imageRef`) comes first, followed by the
/// configured one (`status.image.image`) when it differs.
pub fn parse_container_image_refs(json: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<Value>(json) else {
        return Vec::new();
    };

    let status = &value["status"];
    let mut refs = Vec::new();

    for candidate in [&status["imageRef"], &status["image"]["image"]] {
        if let Some(s) = candidate.as_str().map(str::trim).filter(|s| !s.is_empty()) {
            if !refs.iter().any(|r| r == s) {
                refs.push(s.to_string());
            }
        }
    }

    refs
}

/// Build an [`ImageRecord`] from `crictl inspecti` output.
pub fn parse_image_record(image_id: &str, json: &str) -> ImageRecord {
    let Ok(value) = serde_json::from_str::<Value>(json) else {
        return ImageRecord::new(image_id, None);
    };

    let created_at = value["info"]["imageSpec"]["created"]
        .as_str()
        .and_then(parse_timestamp);

    let references = ["repoTags", "repoDigests"]
        .iter()
        .filter_map(|key| value["status"][*key].as_array())
        .flatten()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();

    ImageRecord::new(image_id, created_at).with_references(references)
}

/// Parse an RFC 3339 timestamp, normalized to microsecond precision.
///
/// Any fractional-second width is accepted; a trailing `Z` means UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc).trunc_subsecs(6))
}
