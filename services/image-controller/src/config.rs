//! Configuration for the image controller.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use plfm_networking::{AllowedNetwork, NetworkError};

use crate::disk::GIB;
use crate::lifecycle::{LifecycleSettings, DEFAULT_MIN_FREE_BYTES, DEFAULT_PULL_TIMEOUT};

/// Default age threshold for prunes, in days.
pub const DEFAULT_PRUNE_DAYS: u32 = 14;

/// Recurring prune configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneJobConfig {
    /// Cron expression; `None` disables the recurring job.
    pub cron_expression: Option<String>,

    /// Age threshold for scheduled prunes.
    pub age_threshold_days: u32,
}

/// A setting whose value was rejected in favor of its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFallback {
    pub key: String,
    pub value: String,
    pub default: String,
}

impl std::fmt::Display for ConfigFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid {}={:?}, using default {}",
            self.key, self.value, self.default
        )
    }
}

/// Image controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Callers permitted to use the API.
    pub allowed_network: AllowedNetwork,

    /// Why the configured allowed network was rejected, if it was.
    pub allowed_network_error: Option<NetworkError>,

    /// Recurring prune job.
    pub prune: PruneJobConfig,

    /// Where the host filesystem is mounted inside the container.
    pub host_root: PathBuf,

    /// Whether this process runs inside a container.
    pub in_container: bool,

    /// Pulls are refused below this many free bytes.
    pub min_free_bytes: u64,

    /// Bound on a single pull.
    pub pull_timeout: Duration,

    /// Settings that fell back to their defaults. Loading happens before
    /// logging is set up, so these are reported by the caller.
    pub fallbacks: Vec<ConfigFallback>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps variable names to values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("GHOST_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8000".to_string())
            .parse()
            .context("GHOST_LISTEN_ADDR must be a socket address (e.g. 0.0.0.0:8000).")?;

        let mut fallbacks = Vec::new();

        let log_level = lookup("GHOST_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let cidr = lookup("GHOST_ALLOWED_NETWORK").or_else(|| lookup("ALLOWED_NETWORK"));
        let (allowed_network, allowed_network_error) = AllowedNetwork::from_config(cidr.as_deref());

        let cron_expression = lookup("GHOST_PRUNE_SCHEDULE")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let age_threshold_days =
            parse_or_default(&lookup, &mut fallbacks, "GHOST_PRUNE_DAYS", DEFAULT_PRUNE_DAYS);

        let host_root = lookup("GHOST_HOST_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/host"));

        let in_container = match lookup("GHOST_IN_CONTAINER") {
            Some(v) => v == "1" || v.to_lowercase() == "true",
            None => detect_container(Path::new("/")),
        };

        let min_free_gib = parse_or_default(
            &lookup,
            &mut fallbacks,
            "GHOST_MIN_FREE_DISK_GIB",
            DEFAULT_MIN_FREE_BYTES / GIB,
        );

        let pull_timeout_secs = parse_or_default(
            &lookup,
            &mut fallbacks,
            "GHOST_PULL_TIMEOUT_SECS",
            DEFAULT_PULL_TIMEOUT.as_secs(),
        );

        Ok(Self {
            listen_addr,
            log_level,
            allowed_network,
            allowed_network_error,
            prune: PruneJobConfig {
                cron_expression,
                age_threshold_days,
            },
            host_root,
            in_container,
            min_free_bytes: min_free_gib.saturating_mul(GIB),
            pull_timeout: Duration::from_secs(pull_timeout_secs),
            fallbacks,
        })
    }

    /// Root of the host filesystem as seen from this process.
    pub fn effective_host_root(&self) -> PathBuf {
        if self.in_container {
            self.host_root.clone()
        } else {
            PathBuf::from("/")
        }
    }

    /// Settings for the lifecycle controller.
    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            min_free_bytes: self.min_free_bytes,
            pull_timeout: self.pull_timeout,
            disk_path: self.effective_host_root(),
        }
    }
}

fn parse_or_default<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    fallbacks: &mut Vec<ConfigFallback>,
    key: &str,
    default: T,
) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            fallbacks.push(ConfigFallback {
                key: key.to_string(),
                value: raw,
                default: default.to_string(),
            });
            default
        }),
    }
}

/// Detect whether the filesystem rooted at `root` belongs to a container.
pub fn detect_container(root: &Path) -> bool {
    if root.join(".dockerenv").exists() || root.join("run/.containerenv").exists() {
        return true;
    }

    std::fs::read_to_string(root.join("proc/1/cgroup"))
        .map(|cgroup| {
            ["docker", "kubepods", "containerd"]
                .iter()
                .any(|marker| cgroup.contains(marker))
        })
        .unwrap_or(false)
}
