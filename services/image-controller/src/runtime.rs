//! Container runtime command gateway.
//!
//! All image-store access goes through `crictl` on the host. The gateway
//! abstracts how that binary is located and launched:
//! - Probing the host layout for the binary path on every call
//! - Wrapping commands in `chroot` when the controller runs in a container
//! - Bounding calls with an optional timeout
//!
//! Non-zero exit codes are returned to the caller. Only a failure to launch
//! or a timeout is an error.
//!
//! A mock implementation is provided for testing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// crictl installed through the nix system profile.
pub const NIX_CRICTL_PATH: &str = "/nix/var/nix/profiles/system/sw/bin/crictl";

/// crictl installed by the distribution package manager.
pub const DEFAULT_CRICTL_PATH: &str = "/usr/bin/crictl";

/// Result of one runtime command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code (-1 when killed by a signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// A successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed output with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors from the runtime gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The process could not be started (binary missing, chroot failed, permission denied).
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process did not finish within its timeout and was killed.
    #[error("command timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Container runtime interface.
#[async_trait]
pub trait RuntimeGateway: Send + Sync {
    /// Run a runtime subcommand, optionally bounded by `timeout`.
    async fn execute(
        &self,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, GatewayError>;
}

/// Gateway that runs `crictl` on the host.
#[derive(Debug, Clone)]
pub struct CrictlGateway {
    /// Where the host filesystem is mounted when running in a container.
    host_root: PathBuf,
    /// Whether commands must be wrapped in `chroot <host_root>`.
    in_container: bool,
}

impl CrictlGateway {
    /// Create a new gateway.
    pub fn new(host_root: impl Into<PathBuf>, in_container: bool) -> Self {
        Self {
            host_root: host_root.into(),
            in_container,
        }
    }

    /// Root of the host filesystem as seen from this process.
    pub fn probe_root(&self) -> &Path {
        if self.in_container {
            &self.host_root
        } else {
            Path::new("/")
        }
    }

    /// Locate crictl on the host.
    ///
    /// The returned path is relative to the host root, so it is valid both
    /// inside the chroot and when running directly on the host.
    pub fn crictl_path(&self) -> &'static str {
        if self.probe_root().join("nix").exists() {
            NIX_CRICTL_PATH
        } else {
            DEFAULT_CRICTL_PATH
        }
    }

    /// Build the program and argument vector for a subcommand.
    pub fn command_line(&self, args: &[&str]) -> (String, Vec<String>) {
        let crictl = self.crictl_path();
        let rest = args.iter().map(|a| a.to_string());

        if self.in_container {
            let argv = [
                self.host_root.to_string_lossy().into_owned(),
                crictl.to_string(),
            ]
            .into_iter()
            .chain(rest)
            .collect();
            ("chroot".to_string(), argv)
        } else {
            (crictl.to_string(), rest.collect())
        }
    }
}

#[async_trait]
impl RuntimeGateway for CrictlGateway {
    async fn execute(
        &self,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, GatewayError> {
        let (program, argv) = self.command_line(args);

        let child = Command::new(&program)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GatewayError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    debug!(program = %program, args = ?argv, "Runtime command timed out");
                    GatewayError::Timeout(limit)
                })?,
            None => child.wait_with_output().await,
        };

        let output = waited.map_err(|source| GatewayError::Spawn {
            program: program.clone(),
            source,
        })?;

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(
            program = %program,
            args = ?argv,
            exit_code = result.exit_code,
            stdout = %result.stdout.trim(),
            stderr = %result.stderr.trim(),
            "Runtime command finished"
        );

        Ok(result)
    }
}

// =============================================================================
// Mock gateway
// =============================================================================

/// Failure a [`MockGateway`] can be scripted to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Behave as if the binary is missing.
    Spawn,
    /// Behave as if the command timed out.
    Timeout,
}

/// Scripted gateway for testing.
///
/// Responses are keyed by the space-joined argument list. Unscripted
/// commands succeed with empty output. Every call is recorded, and the peak
/// number of concurrently executing calls is tracked.
#[derive(Debug, Default)]
pub struct MockGateway {
    responses: Mutex<HashMap<String, Result<CommandOutput, MockFailure>>>,
    calls: Mutex<Vec<Vec<String>>>,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockGateway {
    /// Create a new mock gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call take `delay` before returning.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Script the output for a command (e.g. `"images -q"`).
    pub fn respond(&self, command: &str, output: CommandOutput) -> &Self {
        self.lock_responses().insert(command.to_string(), Ok(output));
        self
    }

    /// Script a failure for a command.
    pub fn fail(&self, command: &str, failure: MockFailure) -> &Self {
        self.lock_responses()
            .insert(command.to_string(), Err(failure));
        self
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Recorded calls whose first argument is `subcommand`.
    pub fn calls_to(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.first().map(String::as_str) == Some(subcommand))
            .collect()
    }

    /// Peak number of calls that were executing at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn lock_responses(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Result<CommandOutput, MockFailure>>> {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RuntimeGateway for MockGateway {
    async fn execute(
        &self,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, GatewayError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(args.iter().map(|a| a.to_string()).collect());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self.lock_responses().get(&args.join(" ")).cloned();
        self.active.fetch_sub(1, Ordering::SeqCst);

        match scripted {
            None => Ok(CommandOutput::ok("")),
            Some(Ok(output)) => Ok(output),
            Some(Err(MockFailure::Spawn)) => Err(GatewayError::Spawn {
                program: "crictl".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "mock: not found"),
            }),
            Some(Err(MockFailure::Timeout)) => Err(GatewayError::Timeout(
                timeout.unwrap_or(Duration::from_secs(0)),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_host_command_line_without_nix() {
        let root = TempDir::new().unwrap();
        let gateway = CrictlGateway::new(root.path(), true);

        let (program, argv) = gateway.command_line(&["images", "-q"]);
        assert_eq!(program, "chroot");
        assert_eq!(
            argv,
            vec![
                root.path().to_string_lossy().into_owned(),
                DEFAULT_CRICTL_PATH.to_string(),
                "images".to_string(),
                "-q".to_string(),
            ]
        );
    }

    #[test]
    fn test_nix_layout_is_probed_per_call() {
        let root = TempDir::new().unwrap();
        let gateway = CrictlGateway::new(root.path(), true);

        assert_eq!(gateway.crictl_path(), DEFAULT_CRICTL_PATH);

        std::fs::create_dir(root.path().join("nix")).unwrap();
        assert_eq!(gateway.crictl_path(), NIX_CRICTL_PATH);

        let (_, argv) = gateway.command_line(&["rmi", "sha256:abc"]);
        assert_eq!(argv[1], NIX_CRICTL_PATH);
    }

    #[test]
    fn test_direct_command_line_outside_container() {
        let gateway = CrictlGateway::new("/host", false);
        let (program, argv) = gateway.command_line(&["ps", "-a", "-q"]);

        assert_ne!(program, "chroot");
        assert!(program.ends_with("crictl"));
        assert_eq!(argv, vec!["ps", "-a", "-q"]);
        assert_eq!(gateway.probe_root(), Path::new("/"));
    }

    #[tokio::test]
    async fn test_missing_chroot_target_is_launch_or_exit_failure() {
        // chroot into a directory without crictl either fails to launch
        // (no chroot binary) or exits non-zero; it never panics.
        let root = TempDir::new().unwrap();
        let gateway = CrictlGateway::new(root.path(), true);

        match gateway.execute(&["images", "-q"], None).await {
            Ok(output) => assert!(!output.success()),
            Err(e) => assert!(matches!(e, GatewayError::Spawn { .. })),
        }
    }

    #[tokio::test]
    async fn test_mock_gateway_scripting() {
        let gateway = MockGateway::new();
        gateway
            .respond("images -q", CommandOutput::ok("sha256:a\n"))
            .fail("rmi sha256:a", MockFailure::Spawn);

        let out = gateway.execute(&["images", "-q"], None).await.unwrap();
        assert_eq!(out.stdout, "sha256:a\n");

        let unscripted = gateway.execute(&["ps", "-a", "-q"], None).await.unwrap();
        assert!(unscripted.success());
        assert!(unscripted.stdout.is_empty());

        assert!(gateway.execute(&["rmi", "sha256:a"], None).await.is_err());
        assert_eq!(gateway.calls().len(), 3);
        assert_eq!(gateway.calls_to("rmi").len(), 1);
        assert_eq!(gateway.max_concurrency(), 1);
    }
}
