//! External collaborator seams
//!
//! The data-plane engine is consumed in exactly two narrow ways: as a
//! subprocess validator over candidate configuration files, and as a reload
//! target signaled through its pid file. The certificate issuance tool is a
//! third collaborator reached the same way. All filesystem staging stays on
//! this side of these traits so the collaborators are swappable in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Validates a candidate configuration file set.
#[async_trait]
pub trait PipelineValidator: Send + Sync {
    /// Run the external validator over the given paths/globs.
    ///
    /// Returns `None` when the set is valid, or the validator's diagnostic
    /// text when it is not. `Err` means the validator itself could not run.
    async fn validate(&self, paths: &[PathBuf]) -> Result<Option<String>>;

    /// Version string of the engine binary, if it can be determined.
    async fn engine_version(&self) -> Option<String>;
}

/// Signals long-running collaborator processes.
pub trait ProcessControl: Send + Sync {
    /// Ask the data-plane engine to reload its configuration in place.
    fn reload_pipeline(&self) -> Result<()>;

    /// Ask the certificate issuance tool to restart and (re)issue.
    fn restart_cert_issuer(&self) -> Result<()>;
}

/// Production validator shelling out to the engine binary.
pub struct EngineValidator {
    binary: PathBuf,
}

impl EngineValidator {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl PipelineValidator for EngineValidator {
    async fn validate(&self, paths: &[PathBuf]) -> Result<Option<String>> {
        let output = Command::new(&self.binary)
            .arg("validate")
            .arg("--no-environment")
            .args(paths)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.binary.display()))?;

        if output.status.success() {
            debug!("validator accepted {} path(s)", paths.len());
            return Ok(None);
        }

        let mut diagnostic = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            if !diagnostic.is_empty() {
                diagnostic.push('\n');
            }
            diagnostic.push_str(stderr);
        }
        Ok(Some(diagnostic))
    }

    async fn engine_version(&self) -> Option<String> {
        let output = Command::new(&self.binary).arg("--version").output().await.ok()?;
        if !output.status.success() {
            return None;
        }
        // "vector 0.39.0 (x86_64-unknown-linux-gnu ...)" -> "0.39.0"
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.split_whitespace().nth(1).map(|v| v.to_string())
    }
}

/// Production process control using pid files and POSIX signals.
pub struct SignalProcessControl {
    engine_pid_file: PathBuf,
    issuer_pid_file: PathBuf,
}

impl SignalProcessControl {
    pub fn new(engine_pid_file: PathBuf, issuer_pid_file: PathBuf) -> Self {
        Self {
            engine_pid_file,
            issuer_pid_file,
        }
    }
}

impl ProcessControl for SignalProcessControl {
    fn reload_pipeline(&self) -> Result<()> {
        let pid = read_pid(&self.engine_pid_file)?;
        info!(pid, "signaling pipeline engine to reload");
        send_signal(pid, nix::sys::signal::Signal::SIGHUP)
    }

    fn restart_cert_issuer(&self) -> Result<()> {
        // The supervisor restarts the issuer after termination.
        match read_pid(&self.issuer_pid_file) {
            Ok(pid) => {
                info!(pid, "requesting certificate issuer restart");
                send_signal(pid, nix::sys::signal::Signal::SIGTERM)
            }
            Err(e) => {
                warn!("certificate issuer not running yet: {e:#}");
                Ok(())
            }
        }
    }
}

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    nix::sys::signal::kill(pid, signal)
        .with_context(|| format!("failed to send {signal} to pid {pid}"))
}

fn read_pid(path: &Path) -> Result<u32> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pid file {}", path.display()))?;
    contents
        .trim()
        .parse::<u32>()
        .with_context(|| format!("malformed pid file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn read_pid_parses_trimmed_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("engine.pid");
        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid(&path).unwrap(), 4242);
    }

    #[test]
    fn read_pid_rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("engine.pid");
        std::fs::write(&path, "not-a-pid").unwrap();
        assert!(read_pid(&path).is_err());
        assert!(read_pid(&tmp.path().join("missing.pid")).is_err());
    }

    #[tokio::test]
    async fn engine_validator_reports_missing_binary() {
        let validator = EngineValidator::new(PathBuf::from("/nonexistent/engine-binary"));
        let result = validator.validate(&[PathBuf::from("/tmp/x.yaml")]).await;
        assert!(result.is_err());
        assert_eq!(validator.engine_version().await, None);
    }

    #[tokio::test]
    async fn engine_validator_collects_diagnostics() {
        // `false` exits non-zero with no output: invalid, empty diagnostic.
        let validator = EngineValidator::new(PathBuf::from("false"));
        let diag = validator
            .validate(&[PathBuf::from("/tmp/x.yaml")])
            .await
            .unwrap();
        assert_eq!(diag, Some(String::new()));
    }
}
