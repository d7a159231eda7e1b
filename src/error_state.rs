//! Persistent error state
//!
//! At most one free-text error message is kept on disk and surfaced to the
//! control plane on the next ping. A fixed set of message prefixes is
//! "sticky": those survive an otherwise-clean cycle and are only cleared by
//! a cycle that resolves the underlying condition.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Message prefixes that an uneventful cycle must not clear.
pub const STICKY_PREFIXES: &[&str] = &[
    "configuration validation failed",
    "enrichment table validation failed",
    "invalid file name",
    "invalid configuration version",
];

/// Reads and writes the single persisted error message.
#[derive(Debug, Clone)]
pub struct ErrorStore {
    path: PathBuf,
}

impl ErrorStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The current persisted message, if any. An unreadable file is treated
    /// as no error rather than failing the cycle.
    pub fn current(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => {
                let s = s.trim().to_string();
                if s.is_empty() {
                    None
                } else {
                    Some(s)
                }
            }
            Err(_) => None,
        }
    }

    /// Record a message, replacing whatever was there. Last write wins.
    pub fn record(&self, message: &str) {
        warn!(error = %message, "recording persistent error");
        if let Err(e) = self.write(message) {
            warn!("failed to persist error state: {e:#}");
        }
    }

    /// Clear the message unconditionally.
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Clear the message only when it is not sticky. Called at the end of a
    /// cycle that produced no new error.
    pub fn clear_unless_sticky(&self) {
        match self.current() {
            Some(msg) if is_sticky(&msg) => {
                debug!(error = %msg, "keeping sticky error across clean cycle");
            }
            Some(_) => {
                if let Err(e) = self.clear() {
                    warn!("failed to clear error state: {e:#}");
                }
            }
            None => {}
        }
    }

    fn write(&self, message: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&self.path, message)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

/// Whether a message belongs to one of the sticky classes.
pub fn is_sticky(message: &str) -> bool {
    STICKY_PREFIXES.iter().any(|p| message.starts_with(p))
}
