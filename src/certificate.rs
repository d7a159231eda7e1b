//! Certificate-readiness gate
//!
//! Tracks the desired TLS domain announced by the control plane. When the
//! domain changes mid-cycle and no certificate exists for it yet, promotion
//! of the accompanying pipeline configuration must be deferred so the
//! control plane resends that version once issuance has caught up.

use crate::validator::ProcessControl;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{debug, info};

pub struct CertificateGate {
    domain_file: PathBuf,
    cert_dir: PathBuf,
    just_changed: bool,
}

impl CertificateGate {
    pub fn new(domain_file: PathBuf, cert_dir: PathBuf) -> Self {
        Self {
            domain_file,
            cert_dir,
            just_changed: false,
        }
    }

    /// The persisted desired domain, if any.
    pub fn current_domain(&self) -> Option<String> {
        std::fs::read_to_string(&self.domain_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Apply a domain update from the control plane.
    ///
    /// Persists the new value when it differs from the stored one, marks the
    /// transient just-changed flag, and for non-empty domains asks the
    /// issuance tool to restart. Returns whether a change occurred.
    pub fn process_domain_update(
        &mut self,
        new_domain: &str,
        control: &dyn ProcessControl,
    ) -> Result<bool> {
        let new_domain = new_domain.trim();
        if self.current_domain().as_deref().unwrap_or("") == new_domain {
            debug!(domain = new_domain, "domain unchanged");
            return Ok(false);
        }

        if let Some(parent) = self.domain_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&self.domain_file, new_domain)
            .with_context(|| format!("failed to write {}", self.domain_file.display()))?;
        self.just_changed = true;
        info!(domain = new_domain, "TLS domain updated");

        if !new_domain.is_empty() {
            control.restart_cert_issuer()?;
        }
        Ok(true)
    }

    /// Whether a certificate/key pair exists on disk for the current domain.
    pub fn certificate_exists(&self) -> bool {
        match self.current_domain() {
            Some(domain) => {
                self.cert_dir.join(format!("{domain}.pem")).exists()
                    && self.cert_dir.join(format!("{domain}.key")).exists()
            }
            None => false,
        }
    }

    /// Whether pipeline-config promotion must be skipped this cycle.
    ///
    /// The just-changed flag is consumed here exactly once per cycle,
    /// whatever the outcome.
    pub fn should_defer_promotion(&mut self) -> bool {
        let changed = std::mem::take(&mut self.just_changed);
        changed && !self.certificate_exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingControl {
        issuer_restarts: AtomicUsize,
    }

    impl ProcessControl for RecordingControl {
        fn reload_pipeline(&self) -> Result<()> {
            Ok(())
        }
        fn restart_cert_issuer(&self) -> Result<()> {
            self.issuer_restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn gate_in(tmp: &TempDir) -> CertificateGate {
        CertificateGate::new(tmp.path().join("domain.txt"), tmp.path().join("ssl"))
    }

    #[test]
    fn domain_change_persists_and_restarts_issuer() {
        let tmp = TempDir::new().unwrap();
        let mut gate = gate_in(&tmp);
        let control = RecordingControl::default();

        assert!(gate.process_domain_update("ingest.example.com", &control).unwrap());
        assert_eq!(gate.current_domain().as_deref(), Some("ingest.example.com"));
        assert_eq!(control.issuer_restarts.load(Ordering::SeqCst), 1);

        // Same domain again: no change, no restart.
        assert!(!gate.process_domain_update("ingest.example.com", &control).unwrap());
        assert_eq!(control.issuer_restarts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_domain_change_skips_issuer_restart() {
        let tmp = TempDir::new().unwrap();
        let mut gate = gate_in(&tmp);
        let control = RecordingControl::default();

        std::fs::write(tmp.path().join("domain.txt"), "old.example.com").unwrap();
        assert!(gate.process_domain_update("", &control).unwrap());
        assert_eq!(control.issuer_restarts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn defer_only_while_certificate_missing() {
        let tmp = TempDir::new().unwrap();
        let mut gate = gate_in(&tmp);
        let control = RecordingControl::default();

        gate.process_domain_update("ingest.example.com", &control).unwrap();
        assert!(gate.should_defer_promotion());
        // Flag consumed: a second ask within the same process is a no-defer.
        assert!(!gate.should_defer_promotion());

        // Change again, but this time the pair is already on disk.
        let ssl = tmp.path().join("ssl");
        std::fs::create_dir_all(&ssl).unwrap();
        std::fs::write(ssl.join("other.example.com.pem"), "cert").unwrap();
        std::fs::write(ssl.join("other.example.com.key"), "key").unwrap();
        gate.process_domain_update("other.example.com", &control).unwrap();
        assert!(!gate.should_defer_promotion());
    }
}
