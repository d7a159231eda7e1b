//! Shared mock collaborators for unit tests.

use crate::validator::{PipelineValidator, ProcessControl};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Validator that accepts every file set.
pub struct AcceptAll;

#[async_trait]
impl PipelineValidator for AcceptAll {
    async fn validate(&self, _paths: &[PathBuf]) -> Result<Option<String>> {
        Ok(None)
    }
    async fn engine_version(&self) -> Option<String> {
        Some("0.0.0-test".to_string())
    }
}

/// Validator that rejects every file set with a fixed diagnostic.
pub struct RejectAll(pub &'static str);

#[async_trait]
impl PipelineValidator for RejectAll {
    async fn validate(&self, _paths: &[PathBuf]) -> Result<Option<String>> {
        Ok(Some(self.0.to_string()))
    }
    async fn engine_version(&self) -> Option<String> {
        None
    }
}

/// Validator recording every call for assertions.
#[derive(Default)]
pub struct RecordingValidator {
    pub calls: Mutex<Vec<Vec<PathBuf>>>,
}

#[async_trait]
impl PipelineValidator for RecordingValidator {
    async fn validate(&self, paths: &[PathBuf]) -> Result<Option<String>> {
        self.calls.lock().unwrap().push(paths.to_vec());
        Ok(None)
    }
    async fn engine_version(&self) -> Option<String> {
        None
    }
}

/// Process control counting signals instead of sending them.
#[derive(Default)]
pub struct CountingControl {
    pub reloads: AtomicUsize,
    pub issuer_restarts: AtomicUsize,
}

impl CountingControl {
    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

impl ProcessControl for CountingControl {
    fn reload_pipeline(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn restart_cert_issuer(&self) -> Result<()> {
        self.issuer_restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
