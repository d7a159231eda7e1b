//! Reconciliation cycle orchestration
//!
//! One [`ConfigSyncAgent`] owns the polling cycle: it reports status to the
//! control plane, downloads announced configuration versions, routes the
//! downloaded files to the enrichment, certificate and promotion subsystems,
//! drives discovery against the promoted configuration, and decides what
//! error state survives into the next ping. Exactly one cycle runs at a
//! time; the run loop skips ticks while a cycle is still in flight.

use crate::certificate::CertificateGate;
use crate::control_plane::{
    validate_file_name, validate_version_id, ControlPlaneClient, FatalAuthError, PingOutcome,
    PingPayload,
};
use crate::discovery::KubernetesDiscoveryEngine;
use crate::enrichment::EnrichmentTableSync;
use crate::error_state::ErrorStore;
use crate::promoter::{recognized_in, ConfigPromoter};
use crate::settings::Settings;
use crate::validator::{PipelineValidator, ProcessControl};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// File in a version download that updates the desired TLS domain.
const DOMAIN_FILE: &str = "domain.txt";
/// File in a version download routed to the database enrichment table.
const DATABASES_FILE: &str = "databases.csv";

pub struct ConfigSyncAgent {
    settings: Settings,
    client: ControlPlaneClient,
    errors: ErrorStore,
    promoter: ConfigPromoter,
    discovery: KubernetesDiscoveryEngine,
    certificate: CertificateGate,
    containers_table: EnrichmentTableSync,
    databases_table: EnrichmentTableSync,
    validator: Arc<dyn PipelineValidator>,
    control: Arc<dyn ProcessControl>,
    engine_version: Option<String>,
    system_info_sent: bool,
    current_version: Option<String>,
    /// Upstream changed but the composite has not been re-promoted yet.
    restage_pending: bool,
}

impl ConfigSyncAgent {
    pub fn new(
        settings: Settings,
        validator: Arc<dyn PipelineValidator>,
        control: Arc<dyn ProcessControl>,
    ) -> Result<Self> {
        settings.validate()?;
        let client = ControlPlaneClient::new(
            settings.base_url.clone(),
            settings.collector_secret.clone(),
            settings.host.clone(),
        )?;
        let errors = ErrorStore::new(settings.errors_file());
        let promoter = ConfigPromoter::new(settings.clone(), validator.clone(), control.clone());
        let discovery = KubernetesDiscoveryEngine::new(settings.clone(), validator.clone());
        let certificate = CertificateGate::new(settings.domain_file(), settings.cert_dir.clone());
        let containers_table = EnrichmentTableSync::containers(&settings.enrichment_dir);
        let databases_table = EnrichmentTableSync::databases(&settings.enrichment_dir);
        let current_version = std::fs::read_to_string(settings.version_file())
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        promoter.startup_recovery()?;
        crate::discovery::ensure_default_generation(&settings)?;
        std::fs::create_dir_all(&settings.enrichment_dir)
            .with_context(|| format!("failed to create {}", settings.enrichment_dir.display()))?;

        Ok(Self {
            settings,
            client,
            errors,
            promoter,
            discovery,
            certificate,
            containers_table,
            databases_table,
            validator,
            control,
            engine_version: None,
            system_info_sent: false,
            current_version,
            restage_pending: false,
        })
    }

    /// Run one full reconciliation cycle.
    ///
    /// Non-fatal failures are persisted for the next ping and the cycle
    /// completes; only an authentication rejection propagates, and the
    /// caller must terminate the process on it.
    #[instrument(skip(self))]
    pub async fn run_cycle(&mut self) -> Result<()> {
        let mut cycle_error: Option<String> = None;
        let mut may_clear = false;
        // A successful validate-and-promote resolves even sticky errors.
        let mut resolved = false;

        let is_collector = if self.settings.force_cluster_collector {
            true
        } else {
            match self.client.is_cluster_collector().await {
                Ok(is_collector) => is_collector,
                Err(e) if e.downcast_ref::<FatalAuthError>().is_some() => return Err(e),
                Err(e) => {
                    cycle_error = Some(format!("{e:#}"));
                    false
                }
            }
        };

        let payload = self.build_payload(is_collector).await;
        match self.client.ping(&payload).await {
            Ok(PingOutcome::NothingPending) => {
                debug!("no configuration update pending");
                self.system_info_sent = true;
                may_clear = true;
            }
            Ok(PingOutcome::NewVersion(version)) => {
                info!(version = %version, "new configuration version announced");
                self.system_info_sent = true;
                match self.apply_version(&version).await {
                    Ok(upstream_changed) => {
                        self.restage_pending = self.restage_pending || upstream_changed;
                        resolved = resolved || upstream_changed;
                        may_clear = true;
                    }
                    Err(e) if e.downcast_ref::<FatalAuthError>().is_some() => return Err(e),
                    Err(e) => cycle_error = Some(format!("{e:#}")),
                }
            }
            Ok(PingOutcome::Informational(status)) => {
                debug!(status = %status, "informational ping status");
                self.system_info_sent = true;
            }
            Err(e) if e.downcast_ref::<FatalAuthError>().is_some() => return Err(e),
            Err(e) => cycle_error = Some(format!("{e:#}")),
        }

        match self.sync_table(&self.containers_table) {
            Ok(promoted) => resolved = resolved || promoted,
            Err(e) => cycle_error = Some(format!("{e:#}")),
        }

        let discovery_changed = match self.discovery.maybe_run().await {
            Ok(changed) => changed,
            Err(e) => {
                cycle_error = Some(format!("{e:#}"));
                false
            }
        };

        if self.restage_pending || discovery_changed {
            match self.restage_and_promote().await {
                Ok(promoted) => {
                    self.restage_pending = false;
                    resolved = resolved || promoted;
                }
                Err(e) => cycle_error = Some(format!("{e:#}")),
            }
        }

        match cycle_error {
            Some(message) => self.errors.record(&message),
            None if resolved => {
                if let Err(e) = self.errors.clear() {
                    warn!("failed to clear error state: {e:#}");
                }
            }
            None if may_clear => self.errors.clear_unless_sticky(),
            None => {}
        }
        Ok(())
    }

    /// Fetch, store and dispatch one announced version. Any failure removes
    /// the version directory so the control plane re-announces it cleanly.
    async fn apply_version(&mut self, version: &str) -> Result<bool> {
        validate_version_id(version)?;
        let version_dir = self.settings.versions_dir().join(version);

        let result = self.apply_version_inner(version, &version_dir).await;
        if result.is_err() && version_dir.exists() {
            self.promoter.discard(&version_dir);
        }
        result
    }

    async fn apply_version_inner(&mut self, version: &str, version_dir: &Path) -> Result<bool> {
        let files = self.client.fetch_file_list(version).await?;
        if files.is_empty() {
            return Err(anyhow::anyhow!("version {version} has no files"));
        }
        // Every name is validated before the first write: one bad entry
        // aborts the whole version with nothing on disk.
        for file in &files {
            validate_file_name(file.file_name())?;
        }
        for file in &files {
            self.client.download(file, version_dir).await?;
        }

        let domain_path = version_dir.join(DOMAIN_FILE);
        if domain_path.exists() {
            let domain = std::fs::read_to_string(&domain_path)
                .with_context(|| format!("failed to read {}", domain_path.display()))?;
            self.certificate
                .process_domain_update(&domain, self.control.as_ref())?;
        }

        let databases_path = version_dir.join(DATABASES_FILE);
        if databases_path.exists() {
            std::fs::copy(&databases_path, self.databases_table.incoming_path())
                .context("failed to stage database table")?;
            self.sync_table(&self.databases_table)?;
        }

        let mut upstream_changed = false;
        if !recognized_in(version_dir).is_empty() {
            if self.certificate.should_defer_promotion() {
                info!(
                    version = %version,
                    "certificate not ready for new domain, deferring promotion"
                );
                self.promoter.discard(version_dir);
                return Ok(false);
            }
            match self.promoter.validate_upstream(version_dir).await? {
                Some(diagnostic) => {
                    return Err(anyhow::anyhow!(
                        "configuration validation failed: {diagnostic}"
                    ));
                }
                None => {
                    self.promoter.promote_upstream(version_dir)?;
                    upstream_changed = true;
                }
            }
        }

        self.set_current_version(version)?;
        Ok(upstream_changed)
    }

    /// Stage, validate and promote a composite configuration. Returns
    /// whether a promotion actually happened.
    async fn restage_and_promote(&mut self) -> Result<bool> {
        let staged = match self.promoter.prepare_composite()? {
            Some(staged) => staged,
            None => return Ok(false),
        };
        match self.promoter.validate_composite(&staged).await {
            Ok(None) => {
                self.promoter.promote_composite(&staged)?;
                Ok(true)
            }
            Ok(Some(diagnostic)) => {
                self.promoter.discard(&staged);
                Err(anyhow::anyhow!(
                    "configuration validation failed: {diagnostic}"
                ))
            }
            Err(e) => {
                self.promoter.discard(&staged);
                Err(e)
            }
        }
    }

    /// Validate and promote one enrichment table when its incoming file
    /// differs from the promoted one. Returns whether a promotion happened.
    fn sync_table(&self, table: &EnrichmentTableSync) -> Result<bool> {
        if !table.has_pending_change() {
            return Ok(false);
        }
        if let Err(e) = table.validate() {
            return Err(anyhow::anyhow!(
                "enrichment table validation failed: {}: {e:#}",
                table.name()
            ));
        }
        table.promote()?;
        Ok(true)
    }

    async fn build_payload(&mut self, is_collector: bool) -> PingPayload {
        if self.engine_version.is_none() {
            self.engine_version = self.validator.engine_version().await;
        }
        PingPayload {
            collector_secret: self.settings.collector_secret.clone(),
            cluster_collector: is_collector,
            host: self.settings.host.clone(),
            collector_version: env!("CARGO_PKG_VERSION").to_string(),
            vector_version: self.engine_version.clone().unwrap_or_default(),
            beyla_version: self.settings.beyla_version.clone(),
            cluster_agent_version: self.settings.cluster_agent_version.clone(),
            configuration_version: self.current_version.clone(),
            error: self.errors.current(),
            system_information: if self.system_info_sent {
                None
            } else {
                Some(system_information())
            },
        }
    }

    fn set_current_version(&mut self, version: &str) -> Result<()> {
        std::fs::write(self.settings.version_file(), version)
            .context("failed to persist configuration version")?;
        self.current_version = Some(version.to_string());
        Ok(())
    }

    /// The version reported to the control plane.
    pub fn current_version(&self) -> Option<&str> {
        self.current_version.as_deref()
    }

    /// Drive cycles on a fixed interval until shutdown. Missed ticks are
    /// skipped, so a slow cycle never overlaps the next one.
    pub async fn run_loop(&mut self) -> Result<()> {
        info!(
            interval = self.settings.sync_interval,
            "starting reconciliation loop"
        );
        let mut ticker = interval(Duration::from_secs(self.settings.sync_interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        // Only authentication rejection propagates here.
                        error!("fatal cycle failure: {e:#}");
                        return Err(e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal");
                    return Ok(());
                }
            }
        }
    }
}

/// One-shot system/compatibility report included until the first successful
/// ping acknowledges it.
fn system_information() -> String {
    use sysinfo::System;
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();
    serde_json::json!({
        "os_name": System::name(),
        "os_version": System::os_version(),
        "kernel_version": System::kernel_version(),
        "arch": std::env::consts::ARCH,
        "cpu_count": sys.cpus().len(),
        "total_memory_bytes": sys.total_memory(),
    })
    .to_string()
}
