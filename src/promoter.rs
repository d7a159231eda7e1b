//! Versioned configuration store and promotion
//!
//! Candidate pipeline configurations move through three places: the raw
//! per-version download directory, the last known-good upstream copy, and
//! the active directory the data-plane engine reads. Every move is staged
//! next to its destination and swapped in only after validation, so the
//! engine can never observe a half-written or unvalidated configuration.

use crate::discovery;
use crate::settings::Settings;
use crate::validator::{PipelineValidator, ProcessControl};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration file names recognized in a version download.
pub const RECOGNIZED_CONFIGS: &[&str] = &["vector.yaml", "manual.vector.yaml"];
/// Relative path of the discovery generation link inside a staged directory.
pub const DISCOVERY_LINK: &str = "kubernetes-discovery";
/// Version directories kept under `versions/`.
const RETAINED_VERSIONS: usize = 20;

pub struct ConfigPromoter {
    settings: Settings,
    validator: Arc<dyn PipelineValidator>,
    control: Arc<dyn ProcessControl>,
}

impl ConfigPromoter {
    pub fn new(
        settings: Settings,
        validator: Arc<dyn PipelineValidator>,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            settings,
            validator,
            control,
        }
    }

    /// Validate the upstream configuration files of a downloaded version.
    ///
    /// Returns the diagnostic text when the version must be rejected:
    /// missing recognized files, a non-declarative directive, or an external
    /// validator failure.
    pub async fn validate_upstream(&self, version_dir: &Path) -> Result<Option<String>> {
        let files = recognized_in(version_dir);
        if files.is_empty() {
            return Ok(Some(format!(
                "no recognized configuration file ({}) in version",
                RECOGNIZED_CONFIGS.join(" or ")
            )));
        }
        for file in &files {
            if let Some(reason) = declarative_violation(file)? {
                return Ok(Some(reason));
            }
        }

        // Validate in isolation with a stub discovery fragment so wildcard
        // discovery inputs resolve even before any generation exists.
        let tmp = tempfile::TempDir::new().context("failed to create validation dir")?;
        for file in &files {
            let name = file.file_name().unwrap_or_default();
            std::fs::copy(file, tmp.path().join(name))
                .with_context(|| format!("failed to stage {}", file.display()))?;
        }
        std::fs::write(
            tmp.path().join(discovery::METRICS_FRAGMENT),
            discovery::metrics_fragment_yaml(0),
        )
        .context("failed to stage discovery stub")?;

        self.validator.validate(&[tmp.path().join("*.yaml")]).await
    }

    /// Copy a validated version's configuration files into the last
    /// known-good upstream slot via a build-then-replace sequence.
    pub fn promote_upstream(&self, version_dir: &Path) -> Result<()> {
        let target = self.settings.latest_valid_upstream();
        let staging = staging_sibling(&target);
        if staging.exists() {
            std::fs::remove_dir_all(&staging)
                .with_context(|| format!("failed to clear {}", staging.display()))?;
        }
        std::fs::create_dir_all(&staging)
            .with_context(|| format!("failed to create {}", staging.display()))?;
        for file in recognized_in(version_dir) {
            let name = file.file_name().unwrap_or_default();
            std::fs::copy(&file, staging.join(name))
                .with_context(|| format!("failed to copy {}", file.display()))?;
        }

        if target.exists() {
            std::fs::remove_dir_all(&target)
                .with_context(|| format!("failed to remove {}", target.display()))?;
        }
        std::fs::rename(&staging, &target)
            .with_context(|| format!("failed to activate {}", target.display()))?;
        info!("upstream configuration promoted to last known-good");
        Ok(())
    }

    /// Stage a composite directory: the last known-good upstream plus a
    /// linked discovery generation. `None` when no upstream exists yet.
    pub fn prepare_composite(&self) -> Result<Option<PathBuf>> {
        let upstream = self.settings.latest_valid_upstream();
        if !upstream.exists() {
            debug!("no last known-good upstream yet, nothing to stage");
            return Ok(None);
        }
        discovery::ensure_default_generation(&self.settings)?;

        let ts = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f");
        let staging = self.settings.vector_config_dir().join(format!("new_{ts}"));
        copy_dir(&upstream, &staging)?;

        let generation = if dir_references_discovery(&staging)? {
            discovery::latest_generation_dir(&self.settings)
        } else {
            self.settings.default_generation_dir()
        };
        std::os::unix::fs::symlink(&generation, staging.join(DISCOVERY_LINK)).with_context(
            || format!("failed to link discovery generation {}", generation.display()),
        )?;
        Ok(Some(staging))
    }

    /// Validate a staged composite directory as the engine would read it.
    pub async fn validate_composite(&self, dir: &Path) -> Result<Option<String>> {
        self.validator
            .validate(&[
                dir.join("*.yaml"),
                dir.join(DISCOVERY_LINK).join("*.yaml"),
            ])
            .await
    }

    /// Swap a validated staged directory into the active position and ask
    /// the engine to reload.
    pub fn promote_composite(&self, dir: &Path) -> Result<()> {
        let current = self.settings.current_config_dir();
        if current.exists() {
            std::fs::remove_dir_all(&current)
                .with_context(|| format!("failed to remove {}", current.display()))?;
        }
        std::fs::rename(dir, &current)
            .with_context(|| format!("failed to activate {}", current.display()))?;
        info!("composite configuration promoted to active");
        self.control.reload_pipeline()
    }

    /// Drop a staged or downloaded directory that will not be promoted.
    pub fn discard(&self, dir: &Path) {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            warn!(dir = %dir.display(), "failed to discard directory: {e:#}");
        }
    }

    /// Remove crash leftovers and prune old version downloads. Runs once
    /// before the first cycle.
    pub fn startup_recovery(&self) -> Result<()> {
        let staging = staging_sibling(&self.settings.latest_valid_upstream());
        if staging.exists() {
            warn!("removing stale upstream staging directory");
            std::fs::remove_dir_all(&staging)
                .with_context(|| format!("failed to remove {}", staging.display()))?;
        }
        if let Ok(entries) = std::fs::read_dir(self.settings.vector_config_dir()) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with("new_") {
                    warn!(dir = %name, "removing stale composite staging directory");
                    self.discard(&entry.path());
                }
            }
        }

        let mut versions: Vec<String> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(self.settings.versions_dir()) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    versions.push(entry.file_name().to_string_lossy().to_string());
                }
            }
        }
        versions.sort();
        while versions.len() > RETAINED_VERSIONS {
            let victim = versions.remove(0);
            self.discard(&self.settings.versions_dir().join(victim));
        }
        Ok(())
    }
}

/// Recognized configuration files present in a directory, in fixed order.
pub fn recognized_in(dir: &Path) -> Vec<PathBuf> {
    RECOGNIZED_CONFIGS
        .iter()
        .map(|name| dir.join(name))
        .filter(|p| p.exists())
        .collect()
}

/// Whether the active configuration references discovery sources.
pub fn active_references_discovery(settings: &Settings) -> bool {
    let current = settings.current_config_dir();
    current.exists() && dir_references_discovery(&current).unwrap_or(false)
}

/// Whether any recognized configuration file in `dir` mentions the
/// discovery source prefix.
pub fn dir_references_discovery(dir: &Path) -> Result<bool> {
    for file in recognized_in(dir) {
        let contents = std::fs::read_to_string(&file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        if contents.contains(discovery::SOURCE_PREFIX) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// The declarative-only boundary: configurations may not carry a `command`
/// directive anywhere, and unparseable YAML is rejected outright.
fn declarative_violation(file: &Path) -> Result<Option<String>> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let value: serde_yaml::Value = match serde_yaml::from_str(&contents) {
        Ok(value) => value,
        Err(e) => return Ok(Some(format!("{name} is not valid YAML: {e}"))),
    };
    if has_command_key(&value) {
        return Ok(Some(format!(
            "{name} contains a command directive; configuration must be declarative"
        )));
    }
    Ok(None)
}

fn has_command_key(value: &serde_yaml::Value) -> bool {
    match value {
        serde_yaml::Value::Mapping(map) => map.iter().any(|(key, child)| {
            matches!(key.as_str(), Some("command")) || has_command_key(child)
        }),
        serde_yaml::Value::Sequence(seq) => seq.iter().any(has_command_key),
        _ => false,
    }
}

fn staging_sibling(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(".new");
    target.with_file_name(name)
}

/// Recursively copy a directory tree of regular files.
fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.with_context(|| format!("failed to walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .context("walked path outside source tree")?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{AcceptAll, CountingControl, RecordingValidator, RejectAll};
    use tempfile::TempDir;

    fn promoter_with(
        tmp: &TempDir,
        validator: Arc<dyn PipelineValidator>,
    ) -> (ConfigPromoter, Arc<CountingControl>, Settings) {
        let settings = Settings::rooted(tmp.path(), "http://cp", "s");
        let control = Arc::new(CountingControl::default());
        let promoter = ConfigPromoter::new(settings.clone(), validator, control.clone());
        (promoter, control, settings)
    }

    fn write_version(settings: &Settings, version: &str, yaml: &str) -> PathBuf {
        let dir = settings.versions_dir().join(version);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("vector.yaml"), yaml).unwrap();
        dir
    }

    const PLAIN_CONFIG: &str =
        "sources:\n  in:\n    type: internal_metrics\nsinks:\n  out:\n    type: blackhole\n    inputs: [\"in\"]\n";
    const DISCOVERY_CONFIG: &str =
        "sinks:\n  out:\n    type: blackhole\n    inputs: [\"kubernetes_discovery_*\"]\n";

    #[tokio::test]
    async fn upstream_without_recognized_files_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let validator = Arc::new(RecordingValidator::default());
        let (promoter, _, settings) = promoter_with(&tmp, validator.clone());

        let dir = settings.versions_dir().join("v1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("unrelated.txt"), "x").unwrap();

        let diag = promoter.validate_upstream(&dir).await.unwrap();
        assert!(diag.unwrap().contains("no recognized configuration file"));
        assert!(validator.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn command_directives_never_reach_the_validator() {
        let tmp = TempDir::new().unwrap();
        let validator = Arc::new(RecordingValidator::default());
        let (promoter, _, settings) = promoter_with(&tmp, validator.clone());

        let dir = write_version(
            &settings,
            "v1",
            "sources:\n  bad:\n    type: exec\n    command: [\"rm\", \"-rf\", \"/\"]\n",
        );
        let diag = promoter.validate_upstream(&dir).await.unwrap();
        assert!(diag.unwrap().contains("command directive"));

        let dir2 = write_version(&settings, "v2", "sources: [unbalanced");
        let diag = promoter.validate_upstream(&dir2).await.unwrap();
        assert!(diag.unwrap().contains("not valid YAML"));

        assert!(validator.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upstream_validation_runs_in_isolation() {
        let tmp = TempDir::new().unwrap();
        let validator = Arc::new(RecordingValidator::default());
        let (promoter, _, settings) = promoter_with(&tmp, validator.clone());

        let dir = write_version(&settings, "v1", PLAIN_CONFIG);
        let diag = promoter.validate_upstream(&dir).await.unwrap();
        assert!(diag.is_none());

        let calls = validator.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        // A glob over an isolated temp dir, not over the version directory.
        let glob = &calls[0][0];
        assert!(glob.to_string_lossy().ends_with("*.yaml"));
        assert!(!glob.starts_with(&dir));
    }

    #[tokio::test]
    async fn upstream_promotion_replaces_previous_copy() {
        let tmp = TempDir::new().unwrap();
        let (promoter, _, settings) = promoter_with(&tmp, Arc::new(AcceptAll));

        let v1 = write_version(&settings, "v1", PLAIN_CONFIG);
        promoter.promote_upstream(&v1).unwrap();
        let v2 = write_version(&settings, "v2", DISCOVERY_CONFIG);
        promoter.promote_upstream(&v2).unwrap();

        let kept =
            std::fs::read_to_string(settings.latest_valid_upstream().join("vector.yaml")).unwrap();
        assert_eq!(kept, DISCOVERY_CONFIG);
        assert!(!staging_sibling(&settings.latest_valid_upstream()).exists());
    }

    #[tokio::test]
    async fn composite_requires_an_upstream() {
        let tmp = TempDir::new().unwrap();
        let (promoter, _, _) = promoter_with(&tmp, Arc::new(AcceptAll));
        assert!(promoter.prepare_composite().unwrap().is_none());
    }

    #[tokio::test]
    async fn composite_links_default_generation_without_discovery_references() {
        let tmp = TempDir::new().unwrap();
        let (promoter, _, settings) = promoter_with(&tmp, Arc::new(AcceptAll));

        let v1 = write_version(&settings, "v1", PLAIN_CONFIG);
        promoter.promote_upstream(&v1).unwrap();

        let staged = promoter.prepare_composite().unwrap().unwrap();
        let link = staged.join(DISCOVERY_LINK);
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            settings.default_generation_dir()
        );
        assert!(link.join(discovery::METRICS_FRAGMENT).exists());
    }

    #[tokio::test]
    async fn composite_links_latest_generation_with_discovery_references() {
        let tmp = TempDir::new().unwrap();
        let (promoter, _, settings) = promoter_with(&tmp, Arc::new(AcceptAll));

        let v1 = write_version(&settings, "v1", DISCOVERY_CONFIG);
        promoter.promote_upstream(&v1).unwrap();

        let generation = settings.discovery_dir().join("2025-06-01T00-00-00");
        std::fs::create_dir_all(&generation).unwrap();
        std::fs::write(
            generation.join(discovery::METRICS_FRAGMENT),
            discovery::metrics_fragment_yaml(3),
        )
        .unwrap();

        let staged = promoter.prepare_composite().unwrap().unwrap();
        assert_eq!(
            std::fs::read_link(staged.join(DISCOVERY_LINK)).unwrap(),
            generation
        );
    }

    #[tokio::test]
    async fn composite_promotion_swaps_active_and_reloads() {
        let tmp = TempDir::new().unwrap();
        let (promoter, control, settings) = promoter_with(&tmp, Arc::new(AcceptAll));

        let v1 = write_version(&settings, "v1", PLAIN_CONFIG);
        promoter.promote_upstream(&v1).unwrap();
        let staged = promoter.prepare_composite().unwrap().unwrap();
        assert!(promoter.validate_composite(&staged).await.unwrap().is_none());
        promoter.promote_composite(&staged).unwrap();

        assert!(!staged.exists());
        let current = settings.current_config_dir();
        assert_eq!(
            std::fs::read_to_string(current.join("vector.yaml")).unwrap(),
            PLAIN_CONFIG
        );
        assert_eq!(control.reload_count(), 1);
    }

    #[tokio::test]
    async fn rejected_composite_leaves_active_untouched() {
        let tmp = TempDir::new().unwrap();
        let (promoter, control, settings) = promoter_with(&tmp, Arc::new(AcceptAll));

        let v1 = write_version(&settings, "v1", PLAIN_CONFIG);
        promoter.promote_upstream(&v1).unwrap();
        let staged = promoter.prepare_composite().unwrap().unwrap();
        promoter.promote_composite(&staged).unwrap();
        assert_eq!(control.reload_count(), 1);

        // Second upstream validates, but its composite is rejected.
        let v2 = write_version(&settings, "v2", DISCOVERY_CONFIG);
        promoter.promote_upstream(&v2).unwrap();
        let rejecting = ConfigPromoter::new(
            settings.clone(),
            Arc::new(RejectAll("unknown sink type")),
            control.clone(),
        );
        let staged = rejecting.prepare_composite().unwrap().unwrap();
        let diag = rejecting.validate_composite(&staged).await.unwrap();
        assert_eq!(diag.as_deref(), Some("unknown sink type"));
        rejecting.discard(&staged);

        assert_eq!(
            std::fs::read_to_string(settings.current_config_dir().join("vector.yaml")).unwrap(),
            PLAIN_CONFIG
        );
        assert_eq!(control.reload_count(), 1);
        assert!(!staged.exists());
    }

    #[test]
    fn startup_recovery_clears_leftovers_and_prunes_versions() {
        let tmp = TempDir::new().unwrap();
        let (promoter, _, settings) = promoter_with(&tmp, Arc::new(AcceptAll));

        let stale = settings.vector_config_dir().join("new_2025-01-01T00-00-00");
        std::fs::create_dir_all(&stale).unwrap();
        let stale_upstream = staging_sibling(&settings.latest_valid_upstream());
        std::fs::create_dir_all(&stale_upstream).unwrap();
        for i in 0..25 {
            std::fs::create_dir_all(settings.versions_dir().join(format!("2025-01-01T00-00-{i:02}")))
                .unwrap();
        }

        promoter.startup_recovery().unwrap();

        assert!(!stale.exists());
        assert!(!stale_upstream.exists());
        let versions = std::fs::read_dir(settings.versions_dir()).unwrap().count();
        assert_eq!(versions, 20);
        assert!(settings.versions_dir().join("2025-01-01T00-00-24").exists());
        assert!(!settings.versions_dir().join("2025-01-01T00-00-04").exists());
    }
}
