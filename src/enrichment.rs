//! Enrichment table synchronization
//!
//! Small side-channel CSV datasets (container mappings, database mappings)
//! follow the same discipline as pipeline configuration: an incoming staged
//! file is validated, compared by content hash, and atomically renamed over
//! the promoted file. One generic component parameterized by a per-table
//! validation policy covers both tables.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// How a table's header row is checked.
#[derive(Debug, Clone, Copy)]
pub enum HeaderCheck {
    /// First line must equal this string exactly.
    Literal(&'static str),
    /// First line parsed as CSV must equal this field tuple.
    CsvTuple(&'static [&'static str]),
}

/// Per-table validation policy.
#[derive(Debug, Clone, Copy)]
pub struct TablePolicy {
    pub name: &'static str,
    pub header: HeaderCheck,
}

/// Container-mapping table policy.
pub const CONTAINERS: TablePolicy = TablePolicy {
    name: "containers",
    header: HeaderCheck::Literal("container_id,pod_name,namespace,workload"),
};

/// Database-mapping table policy.
pub const DATABASES: TablePolicy = TablePolicy {
    name: "databases",
    header: HeaderCheck::CsvTuple(&["host", "port", "engine", "database"]),
};

/// Validate-then-promote pipeline for one enrichment table.
pub struct EnrichmentTableSync {
    target: PathBuf,
    incoming: PathBuf,
    policy: TablePolicy,
}

impl EnrichmentTableSync {
    pub fn new(target: PathBuf, incoming: PathBuf, policy: TablePolicy) -> Self {
        Self {
            target,
            incoming,
            policy,
        }
    }

    /// The container-mapping table under the enrichment directory.
    pub fn containers(enrichment_dir: &Path) -> Self {
        Self::new(
            enrichment_dir.join("docker-mappings.csv"),
            enrichment_dir.join("docker-mappings.csv.incoming"),
            CONTAINERS,
        )
    }

    /// The database-mapping table under the enrichment directory.
    pub fn databases(enrichment_dir: &Path) -> Self {
        Self::new(
            enrichment_dir.join("databases.csv"),
            enrichment_dir.join("databases.csv.incoming"),
            DATABASES,
        )
    }

    pub fn name(&self) -> &'static str {
        self.policy.name
    }

    /// Path an upstream download for this table should be staged at.
    pub fn incoming_path(&self) -> &Path {
        &self.incoming
    }

    /// True iff an incoming file exists and its content differs from the
    /// promoted file. A missing promoted file differs from any content.
    pub fn has_pending_change(&self) -> bool {
        let incoming = match file_hash(&self.incoming) {
            Some(h) => h,
            None => return false,
        };
        match file_hash(&self.target) {
            Some(current) => current != incoming,
            None => true,
        }
    }

    /// Header/shape and non-emptiness validation of the incoming file.
    pub fn validate(&self) -> Result<()> {
        let contents = std::fs::read_to_string(&self.incoming).with_context(|| {
            format!("incoming {} table missing or unreadable", self.policy.name)
        })?;
        if contents.trim().is_empty() {
            return Err(anyhow::anyhow!("incoming {} table is empty", self.policy.name));
        }

        let first_line = contents.lines().next().unwrap_or_default();
        match self.policy.header {
            HeaderCheck::Literal(expected) => {
                if first_line.trim_end() != expected {
                    return Err(anyhow::anyhow!(
                        "{} table header mismatch: expected \"{}\", got \"{}\"",
                        self.policy.name,
                        expected,
                        first_line
                    ));
                }
            }
            HeaderCheck::CsvTuple(expected) => {
                let fields = parse_csv_line(first_line).with_context(|| {
                    format!("{} table header is not well-formed CSV", self.policy.name)
                })?;
                if fields != expected {
                    return Err(anyhow::anyhow!(
                        "{} table header mismatch: expected {:?}, got {:?}",
                        self.policy.name,
                        expected,
                        fields
                    ));
                }
            }
        }
        debug!(table = self.policy.name, "incoming table validated");
        Ok(())
    }

    /// Atomically rename incoming over the promoted file.
    pub fn promote(&self) -> Result<()> {
        if let Some(parent) = self.target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::rename(&self.incoming, &self.target).with_context(|| {
            format!(
                "failed to promote {} -> {}",
                self.incoming.display(),
                self.target.display()
            )
        })?;
        info!(table = self.policy.name, "enrichment table promoted");
        Ok(())
    }
}

/// Sha256 of a file's contents, `None` when the file is absent or unreadable.
pub fn file_hash(path: &Path) -> Option<[u8; 32]> {
    let contents = std::fs::read(path).ok()?;
    Some(Sha256::digest(&contents).into())
}

/// Parse one CSV line with double-quote quoting. Unbalanced quotes are an
/// error, not a panic.
fn parse_csv_line(line: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut field));
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(anyhow::anyhow!("unterminated quoted field"));
    }
    fields.push(field);
    Ok(fields.into_iter().map(|f| f.trim().to_string()).collect())
}
