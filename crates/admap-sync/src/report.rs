//! Completion report of a reconciliation run and its on-disk artifacts.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use admap_core::{CanonicalId, MappingRecord, ProviderCode, ProviderId, Tier};
use admap_storage::MappingCounts;
use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub fetched: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub ambiguous: usize,
    pub written: usize,
    pub unchanged: usize,
    pub persist_failed: usize,
}

impl TierCounts {
    pub fn merge(&mut self, other: &TierCounts) {
        self.fetched += other.fetched;
        self.resolved += other.resolved;
        self.unresolved += other.unresolved;
        self.ambiguous += other.ambiguous;
        self.written += other.written;
        self.unchanged += other.unchanged;
        self.persist_failed += other.persist_failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// Best score below the tier threshold.
    NoMatch,
    /// A sibling with a higher score claimed the same canonical unit.
    DuplicateTarget,
    /// The resolved parent has no canonical children to match against.
    EmptyScope,
    /// Matched, but the batch holding the mapping was not written.
    PersistFailed,
}

/// Provider unit left for manual mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedUnit {
    pub tier: Tier,
    pub provider_code: ProviderCode,
    pub provider_name: String,
    pub parent_provider_code: Option<ProviderCode>,
    pub parent_canonical_id: Option<CanonicalId>,
    pub reason: UnresolvedReason,
    pub best_candidate: Option<CanonicalId>,
    pub best_score: f64,
}

/// Resolved unit whose best score was shared by several canonical candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguousUnit {
    pub tier: Tier,
    pub provider_code: ProviderCode,
    pub provider_name: String,
    pub chosen: CanonicalId,
    pub tied_ids: Vec<CanonicalId>,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Children of this parent were requested and the provider call failed.
    SubtreeSkipped,
    /// Children of this parent were never requested because the run was cancelled.
    NotAttempted,
    /// A mapping batch could not be written.
    PersistFailed,
    /// A resolved parent has no canonical children.
    EmptyScope,
}

/// Run-level event about a whole subtree or batch rather than a single unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Tier of the units affected.
    pub tier: Tier,
    pub parent_provider_code: Option<ProviderCode>,
    pub parent_canonical_id: Option<CanonicalId>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub run_id: Uuid,
    pub provider_code: String,
    pub provider_id: ProviderId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub counts: BTreeMap<Tier, TierCounts>,
    pub unresolved: Vec<UnresolvedUnit>,
    pub ambiguous: Vec<AmbiguousUnit>,
    pub diagnostics: Vec<Diagnostic>,
    /// SHA-256 over the sorted resolved mapping set.
    pub mapping_digest: String,
    /// Rows held by the store for this provider after the run, when the store could be read.
    pub stored_totals: Option<MappingCounts>,
    #[serde(skip)]
    pub mappings: Vec<MappingRecord>,
}

impl ReconcileReport {
    pub fn counts(&self, tier: Tier) -> TierCounts {
        self.counts.get(&tier).copied().unwrap_or_default()
    }

    pub fn diagnostics_of(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.kind == kind)
    }

    pub fn summary_markdown(&self) -> String {
        let mut lines = vec![
            "# admap reconciliation".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Provider: {} (id {})", self.provider_code, self.provider_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Cancelled: {}", self.cancelled),
            format!("- Mapping digest: `{}`", self.mapping_digest),
            String::new(),
            "## Counts".to_string(),
            String::new(),
            "| tier | fetched | resolved | unresolved | ambiguous | written | unchanged | \
             persist failed |"
                .to_string(),
            "|---|---|---|---|---|---|---|---|".to_string(),
        ];
        for tier in Tier::ALL {
            let c = self.counts(tier);
            lines.push(format!(
                "| {tier} | {} | {} | {} | {} | {} | {} | {} |",
                c.fetched,
                c.resolved,
                c.unresolved,
                c.ambiguous,
                c.written,
                c.unchanged,
                c.persist_failed
            ));
        }
        if let Some(totals) = &self.stored_totals {
            lines.push(String::new());
            lines.push(format!(
                "Stored mappings: {} provinces, {} districts, {} wards",
                totals.provinces, totals.districts, totals.wards
            ));
        }

        if !self.diagnostics.is_empty() {
            lines.push(String::new());
            lines.push("## Diagnostics".to_string());
            for d in &self.diagnostics {
                let parent = d
                    .parent_provider_code
                    .as_ref()
                    .map(|c| format!(" under `{c}`"))
                    .unwrap_or_default();
                lines.push(format!("- {:?} ({}){parent}: {}", d.kind, d.tier, d.message));
            }
        }

        if !self.unresolved.is_empty() {
            lines.push(String::new());
            lines.push("## Unresolved".to_string());
            for u in &self.unresolved {
                lines.push(format!(
                    "- {} `{}` {:?}: {:?} (best {:?} at {:.3})",
                    u.tier,
                    u.provider_code,
                    u.provider_name,
                    u.reason,
                    u.best_candidate,
                    u.best_score
                ));
            }
        }

        if !self.ambiguous.is_empty() {
            lines.push(String::new());
            lines.push("## Ambiguous".to_string());
            for a in &self.ambiguous {
                lines.push(format!(
                    "- {} `{}` {:?}: chose {} among {:?}",
                    a.tier, a.provider_code, a.provider_name, a.chosen, a.tied_ids
                ));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Order-independent fingerprint of a mapping set.
pub fn mapping_digest(records: &[MappingRecord]) -> String {
    let mut sorted = records.iter().collect::<Vec<_>>();
    sorted.sort();
    let mut hasher = Sha256::new();
    for record in sorted {
        let line = format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            record.provider_id,
            record.tier,
            record.canonical_id,
            record.provider_code,
            record.provider_name,
            record
                .parent_canonical_id
                .map(|id| id.to_string())
                .unwrap_or_default()
        );
        hasher.update(line.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ArtifactManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `<reports_dir>/<run_id>/` with the markdown summary, JSON report, Parquet snapshots and a
/// manifest. Returns the run directory.
pub async fn write_report(report: &ReconcileReport, reports_dir: &Path) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let summary_path = run_dir.join("summary.md");
    fs::write(&summary_path, report.summary_markdown())
        .await
        .context("writing summary.md")?;

    let json_path = run_dir.join("reconcile_report.json");
    let json = serde_json::to_vec_pretty(report).context("serializing reconcile report")?;
    fs::write(&json_path, json)
        .await
        .context("writing reconcile_report.json")?;

    let mappings_path = run_dir.join("mappings.parquet");
    let unresolved_path = run_dir.join("unresolved.parquet");
    write_mappings_parquet(&mappings_path, &report.mappings)?;
    write_unresolved_parquet(&unresolved_path, &report.unresolved)?;

    let manifest = ArtifactManifest {
        schema_version: 1,
        run_id: report.run_id,
        files: vec![
            manifest_entry("summary", &run_dir, &summary_path)?,
            manifest_entry("reconcile_report", &run_dir, &json_path)?,
            manifest_entry("mappings", &run_dir, &mappings_path)?,
            manifest_entry("unresolved", &run_dir, &unresolved_path)?,
        ],
    };
    let manifest_path = run_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(run_dir)
}

/// Markdown digest of the latest `runs` reports under `reports_dir`, newest first.
pub fn report_recent_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut reports = Vec::new();
    let entries = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?;
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path().join("reconcile_report.json");
        if !path.is_file() {
            continue;
        }
        let parsed = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))
            .and_then(|data| {
                serde_json::from_str::<ReconcileReport>(&data)
                    .with_context(|| format!("parsing {}", path.display()))
            });
        match parsed {
            Ok(report) => reports.push((report, entry.path())),
            Err(err) => {
                let error = format!("{err:#}");
                warn!(%error, "skipping unreadable run report");
            }
        }
    }
    reports.sort_by(|a, b| b.0.started_at.cmp(&a.0.started_at));

    let mut lines = vec!["# admap recent runs".to_string(), String::new()];
    for (report, dir) in reports.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}` ({})", report.run_id, report.provider_code));
        lines.push(format!("- started: {}", report.started_at));
        for tier in Tier::ALL {
            let c = report.counts(tier);
            lines.push(format!(
                "- {tier}: {}/{} resolved, {} ambiguous, {} written, {} unchanged",
                c.resolved, c.fetched, c.ambiguous, c.written, c.unchanged
            ));
        }
        lines.push(format!("- diagnostics: {}", report.diagnostics.len()));
        if report.cancelled {
            lines.push("- cancelled before completion".to_string());
        }
        lines.push(format!("- digest: `{}`", report.mapping_digest));
        lines.push(format!("- directory: `{}`", dir.display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_mappings_parquet(path: &Path, mappings: &[MappingRecord]) -> Result<()> {
    let mut sorted = mappings.iter().collect::<Vec<_>>();
    sorted.sort();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("provider_id", DataType::Int32, false),
        ArrowField::new("tier", DataType::Utf8, false),
        ArrowField::new("canonical_id", DataType::Int64, false),
        ArrowField::new("provider_code", DataType::Utf8, false),
        ArrowField::new("provider_name", DataType::Utf8, false),
        ArrowField::new("parent_canonical_id", DataType::Int64, true),
    ]));

    let provider_ids = Int32Array::from(sorted.iter().map(|m| m.provider_id).collect::<Vec<_>>());
    let tiers = StringArray::from(sorted.iter().map(|m| m.tier.as_str()).collect::<Vec<_>>());
    let canonical_ids = Int64Array::from(sorted.iter().map(|m| m.canonical_id).collect::<Vec<_>>());
    let codes =
        StringArray::from(sorted.iter().map(|m| m.provider_code.as_str()).collect::<Vec<_>>());
    let names =
        StringArray::from(sorted.iter().map(|m| m.provider_name.as_str()).collect::<Vec<_>>());
    let parents =
        Int64Array::from(sorted.iter().map(|m| m.parent_canonical_id).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(provider_ids),
            Arc::new(tiers),
            Arc::new(canonical_ids),
            Arc::new(codes),
            Arc::new(names),
            Arc::new(parents),
        ],
    )
    .context("building mappings record batch")?;
    write_parquet(path, batch)
}

fn write_unresolved_parquet(path: &Path, unresolved: &[UnresolvedUnit]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("tier", DataType::Utf8, false),
        ArrowField::new("provider_code", DataType::Utf8, false),
        ArrowField::new("provider_name", DataType::Utf8, false),
        ArrowField::new("parent_provider_code", DataType::Utf8, true),
        ArrowField::new("parent_canonical_id", DataType::Int64, true),
        ArrowField::new("reason", DataType::Utf8, false),
        ArrowField::new("best_candidate", DataType::Int64, true),
        ArrowField::new("best_score", DataType::Float64, false),
    ]));

    let tiers = StringArray::from(unresolved.iter().map(|u| u.tier.as_str()).collect::<Vec<_>>());
    let codes = StringArray::from(
        unresolved.iter().map(|u| u.provider_code.as_str()).collect::<Vec<_>>(),
    );
    let names = StringArray::from(
        unresolved.iter().map(|u| u.provider_name.as_str()).collect::<Vec<_>>(),
    );
    let parent_codes = StringArray::from(
        unresolved
            .iter()
            .map(|u| u.parent_provider_code.as_ref().map(ProviderCode::as_str))
            .collect::<Vec<_>>(),
    );
    let parent_ids =
        Int64Array::from(unresolved.iter().map(|u| u.parent_canonical_id).collect::<Vec<_>>());
    let reasons = StringArray::from(
        unresolved
            .iter()
            .map(|u| match u.reason {
                UnresolvedReason::NoMatch => "no_match",
                UnresolvedReason::DuplicateTarget => "duplicate_target",
                UnresolvedReason::EmptyScope => "empty_scope",
                UnresolvedReason::PersistFailed => "persist_failed",
            })
            .collect::<Vec<_>>(),
    );
    let best = Int64Array::from(unresolved.iter().map(|u| u.best_candidate).collect::<Vec<_>>());
    let scores = Float64Array::from(unresolved.iter().map(|u| u.best_score).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(tiers),
            Arc::new(codes),
            Arc::new(names),
            Arc::new(parent_codes),
            Arc::new(parent_ids),
            Arc::new(reasons),
            Arc::new(best),
            Arc::new(scores),
        ],
    )
    .context("building unresolved record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ArtifactManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ArtifactManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
