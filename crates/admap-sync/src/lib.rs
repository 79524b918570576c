//! Reconciliation of a provider's province → district → ward tree against the canonical taxonomy.

pub mod config;
pub mod index;
pub mod matcher;
pub mod orchestrator;
pub mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use admap_adapters::{FixtureProviderClient, ProviderClient, ProviderError};
use admap_core::CanonicalId;
use admap_storage::{
    connect_pool, run_migrations, CanonicalSink, CanonicalSnapshot, CanonicalSource, HttpFetcher,
    MappingStore, MemoryCanonicalSource, MemoryMappingStore, PgCanonicalSource, PgMappingStore,
    ProviderCodes, SeedStats, TaxonomyError,
};
use anyhow::{Context, Result};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::{ConfigError, ProviderConfig, ProviderRegistry, SyncConfig, Thresholds};
pub use index::CanonicalIndex;
pub use matcher::{settle_claims, similarity, MatchPolicy, Matcher};
pub use orchestrator::{reconcile, ReconcileSettings, Reconciler};
pub use report::{
    mapping_digest, report_recent_markdown, write_report, AmbiguousUnit, Diagnostic, DiagnosticKind,
    ReconcileReport, TierCounts, UnresolvedReason, UnresolvedUnit,
};

pub const CRATE_NAME: &str = "admap-sync";

/// Run-level failures. Everything below the province list is recorded in the report instead.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("canonical taxonomy unavailable: {0}")]
    DataUnavailable(#[from] TaxonomyError),
    #[error("provider `{provider}` province list unavailable: {source}")]
    ProviderUnavailable {
        provider: String,
        #[source]
        source: ProviderError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Per-invocation overrides on top of [`SyncConfig`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Provider code from the registry; falls back to `ADMAP_PROVIDER`.
    pub provider: Option<String>,
    /// Serve provider data from a fixture file instead of the live API.
    pub fixture: Option<PathBuf>,
    /// Load the canonical taxonomy from a JSON snapshot instead of the database.
    pub canonical: Option<PathBuf>,
    /// Keep mappings in memory; nothing is written to the database.
    pub dry_run: bool,
    pub concurrency: Option<usize>,
    pub cancel: CancellationToken,
}

impl RunOptions {
    fn needs_database(&self) -> bool {
        self.canonical.is_none() || !self.dry_run
    }
}

pub fn load_canonical_snapshot(path: &Path) -> Result<CanonicalSnapshot> {
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("parsing canonical snapshot {}", path.display()))
}

/// Reconcile one provider and write the run's report artifacts.
/// Returns the report and its directory.
pub async fn run_reconcile(
    config: &SyncConfig,
    options: RunOptions,
) -> Result<(ReconcileReport, PathBuf)> {
    let mut config = config.clone();
    if let Some(concurrency) = options.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(provider) = &options.provider {
        config.provider_code = provider.clone();
    }
    config.validate().map_err(ReconcileError::from)?;

    let registry = ProviderRegistry::load(&config.providers_file)?;
    let provider = registry
        .provider(&config.provider_code)
        .map_err(ReconcileError::from)?
        .clone();

    let client: Arc<dyn ProviderClient> = match &options.fixture {
        Some(path) => Arc::new(FixtureProviderClient::from_path(path)?),
        None => {
            let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
            Arc::new(provider.http_client(fetcher).map_err(ReconcileError::from)?)
        }
    };

    let pool = if options.needs_database() {
        let pool = connect_pool(&config.database_url, pool_size(&config))
            .await
            .map_err(ReconcileError::from)?;
        Some(pool)
    } else {
        None
    };

    let source: Box<dyn CanonicalSource> = match (&options.canonical, &pool) {
        (Some(path), _) => Box::new(MemoryCanonicalSource::new(load_canonical_snapshot(path)?)),
        (None, Some(pool)) => Box::new(PgCanonicalSource::new(pool.clone())),
        (None, None) => {
            anyhow::bail!("no canonical source: pass a snapshot file or configure DATABASE_URL")
        }
    };
    let store: Arc<dyn MappingStore> = match (&pool, options.dry_run) {
        (Some(pool), false) => Arc::new(PgMappingStore::new(pool.clone())),
        _ => Arc::new(MemoryMappingStore::new()),
    };

    info!(
        provider = %provider.code,
        provider_id = provider.provider_id,
        fixture = options.fixture.is_some(),
        dry_run = options.dry_run,
        "starting reconciliation"
    );
    let report = reconcile(
        source.as_ref(),
        client,
        store,
        Matcher::new(config.thresholds),
        ReconcileSettings {
            provider_id: provider.provider_id,
            concurrency: config.concurrency,
            backoff: config.backoff(),
        },
        options.cancel,
    )
    .await?;

    let dir = write_report(&report, &config.reports_dir).await?;
    Ok((report, dir))
}

/// Validate `snapshot` against the taxonomy invariants, then write it through `sink`.
/// Nothing is written when validation fails.
pub async fn seed_canonical(
    sink: &dyn CanonicalSink,
    snapshot: &CanonicalSnapshot,
) -> Result<SeedStats, TaxonomyError> {
    CanonicalIndex::build(snapshot)?;
    let stats = sink.seed_snapshot(snapshot).await?;
    info!(
        provinces = snapshot.provinces.len(),
        districts = snapshot.districts.len(),
        wards = snapshot.wards.len(),
        written = stats.provinces.written + stats.districts.written + stats.wards.written,
        "canonical taxonomy seeded"
    );
    Ok(stats)
}

/// Load a canonical snapshot file into the database named by `DATABASE_URL`.
pub async fn run_seed(config: &SyncConfig, path: &Path) -> Result<SeedStats> {
    let snapshot = load_canonical_snapshot(path)?;
    CanonicalIndex::build(&snapshot).with_context(|| format!("validating {}", path.display()))?;
    let pool = connect_pool(&config.database_url, 2).await?;
    Ok(seed_canonical(&PgCanonicalSource::new(pool), &snapshot).await?)
}

pub async fn migrate(config: &SyncConfig) -> Result<()> {
    let pool = connect_pool(&config.database_url, 2).await?;
    run_migrations(&pool).await
}

/// Stored provider codes for a canonical province/district (and optionally ward).
pub async fn lookup_codes(
    config: &SyncConfig,
    provider: &str,
    province_id: CanonicalId,
    district_id: CanonicalId,
    ward_id: Option<CanonicalId>,
) -> Result<ProviderCodes> {
    let registry = ProviderRegistry::load(&config.providers_file)?;
    let provider = registry.provider(provider)?;
    let pool = connect_pool(&config.database_url, 2).await?;
    let store = PgMappingStore::new(pool);
    Ok(store
        .lookup_codes(provider.provider_id, province_id, district_id, ward_id)
        .await?)
}

fn pool_size(config: &SyncConfig) -> u32 {
    u32::try_from(config.concurrency.saturating_add(2)).unwrap_or(u32::MAX)
}
