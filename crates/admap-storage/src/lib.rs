//! Canonical taxonomy store, provider mapping tables and rate-limited HTTP transport.

use admap_core::{CanonicalId, MappingRecord, ProviderId, Tier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod http;
pub mod memory;
pub mod pg;

pub use http::{
    classify_status, BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, RetryDisposition,
    SimpleTokenBucket, TokenBucketConfig,
};
pub use memory::{MemoryCanonicalSource, MemoryMappingStore};
pub use pg::{connect_pool, run_migrations, PgCanonicalSource, PgMappingStore};

pub const CRATE_NAME: &str = "admap-storage";

/// One row of a canonical tier as stored, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub id: CanonicalId,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<CanonicalId>,
}

impl CanonicalRow {
    pub fn new(id: CanonicalId, name: impl Into<String>, parent_id: Option<CanonicalId>) -> Self {
        Self {
            id,
            name: name.into(),
            parent_id,
        }
    }
}

/// Raw read of the three canonical tiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSnapshot {
    pub provinces: Vec<CanonicalRow>,
    pub districts: Vec<CanonicalRow>,
    pub wards: Vec<CanonicalRow>,
}

impl CanonicalSnapshot {
    pub fn rows(&self, tier: Tier) -> &[CanonicalRow] {
        match tier {
            Tier::Province => &self.provinces,
            Tier::District => &self.districts,
            Tier::Ward => &self.wards,
        }
    }
}

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("canonical store unavailable: {0}")]
    DataUnavailable(String),
    #[error("canonical taxonomy integrity violation: {0}")]
    Integrity(String),
    #[error("writing canonical taxonomy failed: {0}")]
    Write(String),
}

#[derive(Debug, Error)]
#[error("persisting {tier} mappings for provider {provider_id} failed: {message}")]
pub struct PersistenceError {
    pub tier: Tier,
    pub provider_id: ProviderId,
    pub canonical_ids: Vec<CanonicalId>,
    pub message: String,
}

/// Rows inserted or changed vs. rows that already held identical values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStats {
    pub written: usize,
    pub unchanged: usize,
}

impl WriteStats {
    pub fn merge(&mut self, other: WriteStats) {
        self.written += other.written;
        self.unchanged += other.unchanged;
    }
}

/// Write counts of one canonical seed, per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedStats {
    pub provinces: WriteStats,
    pub districts: WriteStats,
    pub wards: WriteStats,
}

impl SeedStats {
    pub fn tier(&self, tier: Tier) -> WriteStats {
        match tier {
            Tier::Province => self.provinces,
            Tier::District => self.districts,
            Tier::Ward => self.wards,
        }
    }

    pub fn tier_mut(&mut self, tier: Tier) -> &mut WriteStats {
        match tier {
            Tier::Province => &mut self.provinces,
            Tier::District => &mut self.districts,
            Tier::Ward => &mut self.wards,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingCounts {
    pub provinces: u64,
    pub districts: u64,
    pub wards: u64,
}

/// Provider codes for a canonical address, as used when creating a shipment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCodes {
    pub province: Option<String>,
    pub district: Option<String>,
    pub ward: Option<String>,
}

#[async_trait]
pub trait CanonicalSource: Send + Sync {
    async fn load_snapshot(&self) -> Result<CanonicalSnapshot, TaxonomyError>;
}

/// Writes the canonical taxonomy. Rows are upserted by id, parents before children, so a seed can
/// be repeated and an updated list replaces names and parents in place.
#[async_trait]
pub trait CanonicalSink: Send + Sync {
    async fn seed_snapshot(&self, snapshot: &CanonicalSnapshot) -> Result<SeedStats, TaxonomyError>;
}

/// Idempotent writer for mapping records keyed by `(provider_id, canonical_id)` per tier.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Upsert records of a single tier in one write. An empty batch is a no-op.
    async fn upsert_batch(&self, records: &[MappingRecord]) -> Result<WriteStats, PersistenceError>;

    async fn upsert(&self, record: &MappingRecord) -> Result<WriteStats, PersistenceError> {
        self.upsert_batch(std::slice::from_ref(record)).await
    }

    async fn count_mappings(&self, provider_id: ProviderId)
        -> Result<MappingCounts, PersistenceError>;

    async fn lookup_codes(
        &self,
        provider_id: ProviderId,
        province_id: CanonicalId,
        district_id: CanonicalId,
        ward_id: Option<CanonicalId>,
    ) -> Result<ProviderCodes, PersistenceError>;
}

/// Reject batches that mix tiers or carry the same canonical id twice.
pub(crate) fn validate_batch(
    records: &[MappingRecord],
) -> Result<Option<(Tier, ProviderId)>, PersistenceError> {
    let Some(first) = records.first() else {
        return Ok(None);
    };
    let mut seen = std::collections::HashSet::with_capacity(records.len());
    for record in records {
        if record.tier != first.tier || record.provider_id != first.provider_id {
            return Err(PersistenceError {
                tier: first.tier,
                provider_id: first.provider_id,
                canonical_ids: records.iter().map(|r| r.canonical_id).collect(),
                message: "batch mixes tiers or providers".to_string(),
            });
        }
        if !seen.insert(record.canonical_id) {
            return Err(PersistenceError {
                tier: first.tier,
                provider_id: first.provider_id,
                canonical_ids: vec![record.canonical_id],
                message: format!("canonical id {} appears twice in one batch", record.canonical_id),
            });
        }
    }
    Ok(Some((first.tier, first.provider_id)))
}
