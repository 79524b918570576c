//! In-memory canonical source and mapping store, used for dry runs and tests.

use std::collections::{BTreeMap, HashSet};

use admap_core::{CanonicalId, MappingRecord, ProviderId, Tier};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    validate_batch, CanonicalSink, CanonicalSnapshot, CanonicalSource, MappingCounts, MappingStore,
    PersistenceError, ProviderCodes, SeedStats, TaxonomyError, WriteStats,
};

#[derive(Debug)]
pub struct MemoryCanonicalSource {
    snapshot: Mutex<Option<CanonicalSnapshot>>,
}

impl MemoryCanonicalSource {
    pub fn new(snapshot: CanonicalSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
        }
    }

    pub fn empty() -> Self {
        Self::new(CanonicalSnapshot::default())
    }

    /// Source whose every load and seed fails as if the backing store were unreachable.
    pub fn unavailable() -> Self {
        Self {
            snapshot: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CanonicalSource for MemoryCanonicalSource {
    async fn load_snapshot(&self) -> Result<CanonicalSnapshot, TaxonomyError> {
        self.snapshot.lock().await.clone().ok_or_else(|| {
            TaxonomyError::DataUnavailable("in-memory source marked unavailable".to_string())
        })
    }
}

#[async_trait]
impl CanonicalSink for MemoryCanonicalSource {
    async fn seed_snapshot(
        &self,
        snapshot: &CanonicalSnapshot,
    ) -> Result<SeedStats, TaxonomyError> {
        let mut guard = self.snapshot.lock().await;
        let stored = guard.as_mut().ok_or_else(|| {
            TaxonomyError::Write("in-memory source marked unavailable".to_string())
        })?;

        let mut stats = SeedStats::default();
        for tier in Tier::ALL {
            let rows = match tier {
                Tier::Province => &mut stored.provinces,
                Tier::District => &mut stored.districts,
                Tier::Ward => &mut stored.wards,
            };
            let tier_stats = stats.tier_mut(tier);
            for row in snapshot.rows(tier) {
                match rows.iter_mut().find(|r| r.id == row.id) {
                    Some(existing) if existing == row => tier_stats.unchanged += 1,
                    Some(existing) => {
                        *existing = row.clone();
                        tier_stats.written += 1;
                    }
                    None => {
                        rows.push(row.clone());
                        tier_stats.written += 1;
                    }
                }
            }
            rows.sort_by_key(|r| r.id);
        }
        Ok(stats)
    }
}

type MappingKey = (ProviderId, Tier, CanonicalId);

#[derive(Debug, Default)]
pub struct MemoryMappingStore {
    rows: Mutex<BTreeMap<MappingKey, MappingRecord>>,
    failing: Mutex<HashSet<(Tier, CanonicalId)>>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make any batch containing this unit fail, as a storage fault would.
    pub async fn fail_writes_for(&self, tier: Tier, canonical_id: CanonicalId) {
        self.failing.lock().await.insert((tier, canonical_id));
    }

    pub async fn records(&self) -> Vec<MappingRecord> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn upsert_batch(
        &self,
        records: &[MappingRecord],
    ) -> Result<WriteStats, PersistenceError> {
        let Some((tier, provider_id)) = validate_batch(records)? else {
            return Ok(WriteStats::default());
        };

        {
            let failing = self.failing.lock().await;
            let rejected = records
                .iter()
                .filter(|r| failing.contains(&(r.tier, r.canonical_id)))
                .map(|r| r.canonical_id)
                .collect::<Vec<_>>();
            if !rejected.is_empty() {
                return Err(PersistenceError {
                    tier,
                    provider_id,
                    canonical_ids: records.iter().map(|r| r.canonical_id).collect(),
                    message: format!("simulated storage fault for {rejected:?}"),
                });
            }
        }

        let mut rows = self.rows.lock().await;
        let mut stats = WriteStats::default();
        for record in records {
            let key = (record.provider_id, record.tier, record.canonical_id);
            match rows.get(&key) {
                Some(existing) if existing == record => stats.unchanged += 1,
                _ => {
                    rows.insert(key, record.clone());
                    stats.written += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn count_mappings(
        &self,
        provider_id: ProviderId,
    ) -> Result<MappingCounts, PersistenceError> {
        let rows = self.rows.lock().await;
        let mut counts = MappingCounts::default();
        for (pid, tier, _) in rows.keys() {
            if *pid != provider_id {
                continue;
            }
            match tier {
                Tier::Province => counts.provinces += 1,
                Tier::District => counts.districts += 1,
                Tier::Ward => counts.wards += 1,
            }
        }
        Ok(counts)
    }

    async fn lookup_codes(
        &self,
        provider_id: ProviderId,
        province_id: CanonicalId,
        district_id: CanonicalId,
        ward_id: Option<CanonicalId>,
    ) -> Result<ProviderCodes, PersistenceError> {
        let rows = self.rows.lock().await;
        let code = |tier: Tier, id: CanonicalId| {
            rows.get(&(provider_id, tier, id))
                .map(|r| r.provider_code.as_str().to_string())
        };
        Ok(ProviderCodes {
            province: code(Tier::Province, province_id),
            district: code(Tier::District, district_id),
            ward: ward_id.and_then(|id| code(Tier::Ward, id)),
        })
    }
}
