//! Postgres-backed canonical taxonomy reads and provider mapping upserts.

use std::time::Duration;

use admap_core::{CanonicalId, MappingRecord, ProviderId, Tier};
use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::{
    validate_batch, CanonicalRow, CanonicalSink, CanonicalSnapshot, CanonicalSource, MappingCounts,
    MappingStore, PersistenceError, ProviderCodes, SeedStats, TaxonomyError, WriteStats,
};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn connect_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, TaxonomyError> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(|err| {
            TaxonomyError::DataUnavailable(format!("connecting to canonical store: {err}"))
        })
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await?;
    info!("mapping schema migrations applied");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgCanonicalSource {
    pool: PgPool,
}

impl PgCanonicalSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_tier(&self, sql: &str, tier: Tier) -> Result<Vec<CanonicalRow>, TaxonomyError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| TaxonomyError::DataUnavailable(format!("reading {tier} rows: {err}")))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let decode = |err: sqlx::Error| {
                TaxonomyError::DataUnavailable(format!("decoding {tier} row: {err}"))
            };
            out.push(CanonicalRow {
                id: row.try_get("id").map_err(decode)?,
                name: row.try_get("name").map_err(decode)?,
                parent_id: row.try_get("parent_id").map_err(decode)?,
            });
        }
        debug!(%tier, rows = out.len(), "loaded canonical tier");
        Ok(out)
    }
}

#[async_trait]
impl CanonicalSource for PgCanonicalSource {
    async fn load_snapshot(&self) -> Result<CanonicalSnapshot, TaxonomyError> {
        let provinces = self
            .load_tier(
                "SELECT id, name, NULL::BIGINT AS parent_id FROM provinces ORDER BY id",
                Tier::Province,
            )
            .await?;
        let districts = self
            .load_tier(
                "SELECT id, name, province_id AS parent_id FROM districts ORDER BY id",
                Tier::District,
            )
            .await?;
        let wards = self
            .load_tier(
                "SELECT id, name, district_id AS parent_id FROM wards ORDER BY id",
                Tier::Ward,
            )
            .await?;
        Ok(CanonicalSnapshot {
            provinces,
            districts,
            wards,
        })
    }
}

/// Rows per canonical upsert statement; three binds each keeps well under the Postgres bind limit.
const SEED_CHUNK_ROWS: usize = 5_000;

/// Column layout of one canonical table.
struct CanonicalTable {
    table: &'static str,
    parent_col: Option<&'static str>,
}

fn canonical_table(tier: Tier) -> CanonicalTable {
    match tier {
        Tier::Province => CanonicalTable {
            table: "provinces",
            parent_col: None,
        },
        Tier::District => CanonicalTable {
            table: "districts",
            parent_col: Some("province_id"),
        },
        Tier::Ward => CanonicalTable {
            table: "wards",
            parent_col: Some("district_id"),
        },
    }
}

impl CanonicalTable {
    fn insert_head(&self) -> String {
        let parent = self.parent_col.map(|c| format!(", {c}")).unwrap_or_default();
        format!("INSERT INTO {} (id, name{}) ", self.table, parent)
    }

    fn conflict_tail(&self) -> String {
        let t = self.table;
        let mut cols = vec!["name"];
        cols.extend(self.parent_col);
        let set = cols
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let current = cols.iter().map(|c| format!("{t}.{c}")).collect::<Vec<_>>().join(", ");
        let incoming = cols.iter().map(|c| format!("EXCLUDED.{c}")).collect::<Vec<_>>().join(", ");
        format!(
            " ON CONFLICT (id) DO UPDATE SET {set} WHERE ({current}) IS DISTINCT FROM ({incoming})"
        )
    }
}

#[async_trait]
impl CanonicalSink for PgCanonicalSource {
    /// One transaction for the whole snapshot; a failure leaves the tables as they were.
    async fn seed_snapshot(
        &self,
        snapshot: &CanonicalSnapshot,
    ) -> Result<SeedStats, TaxonomyError> {
        let write_error =
            |tier: Tier, err: sqlx::Error| TaxonomyError::Write(format!("{tier} rows: {err}"));
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| TaxonomyError::Write(format!("opening transaction: {err}")))?;

        let mut stats = SeedStats::default();
        for tier in Tier::ALL {
            let layout = canonical_table(tier);
            for chunk in snapshot.rows(tier).chunks(SEED_CHUNK_ROWS) {
                let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(layout.insert_head());
                qb.push_values(chunk.iter(), |mut b, row| {
                    b.push_bind(row.id).push_bind(row.name.as_str());
                    if layout.parent_col.is_some() {
                        b.push_bind(row.parent_id);
                    }
                });
                qb.push(layout.conflict_tail());

                let result = qb
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| write_error(tier, err))?;
                let written = (result.rows_affected() as usize).min(chunk.len());
                stats.tier_mut(tier).merge(WriteStats {
                    written,
                    unchanged: chunk.len() - written,
                });
            }
            debug!(
                %tier,
                rows = snapshot.rows(tier).len(),
                written = stats.tier(tier).written,
                "seeded canonical tier"
            );
        }

        tx.commit()
            .await
            .map_err(|err| TaxonomyError::Write(format!("committing seed: {err}")))?;
        Ok(stats)
    }
}

/// Column layout of one mapping table.
struct MappingTable {
    table: &'static str,
    id_col: &'static str,
    code_col: &'static str,
    name_col: &'static str,
    parent_col: Option<&'static str>,
}

fn mapping_table(tier: Tier) -> MappingTable {
    match tier {
        Tier::Province => MappingTable {
            table: "provider_provinces",
            id_col: "province_id",
            code_col: "provider_province_code",
            name_col: "provider_province_name",
            parent_col: None,
        },
        Tier::District => MappingTable {
            table: "provider_districts",
            id_col: "district_id",
            code_col: "provider_district_code",
            name_col: "provider_district_name",
            parent_col: Some("province_id"),
        },
        Tier::Ward => MappingTable {
            table: "provider_wards",
            id_col: "ward_id",
            code_col: "provider_ward_code",
            name_col: "provider_ward_name",
            parent_col: Some("district_id"),
        },
    }
}

impl MappingTable {
    fn insert_head(&self) -> String {
        let parent = self.parent_col.map(|c| format!(", {c}")).unwrap_or_default();
        format!(
            "INSERT INTO {} (provider_id, {}, {}, {}{}) ",
            self.table, self.id_col, self.code_col, self.name_col, parent
        )
    }

    /// Only touches rows whose values actually differ, so `rows_affected` counts real changes.
    fn conflict_tail(&self) -> String {
        let t = self.table;
        let mut cols = vec![self.code_col, self.name_col];
        cols.extend(self.parent_col);
        let set = cols
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let current = cols.iter().map(|c| format!("{t}.{c}")).collect::<Vec<_>>().join(", ");
        let incoming = cols.iter().map(|c| format!("EXCLUDED.{c}")).collect::<Vec<_>>().join(", ");
        format!(
            " ON CONFLICT (provider_id, {id}) DO UPDATE SET {set}, updated_at = NOW() \
             WHERE ({current}) IS DISTINCT FROM ({incoming})",
            id = self.id_col
        )
    }
}

#[derive(Debug, Clone)]
pub struct PgMappingStore {
    pool: PgPool,
}

impl PgMappingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_code(
        &self,
        tier: Tier,
        provider_id: ProviderId,
        canonical_id: CanonicalId,
    ) -> Result<Option<String>, PersistenceError> {
        let layout = mapping_table(tier);
        let sql = format!(
            "SELECT {} AS code FROM {} WHERE provider_id = $1 AND {} = $2",
            layout.code_col, layout.table, layout.id_col
        );
        let row = sqlx::query(&sql)
            .bind(provider_id)
            .bind(canonical_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| persistence_error(tier, provider_id, vec![canonical_id], err))?;
        row.map(|r| r.try_get::<String, _>("code"))
            .transpose()
            .map_err(|err| persistence_error(tier, provider_id, vec![canonical_id], err))
    }
}

fn persistence_error(
    tier: Tier,
    provider_id: ProviderId,
    canonical_ids: Vec<CanonicalId>,
    err: sqlx::Error,
) -> PersistenceError {
    PersistenceError {
        tier,
        provider_id,
        canonical_ids,
        message: err.to_string(),
    }
}

#[async_trait]
impl MappingStore for PgMappingStore {
    async fn upsert_batch(
        &self,
        records: &[MappingRecord],
    ) -> Result<WriteStats, PersistenceError> {
        let Some((tier, provider_id)) = validate_batch(records)? else {
            return Ok(WriteStats::default());
        };
        let layout = mapping_table(tier);

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(layout.insert_head());
        qb.push_values(records.iter(), |mut b, record| {
            b.push_bind(record.provider_id)
                .push_bind(record.canonical_id)
                .push_bind(record.provider_code.as_str())
                .push_bind(record.provider_name.as_str());
            if layout.parent_col.is_some() {
                b.push_bind(record.parent_canonical_id);
            }
        });
        qb.push(layout.conflict_tail());

        let result = qb.build().execute(&self.pool).await.map_err(|err| {
            let ids = records.iter().map(|r| r.canonical_id).collect();
            persistence_error(tier, provider_id, ids, err)
        })?;

        let written = (result.rows_affected() as usize).min(records.len());
        Ok(WriteStats {
            written,
            unchanged: records.len() - written,
        })
    }

    async fn count_mappings(
        &self,
        provider_id: ProviderId,
    ) -> Result<MappingCounts, PersistenceError> {
        let mut counts = MappingCounts::default();
        for tier in Tier::ALL {
            let layout = mapping_table(tier);
            let sql = format!("SELECT COUNT(*) AS c FROM {} WHERE provider_id = $1", layout.table);
            let count: i64 = sqlx::query(&sql)
                .bind(provider_id)
                .fetch_one(&self.pool)
                .await
                .and_then(|row| row.try_get("c"))
                .map_err(|err| persistence_error(tier, provider_id, Vec::new(), err))?;
            let count = count.max(0) as u64;
            match tier {
                Tier::Province => counts.provinces = count,
                Tier::District => counts.districts = count,
                Tier::Ward => counts.wards = count,
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
        let province = self.fetch_code(Tier::Province, provider_id, province_id).await?;
        let district = self.fetch_code(Tier::District, provider_id, district_id).await?;
        let ward = match ward_id {
            Some(id) => self.fetch_code(Tier::Ward, provider_id, id).await?,
            None => None,
        };
        Ok(ProviderCodes {
            province,
            district,
            ward,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn province_upsert_has_no_parent_column() {
        let layout = mapping_table(Tier::Province);
        assert_eq!(
            layout.insert_head(),
            "INSERT INTO provider_provinces \
             (provider_id, province_id, provider_province_code, provider_province_name) "
        );
        assert!(layout.conflict_tail().contains(
            "ON CONFLICT (provider_id, province_id) \
             DO UPDATE SET provider_province_code = EXCLUDED.provider_province_code"
        ));
    }

    #[test]
    fn canonical_seed_upserts_by_id_with_parent_column() {
        let layout = canonical_table(Tier::District);
        assert_eq!(layout.insert_head(), "INSERT INTO districts (id, name, province_id) ");
        assert_eq!(
            layout.conflict_tail(),
            " ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, \
             province_id = EXCLUDED.province_id \
             WHERE (districts.name, districts.province_id) \
             IS DISTINCT FROM (EXCLUDED.name, EXCLUDED.province_id)"
        );
        assert_eq!(
            canonical_table(Tier::Province).insert_head(),
            "INSERT INTO provinces (id, name) "
        );
    }

    #[test]
    fn ward_upsert_only_rewrites_changed_rows() {
        let tail = mapping_table(Tier::Ward).conflict_tail();
        assert!(tail.contains("district_id = EXCLUDED.district_id"));
        assert!(tail.contains(
            "WHERE (provider_wards.provider_ward_code, provider_wards.provider_ward_name, \
             provider_wards.district_id) IS DISTINCT FROM \
             (EXCLUDED.provider_ward_code, EXCLUDED.provider_ward_name, EXCLUDED.district_id)"
        ));
    }
}
