//! Province → district → ward walk: fetch each level from the provider, match it inside the
//! resolved parent's canonical scope, persist the resolved siblings as one batch, descend.
//!
//! Resolved provinces run as independent subtrees on a bounded worker pool. Claims are settled per
//! sibling group before anything is written, so two workers never write the same key.

use std::collections::BTreeMap;
use std::sync::Arc;

use admap_adapters::{ProviderClient, ProviderError};
use admap_core::{
    CanonicalId, CanonicalUnit, MappingRecord, ProviderCode, ProviderId, ProviderUnit, Tier,
};
use admap_storage::{BackoffPolicy, CanonicalSource, MappingCounts, MappingStore};
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::index::CanonicalIndex;
use crate::matcher::{settle_claims, Matcher};
use crate::report::{
    mapping_digest, AmbiguousUnit, Diagnostic, DiagnosticKind, ReconcileReport, TierCounts,
    UnresolvedReason, UnresolvedUnit,
};
use crate::ReconcileError;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    pub provider_id: ProviderId,
    /// Province subtrees processed at once.
    pub concurrency: usize,
    /// Caller-side retry of retryable provider failures.
    pub backoff: BackoffPolicy,
}

pub struct Reconciler {
    client: Arc<dyn ProviderClient>,
    index: Arc<CanonicalIndex>,
    store: Arc<dyn MappingStore>,
    matcher: Matcher,
    settings: ReconcileSettings,
    cancel: CancellationToken,
}

/// Load the canonical taxonomy from `source`, then run. Nothing is fetched if the load fails.
pub async fn reconcile(
    source: &dyn CanonicalSource,
    client: Arc<dyn ProviderClient>,
    store: Arc<dyn MappingStore>,
    matcher: Matcher,
    settings: ReconcileSettings,
    cancel: CancellationToken,
) -> Result<ReconcileReport, ReconcileError> {
    let index = CanonicalIndex::load(source).await?;
    Reconciler::new(client, Arc::new(index), store, matcher, settings)
        .with_cancellation(cancel)
        .run()
        .await
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn ProviderClient>,
        index: Arc<CanonicalIndex>,
        store: Arc<dyn MappingStore>,
        matcher: Matcher,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            client,
            index,
            store,
            matcher,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run to completion. Only a failed province list is fatal; every other failure is recorded in
    /// the report and the walk continues.
    pub async fn run(&self) -> Result<ReconcileReport, ReconcileError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let walk = Arc::new(Walk {
            client: Arc::clone(&self.client),
            index: Arc::clone(&self.index),
            store: Arc::clone(&self.store),
            matcher: self.matcher,
            settings: self.settings,
            cancel: self.cancel.clone(),
        });
        let provider = walk.client.provider_code().to_string();
        info!(
            %run_id,
            provider = %provider,
            provider_id = self.settings.provider_id,
            "reconciliation started"
        );

        let mut tally = Tally::default();
        let provinces = match walk.fetch(Tier::Province, None).await {
            FetchOutcome::Units(units) => units,
            FetchOutcome::Failed(source) => {
                error!(
                    provider = %provider,
                    error = %source,
                    "province list unavailable; aborting run"
                );
                return Err(ReconcileError::ProviderUnavailable { provider, source });
            }
            FetchOutcome::Cancelled => {
                tally.diagnostics.push(Diagnostic {
                    kind: DiagnosticKind::NotAttempted,
                    tier: Tier::Province,
                    parent_provider_code: None,
                    parent_canonical_id: None,
                    message: "cancelled before the province list was requested".to_string(),
                });
                Vec::new()
            }
        };

        let resolved = walk
            .reconcile_level(
                Tier::Province,
                &provinces,
                walk.index.provinces(),
                None,
                None,
                &mut tally,
            )
            .await;

        let permits = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut workers = JoinSet::new();
        for (order, (province, canonical_id)) in resolved.into_iter().enumerate() {
            let walk = Arc::clone(&walk);
            let permits = Arc::clone(&permits);
            let span =
                info_span!("province", provider_code = %province.provider_code, canonical_id);
            workers.spawn(
                async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .expect("province semaphore is never closed");
                    (order, walk.reconcile_province(&province, canonical_id).await)
                }
                .instrument(span),
            );
        }

        let mut subtrees = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(subtree) => subtrees.push(subtree),
                Err(err) => {
                    error!(error = %err, "province worker failed");
                    tally.diagnostics.push(Diagnostic {
                        kind: DiagnosticKind::SubtreeSkipped,
                        tier: Tier::District,
                        parent_provider_code: None,
                        parent_canonical_id: None,
                        message: format!("province worker failed: {err}"),
                    });
                }
            }
        }
        subtrees.sort_by_key(|(order, _)| *order);
        for (_, subtree) in subtrees {
            tally.absorb(subtree);
        }

        let stored_totals = match walk.store.count_mappings(self.settings.provider_id).await {
            Ok(totals) => Some(totals),
            Err(err) => {
                warn!(error = %err, "could not count stored mappings");
                None
            }
        };

        let cancelled = self.cancel.is_cancelled();
        let report = tally.into_report(RunMeta {
            run_id,
            provider_code: provider,
            provider_id: self.settings.provider_id,
            started_at,
            cancelled,
            stored_totals,
        });
        for tier in Tier::ALL {
            let c = report.counts(tier);
            info!(
                %tier,
                fetched = c.fetched,
                resolved = c.resolved,
                unresolved = c.unresolved,
                ambiguous = c.ambiguous,
                written = c.written,
                unchanged = c.unchanged,
                persist_failed = c.persist_failed,
                "tier summary"
            );
        }
        info!(%run_id, cancelled, digest = %report.mapping_digest, "reconciliation finished");
        Ok(report)
    }
}

enum FetchOutcome {
    Units(Vec<ProviderUnit>),
    Failed(ProviderError),
    Cancelled,
}

/// State shared by the province workers of one run.
struct Walk {
    client: Arc<dyn ProviderClient>,
    index: Arc<CanonicalIndex>,
    store: Arc<dyn MappingStore>,
    matcher: Matcher,
    settings: ReconcileSettings,
    cancel: CancellationToken,
}

impl Walk {
    /// Fetch one level, retrying retryable failures with backoff.
    /// No call starts after cancellation.
    async fn fetch(&self, tier: Tier, parent: Option<&ProviderCode>) -> FetchOutcome {
        let backoff = self.settings.backoff;
        let mut attempt = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                return FetchOutcome::Cancelled;
            }
            let result = match (tier, parent) {
                (Tier::Province, _) => self.client.fetch_provinces().await,
                (Tier::District, Some(code)) => self.client.fetch_districts(code).await,
                (Tier::Ward, Some(code)) => self.client.fetch_wards(code).await,
                (_, None) => Ok(Vec::new()),
            };
            match result {
                Ok(units) => {
                    debug!(
                        %tier,
                        parent = ?parent.map(ProviderCode::as_str),
                        units = units.len(),
                        "fetched provider units"
                    );
                    return FetchOutcome::Units(units);
                }
                Err(err) if err.is_retryable() && attempt < backoff.max_retries => {
                    let delay = backoff.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(
                        %tier,
                        parent = ?parent.map(ProviderCode::as_str),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "provider call failed; retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return FetchOutcome::Failed(err),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return FetchOutcome::Failed(err),
            }
        }
    }

    async fn reconcile_province(&self, province: &ProviderUnit, province_id: CanonicalId) -> Tally {
        let mut tally = Tally::default();
        let code = &province.provider_code;

        let Some(districts) = self
            .fetch_children(Tier::District, code, province_id, &mut tally)
            .await
        else {
            return tally;
        };
        let resolved = self
            .reconcile_level(
                Tier::District,
                &districts,
                self.index.districts_of(province_id),
                Some(code),
                Some(province_id),
                &mut tally,
            )
            .await;

        for (district, district_id) in resolved {
            let code = &district.provider_code;
            let Some(wards) = self
                .fetch_children(Tier::Ward, code, district_id, &mut tally)
                .await
            else {
                continue;
            };
            self.reconcile_level(
                Tier::Ward,
                &wards,
                self.index.wards_of(district_id),
                Some(code),
                Some(district_id),
                &mut tally,
            )
            .await;
        }
        tally
    }

    /// Children of a resolved parent, or `None` with a diagnostic when the subtree cannot proceed.
    async fn fetch_children(
        &self,
        tier: Tier,
        parent: &ProviderCode,
        parent_id: CanonicalId,
        tally: &mut Tally,
    ) -> Option<Vec<ProviderUnit>> {
        let (kind, message) = match self.fetch(tier, Some(parent)).await {
            FetchOutcome::Units(units) => return Some(units),
            FetchOutcome::Failed(err) => {
                warn!(
                    %tier,
                    parent = %parent,
                    parent_canonical_id = parent_id,
                    error = %err,
                    "skipping subtree"
                );
                (DiagnosticKind::SubtreeSkipped, err.to_string())
            }
            FetchOutcome::Cancelled => {
                info!(
                    %tier,
                    parent = %parent,
                    parent_canonical_id = parent_id,
                    "cancelled before fetch; subtree not attempted"
                );
                (
                    DiagnosticKind::NotAttempted,
                    "run cancelled before this subtree was requested".to_string(),
                )
            }
        };
        tally.diagnostics.push(Diagnostic {
            kind,
            tier,
            parent_provider_code: Some(parent.clone()),
            parent_canonical_id: Some(parent_id),
            message,
        });
        None
    }

    /// Match one sibling group within `candidates` and persist its resolved members as one
    /// batch. Returns the matched units with their canonical ids, in provider order. A batch
    /// that failed to persist is still returned so the walk descends into its canonical scopes.
    async fn reconcile_level(
        &self,
        tier: Tier,
        units: &[ProviderUnit],
        candidates: &[CanonicalUnit],
        parent_code: Option<&ProviderCode>,
        parent_id: Option<CanonicalId>,
        tally: &mut Tally,
    ) -> Vec<(ProviderUnit, CanonicalId)> {
        let mut counts = TierCounts {
            fetched: units.len(),
            ..Default::default()
        };
        if units.is_empty() {
            tally.count(tier, &counts);
            return Vec::new();
        }

        if candidates.is_empty() {
            error!(
                %tier,
                parent = ?parent_code.map(ProviderCode::as_str),
                parent_canonical_id = ?parent_id,
                units = units.len(),
                "no canonical units in scope; canonical data is probably incomplete"
            );
            tally.diagnostics.push(Diagnostic {
                kind: DiagnosticKind::EmptyScope,
                tier,
                parent_provider_code: parent_code.cloned(),
                parent_canonical_id: parent_id,
                message: format!("{} provider units had no canonical candidates", units.len()),
            });
            for unit in units {
                tally.unresolved.push(unresolved(
                    tier,
                    unit,
                    parent_code,
                    parent_id,
                    UnresolvedReason::EmptyScope,
                    None,
                    0.0,
                ));
            }
            counts.unresolved = units.len();
            tally.count(tier, &counts);
            return Vec::new();
        }

        let mut results = units
            .iter()
            .map(|unit| self.matcher.match_unit(tier, unit, candidates))
            .collect::<Vec<_>>();
        let losers = settle_claims(&mut results);

        let mut resolved = Vec::new();
        let mut records = Vec::new();
        let mut scores = Vec::new();
        for (idx, (unit, result)) in units.iter().zip(&results).enumerate() {
            let Some(canonical_id) = result.canonical_id else {
                let reason = if losers.contains(&idx) {
                    info!(
                        %tier,
                        provider_code = %unit.provider_code,
                        name = %unit.name,
                        claimed = ?result.best_candidate,
                        score = result.score,
                        "canonical unit already claimed by a sibling"
                    );
                    UnresolvedReason::DuplicateTarget
                } else {
                    info!(
                        %tier,
                        provider_code = %unit.provider_code,
                        name = %unit.name,
                        best = ?result.best_candidate,
                        score = result.score,
                        "no canonical match"
                    );
                    UnresolvedReason::NoMatch
                };
                tally.unresolved.push(unresolved(
                    tier,
                    unit,
                    parent_code,
                    parent_id,
                    reason,
                    result.best_candidate,
                    result.score,
                ));
                continue;
            };

            if result.ambiguous {
                warn!(
                    %tier,
                    provider_code = %unit.provider_code,
                    name = %unit.name,
                    chosen = canonical_id,
                    tied = ?result.tied_ids,
                    score = result.score,
                    "ambiguous match; kept first candidate"
                );
                counts.ambiguous += 1;
                tally.ambiguous.push(AmbiguousUnit {
                    tier,
                    provider_code: unit.provider_code.clone(),
                    provider_name: unit.name.clone(),
                    chosen: canonical_id,
                    tied_ids: result.tied_ids.clone(),
                    score: result.score,
                });
            }
            debug!(
                %tier,
                provider_code = %unit.provider_code,
                canonical_id,
                score = result.score,
                "matched"
            );
            records.push(MappingRecord {
                provider_id: self.settings.provider_id,
                tier,
                canonical_id,
                provider_code: unit.provider_code.clone(),
                provider_name: unit.name.clone(),
                parent_canonical_id: parent_id,
            });
            scores.push(result.score);
            resolved.push((unit.clone(), canonical_id));
        }

        if !records.is_empty() {
            match self.store.upsert_batch(&records).await {
                Ok(stats) => {
                    counts.written = stats.written;
                    counts.unchanged = stats.unchanged;
                }
                Err(err) => {
                    error!(
                        %tier,
                        parent = ?parent_code.map(ProviderCode::as_str),
                        rows = records.len(),
                        error = %err,
                        "mapping batch not persisted"
                    );
                    counts.persist_failed = records.len();
                    tally.diagnostics.push(Diagnostic {
                        kind: DiagnosticKind::PersistFailed,
                        tier,
                        parent_provider_code: parent_code.cloned(),
                        parent_canonical_id: parent_id,
                        message: err.to_string(),
                    });
                    // Matched but not stored: listed for follow-up, kept out of the mapping set.
                    for ((unit, canonical_id), score) in resolved.iter().zip(&scores) {
                        tally.unresolved.push(unresolved(
                            tier,
                            unit,
                            parent_code,
                            parent_id,
                            UnresolvedReason::PersistFailed,
                            Some(*canonical_id),
                            *score,
                        ));
                    }
                    records.clear();
                }
            }
        }
        counts.resolved = records.len();
        counts.unresolved = units.len() - records.len();
        tally.count(tier, &counts);
        tally.mappings.extend(records);
        resolved
    }
}

fn unresolved(
    tier: Tier,
    unit: &ProviderUnit,
    parent_code: Option<&ProviderCode>,
    parent_id: Option<CanonicalId>,
    reason: UnresolvedReason,
    best_candidate: Option<CanonicalId>,
    best_score: f64,
) -> UnresolvedUnit {
    UnresolvedUnit {
        tier,
        provider_code: unit.provider_code.clone(),
        provider_name: unit.name.clone(),
        parent_provider_code: parent_code.cloned(),
        parent_canonical_id: parent_id,
        reason,
        best_candidate,
        best_score,
    }
}

struct RunMeta {
    run_id: Uuid,
    provider_code: String,
    provider_id: ProviderId,
    started_at: DateTime<Utc>,
    cancelled: bool,
    stored_totals: Option<MappingCounts>,
}

#[derive(Debug, Default)]
struct Tally {
    counts: BTreeMap<Tier, TierCounts>,
    unresolved: Vec<UnresolvedUnit>,
    ambiguous: Vec<AmbiguousUnit>,
    diagnostics: Vec<Diagnostic>,
    mappings: Vec<MappingRecord>,
}

impl Tally {
    fn count(&mut self, tier: Tier, counts: &TierCounts) {
        self.counts.entry(tier).or_default().merge(counts);
    }

    fn absorb(&mut self, other: Tally) {
        for (tier, counts) in &other.counts {
            self.count(*tier, counts);
        }
        self.unresolved.extend(other.unresolved);
        self.ambiguous.extend(other.ambiguous);
        self.diagnostics.extend(other.diagnostics);
        self.mappings.extend(other.mappings);
    }

    fn into_report(mut self, meta: RunMeta) -> ReconcileReport {
        self.unresolved.sort_by(|a, b| {
            (a.tier, &a.parent_provider_code, &a.provider_code).cmp(&(
                b.tier,
                &b.parent_provider_code,
                &b.provider_code,
            ))
        });
        self.ambiguous
            .sort_by(|a, b| (a.tier, &a.provider_code).cmp(&(b.tier, &b.provider_code)));
        self.diagnostics.sort_by(|a, b| {
            (a.tier, a.kind, &a.parent_provider_code).cmp(&(
                b.tier,
                b.kind,
                &b.parent_provider_code,
            ))
        });
        self.mappings.sort();
        for tier in Tier::ALL {
            self.counts.entry(tier).or_default();
        }

        ReconcileReport {
            run_id: meta.run_id,
            provider_code: meta.provider_code,
            provider_id: meta.provider_id,
            started_at: meta.started_at,
            finished_at: Utc::now(),
            cancelled: meta.cancelled,
            counts: self.counts,
            unresolved: self.unresolved,
            ambiguous: self.ambiguous,
            diagnostics: self.diagnostics,
            mapping_digest: mapping_digest(&self.mappings),
            stored_totals: meta.stored_totals,
            mappings: self.mappings,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use admap_adapters::{FailureKind, FixtureProviderClient, ProviderFixture};
    use admap_storage::{CanonicalRow, CanonicalSnapshot, MemoryCanonicalSource, MemoryMappingStore};
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::config::Thresholds;

    fn snapshot() -> CanonicalSnapshot {
        CanonicalSnapshot {
            provinces: vec![
                CanonicalRow::new(1, "Thành phố Hà Nội", None),
                CanonicalRow::new(79, "Thành phố Hồ Chí Minh", None),
            ],
            districts: vec![
                CanonicalRow::new(1, "Quận Ba Đình", Some(1)),
                CanonicalRow::new(2, "Quận Hoàn Kiếm", Some(1)),
                CanonicalRow::new(760, "Quận 1", Some(79)),
                CanonicalRow::new(769, "Quận 2", Some(79)),
                CanonicalRow::new(783, "Huyện Củ Chi", Some(79)),
            ],
            wards: vec![
                CanonicalRow::new(1, "Phường Phúc Xá", Some(1)),
                CanonicalRow::new(37, "Phường Phúc Tân", Some(2)),
                CanonicalRow::new(26734, "Phường Tân Định", Some(760)),
                CanonicalRow::new(26737, "Phường Đa Kao", Some(760)),
                CanonicalRow::new(26740, "Phường Bến Nghé", Some(760)),
                CanonicalRow::new(27127, "Phường Thảo Điền", Some(769)),
            ],
        }
    }

    fn fixture() -> serde_json::Value {
        json!({
            "provider_code": "ghn",
            "provinces": [
                { "code": 202, "name": "Hồ Chí Minh" },
                { "code": 201, "name": "Hà Nội" }
            ],
            "districts": {
                "202": [
                    { "code": 1442, "name": "District 1" },
                    { "code": 1443, "name": "Quận 2" },
                    { "code": 1462, "name": "Huyện Củ Chi" }
                ],
                "201": [
                    { "code": 1484, "name": "Ba Đình" },
                    { "code": 1489, "name": "Hoàn Kiếm" }
                ]
            },
            "wards": {
                "1442": [
                    { "code": "20101", "name": "Phường Tân Định" },
                    { "code": "20102", "name": "Phường Đa Kao" },
                    { "code": "20109", "name": "Phường Bến Nghé" },
                    { "code": "20199", "name": "Phường Xyz" }
                ],
                "1443": [{ "code": "20201", "name": "Phường Thảo Điền" }],
                "1484": [{ "code": "1A0101", "name": "Phường Phúc Xá" }],
                "1489": [{ "code": "1A0201", "name": "Phường Phúc Tân" }]
            }
        })
    }

    fn client(value: serde_json::Value) -> Arc<FixtureProviderClient> {
        let fixture: ProviderFixture = serde_json::from_value(value).unwrap();
        Arc::new(FixtureProviderClient::new(fixture))
    }

    fn settings() -> ReconcileSettings {
        ReconcileSettings {
            provider_id: 1,
            concurrency: 2,
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        }
    }

    fn reconciler(
        client: Arc<dyn ProviderClient>,
        snapshot: &CanonicalSnapshot,
        store: Arc<MemoryMappingStore>,
    ) -> Reconciler {
        let index = CanonicalIndex::build(snapshot).unwrap();
        Reconciler::new(
            client,
            Arc::new(index),
            store,
            Matcher::new(Thresholds::default()),
            settings(),
        )
    }

    fn calls_for(calls: &[(Tier, Option<ProviderCode>)], tier: Tier, parent: &str) -> usize {
        calls
            .iter()
            .filter(|(t, p)| *t == tier && p.as_ref().map(ProviderCode::as_str) == Some(parent))
            .count()
    }

    #[tokio::test]
    async fn full_run_maps_every_tier_and_reports_unmatched_wards() {
        let store = Arc::new(MemoryMappingStore::new());
        let report = reconciler(client(fixture()), &snapshot(), store.clone()).run().await.unwrap();

        assert_eq!(report.counts(Tier::Province).resolved, 2);
        assert_eq!(report.counts(Tier::District).written, 5);
        let wards = report.counts(Tier::Ward);
        assert_eq!((wards.fetched, wards.resolved, wards.unresolved), (7, 6, 1));
        assert!(!report.cancelled);
        assert!(report.diagnostics.is_empty());

        let district_1 = report
            .mappings
            .iter()
            .find(|m| m.tier == Tier::District && m.provider_code.as_str() == "1442")
            .unwrap();
        assert_eq!(district_1.canonical_id, 760);
        assert_eq!(district_1.parent_canonical_id, Some(79));

        assert_eq!(report.unresolved.len(), 1);
        let xyz = &report.unresolved[0];
        assert_eq!(xyz.provider_code.as_str(), "20199");
        assert_eq!(xyz.reason, UnresolvedReason::NoMatch);
        assert_eq!(xyz.parent_canonical_id, Some(760));
        assert!(store
            .records()
            .await
            .iter()
            .all(|r| r.provider_code.as_str() != "20199"));
        assert_eq!(store.len().await, 13);
        assert_eq!(
            report.stored_totals,
            Some(MappingCounts {
                provinces: 2,
                districts: 5,
                wards: 6
            })
        );
    }

    #[tokio::test]
    async fn rerun_changes_nothing_and_keeps_the_digest() {
        let store = Arc::new(MemoryMappingStore::new());
        let first = reconciler(client(fixture()), &snapshot(), store.clone()).run().await.unwrap();
        let second = reconciler(client(fixture()), &snapshot(), store.clone()).run().await.unwrap();

        for tier in Tier::ALL {
            assert_eq!(second.counts(tier).written, 0, "{tier}");
            assert_eq!(second.counts(tier).unchanged, first.counts(tier).written, "{tier}");
        }
        assert_eq!(first.mapping_digest, second.mapping_digest);
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(store.len().await, 13);
    }

    #[tokio::test]
    async fn province_failure_aborts_before_any_district_fetch() {
        let client = client(fixture());
        client.fail(Tier::Province, None, FailureKind::Unavailable).await;
        let store = Arc::new(MemoryMappingStore::new());

        let err = reconciler(client.clone(), &snapshot(), store.clone()).run().await.unwrap_err();
        assert!(matches!(err, ReconcileError::ProviderUnavailable { .. }));

        let calls = client.calls().await;
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(tier, _)| *tier == Tier::Province));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn bad_province_payload_is_fatal_without_retry() {
        let client = client(fixture());
        client.fail(Tier::Province, None, FailureKind::BadResponse).await;
        let store = Arc::new(MemoryMappingStore::new());

        assert!(reconciler(client.clone(), &snapshot(), store).run().await.is_err());
        assert_eq!(client.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn district_list_failure_skips_only_that_province() {
        let client = client(fixture());
        client
            .fail(Tier::District, Some(ProviderCode::new("201")), FailureKind::Unavailable)
            .await;
        let store = Arc::new(MemoryMappingStore::new());

        let report = reconciler(client.clone(), &snapshot(), store).run().await.unwrap();

        let skipped = report
            .diagnostics_of(DiagnosticKind::SubtreeSkipped)
            .collect::<Vec<_>>();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].tier, Tier::District);
        assert_eq!(skipped[0].parent_provider_code, Some(ProviderCode::new("201")));

        assert_eq!(report.counts(Tier::District).resolved, 3);
        assert_eq!(report.counts(Tier::Ward).fetched, 5);
        assert_eq!(calls_for(&client.calls().await, Tier::District, "201"), 3);
    }

    #[tokio::test]
    async fn ward_failure_keeps_sibling_districts() {
        let client = client(fixture());
        client
            .fail(Tier::Ward, Some(ProviderCode::new("1442")), FailureKind::BadResponse)
            .await;
        let store = Arc::new(MemoryMappingStore::new());

        let report = reconciler(client.clone(), &snapshot(), store.clone()).run().await.unwrap();

        let skipped = report
            .diagnostics_of(DiagnosticKind::SubtreeSkipped)
            .collect::<Vec<_>>();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].parent_canonical_id, Some(760));
        assert_eq!(calls_for(&client.calls().await, Tier::Ward, "1442"), 1);

        let wards = store
            .records()
            .await
            .into_iter()
            .filter(|r| r.tier == Tier::Ward)
            .map(|r| r.canonical_id)
            .collect::<Vec<_>>();
        assert_eq!(wards, vec![1, 37, 27127]);
    }

    #[tokio::test]
    async fn unavailable_ward_list_is_retried_then_skipped() {
        let client = client(fixture());
        client
            .fail(Tier::Ward, Some(ProviderCode::new("1442")), FailureKind::Unavailable)
            .await;
        let store = Arc::new(MemoryMappingStore::new());

        let report = reconciler(client.clone(), &snapshot(), store.clone()).run().await.unwrap();

        assert_eq!(calls_for(&client.calls().await, Tier::Ward, "1442"), 3);
        let skipped = report
            .diagnostics_of(DiagnosticKind::SubtreeSkipped)
            .collect::<Vec<_>>();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].tier, Tier::Ward);
        assert_eq!(skipped[0].parent_canonical_id, Some(760));
        assert_eq!(report.counts(Tier::Ward).written, 3);
        assert_eq!(report.counts(Tier::District).written, 5);
        assert!(!report.cancelled);
    }

    /// Fails the wards of district 1442 as unavailable and cancels the run on that first failure.
    struct CancelOnWardFailure {
        inner: Arc<FixtureProviderClient>,
        token: CancellationToken,
    }

    #[async_trait]
    impl ProviderClient for CancelOnWardFailure {
        fn provider_code(&self) -> &str {
            self.inner.provider_code()
        }

        async fn fetch_provinces(&self) -> Result<Vec<ProviderUnit>, ProviderError> {
            self.inner.fetch_provinces().await
        }

        async fn fetch_districts(
            &self,
            province: &ProviderCode,
        ) -> Result<Vec<ProviderUnit>, ProviderError> {
            self.inner.fetch_districts(province).await
        }

        async fn fetch_wards(
            &self,
            district: &ProviderCode,
        ) -> Result<Vec<ProviderUnit>, ProviderError> {
            let result = self.inner.fetch_wards(district).await;
            if result.is_err() {
                self.token.cancel();
            }
            result
        }
    }

    #[tokio::test]
    async fn cancel_during_backoff_skips_the_subtree() {
        let inner = client(fixture());
        inner
            .fail(Tier::Ward, Some(ProviderCode::new("1442")), FailureKind::Unavailable)
            .await;
        let token = CancellationToken::new();
        let wrapper = Arc::new(CancelOnWardFailure {
            inner: inner.clone(),
            token: token.clone(),
        });
        let store = Arc::new(MemoryMappingStore::new());
        let index = CanonicalIndex::build(&snapshot()).unwrap();
        let reconciler = Reconciler::new(
            wrapper,
            Arc::new(index),
            store,
            Matcher::new(Thresholds::default()),
            ReconcileSettings {
                concurrency: 1,
                backoff: BackoffPolicy {
                    max_retries: 2,
                    base_delay: Duration::from_secs(60),
                    max_delay: Duration::from_secs(60),
                },
                ..settings()
            },
        )
        .with_cancellation(token);
        let run = reconciler.run();

        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("cancellation interrupts the backoff sleep")
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(calls_for(&inner.calls().await, Tier::Ward, "1442"), 1);
        let skipped = report
            .diagnostics_of(DiagnosticKind::SubtreeSkipped)
            .collect::<Vec<_>>();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].tier, Tier::Ward);
        assert_eq!(skipped[0].parent_canonical_id, Some(760));
    }

    #[tokio::test]
    async fn empty_canonical_scope_is_reported_as_error() {
        let mut snap = snapshot();
        snap.provinces.push(CanonicalRow::new(2, "Tỉnh Hà Giang", None));
        let mut value = fixture();
        value["provinces"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "code": 269, "name": "Hà Giang" }));
        value["districts"]["269"] = json!([{ "code": 2264, "name": "Huyện Mèo Vạc" }]);

        let store = Arc::new(MemoryMappingStore::new());
        let report = reconciler(client(value), &snap, store).run().await.unwrap();

        let empty = report.diagnostics_of(DiagnosticKind::EmptyScope).collect::<Vec<_>>();
        assert_eq!(empty.len(), 1);
        assert_eq!(empty[0].parent_canonical_id, Some(2));
        let meo_vac = report
            .unresolved
            .iter()
            .find(|u| u.provider_code.as_str() == "2264")
            .unwrap();
        assert_eq!(meo_vac.reason, UnresolvedReason::EmptyScope);
        assert_eq!(report.counts(Tier::Province).resolved, 3);
    }

    #[tokio::test]
    async fn sibling_claiming_a_taken_unit_is_unresolved() {
        let mut value = fixture();
        value["districts"]["202"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "code": 1500, "name": "Q. 1" }));
        let client = client(value);
        let store = Arc::new(MemoryMappingStore::new());

        let report = reconciler(client.clone(), &snapshot(), store).run().await.unwrap();

        let dup = report
            .unresolved
            .iter()
            .find(|u| u.provider_code.as_str() == "1500")
            .unwrap();
        assert_eq!(dup.reason, UnresolvedReason::DuplicateTarget);
        assert_eq!(dup.best_candidate, Some(760));
        assert_eq!(calls_for(&client.calls().await, Tier::Ward, "1500"), 0);
        assert_eq!(report.counts(Tier::District).written, 5);
    }

    #[tokio::test]
    async fn tied_candidates_are_reported_as_ambiguous() {
        let mut snap = snapshot();
        snap.districts.push(CanonicalRow::new(761, "Quận 1", Some(79)));
        let store = Arc::new(MemoryMappingStore::new());

        let report = reconciler(client(fixture()), &snap, store).run().await.unwrap();

        assert_eq!(report.ambiguous.len(), 1);
        assert_eq!(report.ambiguous[0].chosen, 760);
        assert_eq!(report.ambiguous[0].tied_ids, vec![760, 761]);
        assert_eq!(report.counts(Tier::District).ambiguous, 1);
    }

    #[tokio::test]
    async fn persistence_failure_is_scoped_to_its_batch() {
        let store = Arc::new(MemoryMappingStore::new());
        store.fail_writes_for(Tier::Ward, 26734).await;

        let report = reconciler(client(fixture()), &snapshot(), store.clone()).run().await.unwrap();

        let wards = report.counts(Tier::Ward);
        assert_eq!(wards.persist_failed, 3);
        assert_eq!(wards.written, 3);
        assert_eq!((wards.fetched, wards.resolved, wards.unresolved), (7, 3, 4));
        let failed = report
            .diagnostics_of(DiagnosticKind::PersistFailed)
            .collect::<Vec<_>>();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].parent_canonical_id, Some(760));

        let unstored = report
            .unresolved
            .iter()
            .filter(|u| u.reason == UnresolvedReason::PersistFailed)
            .map(|u| (u.provider_code.as_str(), u.best_candidate))
            .collect::<Vec<_>>();
        assert_eq!(
            unstored,
            vec![("20101", Some(26734)), ("20102", Some(26737)), ("20109", Some(26740))]
        );

        let reported = report
            .mappings
            .iter()
            .filter(|m| m.tier == Tier::Ward)
            .map(|m| m.canonical_id)
            .collect::<Vec<_>>();
        let stored = store
            .records()
            .await
            .into_iter()
            .filter(|r| r.tier == Tier::Ward)
            .map(|r| r.canonical_id)
            .collect::<Vec<_>>();
        assert_eq!(reported, vec![1, 37, 27127]);
        assert_eq!(reported, stored);
    }

    #[tokio::test]
    async fn failed_district_batch_still_descends_into_wards() {
        let store = Arc::new(MemoryMappingStore::new());
        store.fail_writes_for(Tier::District, 1).await;

        let report = reconciler(client(fixture()), &snapshot(), store.clone()).run().await.unwrap();

        let districts = report.counts(Tier::District);
        assert_eq!((districts.resolved, districts.unresolved, districts.persist_failed), (3, 2, 2));
        assert!(report
            .mappings
            .iter()
            .all(|m| !(m.tier == Tier::District && m.parent_canonical_id == Some(1))));
        assert_eq!(report.counts(Tier::Ward).written, 6);
    }

    /// Cancels the run as soon as the first district list is requested.
    struct CancelOnDistricts {
        inner: Arc<FixtureProviderClient>,
        token: CancellationToken,
    }

    #[async_trait]
    impl ProviderClient for CancelOnDistricts {
        fn provider_code(&self) -> &str {
            self.inner.provider_code()
        }

        async fn fetch_provinces(&self) -> Result<Vec<ProviderUnit>, ProviderError> {
            self.inner.fetch_provinces().await
        }

        async fn fetch_districts(
            &self,
            province: &ProviderCode,
        ) -> Result<Vec<ProviderUnit>, ProviderError> {
            self.token.cancel();
            self.inner.fetch_districts(province).await
        }

        async fn fetch_wards(
            &self,
            district: &ProviderCode,
        ) -> Result<Vec<ProviderUnit>, ProviderError> {
            self.inner.fetch_wards(district).await
        }
    }

    #[tokio::test]
    async fn cancellation_stops_new_fetches_but_persists_matched_batches() {
        let inner = client(fixture());
        let token = CancellationToken::new();
        let wrapper = Arc::new(CancelOnDistricts {
            inner: inner.clone(),
            token: token.clone(),
        });
        let store = Arc::new(MemoryMappingStore::new());
        let index = CanonicalIndex::build(&snapshot()).unwrap();
        let report = Reconciler::new(
            wrapper,
            Arc::new(index),
            store.clone(),
            Matcher::new(Thresholds::default()),
            ReconcileSettings {
                concurrency: 1,
                ..settings()
            },
        )
        .with_cancellation(token)
        .run()
        .await
        .unwrap();

        assert!(report.cancelled);
        let calls = inner.calls().await;
        assert_eq!(calls.iter().filter(|(t, _)| *t == Tier::District).count(), 1);
        assert_eq!(calls.iter().filter(|(t, _)| *t == Tier::Ward).count(), 0);

        let districts_written = report.counts(Tier::District).written;
        assert!(districts_written > 0);
        assert_eq!(
            store.records().await.iter().filter(|r| r.tier == Tier::District).count(),
            districts_written
        );

        let not_attempted = report
            .diagnostics_of(DiagnosticKind::NotAttempted)
            .collect::<Vec<_>>();
        let skipped_provinces = not_attempted.iter().filter(|d| d.tier == Tier::District).count();
        let skipped_districts = not_attempted.iter().filter(|d| d.tier == Tier::Ward).count();
        assert_eq!(skipped_provinces, 1);
        assert_eq!(skipped_districts, districts_written);
        assert_eq!(report.diagnostics_of(DiagnosticKind::SubtreeSkipped).count(), 0);
    }

    #[tokio::test]
    async fn unreachable_canonical_store_aborts_before_any_fetch() {
        let client = client(fixture());
        let store = Arc::new(MemoryMappingStore::new());
        let err = reconcile(
            &MemoryCanonicalSource::unavailable(),
            client.clone(),
            store,
            Matcher::new(Thresholds::default()),
            settings(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ReconcileError::DataUnavailable(_)));
        assert!(client.calls().await.is_empty());
    }
}
