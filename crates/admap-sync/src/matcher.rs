//! Scoped fuzzy matching of provider units against canonical candidates.

use std::collections::BTreeMap;

use admap_core::{
    normalize, CanonicalId, CanonicalUnit, MatchResult, ProviderCode, ProviderUnit, Tier,
};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::trace;

use crate::config::Thresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Highest similarity wins.
    Fuzzy,
    /// An identical normalized key wins outright; otherwise fall back to fuzzy.
    ExactThenFuzzy,
}

impl MatchPolicy {
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Province => MatchPolicy::ExactThenFuzzy,
            Tier::District | Tier::Ward => MatchPolicy::Fuzzy,
        }
    }
}

/// Similarity of two normalized keys in `[0, 1]`.
///
/// Takes the better of plain Jaro-Winkler and Jaro-Winkler over the sorted tokens, so word order
/// differences such as `"minh ho chi"` still score high.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    jaro_winkler(a, b).max(jaro_winkler(&sorted_tokens(a), &sorted_tokens(b)))
}

fn sorted_tokens(key: &str) -> String {
    let mut tokens = key.split_whitespace().collect::<Vec<_>>();
    tokens.sort_unstable();
    tokens.join(" ")
}

#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    thresholds: Thresholds,
}

impl Matcher {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn match_unit(
        &self,
        tier: Tier,
        unit: &ProviderUnit,
        candidates: &[CanonicalUnit],
    ) -> MatchResult {
        let key = normalize(&unit.name, tier);
        self.match_key(tier, &unit.provider_code, &key, candidates)
    }

    /// Best candidate for an already-normalized key. Never returns an id outside `candidates`.
    pub fn match_key(
        &self,
        tier: Tier,
        provider_code: &ProviderCode,
        key: &str,
        candidates: &[CanonicalUnit],
    ) -> MatchResult {
        if candidates.is_empty() {
            return MatchResult::unresolved(provider_code.clone());
        }

        let scored = match MatchPolicy::for_tier(tier) {
            MatchPolicy::ExactThenFuzzy => {
                exact_hits(key, candidates).unwrap_or_else(|| fuzzy(key, candidates))
            }
            MatchPolicy::Fuzzy => fuzzy(key, candidates),
        };

        let threshold = self.thresholds.for_tier(tier);
        let resolved = scored.score >= threshold;
        trace!(
            %tier,
            %provider_code,
            key,
            best = scored.best,
            score = scored.score,
            threshold,
            "scored candidates"
        );

        MatchResult {
            provider_code: provider_code.clone(),
            canonical_id: resolved.then_some(scored.best),
            score: scored.score,
            best_candidate: Some(scored.best),
            ambiguous: resolved && scored.tied.len() > 1,
            tied_ids: if scored.tied.len() > 1 { scored.tied } else { Vec::new() },
        }
    }
}

struct Scored {
    best: CanonicalId,
    score: f64,
    tied: Vec<CanonicalId>,
}

fn exact_hits(key: &str, candidates: &[CanonicalUnit]) -> Option<Scored> {
    if key.is_empty() {
        return None;
    }
    let tied = candidates
        .iter()
        .filter(|c| c.normalized_name == key)
        .map(|c| c.id)
        .collect::<Vec<_>>();
    let best = *tied.first()?;
    Some(Scored { best, score: 1.0, tied })
}

/// Highest score wins; on a tie the earliest candidate is kept and the tie is reported.
fn fuzzy(key: &str, candidates: &[CanonicalUnit]) -> Scored {
    let scores = candidates
        .iter()
        .map(|c| (c.id, similarity(key, &c.normalized_name)))
        .collect::<Vec<_>>();
    let max = scores.iter().map(|(_, s)| *s).fold(f64::MIN, f64::max);
    let tied = scores
        .iter()
        .filter(|(_, s)| *s == max)
        .map(|(id, _)| *id)
        .collect::<Vec<_>>();
    Scored {
        best: tied[0],
        score: max,
        tied,
    }
}

/// Enforce one provider unit per canonical id among siblings.
///
/// The highest score keeps the id (first in order on equal scores); every other claimant is turned
/// unresolved. Returns the indices of the units that lost their claim.
pub fn settle_claims(results: &mut [MatchResult]) -> Vec<usize> {
    let mut winners: BTreeMap<CanonicalId, usize> = BTreeMap::new();
    for (idx, result) in results.iter().enumerate() {
        let Some(id) = result.canonical_id else {
            continue;
        };
        match winners.get(&id) {
            Some(&current) if results[current].score >= result.score => {}
            _ => {
                winners.insert(id, idx);
            }
        }
    }

    let mut losers = Vec::new();
    for (idx, result) in results.iter_mut().enumerate() {
        if let Some(id) = result.canonical_id {
            if winners.get(&id) != Some(&idx) {
                result.canonical_id = None;
                result.ambiguous = false;
                losers.push(idx);
            }
        }
    }
    losers
}
