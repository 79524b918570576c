//! Core domain model for provider-to-canonical administrative taxonomy reconciliation.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

pub mod normalize;

pub use normalize::normalize;

pub const CRATE_NAME: &str = "admap-core";

/// Stable internal key of a canonical province, district or ward.
pub type CanonicalId = i64;

/// Fixed integer identifying a logistics provider in the mapping tables.
pub type ProviderId = i32;

/// Level of an administrative unit in the province → district → ward hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Province,
    District,
    Ward,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Province, Tier::District, Tier::Ward];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Province => "province",
            Tier::District => "district",
            Tier::Ward => "ward",
        }
    }

    pub fn child(&self) -> Option<Tier> {
        match self {
            Tier::Province => Some(Tier::District),
            Tier::District => Some(Tier::Ward),
            Tier::Ward => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque provider-side code. Providers return these as JSON numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ProviderCode(String);

impl ProviderCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric view, for provider endpoints that expect integer ids in request bodies.
    pub fn as_i64(&self) -> Option<i64> {
        self.0.trim().parse().ok()
    }
}

impl fmt::Display for ProviderCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderCode {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<i64> for ProviderCode {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for ProviderCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawCode {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match RawCode::deserialize(deserializer)? {
            RawCode::Text(text) => Self(text.trim().to_string()),
            RawCode::Signed(n) => Self(n.to_string()),
            RawCode::Unsigned(n) => Self(n.to_string()),
        })
    }
}

/// Unit of the internal, authoritative taxonomy. `normalized_name` is derived once on construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalUnit {
    pub tier: Tier,
    pub id: CanonicalId,
    pub name: String,
    pub normalized_name: String,
    pub parent_id: Option<CanonicalId>,
}

impl CanonicalUnit {
    pub fn new(
        tier: Tier,
        id: CanonicalId,
        name: impl Into<String>,
        parent_id: Option<CanonicalId>,
    ) -> Self {
        let name = name.into();
        let normalized_name = normalize(&name, tier);
        Self {
            tier,
            id,
            name,
            normalized_name,
            parent_id,
        }
    }
}

/// Unit as returned by the provider API, name untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUnit {
    pub provider_code: ProviderCode,
    pub name: String,
    pub parent_provider_code: Option<ProviderCode>,
}

impl ProviderUnit {
    pub fn new(
        provider_code: impl Into<ProviderCode>,
        name: impl Into<String>,
        parent_provider_code: Option<ProviderCode>,
    ) -> Self {
        Self {
            provider_code: provider_code.into(),
            name: name.into(),
            parent_provider_code,
        }
    }
}

/// Outcome of matching one provider unit against a scoped candidate set.
///
/// `canonical_id` is `None` when the best score fell below the tier threshold or there were no
/// candidates. `best_candidate` is kept either way so unresolved units can be reviewed against
/// their closest canonical name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub provider_code: ProviderCode,
    pub canonical_id: Option<CanonicalId>,
    pub score: f64,
    pub best_candidate: Option<CanonicalId>,
    pub ambiguous: bool,
    pub tied_ids: Vec<CanonicalId>,
}

impl MatchResult {
    pub fn unresolved(provider_code: ProviderCode) -> Self {
        Self {
            provider_code,
            canonical_id: None,
            score: 0.0,
            best_candidate: None,
            ambiguous: false,
            tied_ids: Vec::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.canonical_id.is_some()
    }
}

/// Persisted provider ↔ canonical correspondence.
///
/// Natural key is `(provider_id, tier, canonical_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MappingRecord {
    pub provider_id: ProviderId,
    pub tier: Tier,
    pub canonical_id: CanonicalId,
    pub provider_code: ProviderCode,
    pub provider_name: String,
    pub parent_canonical_id: Option<CanonicalId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_code_accepts_numbers_and_strings() {
        let codes: Vec<ProviderCode> =
            serde_json::from_str(r#"[202, " 20109 ", "1A0101"]"#).unwrap();
        assert_eq!(codes[0].as_str(), "202");
        assert_eq!(codes[0].as_i64(), Some(202));
        assert_eq!(codes[1].as_str(), "20109");
        assert_eq!(codes[2].as_i64(), None);
    }

    #[test]
    fn canonical_unit_derives_normalized_name() {
        let unit = CanonicalUnit::new(Tier::District, 760, "Quận 1", Some(79));
        assert_eq!(unit.normalized_name, "1");
        assert_eq!(unit.parent_id, Some(79));
    }

    #[test]
    fn tier_walks_down_the_hierarchy() {
        assert_eq!(Tier::Province.child(), Some(Tier::District));
        assert_eq!(Tier::District.child(), Some(Tier::Ward));
        assert_eq!(Tier::Ward.child(), None);
        assert_eq!(Tier::Ward.to_string(), "ward");
    }
}
