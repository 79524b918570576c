//! Fixture-backed provider client for offline runs and tests.
//!
//! A fixture file mirrors what the provider API would return, keyed by parent code:
//!
//! ```json
//! {
//!   "provider_code": "ghn",
//!   "provinces": [{ "code": 202, "name": "Hồ Chí Minh" }],
//!   "districts": { "202": [{ "code": 1442, "name": "Quận 1" }] },
//!   "wards": { "1442": [{ "code": "20109", "name": "Phường Bến Nghé" }] }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use admap_core::{ProviderCode, ProviderUnit, Tier};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{ProviderClient, ProviderError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureUnit {
    pub code: ProviderCode,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFixture {
    pub provider_code: String,
    #[serde(default)]
    pub provinces: Vec<FixtureUnit>,
    #[serde(default)]
    pub districts: BTreeMap<String, Vec<FixtureUnit>>,
    #[serde(default)]
    pub wards: BTreeMap<String, Vec<FixtureUnit>>,
}

impl ProviderFixture {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parsing provider fixture {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Unavailable,
    BadResponse,
}

type CallKey = (Tier, Option<ProviderCode>);

pub struct FixtureProviderClient {
    fixture: ProviderFixture,
    failures: Mutex<BTreeMap<CallKey, FailureKind>>,
    calls: Mutex<Vec<CallKey>>,
}

impl FixtureProviderClient {
    pub fn new(fixture: ProviderFixture) -> Self {
        Self {
            fixture,
            failures: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(ProviderFixture::load(path)?))
    }

    /// Make every call for `tier` under `parent` fail with `kind`. Provinces use `parent = None`.
    pub async fn fail(&self, tier: Tier, parent: Option<ProviderCode>, kind: FailureKind) {
        self.failures.lock().await.insert((tier, parent), kind);
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<CallKey> {
        self.calls.lock().await.clone()
    }

    async fn answer(
        &self,
        tier: Tier,
        parent: Option<&ProviderCode>,
    ) -> Result<Vec<ProviderUnit>, ProviderError> {
        let key = (tier, parent.cloned());
        self.calls.lock().await.push(key.clone());

        let endpoint = match parent {
            Some(code) => format!("fixture://{}/{tier}/{code}", self.fixture.provider_code),
            None => format!("fixture://{}/{tier}", self.fixture.provider_code),
        };
        if let Some(kind) = self.failures.lock().await.get(&key).copied() {
            return Err(match kind {
                FailureKind::Unavailable => ProviderError::Unavailable {
                    endpoint,
                    message: "simulated outage".to_string(),
                    retryable: true,
                },
                FailureKind::BadResponse => ProviderError::BadResponse {
                    endpoint,
                    detail: "simulated malformed payload".to_string(),
                },
            });
        }

        let units = match (tier, parent) {
            (Tier::Province, _) => Some(&self.fixture.provinces),
            (Tier::District, Some(code)) => self.fixture.districts.get(code.as_str()),
            (Tier::Ward, Some(code)) => self.fixture.wards.get(code.as_str()),
            (_, None) => None,
        };
        Ok(units
            .map(|list| {
                list.iter()
                    .map(|u| ProviderUnit::new(u.code.clone(), u.name.clone(), parent.cloned()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl ProviderClient for FixtureProviderClient {
    fn provider_code(&self) -> &str {
        &self.fixture.provider_code
    }

    async fn fetch_provinces(&self) -> Result<Vec<ProviderUnit>, ProviderError> {
        self.answer(Tier::Province, None).await
    }

    async fn fetch_districts(
        &self,
        province: &ProviderCode,
    ) -> Result<Vec<ProviderUnit>, ProviderError> {
        self.answer(Tier::District, Some(province)).await
    }

    async fn fetch_wards(
        &self,
        district: &ProviderCode,
    ) -> Result<Vec<ProviderUnit>, ProviderError> {
        self.answer(Tier::Ward, Some(district)).await
    }
}
