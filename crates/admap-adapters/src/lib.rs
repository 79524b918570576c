//! Provider client contract + HTTP dialects for logistics master-data APIs.

use std::sync::Arc;

use admap_core::{ProviderCode, ProviderUnit, Tier};
use admap_storage::{FetchError, HttpFetcher, RetryDisposition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub mod fixture;

pub use fixture::{FailureKind, FixtureProviderClient, ProviderFixture};

pub const CRATE_NAME: &str = "admap-adapters";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failure, timeout, throttling or a 5xx from the provider.
    #[error("provider unavailable at {endpoint}: {message}")]
    Unavailable {
        endpoint: String,
        message: String,
        retryable: bool,
    },
    /// The provider answered, but not with the expected list of records.
    #[error("unexpected response from {endpoint}: {detail}")]
    BadResponse { endpoint: String, detail: String },
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Unavailable { retryable: true, .. })
    }

    pub fn from_fetch(endpoint: &str, err: FetchError) -> Self {
        let retryable = err.disposition() == RetryDisposition::Retryable;
        let message = if err.is_timeout() {
            "request timed out".to_string()
        } else {
            err.to_string()
        };
        match err {
            FetchError::Request { .. } => ProviderError::Unavailable {
                endpoint: endpoint.to_string(),
                message,
                retryable,
            },
            FetchError::HttpStatus {
                status, ref body, ..
            } if retryable => ProviderError::Unavailable {
                endpoint: endpoint.to_string(),
                message: format!("http status {status}: {body}"),
                retryable,
            },
            FetchError::HttpStatus { status, body, .. } => ProviderError::BadResponse {
                endpoint: endpoint.to_string(),
                detail: format!("http status {status}: {body}"),
            },
            FetchError::Decode { message, .. } => ProviderError::BadResponse {
                endpoint: endpoint.to_string(),
                detail: message,
            },
        }
    }
}

/// Read-only master-data operations of one provider. Implementations never retry.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider_code(&self) -> &str;

    async fn fetch_provinces(&self) -> Result<Vec<ProviderUnit>, ProviderError>;

    async fn fetch_districts(
        &self,
        province: &ProviderCode,
    ) -> Result<Vec<ProviderUnit>, ProviderError>;

    async fn fetch_wards(&self, district: &ProviderCode)
        -> Result<Vec<ProviderUnit>, ProviderError>;
}

/// Request/response shape of a provider's master-data API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderDialect {
    /// Giao Hang Nhanh: provinces by GET, districts and wards by POST with integer ids.
    Ghn,
    /// Viettel Post: everything by GET with query parameters.
    Vtp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DialectRequest {
    Get {
        path: &'static str,
        query: Vec<(&'static str, String)>,
    },
    Post {
        path: &'static str,
        body: JsonValue,
    },
}

impl DialectRequest {
    pub fn path(&self) -> &'static str {
        match self {
            DialectRequest::Get { path, .. } | DialectRequest::Post { path, .. } => *path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFields {
    pub code: &'static str,
    pub name: &'static str,
    pub parent: Option<&'static str>,
}

impl ProviderDialect {
    pub fn request(&self, tier: Tier, parent: Option<&ProviderCode>) -> DialectRequest {
        let parent_value = || parent.map(ProviderCode::as_str).unwrap_or_default().to_string();
        match (self, tier) {
            (ProviderDialect::Ghn, Tier::Province) => DialectRequest::Get {
                path: "/master-data/province",
                query: Vec::new(),
            },
            (ProviderDialect::Ghn, Tier::District) => DialectRequest::Post {
                path: "/master-data/district",
                body: json!({ "province_id": numeric_or_text(parent) }),
            },
            (ProviderDialect::Ghn, Tier::Ward) => DialectRequest::Post {
                path: "/master-data/ward",
                body: json!({ "district_id": numeric_or_text(parent) }),
            },
            (ProviderDialect::Vtp, Tier::Province) => DialectRequest::Get {
                path: "/categories/listProvinceById",
                query: vec![("provinceId", "0".to_string())],
            },
            (ProviderDialect::Vtp, Tier::District) => DialectRequest::Get {
                path: "/categories/listDistrict",
                query: vec![("provinceId", parent_value())],
            },
            (ProviderDialect::Vtp, Tier::Ward) => DialectRequest::Get {
                path: "/categories/listWards",
                query: vec![("districtId", parent_value())],
            },
        }
    }

    pub fn fields(&self, tier: Tier) -> RecordFields {
        match (self, tier) {
            (ProviderDialect::Ghn, Tier::Province) => RecordFields {
                code: "ProvinceID",
                name: "ProvinceName",
                parent: None,
            },
            (ProviderDialect::Ghn, Tier::District) => RecordFields {
                code: "DistrictID",
                name: "DistrictName",
                parent: Some("ProvinceID"),
            },
            (ProviderDialect::Ghn, Tier::Ward) => RecordFields {
                code: "WardCode",
                name: "WardName",
                parent: Some("DistrictID"),
            },
            (ProviderDialect::Vtp, Tier::Province) => RecordFields {
                code: "PROVINCE_ID",
                name: "PROVINCE_NAME",
                parent: None,
            },
            (ProviderDialect::Vtp, Tier::District) => RecordFields {
                code: "DISTRICT_ID",
                name: "DISTRICT_NAME",
                parent: Some("PROVINCE_ID"),
            },
            (ProviderDialect::Vtp, Tier::Ward) => RecordFields {
                code: "WARDS_ID",
                name: "WARDS_NAME",
                parent: Some("DISTRICT_ID"),
            },
        }
    }
}

fn numeric_or_text(code: Option<&ProviderCode>) -> JsonValue {
    match code {
        Some(code) => code
            .as_i64()
            .map(JsonValue::from)
            .unwrap_or_else(|| JsonValue::from(code.as_str())),
        None => JsonValue::Null,
    }
}

/// Unwrap the `{ code|status, message, data: [...] }` envelope and read one tier's records.
pub fn parse_units(
    dialect: ProviderDialect,
    tier: Tier,
    endpoint: &str,
    payload: &JsonValue,
) -> Result<Vec<ProviderUnit>, ProviderError> {
    let bad = |detail: String| ProviderError::BadResponse {
        endpoint: endpoint.to_string(),
        detail,
    };

    let envelope = payload
        .as_object()
        .ok_or_else(|| bad("payload is not a json object".to_string()))?;

    if envelope.get("error").and_then(JsonValue::as_bool) == Some(true) {
        return Err(bad(envelope_message(envelope)));
    }
    for status_key in ["code", "status"] {
        if let Some(status) = envelope.get(status_key).and_then(JsonValue::as_i64) {
            if status != 200 {
                return Err(bad(format!("{status_key} {status}: {}", envelope_message(envelope))));
            }
        }
    }

    let records = envelope
        .get("data")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| bad("`data` is missing or not a list".to_string()))?;

    let fields = dialect.fields(tier);
    let mut units = Vec::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        let code = record
            .get(fields.code)
            .filter(|v| !v.is_null())
            .ok_or_else(|| bad(format!("record {idx} has no `{}`", fields.code)))?;
        let provider_code: ProviderCode = serde_json::from_value(code.clone())
            .map_err(|err| bad(format!("record {idx} `{}`: {err}", fields.code)))?;
        let name = record
            .get(fields.name)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| bad(format!("record {idx} has no string `{}`", fields.name)))?;
        let parent_provider_code = fields
            .parent
            .and_then(|key| record.get(key))
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value::<ProviderCode>(v.clone()).ok());

        units.push(ProviderUnit {
            provider_code,
            name: name.to_string(),
            parent_provider_code,
        });
    }
    Ok(units)
}

fn envelope_message(envelope: &serde_json::Map<String, JsonValue>) -> String {
    envelope
        .get("message")
        .and_then(JsonValue::as_str)
        .unwrap_or("no message")
        .to_string()
}

/// Connection settings for one HTTP provider.
#[derive(Debug, Clone)]
pub struct HttpProviderSettings {
    pub provider_code: String,
    pub dialect: ProviderDialect,
    pub base_url: String,
    pub auth_header: String,
    pub token: String,
}

pub struct HttpProviderClient {
    settings: HttpProviderSettings,
    fetcher: Arc<HttpFetcher>,
}

impl HttpProviderClient {
    pub fn new(settings: HttpProviderSettings, fetcher: Arc<HttpFetcher>) -> Self {
        Self { settings, fetcher }
    }

    async fn fetch(
        &self,
        tier: Tier,
        parent: Option<&ProviderCode>,
    ) -> Result<Vec<ProviderUnit>, ProviderError> {
        let request = self.settings.dialect.request(tier, parent);
        let url = format!("{}{}", self.settings.base_url.trim_end_matches('/'), request.path());
        let headers = [(self.settings.auth_header.as_str(), self.settings.token.as_str())];

        debug!(
            provider = %self.settings.provider_code,
            %tier,
            parent = ?parent.map(ProviderCode::as_str),
            url = %url,
            "fetching provider units"
        );
        let payload = match &request {
            DialectRequest::Get { query, .. } => self.fetcher.get_json(&url, query, &headers).await,
            DialectRequest::Post { body, .. } => self.fetcher.post_json(&url, body, &headers).await,
        }
        .map_err(|err| ProviderError::from_fetch(&url, err))?;

        parse_units(self.settings.dialect, tier, &url, &payload)
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn provider_code(&self) -> &str {
        &self.settings.provider_code
    }

    async fn fetch_provinces(&self) -> Result<Vec<ProviderUnit>, ProviderError> {
        self.fetch(Tier::Province, None).await
    }

    async fn fetch_districts(
        &self,
        province: &ProviderCode,
    ) -> Result<Vec<ProviderUnit>, ProviderError> {
        self.fetch(Tier::District, Some(province)).await
    }

    async fn fetch_wards(
        &self,
        district: &ProviderCode,
    ) -> Result<Vec<ProviderUnit>, ProviderError> {
        self.fetch(Tier::Ward, Some(district)).await
    }
}
