//! Platform adapter contracts + the NewsNow ranked-listing adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newslens_core::NewsItem;
use newslens_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "newslens-adapters";

pub const DEFAULT_API_BASE: &str = "https://newsnow.busiyi.world";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding listing payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("upstream reported status {status:?} for platform {platform}")]
    UpstreamStatus {
        platform: String,
        status: Option<String>,
    },
}

/// Per-run context handed to every adapter call. `observed_at` is stamped
/// once per run so all platforms land in the same batch.
#[derive(Debug, Clone, Copy)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub observed_at: DateTime<Utc>,
}

/// Stateless fetch seam: returns the platform's current ranked listing.
/// Failures are per-platform; the pipeline isolates them.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn platform_id(&self) -> &str;
    fn platform_name(&self) -> &str;

    async fn fetch_ranked(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<NewsItem>, AdapterError>;
}

/// Adapter for NewsNow-style aggregation APIs: one endpoint, multiplexed by
/// platform id, returning `{status, items: [{id?, title, url, mobileUrl?}]}`.
#[derive(Debug, Clone)]
pub struct NewsNowAdapter {
    base_url: String,
    platform_id: String,
    platform_name: String,
}

impl NewsNowAdapter {
    pub fn new(
        base_url: impl Into<String>,
        platform_id: impl Into<String>,
        platform_name: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            platform_id: platform_id.into(),
            platform_name: platform_name.into(),
        }
    }

    fn listing_url(&self) -> String {
        format!(
            "{}/api/s?id={}&latest",
            self.base_url.trim_end_matches('/'),
            self.platform_id
        )
    }
}

#[async_trait]
impl SourceAdapter for NewsNowAdapter {
    fn platform_id(&self) -> &str {
        &self.platform_id
    }

    fn platform_name(&self) -> &str {
        &self.platform_name
    }

    async fn fetch_ranked(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<NewsItem>, AdapterError> {
        let response = http
            .fetch_bytes(ctx.run_id, &self.platform_id, &self.listing_url())
            .await?;
        parse_listing(
            &self.platform_id,
            &self.platform_name,
            &response.body,
            ctx.observed_at,
        )
    }
}

/// Decode a raw listing body into ranked items.
///
/// Upstream `status` must be `success` or `cache`. Entries without a usable
/// title (missing, non-string, or blank) are dropped. Ranks are the 1-based
/// upstream positions, so a dropped entry still consumes its rank.
pub fn parse_listing(
    platform_id: &str,
    platform_name: &str,
    body: &[u8],
    observed_at: DateTime<Utc>,
) -> Result<Vec<NewsItem>, AdapterError> {
    let payload: JsonValue = serde_json::from_slice(body)?;

    let status = payload.get("status").and_then(JsonValue::as_str);
    if !matches!(status, Some("success") | Some("cache")) {
        return Err(AdapterError::UpstreamStatus {
            platform: platform_id.to_string(),
            status: status.map(str::to_string),
        });
    }

    let entries = payload
        .get("items")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();

    let mut items = Vec::new();
    for (position, entry) in entries.iter().enumerate() {
        let Some(title) = entry.get("title").and_then(JsonValue::as_str) else {
            continue;
        };
        let title = title.trim();
        if title.is_empty() {
            continue;
        }

        let url = entry
            .get("url")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let mobile_url = entry
            .get("mobileUrl")
            .and_then(JsonValue::as_str)
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let external_id = entry
            .get("id")
            .map(json_id_to_string)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| derive_external_id(platform_id, &url, title));

        items.push(NewsItem {
            platform_id: platform_id.to_string(),
            platform_name: platform_name.to_string(),
            external_id,
            title: title.to_string(),
            url,
            mobile_url,
            rank: position as u32 + 1,
            observed_at,
        });
    }
    Ok(items)
}

fn json_id_to_string(id: &JsonValue) -> String {
    match id {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Stable fallback identity for platforms whose payloads carry no item id.
pub fn derive_external_id(platform_id: &str, url: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(platform_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(url.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(title.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn observed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().expect("ts")
    }

    #[test]
    fn listing_parses_and_ranks_in_order() {
        let body = br#"{
            "status": "success",
            "items": [
                {"id": "w1", "title": "First story", "url": "https://a", "mobileUrl": "https://m/a"},
                {"id": "w2", "title": "Second story", "url": "https://b"}
            ]
        }"#;
        let items = parse_listing("weibo", "Weibo", body, observed()).expect("parse");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].rank, 1);
        assert_eq!(items[1].rank, 2);
        assert_eq!(items[0].external_id, "w1");
        assert_eq!(items[0].mobile_url.as_deref(), Some("https://m/a"));
        assert!(items[1].mobile_url.is_none());
    }

    #[test]
    fn blank_and_non_string_titles_are_dropped() {
        let body = br#"{
            "status": "cache",
            "items": [
                {"id": "1", "title": "  "},
                {"id": "2", "title": 42},
                {"id": "3", "title": "Kept"},
                {"id": "4"}
            ]
        }"#;
        let items = parse_listing("zhihu", "Zhihu", body, observed()).expect("parse");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Kept");
        // Dropped entries still consume their upstream rank.
        assert_eq!(items[0].rank, 3);
    }

    #[test]
    fn unexpected_upstream_status_is_an_error() {
        let body = br#"{"status": "throttled", "items": []}"#;
        let err = parse_listing("weibo", "Weibo", body, observed()).expect_err("status");
        assert!(matches!(err, AdapterError::UpstreamStatus { .. }));
    }

    #[test]
    fn missing_id_falls_back_to_derived_identity() {
        let body = br#"{
            "status": "success",
            "items": [{"title": "No id here", "url": "https://x"}]
        }"#;
        let items = parse_listing("weibo", "Weibo", body, observed()).expect("parse");
        assert_eq!(items[0].external_id.len(), 16);
        assert_eq!(
            items[0].external_id,
            derive_external_id("weibo", "https://x", "No id here")
        );
    }

    #[test]
    fn numeric_ids_are_accepted() {
        let body = br#"{
            "status": "success",
            "items": [{"id": 9001, "title": "Numeric id"}]
        }"#;
        let items = parse_listing("weibo", "Weibo", body, observed()).expect("parse");
        assert_eq!(items[0].external_id, "9001");
    }

    #[test]
    fn derived_ids_are_stable_and_distinct() {
        let a = derive_external_id("weibo", "https://x", "Title");
        let b = derive_external_id("weibo", "https://x", "Title");
        let c = derive_external_id("weibo", "https://y", "Title");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn listing_url_strips_trailing_slash() {
        let adapter = NewsNowAdapter::new("https://api.example.com/", "weibo", "Weibo");
        assert_eq!(
            adapter.listing_url(),
            "https://api.example.com/api/s?id=weibo&latest"
        );
    }
}
