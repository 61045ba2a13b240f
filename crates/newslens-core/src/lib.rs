//! Core domain model shared across the NewsLens crates.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "newslens-core";

/// One entry of a ranked listing as observed on a platform.
///
/// Immutable once stored; the partition an item belongs to is the calendar
/// date of `observed_at` in the configured timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsItem {
    pub platform_id: String,
    pub platform_name: String,
    pub external_id: String,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_url: Option<String>,
    /// 1-based position in the listing the item was fetched from.
    pub rank: u32,
    pub observed_at: DateTime<Utc>,
}

impl NewsItem {
    /// Calendar date of the observation in `tz` — the partition key.
    pub fn partition_date(&self, tz: Tz) -> NaiveDate {
        self.observed_at.with_timezone(&tz).date_naive()
    }

    /// Full storage identity. The same external id on different calendar
    /// days is a distinct occurrence.
    pub fn key(&self, tz: Tz) -> ItemKey {
        ItemKey {
            platform_id: self.platform_id.clone(),
            external_id: self.external_id.clone(),
            date: self.partition_date(tz),
        }
    }

    /// Date-free identity used for cross-day dedup lookups.
    pub fn identity(&self) -> (String, String) {
        (self.platform_id.clone(), self.external_id.clone())
    }
}

/// Uniqueness key of a stored item: `(platform, external id, calendar day)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub platform_id: String,
    pub external_id: String,
    pub date: NaiveDate,
}

/// How a run's candidate set is derived from the fresh batch and history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportMode {
    /// Only items from the most recent fetch batch.
    Current,
    /// Everything observed today, any batch.
    #[default]
    Daily,
    /// Items observed today that were not seen in today's earlier batches
    /// or yesterday's partition.
    Incremental,
}

impl fmt::Display for ReportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportMode::Current => f.write_str("current"),
            ReportMode::Daily => f.write_str("daily"),
            ReportMode::Incremental => f.write_str("incremental"),
        }
    }
}

/// A named set of keyword patterns. A title matches the group when it
/// contains any pattern, case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordGroup {
    pub name: String,
    pub keywords: Vec<String>,
}

impl KeywordGroup {
    pub fn matches(&self, title: &str) -> bool {
        let haystack = title.to_lowercase();
        self.keywords
            .iter()
            .any(|kw| haystack.contains(&kw.to_lowercase()))
    }
}

/// An item inside a match result, annotated for presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedItem {
    pub item: NewsItem,
    /// Rank at or below the configured highlight threshold.
    pub highlighted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// All matches for one keyword group in a single run, rank-ordered.
///
/// The same slice of results is handed to both the HTML reporter and the
/// push gate; it is computed once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub group_name: String,
    pub keywords: Vec<String>,
    pub mode: ReportMode,
    pub items: Vec<RankedItem>,
}

impl MatchResult {
    pub fn count(&self) -> usize {
        self.items.len()
    }
}

/// Daily time-of-day interval during which outbound pushes are permitted.
/// `start > end` wraps past midnight (`22:00`–`06:00` spans overnight).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushWindow {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "PushWindow::default_start")]
    pub start: String,
    #[serde(default = "PushWindow::default_end")]
    pub end: String,
}

impl PushWindow {
    fn default_start() -> String {
        "08:00".to_string()
    }

    fn default_end() -> String {
        "23:00".to_string()
    }
}

impl Default for PushWindow {
    fn default() -> Self {
        Self {
            enabled: false,
            start: Self::default_start(),
            end: Self::default_end(),
        }
    }
}

/// Per-platform outcome of the fetch phase, consumed by the reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFetchCount {
    pub platform_id: String,
    pub platform_name: String,
    pub fetched: usize,
    pub succeeded: bool,
}
