//! Date-partitioned item storage + shared HTTP fetch utilities.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::NaiveDate;
use chrono_tz::Tz;
use newslens_core::{ItemKey, NewsItem};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newslens-storage";

const PARTITION_PREFIX: &str = "news_";
const PARTITION_EXT: &str = "jsonl";

/// Append-only store keeping one JSON-Lines file per calendar date.
///
/// Partition boundaries follow the configured timezone; an item never spans
/// two partitions. Appends within a process are serialized by an internal
/// lock so concurrent platform fetches cannot race on the same partition.
#[derive(Debug)]
pub struct PartitionStore {
    root: PathBuf,
    tz: Tz,
    write_lock: Mutex<()>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub total_items: u64,
    pub today_items: u64,
    pub platform_count: usize,
    pub partition_count: usize,
    pub total_bytes: u64,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>, tz: Tz) -> Self {
        Self {
            root: root.into(),
            tz,
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    fn partition_path(&self, date: NaiveDate) -> PathBuf {
        self.root.join(format!(
            "{PARTITION_PREFIX}{}.{PARTITION_EXT}",
            date.format("%Y%m%d")
        ))
    }

    fn partition_date_from_name(name: &str) -> Option<NaiveDate> {
        let stem = name
            .strip_prefix(PARTITION_PREFIX)?
            .strip_suffix(&format!(".{PARTITION_EXT}"))?;
        NaiveDate::parse_from_str(stem, "%Y%m%d").ok()
    }

    /// Fails when the underlying medium is unavailable — callers treat that
    /// as fatal for the whole run.
    pub async fn ensure_root(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating data directory {}", self.root.display()))
    }

    /// Append a batch, deduplicating against items already stored under the
    /// same `(platform, external id, day)` key. Re-ingesting a batch is a
    /// no-op. Returns how many items were newly stored.
    ///
    /// A failure writing one partition is logged and skipped; it never
    /// corrupts the other partitions touched by the batch.
    pub async fn append(&self, items: &[NewsItem]) -> anyhow::Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;
        self.ensure_root().await?;

        let mut by_date: BTreeMap<NaiveDate, Vec<&NewsItem>> = BTreeMap::new();
        for item in items {
            by_date.entry(item.partition_date(self.tz)).or_default().push(item);
        }

        let mut stored = 0usize;
        for (date, batch) in by_date {
            match self.append_partition(date, &batch).await {
                Ok(count) => stored += count,
                Err(err) => {
                    warn!(%date, error = %err, "skipping partition after write failure");
                }
            }
        }
        Ok(stored)
    }

    async fn append_partition(&self, date: NaiveDate, batch: &[&NewsItem]) -> anyhow::Result<usize> {
        let mut existing = self.load_partition(date).await?;
        let mut seen: HashSet<ItemKey> = existing.iter().map(|i| i.key(self.tz)).collect();

        let mut added = 0usize;
        for item in batch {
            if seen.insert(item.key(self.tz)) {
                existing.push((*item).clone());
                added += 1;
            }
        }
        if added == 0 {
            return Ok(0);
        }

        let mut lines = String::new();
        for item in &existing {
            lines.push_str(&serde_json::to_string(item).context("encoding item")?);
            lines.push('\n');
        }
        self.write_partition_atomically(date, lines.as_bytes()).await?;
        debug!(%date, added, "partition updated");
        Ok(added)
    }

    /// Temp-file + rename so a crash mid-write leaves the old partition
    /// contents intact.
    async fn write_partition_atomically(&self, date: NaiveDate, bytes: &[u8]) -> anyhow::Result<()> {
        let target = self.partition_path(date);
        let temp = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp)
            .await
            .with_context(|| format!("opening temp partition file {}", temp.display()))?;
        if let Err(err) = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await
        {
            drop(file);
            let _ = fs::remove_file(&temp).await;
            return Err(err).with_context(|| format!("writing temp partition file {}", temp.display()));
        }
        drop(file);

        if let Err(err) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err)
                .with_context(|| format!("renaming {} -> {}", temp.display(), target.display()));
        }
        Ok(())
    }

    async fn load_partition(&self, date: NaiveDate) -> anyhow::Result<Vec<NewsItem>> {
        let path = self.partition_path(date);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading partition {}", path.display()))
            }
        };

        let mut items = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<NewsItem>(line) {
                Ok(item) => items.push(item),
                Err(err) => {
                    warn!(
                        partition = %path.display(),
                        line = line_no + 1,
                        error = %err,
                        "skipping malformed partition line"
                    );
                }
            }
        }
        Ok(items)
    }

    /// All items observed in the inclusive calendar range `[start, end]`.
    /// Only partitions inside the range are opened.
    pub async fn query_range(&self, start: NaiveDate, end: NaiveDate) -> anyhow::Result<Vec<NewsItem>> {
        let mut items = Vec::new();
        let mut date = start;
        while date <= end {
            items.extend(self.load_partition(date).await?);
            date = match date.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        Ok(items)
    }

    /// Delete whole partitions strictly older than `cutoff`. Idempotent;
    /// files that do not look like partitions are left alone. Returns the
    /// number of partitions removed.
    pub async fn purge_older_than(&self, cutoff: NaiveDate) -> anyhow::Result<usize> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading data directory {}", self.root.display()))
            }
        };

        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await.context("listing partitions")? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(date) = Self::partition_date_from_name(&name) else {
                continue;
            };
            if date < cutoff {
                fs::remove_file(entry.path())
                    .await
                    .with_context(|| format!("removing expired partition {name}"))?;
                removed += 1;
                debug!(partition = %name, "expired partition removed");
            }
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> anyhow::Result<StoreStats> {
        let mut stats = StoreStats::default();
        let today = chrono::Utc::now().with_timezone(&self.tz).date_naive();

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading data directory {}", self.root.display()))
            }
        };

        let mut platforms = HashSet::new();
        while let Some(entry) = entries.next_entry().await.context("listing partitions")? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(date) = Self::partition_date_from_name(&name) else {
                continue;
            };
            stats.partition_count += 1;
            if let Ok(meta) = entry.metadata().await {
                stats.total_bytes += meta.len();
            }
            let items = self.load_partition(date).await?;
            stats.total_items += items.len() as u64;
            if date == today {
                stats.today_items += items.len() as u64;
            }
            platforms.extend(items.into_iter().map(|i| i.platform_id));
        }
        stats.platform_count = platforms.len();
        Ok(stats)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub global_concurrency: usize,
    pub per_platform_concurrency: usize,
    /// Minimum spacing between consecutive requests across all platforms.
    pub min_request_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            proxy: None,
            global_concurrency: 4,
            per_platform_concurrency: 1,
            min_request_interval: Duration::from_millis(1000),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Paces requests so upstream listing APIs see at most one request per
/// configured interval from this process.
#[derive(Debug)]
struct RequestPacer {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared HTTP client with bounded concurrency, request pacing and retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_platform_limit: usize,
    per_platform: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).context("configuring proxy")?);
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_platform_limit: config.per_platform_concurrency.max(1),
            per_platform: Mutex::new(HashMap::new()),
            pacer: RequestPacer::new(config.min_request_interval),
            backoff: config.backoff,
        })
    }

    async fn per_platform_semaphore(&self, platform_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_platform.lock().await;
        map.entry(platform_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_platform_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        platform_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_platform = self.per_platform_semaphore(platform_id).await;
        let _platform = per_platform.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, platform_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;
        for attempt in 0..=self.backoff.max_retries {
            self.pacer.wait().await;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use tempfile::tempdir;

    const TZ: Tz = chrono_tz::UTC;

    fn item(platform: &str, external: &str, rank: u32, ts: &str) -> NewsItem {
        NewsItem {
            platform_id: platform.to_string(),
            platform_name: platform.to_uppercase(),
            external_id: external.to_string(),
            title: format!("{external} headline"),
            url: format!("https://example.com/{external}"),
            mobile_url: None,
            rank,
            observed_at: DateTime::parse_from_rfc3339(ts).expect("ts").with_timezone(&Utc),
        }
    }

    #[tokio::test]
    async fn append_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path(), TZ);
        let batch = vec![
            item("weibo", "a", 1, "2026-03-01T08:00:00Z"),
            item("weibo", "b", 2, "2026-03-01T08:00:00Z"),
        ];

        assert_eq!(store.append(&batch).await.expect("first append"), 2);
        assert_eq!(store.append(&batch).await.expect("second append"), 0);

        let day = NaiveDate::from_ymd_opt(2026, 3, 1).expect("date");
        let stored = store.query_range(day, day).await.expect("query");
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn batch_internal_duplicates_collapse() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path(), TZ);
        let batch = vec![
            item("weibo", "a", 1, "2026-03-01T08:00:00Z"),
            item("weibo", "a", 7, "2026-03-01T09:00:00Z"),
        ];
        assert_eq!(store.append(&batch).await.expect("append"), 1);
    }

    #[tokio::test]
    async fn partitions_align_to_calendar_days() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path(), TZ);
        store
            .append(&[item("zhihu", "x", 3, "2026-03-02T10:00:00Z")])
            .await
            .expect("append");

        let day = NaiveDate::from_ymd_opt(2026, 3, 2).expect("date");
        let prev = day.pred_opt().expect("date");
        assert_eq!(store.query_range(day, day).await.expect("query").len(), 1);
        assert!(store.query_range(prev, prev).await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn same_external_id_counts_once_per_day() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path(), TZ);
        store
            .append(&[
                item("weibo", "a", 1, "2026-03-01T08:00:00Z"),
                item("weibo", "a", 4, "2026-03-02T08:00:00Z"),
            ])
            .await
            .expect("append");

        let start = NaiveDate::from_ymd_opt(2026, 3, 1).expect("date");
        let end = NaiveDate::from_ymd_opt(2026, 3, 2).expect("date");
        assert_eq!(store.query_range(start, end).await.expect("query").len(), 2);
    }

    #[tokio::test]
    async fn purge_removes_only_older_partitions() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path(), TZ);
        store
            .append(&[
                item("weibo", "old", 1, "2026-02-20T08:00:00Z"),
                item("weibo", "kept", 1, "2026-03-01T08:00:00Z"),
            ])
            .await
            .expect("append");

        let cutoff = NaiveDate::from_ymd_opt(2026, 3, 1).expect("date");
        assert_eq!(store.purge_older_than(cutoff).await.expect("purge"), 1);
        assert_eq!(store.purge_older_than(cutoff).await.expect("repurge"), 0);

        let old = NaiveDate::from_ymd_opt(2026, 2, 20).expect("date");
        assert!(store.query_range(old, old).await.expect("query").is_empty());
        assert_eq!(store.query_range(cutoff, cutoff).await.expect("query").len(), 1);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_not_fatal() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path(), TZ);
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).expect("date");
        store
            .append(&[item("weibo", "a", 1, "2026-03-01T08:00:00Z")])
            .await
            .expect("append");

        let path = dir.path().join("news_20260301.jsonl");
        let mut text = std::fs::read_to_string(&path).expect("read");
        text.push_str("{not json}\n");
        std::fs::write(&path, text).expect("write");

        assert_eq!(store.query_range(day, day).await.expect("query").len(), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_do_not_lose_items() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(PartitionStore::new(dir.path(), TZ));

        let a = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .append(&[item("weibo", "wa", 1, "2026-03-01T08:00:00Z")])
                    .await
            })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .append(&[item("zhihu", "za", 1, "2026-03-01T08:00:00Z")])
                    .await
            })
        };
        assert_eq!(a.await.expect("join").expect("append"), 1);
        assert_eq!(b.await.expect("join").expect("append"), 1);

        let day = NaiveDate::from_ymd_opt(2026, 3, 1).expect("date");
        assert_eq!(store.query_range(day, day).await.expect("query").len(), 2);
    }

    #[test]
    fn backoff_delays_are_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(350));
    }

    #[test]
    fn partition_names_round_trip() {
        assert_eq!(
            PartitionStore::partition_date_from_name("news_20260301.jsonl"),
            NaiveDate::from_ymd_opt(2026, 3, 1)
        );
        assert_eq!(PartitionStore::partition_date_from_name("news.db.backup"), None);
        assert_eq!(PartitionStore::partition_date_from_name("news_2026.jsonl"), None);
    }
}
