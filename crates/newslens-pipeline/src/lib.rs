//! Run configuration + single-run orchestration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Days, Utc};
use chrono_tz::Tz;
use newslens_adapters::{AdapterContext, AdapterError, NewsNowAdapter, SourceAdapter, DEFAULT_API_BASE};
use newslens_analysis::{Analyzer, AnalyzerConfig, TopicRules};
use newslens_core::{KeywordGroup, MatchResult, NewsItem, PlatformFetchCount, PushWindow, ReportMode};
use newslens_notify::BarkConfig;
use newslens_storage::{HttpClientConfig, HttpFetcher, PartitionStore, StoreStats};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newslens-pipeline";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app: AppSection,
    pub platforms: Vec<PlatformConfig>,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub topics: Option<TopicRules>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Directory the config file was loaded from; anchors relative paths.
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub timezone: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub api_base: String,
    pub request_interval_ms: u64,
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            request_interval_ms: 1000,
            concurrency: 4,
            timeout_secs: 10,
            user_agent: None,
            proxy: None,
        }
    }
}

impl CrawlerConfig {
    fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            user_agent: self.user_agent.clone(),
            proxy: self.proxy.clone(),
            global_concurrency: self.concurrency,
            min_request_interval: Duration::from_millis(self.request_interval_ms),
            ..HttpClientConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub push_window: PushWindow,
}

fn default_retention_days() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub mode: ReportMode,
    pub dir: Option<PathBuf>,
    pub rank_threshold: u32,
    pub max_news_per_keyword: usize,
    pub keywords_file: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            mode: ReportMode::default(),
            dir: None,
            rank_threshold: 5,
            max_news_per_keyword: 0,
            keywords_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub bark: BarkConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub crons: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            crons: vec!["0 */30 * * * *".to_string()],
        }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        Self::from_yaml_str(&text, base_dir)
    }

    pub fn from_yaml_str(text: &str, base_dir: PathBuf) -> anyhow::Result<Self> {
        let mut config: AppConfig = serde_yaml::from_str(text).context("parsing config yaml")?;
        config.base_dir = base_dir;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment wins over the config file.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("BARK_URL") {
            self.notification.bark.url = url;
        }
        if let Some(enabled) = env_bool("BARK_ENABLED") {
            self.notification.bark.enabled = enabled;
        }
        if let Some(enabled) = env_bool("PUSH_WINDOW_ENABLED") {
            self.storage.push_window.enabled = enabled;
        }
        if let Ok(start) = std::env::var("PUSH_WINDOW_START") {
            if !start.is_empty() {
                self.storage.push_window.start = start;
            }
        }
        if let Ok(end) = std::env::var("PUSH_WINDOW_END") {
            if !end.is_empty() {
                self.storage.push_window.end = end;
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.platforms.is_empty() {
            bail!("platform list must not be empty");
        }
        for platform in &self.platforms {
            if platform.id.trim().is_empty() || platform.name.trim().is_empty() {
                bail!("platform entries need both id and name");
            }
        }
        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> anyhow::Result<Tz> {
        self.app
            .timezone
            .parse::<Tz>()
            .map_err(|err| anyhow::anyhow!("invalid timezone {:?}: {err}", self.app.timezone))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.storage.data_dir)
    }

    pub fn report_dir(&self) -> PathBuf {
        match &self.report.dir {
            Some(dir) => self.resolve(dir),
            None => self.data_dir().join("reports"),
        }
    }

    pub fn keywords_path(&self) -> PathBuf {
        match &self.report.keywords_file {
            Some(path) => self.resolve(path),
            None => self.base_dir.join("keywords.txt"),
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    Some(matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    ))
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: ReportMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub platforms_attempted: usize,
    pub platforms_succeeded: usize,
    pub fetched_items: usize,
    pub stored_items: usize,
    pub purged_partitions: usize,
    pub matched_groups: usize,
    pub keyword_stats: BTreeMap<String, usize>,
}

/// Everything a run produces. `results` is computed once and handed to both
/// the reporter and the push gate unchanged.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub summary: RunSummary,
    pub results: Vec<MatchResult>,
    pub stats: StoreStats,
    pub platform_counts: Vec<PlatformFetchCount>,
}

/// One fetch-analyze-store-purge cycle. No background work: the pipeline is
/// driven once per invocation by an external scheduler or the CLI.
pub struct Pipeline {
    config: AppConfig,
    tz: Tz,
    store: Arc<PartitionStore>,
    http: Arc<HttpFetcher>,
    analyzer: Analyzer,
}

impl Pipeline {
    pub fn new(config: AppConfig, groups: Vec<KeywordGroup>) -> anyhow::Result<Self> {
        let tz = config.timezone()?;
        let store = Arc::new(PartitionStore::new(config.data_dir(), tz));
        let http = Arc::new(HttpFetcher::new(config.crawler.http_config())?);
        let analyzer = Analyzer::new(
            groups,
            AnalyzerConfig {
                rank_threshold: config.report.rank_threshold,
                max_news_per_keyword: config.report.max_news_per_keyword,
            },
            config.topics.clone().unwrap_or_default(),
            tz,
        );
        Ok(Self {
            config,
            tz,
            store,
            http,
            analyzer,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn timezone_id(&self) -> Tz {
        self.tz
    }

    pub async fn run_once(&self) -> anyhow::Result<RunOutput> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mode = self.config.report.mode;
        info!(%run_id, %mode, "run started");

        // Unreachable storage is fatal before any fetch work happens.
        self.store.ensure_root().await?;

        let (fresh, platform_counts) = self.fetch_all(run_id, started_at).await;
        let attempted = platform_counts.len();
        let succeeded = platform_counts.iter().filter(|p| p.succeeded).count();
        if succeeded == 0 && attempted > 0 {
            warn!("no platform produced data this run");
        }

        // Analysis runs before the append so the incremental lookback never
        // sees the batch it is evaluating.
        let results = self.analyzer.collect_at(started_at, &fresh, mode, &self.store).await?;

        let stored_items = self.store.append(&fresh).await?;

        let purged_partitions = if self.config.storage.retention_days > 0 {
            let today = started_at.with_timezone(&self.tz).date_naive();
            let cutoff = today
                .checked_sub_days(Days::new(u64::from(self.config.storage.retention_days)))
                .context("computing retention cutoff")?;
            self.store.purge_older_than(cutoff).await?
        } else {
            0
        };

        let stats = self.store.stats().await?;
        let keyword_stats = Analyzer::keyword_stats(&results);
        let finished_at = Utc::now();
        info!(
            %run_id,
            fetched = fresh.len(),
            stored = stored_items,
            matched = results.len(),
            purged = purged_partitions,
            "run finished"
        );

        Ok(RunOutput {
            summary: RunSummary {
                run_id,
                mode,
                started_at,
                finished_at,
                platforms_attempted: attempted,
                platforms_succeeded: succeeded,
                fetched_items: fresh.len(),
                stored_items,
                purged_partitions,
                matched_groups: results.len(),
                keyword_stats,
            },
            results,
            stats,
            platform_counts,
        })
    }

    /// Fetch every enabled platform concurrently; the fetcher's semaphores
    /// bound the parallelism. Failures are isolated per platform.
    async fn fetch_all(
        &self,
        run_id: Uuid,
        observed_at: DateTime<Utc>,
    ) -> (Vec<NewsItem>, Vec<PlatformFetchCount>) {
        let enabled: Vec<PlatformConfig> = self
            .config
            .platforms
            .iter()
            .filter(|p| p.enabled)
            .cloned()
            .collect();

        let ctx = AdapterContext { run_id, observed_at };
        let mut set: JoinSet<(usize, Result<Vec<NewsItem>, AdapterError>)> = JoinSet::new();
        for (index, platform) in enabled.iter().cloned().enumerate() {
            let http = self.http.clone();
            let base = self.config.crawler.api_base.clone();
            set.spawn(async move {
                let adapter = NewsNowAdapter::new(base, platform.id, platform.name);
                (index, adapter.fetch_ranked(&http, &ctx).await)
            });
        }

        let mut outcomes: Vec<Option<Result<Vec<NewsItem>, AdapterError>>> =
            (0..enabled.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(err) => warn!(error = %err, "platform fetch task aborted"),
            }
        }

        let mut fresh = Vec::new();
        let mut counts = Vec::with_capacity(enabled.len());
        for (platform, outcome) in enabled.iter().zip(outcomes) {
            match outcome {
                Some(Ok(items)) => {
                    info!(platform = %platform.id, items = items.len(), "platform fetched");
                    counts.push(PlatformFetchCount {
                        platform_id: platform.id.clone(),
                        platform_name: platform.name.clone(),
                        fetched: items.len(),
                        succeeded: true,
                    });
                    fresh.extend(items);
                }
                Some(Err(err)) => {
                    warn!(platform = %platform.id, error = %err, "platform fetch failed");
                    counts.push(PlatformFetchCount {
                        platform_id: platform.id.clone(),
                        platform_name: platform.name.clone(),
                        fetched: 0,
                        succeeded: false,
                    });
                }
                None => {
                    counts.push(PlatformFetchCount {
                        platform_id: platform.id.clone(),
                        platform_name: platform.name.clone(),
                        fetched: 0,
                        succeeded: false,
                    });
                }
            }
        }
        (fresh, counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
app:
  timezone: Asia/Shanghai
platforms:
  - id: weibo
    name: Weibo
  - id: zhihu
    name: Zhihu
    enabled: false
crawler:
  request_interval_ms: 250
  concurrency: 2
storage:
  data_dir: output
  retention_days: 14
  push_window:
    enabled: true
    start: "08:30"
    end: "22:30"
report:
  mode: incremental
  rank_threshold: 3
  max_news_per_keyword: 10
notification:
  bark:
    enabled: false
    url: ""
"#;

    #[test]
    fn config_parses_with_defaults_and_base_dir() {
        let config = AppConfig::from_yaml_str(SAMPLE, PathBuf::from("/etc/newslens")).expect("config");
        assert_eq!(config.platforms.len(), 2);
        assert!(!config.platforms[1].enabled);
        assert_eq!(config.report.mode, ReportMode::Incremental);
        assert_eq!(config.storage.retention_days, 14);
        assert_eq!(config.crawler.api_base, DEFAULT_API_BASE);
        assert_eq!(config.data_dir(), PathBuf::from("/etc/newslens/output"));
        assert_eq!(
            config.report_dir(),
            PathBuf::from("/etc/newslens/output/reports")
        );
        assert_eq!(
            config.keywords_path(),
            PathBuf::from("/etc/newslens/keywords.txt")
        );
        assert_eq!(config.timezone().expect("tz"), chrono_tz::Asia::Shanghai);
    }

    #[test]
    fn empty_platform_list_is_rejected() {
        let text = SAMPLE.replace(
            "platforms:\n  - id: weibo\n    name: Weibo\n  - id: zhihu\n    name: Zhihu\n    enabled: false\n",
            "platforms: []\n",
        );
        assert!(AppConfig::from_yaml_str(&text, PathBuf::new()).is_err());
    }

    #[test]
    fn bad_timezone_is_rejected() {
        let text = SAMPLE.replace("Asia/Shanghai", "Mars/Olympus");
        assert!(AppConfig::from_yaml_str(&text, PathBuf::new()).is_err());
    }

    #[test]
    fn env_overrides_beat_the_config_file() {
        std::env::set_var("BARK_URL", "https://bark.example/device");
        std::env::set_var("BARK_ENABLED", "yes");
        std::env::set_var("PUSH_WINDOW_ENABLED", "off");
        std::env::set_var("PUSH_WINDOW_START", "09:15");
        let config = AppConfig::from_yaml_str(SAMPLE, PathBuf::new()).expect("config");
        std::env::remove_var("BARK_URL");
        std::env::remove_var("BARK_ENABLED");
        std::env::remove_var("PUSH_WINDOW_ENABLED");
        std::env::remove_var("PUSH_WINDOW_START");

        assert!(config.notification.bark.enabled);
        assert_eq!(config.notification.bark.url, "https://bark.example/device");
        assert!(!config.storage.push_window.enabled);
        assert_eq!(config.storage.push_window.start, "09:15");
        assert_eq!(config.storage.push_window.end, "22:30");
    }

    #[tokio::test]
    async fn run_once_completes_offline_with_no_enabled_platforms() {
        let dir = tempdir().expect("tempdir");
        let text = SAMPLE
            .replace("  - id: weibo\n    name: Weibo\n", "  - id: weibo\n    name: Weibo\n    enabled: false\n")
            .replace("data_dir: output", &format!("data_dir: {}", dir.path().join("output").display()));
        let config = AppConfig::from_yaml_str(&text, dir.path().to_path_buf()).expect("config");
        let groups = vec![KeywordGroup {
            name: "Rust".to_string(),
            keywords: vec!["rust".to_string()],
        }];

        let pipeline = Pipeline::new(config, groups).expect("pipeline");
        let output = pipeline.run_once().await.expect("run");
        assert_eq!(output.summary.platforms_attempted, 0);
        assert_eq!(output.summary.fetched_items, 0);
        assert!(output.results.is_empty());
        assert_eq!(output.stats.total_items, 0);
    }
}
