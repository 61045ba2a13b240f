//! Keyword rules, report-mode analysis and topic tagging.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use newslens_core::{ItemKey, KeywordGroup, MatchResult, NewsItem, RankedItem, ReportMode};
use newslens_storage::PartitionStore;
use serde::Deserialize;
use tracing::warn;

pub const CRATE_NAME: &str = "newslens-analysis";

/// Parse a keyword rule file.
///
/// `#` lines are comments, blank lines close the current group, `[Name]`
/// headers open a named group. A group without a header is named by joining
/// its patterns with `" / "`. Patterns empty after trimming are dropped.
pub fn parse_keyword_groups(text: &str) -> Vec<KeywordGroup> {
    let mut groups = Vec::new();
    let mut current_name: Option<String> = None;
    let mut current: Vec<String> = Vec::new();

    let close = |name: &mut Option<String>, keywords: &mut Vec<String>, out: &mut Vec<KeywordGroup>| {
        if keywords.is_empty() {
            *name = None;
            return;
        }
        let group_name = name.take().unwrap_or_else(|| keywords.join(" / "));
        out.push(KeywordGroup {
            name: group_name,
            keywords: std::mem::take(keywords),
        });
    };

    for raw in text.lines() {
        let line = raw.trim();
        if line.starts_with('#') {
            continue;
        }
        if line.is_empty() {
            close(&mut current_name, &mut current, &mut groups);
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') && line.len() >= 2 {
            close(&mut current_name, &mut current, &mut groups);
            current_name = Some(line[1..line.len() - 1].trim().to_string());
            continue;
        }
        current.push(line.to_string());
    }
    close(&mut current_name, &mut current, &mut groups);
    groups
}

pub fn load_keyword_groups(path: impl AsRef<Path>) -> anyhow::Result<Vec<KeywordGroup>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading keyword file {}", path.display()))?;
    Ok(parse_keyword_groups(&text))
}

/// Per-topic include/exclude term lists. The `ai` topic is checked first and
/// wins outright on a hit; otherwise the best-scoring topic wins.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TopicRule {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicRules {
    #[serde(default)]
    pub topics: BTreeMap<String, TopicRule>,
    #[serde(default = "TopicRules::default_topic_name")]
    pub default_topic: String,
}

impl TopicRules {
    fn default_topic_name() -> String {
        "other".to_string()
    }

    fn rule(keywords: &[&str], excludes: &[&str]) -> TopicRule {
        TopicRule {
            include: keywords.iter().map(|s| s.to_string()).collect(),
            exclude: excludes.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Classify a title. Returns the winning topic and a rough confidence.
    pub fn classify(&self, title: &str) -> (String, f64) {
        let text = title.to_lowercase();

        if let Some(ai) = self.topics.get("ai") {
            if !Self::hits_any(&text, &ai.exclude) {
                let matched = Self::hit_count(&text, &ai.include);
                if matched > 0 {
                    return ("ai".to_string(), Self::score(matched));
                }
            }
        }

        let mut best: Option<(String, f64)> = None;
        for (topic, rule) in &self.topics {
            if topic == "ai" || Self::hits_any(&text, &rule.exclude) {
                continue;
            }
            let matched = Self::hit_count(&text, &rule.include);
            if matched == 0 {
                continue;
            }
            let score = Self::score(matched);
            if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((topic.clone(), score));
            }
        }
        best.unwrap_or_else(|| (self.default_topic.clone(), 0.05))
    }

    fn hits_any(text: &str, terms: &[String]) -> bool {
        terms.iter().any(|t| !t.is_empty() && text.contains(&t.to_lowercase()))
    }

    fn hit_count(text: &str, terms: &[String]) -> usize {
        terms
            .iter()
            .filter(|t| !t.is_empty() && text.contains(&t.to_lowercase()))
            .count()
    }

    fn score(matched: usize) -> f64 {
        (0.35 + 0.15 * matched as f64).min(1.0)
    }
}

impl Default for TopicRules {
    fn default() -> Self {
        let mut topics = BTreeMap::new();
        topics.insert(
            "ai".to_string(),
            Self::rule(
                &[
                    "ai", "人工智能", "大模型", "智能体", "agent", "chatgpt", "openai",
                    "anthropic", "gemini", "claude", "算力", "多模态", "aigc", "机器学习",
                ],
                &["优惠", "折扣", "测评", "开箱"],
            ),
        );
        topics.insert(
            "market".to_string(),
            Self::rule(
                &["美股", "港股", "a股", "股价", "市值", "财报", "营收", "估值", "加息", "降息", "通胀"],
                &[],
            ),
        );
        topics.insert(
            "industry".to_string(),
            Self::rule(
                &["融资", "并购", "收购", "发布", "上线", "开源", "合作", "裁员", "量产", "芯片"],
                &[],
            ),
        );
        topics.insert(
            "policy".to_string(),
            Self::rule(
                &["政策", "监管", "法案", "国会", "欧盟", "出口管制", "关税", "制裁"],
                &[],
            ),
        );
        topics.insert(
            "society".to_string(),
            Self::rule(
                &["教育", "医疗", "就业", "民生", "医院", "隐私", "伦理", "诈骗", "公益"],
                &[],
            ),
        );
        Self {
            topics,
            default_topic: Self::default_topic_name(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AnalyzerConfig {
    /// Items ranked at or below this are marked highlighted (0 = none).
    pub rank_threshold: u32,
    /// Per-group cap applied after ranking (0 = unlimited).
    pub max_news_per_keyword: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            rank_threshold: 5,
            max_news_per_keyword: 0,
        }
    }
}

/// Matches fetched items against keyword groups under a report mode.
///
/// Configuration is held explicitly; nothing is read from ambient process
/// state, so the analyzer is testable in isolation.
pub struct Analyzer {
    groups: Vec<KeywordGroup>,
    config: AnalyzerConfig,
    topics: TopicRules,
    tz: Tz,
}

impl Analyzer {
    pub fn new(groups: Vec<KeywordGroup>, config: AnalyzerConfig, topics: TopicRules, tz: Tz) -> Self {
        let groups = groups
            .into_iter()
            .map(|mut g| {
                g.keywords.retain(|kw| {
                    let usable = !kw.trim().is_empty();
                    if !usable {
                        warn!(group = %g.name, "dropping empty keyword pattern");
                    }
                    usable
                });
                g
            })
            .collect();
        Self {
            groups,
            config,
            topics,
            tz,
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Match the fresh batch under `mode`, consulting the store for the
    /// `daily`/`incremental` lookbacks.
    ///
    /// Call this BEFORE appending the fresh batch: the `incremental`
    /// lookback must not see the batch it is evaluating, and `daily` unions
    /// the fresh batch in explicitly. A lookback failure is an error — the
    /// run must not degrade to `current` semantics and under-report.
    pub async fn collect(
        &self,
        fresh: &[NewsItem],
        mode: ReportMode,
        store: &PartitionStore,
    ) -> anyhow::Result<Vec<MatchResult>> {
        self.collect_at(Utc::now(), fresh, mode, store).await
    }

    pub async fn collect_at(
        &self,
        now: DateTime<Utc>,
        fresh: &[NewsItem],
        mode: ReportMode,
        store: &PartitionStore,
    ) -> anyhow::Result<Vec<MatchResult>> {
        let today = now.with_timezone(&self.tz).date_naive();

        let candidates: Vec<NewsItem> = match mode {
            ReportMode::Current => fresh.to_vec(),
            ReportMode::Daily => {
                let mut merged = store
                    .query_range(today, today)
                    .await
                    .context("daily lookback")?;
                let mut seen: HashSet<ItemKey> = merged.iter().map(|i| i.key(self.tz)).collect();
                for item in fresh {
                    if seen.insert(item.key(self.tz)) {
                        merged.push(item.clone());
                    }
                }
                merged
            }
            ReportMode::Incremental => {
                let yesterday = today.pred_opt().context("calendar underflow")?;
                let lookback = store
                    .query_range(yesterday, today)
                    .await
                    .context("incremental lookback")?;
                // Dedup across days compares platform + external id only;
                // the full key would never collide across partitions.
                let known: HashSet<(String, String)> =
                    lookback.iter().map(NewsItem::identity).collect();
                fresh
                    .iter()
                    .filter(|item| !known.contains(&item.identity()))
                    .cloned()
                    .collect()
            }
        };

        Ok(self.build_results(&candidates, mode))
    }

    fn build_results(&self, candidates: &[NewsItem], mode: ReportMode) -> Vec<MatchResult> {
        let mut results = Vec::new();
        for group in &self.groups {
            if group.keywords.is_empty() {
                continue;
            }
            let mut seen: HashSet<ItemKey> = HashSet::new();
            let mut matched: Vec<&NewsItem> = Vec::new();
            for item in candidates {
                if group.matches(&item.title) && seen.insert(item.key(self.tz)) {
                    matched.push(item);
                }
            }
            if matched.is_empty() {
                continue;
            }

            matched.sort_by(|a, b| a.rank.cmp(&b.rank).then(a.observed_at.cmp(&b.observed_at)));
            if self.config.max_news_per_keyword > 0 {
                matched.truncate(self.config.max_news_per_keyword);
            }

            let items = matched
                .into_iter()
                .map(|item| RankedItem {
                    highlighted: self.config.rank_threshold > 0
                        && item.rank <= self.config.rank_threshold,
                    topic: Some(self.topics.classify(&item.title).0),
                    item: item.clone(),
                })
                .collect();
            results.push(MatchResult {
                group_name: group.name.clone(),
                keywords: group.keywords.clone(),
                mode,
                items,
            });
        }
        // Busiest groups first, stable within equal counts.
        results.sort_by(|a, b| b.count().cmp(&a.count()));
        results
    }

    /// Per-group match counts, recorded in the run summary.
    pub fn keyword_stats(results: &[MatchResult]) -> BTreeMap<String, usize> {
        results
            .iter()
            .map(|r| (r.group_name.clone(), r.count()))
            .collect()
    }
}
