//! Static HTML rendering of a run's match results.

use std::path::{Path, PathBuf};

use anyhow::Context;
use askama::Template;
use chrono_tz::Tz;
use newslens_core::{MatchResult, PlatformFetchCount};
use newslens_storage::StoreStats;

pub const CRATE_NAME: &str = "newslens-report";

#[derive(Template)]
#[template(path = "report.html")]
struct ReportTemplate {
    generated_at: String,
    mode: String,
    total_items: u64,
    today_items: u64,
    platform_count: usize,
    partition_count: usize,
    groups: Vec<GroupView>,
    platforms: Vec<PlatformView>,
}

struct GroupView {
    name: String,
    count: usize,
    keywords: String,
    items: Vec<ItemView>,
}

struct ItemView {
    rank: u32,
    title: String,
    url: String,
    platform_name: String,
    highlighted: bool,
    topic: String,
}

struct PlatformView {
    platform_name: String,
    fetched: usize,
    succeeded: bool,
}

/// Writes one timestamped report per run plus an `index.html` copy pointing
/// at the latest. Pure formatting — consumes the same result slice the push
/// gate sees.
#[derive(Debug, Clone)]
pub struct HtmlReporter {
    report_dir: PathBuf,
    tz: Tz,
}

impl HtmlReporter {
    pub fn new(report_dir: impl Into<PathBuf>, tz: Tz) -> Self {
        Self {
            report_dir: report_dir.into(),
            tz,
        }
    }

    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    pub fn generate(
        &self,
        results: &[MatchResult],
        platforms: &[PlatformFetchCount],
        stats: &StoreStats,
    ) -> anyhow::Result<PathBuf> {
        let now = chrono::Utc::now().with_timezone(&self.tz);
        let html = render_report(results, platforms, stats, &now.format("%Y-%m-%d %H:%M:%S").to_string())?;

        std::fs::create_dir_all(&self.report_dir)
            .with_context(|| format!("creating report directory {}", self.report_dir.display()))?;

        let report_path = self
            .report_dir
            .join(format!("report_{}.html", now.format("%Y%m%d_%H%M%S")));
        std::fs::write(&report_path, &html)
            .with_context(|| format!("writing {}", report_path.display()))?;

        let index_path = self.report_dir.join("index.html");
        std::fs::copy(&report_path, &index_path)
            .with_context(|| format!("copying report to {}", index_path.display()))?;

        Ok(report_path)
    }
}

pub fn render_report(
    results: &[MatchResult],
    platforms: &[PlatformFetchCount],
    stats: &StoreStats,
    generated_at: &str,
) -> anyhow::Result<String> {
    let mode = results
        .first()
        .map(|r| r.mode.to_string())
        .unwrap_or_else(|| "-".to_string());

    let groups = results
        .iter()
        .map(|result| GroupView {
            name: result.group_name.clone(),
            count: result.count(),
            keywords: result.keywords.join(" / "),
            items: result
                .items
                .iter()
                .map(|ranked| ItemView {
                    rank: ranked.item.rank,
                    title: ranked.item.title.clone(),
                    url: ranked.item.url.clone(),
                    platform_name: ranked.item.platform_name.clone(),
                    highlighted: ranked.highlighted,
                    topic: ranked.topic.clone().unwrap_or_default(),
                })
                .collect(),
        })
        .collect();

    let platforms = platforms
        .iter()
        .map(|p| PlatformView {
            platform_name: p.platform_name.clone(),
            fetched: p.fetched,
            succeeded: p.succeeded,
        })
        .collect();

    let template = ReportTemplate {
        generated_at: generated_at.to_string(),
        mode,
        total_items: stats.total_items,
        today_items: stats.today_items,
        platform_count: stats.platform_count,
        partition_count: stats.partition_count,
        groups,
        platforms,
    };
    template.render().context("rendering report template")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use newslens_core::{NewsItem, RankedItem, ReportMode};
    use tempfile::tempdir;

    fn sample_results() -> Vec<MatchResult> {
        vec![MatchResult {
            group_name: "AI".to_string(),
            keywords: vec!["OpenAI".to_string(), "Claude".to_string()],
            mode: ReportMode::Daily,
            items: vec![RankedItem {
                highlighted: true,
                topic: Some("ai".to_string()),
                item: NewsItem {
                    platform_id: "weibo".to_string(),
                    platform_name: "Weibo".to_string(),
                    external_id: "a1".to_string(),
                    title: "OpenAI ships <new> model".to_string(),
                    url: "https://example.com/a1".to_string(),
                    mobile_url: None,
                    rank: 2,
                    observed_at: Utc::now(),
                },
            }],
        }]
    }

    fn sample_platforms() -> Vec<PlatformFetchCount> {
        vec![
            PlatformFetchCount {
                platform_id: "weibo".to_string(),
                platform_name: "Weibo".to_string(),
                fetched: 50,
                succeeded: true,
            },
            PlatformFetchCount {
                platform_id: "zhihu".to_string(),
                platform_name: "Zhihu".to_string(),
                fetched: 0,
                succeeded: false,
            },
        ]
    }

    #[test]
    fn report_renders_groups_platforms_and_escapes_titles() {
        let stats = StoreStats {
            total_items: 123,
            today_items: 45,
            platform_count: 2,
            partition_count: 3,
            total_bytes: 9000,
        };
        let html = render_report(&sample_results(), &sample_platforms(), &stats, "2026-03-02 09:00:00")
            .expect("render");
        assert!(html.contains("AI"));
        assert!(html.contains("OpenAI / Claude"));
        assert!(html.contains("mode: daily"));
        assert!(html.contains("fetch failed"));
        assert!(html.contains("highlighted"));
        // Askama escapes HTML in titles.
        assert!(html.contains("OpenAI ships &#60;new&#62; model") || html.contains("OpenAI ships &lt;new&gt; model"));
        assert!(!html.contains("<new>"));
    }

    #[test]
    fn generate_writes_report_and_index_copy() {
        let dir = tempdir().expect("tempdir");
        let reporter = HtmlReporter::new(dir.path().join("reports"), chrono_tz::UTC);
        let stats = StoreStats::default();
        let path = reporter
            .generate(&sample_results(), &sample_platforms(), &stats)
            .expect("generate");
        assert!(path.exists());
        assert!(dir.path().join("reports").join("index.html").exists());
    }

    #[test]
    fn empty_results_render_placeholder() {
        let html = render_report(&[], &[], &StoreStats::default(), "2026-03-02 09:00:00")
            .expect("render");
        assert!(html.contains("No keyword matched this run."));
    }
}
