//! Push eligibility gating + the Bark webhook sender.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use newslens_core::{MatchResult, PushWindow};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "newslens-notify";

/// Hard ceiling Bark enforces per message; batches stay under this.
const MAX_BATCH_BYTES: usize = 3600;
const BATCH_PAUSE: Duration = Duration::from_secs(1);
const PUSH_TITLE: &str = "NewsLens";
const PUSH_GROUP: &str = "NewsLens";

/// Decides whether a run's matches may be dispatched, and shapes the single
/// outbound payload. Actual transport lives in [`BarkSender`].
#[derive(Debug, Clone)]
pub struct PushGate {
    window: PushWindow,
    tz: Tz,
}

impl PushGate {
    pub fn new(window: PushWindow, tz: Tz) -> Self {
        Self { window, tz }
    }

    /// A disabled window is always eligible. Otherwise the local
    /// time-of-day must fall inside `[start, end]` inclusive; `start > end`
    /// wraps past midnight. Unparsable bounds fail closed.
    pub fn is_eligible_at(&self, now: NaiveTime) -> bool {
        if !self.window.enabled {
            return true;
        }
        let (Some(start), Some(end)) = (
            parse_time_of_day(&self.window.start),
            parse_time_of_day(&self.window.end),
        ) else {
            warn!(
                start = %self.window.start,
                end = %self.window.end,
                "unparsable push window bounds, failing closed"
            );
            return false;
        };

        if start <= end {
            start <= now && now <= end
        } else {
            now >= start || now <= end
        }
    }

    pub fn is_eligible(&self, now_utc: DateTime<Utc>) -> bool {
        self.is_eligible_at(now_utc.with_timezone(&self.tz).time())
    }

    /// Produce the run's single dispatch payload, or nothing when there are
    /// no matches or the window says no. Exactly one payload per run —
    /// dispatch volume never scales with the number of matched groups.
    pub fn prepare_dispatch(
        &self,
        results: &[MatchResult],
        total_today: u64,
        now_utc: DateTime<Utc>,
    ) -> Option<PushPayload> {
        if results.is_empty() {
            debug!("no matches this run, nothing to dispatch");
            return None;
        }
        let local = now_utc.with_timezone(&self.tz);
        if !self.is_eligible_at(local.time()) {
            info!(
                time = %local.format("%H:%M"),
                start = %self.window.start,
                end = %self.window.end,
                "outside push window, withholding dispatch"
            );
            return None;
        }

        let sections = results
            .iter()
            .map(|result| PushSection {
                group_name: result.group_name.clone(),
                count: result.count(),
                entries: result
                    .items
                    .iter()
                    .map(|ranked| PushEntry {
                        title: ranked.item.title.clone(),
                        url: ranked.item.url.clone(),
                        platform_name: ranked.item.platform_name.clone(),
                    })
                    .collect(),
            })
            .collect();

        Some(PushPayload {
            generated_at: local.format("%Y-%m-%d %H:%M").to_string(),
            updated_at: local.format("%Y-%m-%d %H:%M:%S").to_string(),
            total_today,
            sections,
        })
    }
}

fn parse_time_of_day(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text.trim(), "%H:%M").ok()
}

/// The single per-run summary handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushPayload {
    pub generated_at: String,
    pub updated_at: String,
    pub total_today: u64,
    pub sections: Vec<PushSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushSection {
    pub group_name: String,
    pub count: usize,
    pub entries: Vec<PushEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushEntry {
    pub title: String,
    pub url: String,
    pub platform_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BarkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("bark rejected the push: {0}")]
    Rejected(String),
}

#[derive(Debug, Deserialize)]
struct BarkResponse {
    code: i64,
    #[serde(default)]
    message: Option<String>,
}

/// Best-effort Bark markdown transport. Splits oversized payloads into
/// size-bounded parts and sends them last-first so the newest part tops the
/// client's notification stack.
#[derive(Debug)]
pub struct BarkSender {
    config: BarkConfig,
    client: reqwest::Client,
}

impl BarkSender {
    pub fn new(config: BarkConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building bark client")?;
        Ok(Self { config, client })
    }

    pub fn is_configured(&self) -> bool {
        self.config.enabled && !self.config.url.trim().is_empty()
    }

    pub async fn send(&self, payload: &PushPayload) -> Result<(), PushError> {
        if !self.is_configured() {
            debug!("bark disabled or unconfigured, skipping send");
            return Ok(());
        }

        let batches = render_batches(payload);
        let total = batches.len();
        for (sent, (number, body)) in batches.into_iter().enumerate().rev().enumerate() {
            let title = if total > 1 {
                format!("{PUSH_TITLE} [{}/{}]", number + 1, total)
            } else {
                PUSH_TITLE.to_string()
            };
            self.send_markdown(&title, &body).await?;
            if sent + 1 < total {
                tokio::time::sleep(BATCH_PAUSE).await;
            }
        }
        info!(batches = total, "bark push delivered");
        Ok(())
    }

    async fn send_markdown(&self, title: &str, body: &str) -> Result<(), PushError> {
        let url = self.config.url.trim_end_matches('/');
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({
                "title": title,
                "markdown": body,
                "sound": "default",
                "group": PUSH_GROUP,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Rejected(format!("http status {status}")));
        }
        let parsed: BarkResponse = response.json().await?;
        if parsed.code != 200 {
            return Err(PushError::Rejected(
                parsed.message.unwrap_or_else(|| format!("code {}", parsed.code)),
            ));
        }
        Ok(())
    }
}

/// Render the payload as Bark markdown, split into parts under the size
/// ceiling. Every part repeats the header and footer so it stands alone.
pub fn render_batches(payload: &PushPayload) -> Vec<String> {
    let header = format!(
        "**Total today:** {}\n**Time:** {}\n\n---\n\n",
        payload.total_today, payload.generated_at
    );
    let footer = format!("\n\n> Updated {}", payload.updated_at);

    if payload.sections.is_empty() {
        return vec![format!("{header}No matched keywords\n{footer}")];
    }

    let mut batches: Vec<String> = Vec::new();
    let mut current = header.clone();
    let mut current_has_content = false;

    let total_sections = payload.sections.len();
    for (index, section) in payload.sections.iter().enumerate() {
        let mut block = format!("**{}**\n\n", section.group_name);
        for (entry_no, entry) in section.entries.iter().enumerate() {
            block.push_str(&format_entry(entry, entry_no + 1));
        }
        if index + 1 < total_sections {
            block.push_str("---\n\n");
        }

        let candidate_len = current.len() + block.len() + footer.len();
        if candidate_len >= MAX_BATCH_BYTES && current_has_content {
            batches.push(format!("{current}{footer}"));
            current = format!("{header}{block}");
        } else {
            current.push_str(&block);
        }
        current_has_content = true;
    }
    if current_has_content {
        batches.push(format!("{current}{footer}"));
    }
    batches
}

fn format_entry(entry: &PushEntry, number: usize) -> String {
    let title = shorten_title(&entry.title, 80);
    let linked = if entry.url.is_empty() {
        title
    } else {
        format!("[{title}]({})", entry.url)
    };
    format!("  {number}. {linked}\n     `{}`\n\n", entry.platform_name)
}

fn shorten_title(title: &str, max_chars: usize) -> String {
    if title.chars().count() <= max_chars {
        return title.to_string();
    }
    let mut shortened: String = title.chars().take(max_chars.saturating_sub(3)).collect();
    shortened.push_str("...");
    shortened
}
