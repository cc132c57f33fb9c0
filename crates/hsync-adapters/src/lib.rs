//! Source adapter contract, the Unstop search adapter and the paginated scrape loop.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use hsync_core::{clean_text, HackathonRecord, Status};
use hsync_storage::{FetchError, HttpFetcher};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "hsync-adapters";

pub const UNSTOP_SEARCH_URL: &str = "https://unstop.com/api/public/opportunity/search-result";
const UNSTOP_PUBLIC_BASE: &str = "https://unstop.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub status: Status,
    pub page: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub status: Status,
    pub page: u32,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    /// Load a captured response body, e.g. a fixture.
    pub fn from_file(path: impl AsRef<Path>, status: Status, page: u32) -> Result<Self> {
        let path = path.as_ref();
        let body = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        Ok(Self {
            url: path.display().to_string(),
            status,
            page,
            body,
            fetched_at: Utc::now(),
        })
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid JSON in page response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected response structure: {0}")]
    InvalidStructure(String),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        request: &PageRequest,
    ) -> Result<FetchedPage, AdapterError>;

    /// Flatten one page into records. An empty vector means the listing is exhausted.
    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<HackathonRecord>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct UnstopAdapter {
    search_url: String,
}

impl Default for UnstopAdapter {
    fn default() -> Self {
        Self::new(UNSTOP_SEARCH_URL)
    }
}

impl UnstopAdapter {
    pub fn new(search_url: impl Into<String>) -> Self {
        Self {
            search_url: search_url.into(),
        }
    }

    fn referer(&self, status: &Status) -> String {
        format!(
            "{}?opportunity=hackathons&oppstatus={}",
            self.search_url, status
        )
    }

    fn item_to_record(&self, item: &JsonValue, status: &Status) -> HackathonRecord {
        let text = |path: &[&str]| clean_text(json_str(item, path).map(ToString::to_string));
        let eligibility = json_names(item, &["filters"]);
        let start_date = text(&["start_date"]);
        let deadline = start_date.as_deref().and_then(|start| {
            let remaining = json_at(item, &["regnRequirements", "remainingDaysArray"]);
            application_deadline(
                remaining.and_then(|r| r.get("durations")),
                remaining
                    .and_then(|r| r.get("text"))
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default(),
                start,
            )
        });

        HackathonRecord {
            title: text(&["title"]),
            organisation: text(&["organisation", "name"]),
            link: Some(format!(
                "{}/{}",
                UNSTOP_PUBLIC_BASE,
                json_str(item, &["public_url"]).unwrap_or_default()
            )),
            uploaded_on: start_date,
            opportunity_type: text(&["type"]),
            status: Some(status.clone()),
            applied_count: json_count(item, &["registerCount"]),
            application_deadline: deadline,
            impressions: json_count(item, &["viewsCount"]),
            category: eligibility.clone(),
            eligibility,
            region: text(&["region"]),
        }
    }
}

#[async_trait]
impl SourceAdapter for UnstopAdapter {
    fn source_id(&self) -> &'static str {
        "unstop"
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        request: &PageRequest,
    ) -> Result<FetchedPage, AdapterError> {
        let query = [
            ("opportunity", "hackathons".to_string()),
            ("oppstatus", request.status.to_string()),
            ("page", request.page.to_string()),
            ("size", request.size.to_string()),
        ];
        let headers = [
            ("Accept", "application/json, text/javascript, */*; q=0.01".to_string()),
            ("Accept-Language", "en-GB,en;q=0.8".to_string()),
            ("X-Requested-With", "XMLHttpRequest".to_string()),
            ("Referer", self.referer(&request.status)),
        ];
        let resp = http
            .fetch_bytes(self.source_id(), &self.search_url, &query, &headers)
            .await?;
        Ok(FetchedPage {
            url: resp.final_url,
            status: request.status.clone(),
            page: request.page,
            body: resp.body,
            fetched_at: Utc::now(),
        })
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<HackathonRecord>, AdapterError> {
        let value: JsonValue = serde_json::from_slice(&page.body)?;
        let items = json_at(&value, &["data", "data"])
            .and_then(JsonValue::as_array)
            .ok_or_else(|| {
                AdapterError::InvalidStructure(format!(
                    "missing data.data array on page {} for status={}",
                    page.page, page.status
                ))
            })?;
        Ok(items
            .iter()
            .map(|item| self.item_to_record(item, &page.status))
            .collect())
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_count(value: &JsonValue, path: &[&str]) -> Option<i64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => hsync_core::parse_count(s),
        _ => None,
    }
}

/// `[{name: ..}, ..]` joined with `", "`; `None` when there are no names.
fn json_names(value: &JsonValue, path: &[&str]) -> Option<String> {
    let names = json_at(value, path)?
        .as_array()?
        .iter()
        .filter_map(|entry| entry.get("name").and_then(JsonValue::as_str))
        .collect::<Vec<_>>();
    if names.is_empty() {
        None
    } else {
        Some(names.join(", "))
    }
}

/// Days until registration closes, from the source's `{durations, text}` pair.
///
/// "N days" is taken as-is; "N months" is scaled by the length of the month the
/// listing started in. Anything else is unknown.
pub fn application_deadline(
    durations: Option<&JsonValue>,
    text: &str,
    start_date: &str,
) -> Option<i64> {
    let durations = match durations {
        None => 0,
        Some(JsonValue::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64))?,
        Some(JsonValue::String(s)) => s.trim().parse::<i64>().ok()?,
        Some(_) => return None,
    };
    let unit = text.to_lowercase();
    if unit.contains("day") {
        Some(durations)
    } else if unit.contains("month") {
        days_in_month(start_date).map(|days| durations * i64::from(days))
    } else {
        None
    }
}

pub fn days_in_month(date: &str) -> Option<u32> {
    let Some(parsed) = parse_start_date(date) else {
        warn!(date, "unparseable start date");
        return None;
    };
    let days = match parsed.month() {
        2 => {
            let year = parsed.year();
            let leap = year % 4 == 0 && (year % 100 != 0 || year % 400 == 0);
            if leap {
                29
            } else {
                28
            }
        }
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    };
    Some(days)
}

fn parse_start_date(date: &str) -> Option<NaiveDate> {
    let date = date.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(date) {
        return Some(dt.date_naive());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(date, format) {
            return Some(dt.date());
        }
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub statuses: Vec<Status>,
    pub page_size: u32,
    pub max_pages: u32,
    pub page_delay: Duration,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            statuses: Status::scraped().to_vec(),
            page_size: 30,
            max_pages: 20,
            page_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum StopReason {
    Exhausted,
    PageCap,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusScrape {
    pub pages: u32,
    pub records: usize,
    pub stopped: StopReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeReport {
    pub per_status: BTreeMap<String, StatusScrape>,
    pub total_records: usize,
}

/// Walk every configured status page by page until a page comes back empty,
/// fails, or the page cap is hit. A failure only ends that status.
pub async fn scrape_all(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    config: &ScrapeConfig,
) -> (Vec<HackathonRecord>, ScrapeReport) {
    let mut all = Vec::new();
    let mut report = ScrapeReport::default();

    for status in &config.statuses {
        info!(source = adapter.source_id(), %status, "scraping status");
        let mut pages = 0;
        let mut records = 0;
        let mut stopped = StopReason::PageCap;

        for page in 1..=config.max_pages {
            let request = PageRequest {
                status: status.clone(),
                page,
                size: config.page_size,
            };
            let parsed = match adapter.fetch_page(http, &request).await {
                Ok(fetched) => adapter.parse_page(&fetched),
                Err(err) => Err(err),
            };
            let items = match parsed {
                Ok(items) => items,
                Err(err) => {
                    warn!(%status, page, error = %err, "page retrieval failed; moving to next status");
                    stopped = StopReason::Failed(err.to_string());
                    break;
                }
            };
            if items.is_empty() {
                info!(%status, page, "no more listings");
                stopped = StopReason::Exhausted;
                break;
            }

            pages += 1;
            records += items.len();
            all.extend(items);

            if page < config.max_pages && !config.page_delay.is_zero() {
                tokio::time::sleep(config.page_delay).await;
            }
        }

        info!(%status, pages, records, "finished status");
        report.per_status.insert(
            status.to_string(),
            StatusScrape {
                pages,
                records,
                stopped,
            },
        );
    }

    report.total_records = all.len();
    info!(total = all.len(), "scrape complete");
    (all, report)
}
