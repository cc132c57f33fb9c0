//! Core domain model for hackathon listings: records, statuses and identities.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "hsync-core";

/// Interchange/document column names, in file order.
pub const TITLE: &str = "Title";
pub const ORGANISATIONS: &str = "Organisations";
pub const LINK: &str = "Link";
pub const UPLOADED_ON: &str = "Uploaded On";
pub const OPPORTUNITY_TYPE: &str = "Opportunity Type";
pub const STATUS: &str = "Status";
pub const APPLIED: &str = "Applied";
pub const APPLICATION_DEADLINE: &str = "Application Deadline";
pub const IMPRESSIONS: &str = "Impressions";
pub const ELIGIBILITY: &str = "Eligibility";
pub const CATEGORY: &str = "Category";
pub const REGION: &str = "Region";

pub const COLUMNS: [&str; 12] = [
    TITLE,
    ORGANISATIONS,
    LINK,
    UPLOADED_ON,
    OPPORTUNITY_TYPE,
    STATUS,
    APPLIED,
    APPLICATION_DEADLINE,
    IMPRESSIONS,
    ELIGIBILITY,
    CATEGORY,
    REGION,
];

/// Server-side stamp written on every successful document write.
pub const SYNCED_AT_FIELD: &str = "uploaded_to_firebase";

/// Values a dataframe export or the source API uses to mean "nothing here".
/// Covers pandas' default NA strings plus `None`/`NaT` from object columns.
const MISSING_MARKERS: &[&str] = &[
    "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "NaT", "n/a", "nan", "null",
];

/// Priority given to any status outside the known set.
pub const UNKNOWN_PRIORITY: u8 = 5;

/// Listing status as reported by the source.
///
/// Unrecognized values are preserved verbatim in `Unknown` so they round-trip
/// to the remote store unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Status {
    Open,
    Recent,
    Closed,
    Expired,
    Unknown(String),
}

impl Status {
    /// Statuses queried from the source, in scrape order.
    pub fn scraped() -> [Status; 4] {
        [Status::Open, Status::Closed, Status::Recent, Status::Expired]
    }

    /// Exact match after trimming; `"Open"` is an unknown status, not `Open`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "open" => Status::Open,
            "recent" => Status::Recent,
            "closed" => Status::Closed,
            "expired" => Status::Expired,
            _ => Status::Unknown(trimmed.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Status::Open => "open",
            Status::Recent => "recent",
            Status::Closed => "closed",
            Status::Expired => "expired",
            Status::Unknown(raw) => raw,
        }
    }

    /// Lower is more current: open(1) < recent(2) < closed(3) < expired(4) < anything else(5).
    pub fn priority(&self) -> u8 {
        match self {
            Status::Open => 1,
            Status::Recent => 2,
            Status::Closed => 3,
            Status::Expired => 4,
            Status::Unknown(_) => UNKNOWN_PRIORITY,
        }
    }
}

impl From<String> for Status {
    fn from(value: String) -> Self {
        Status::parse(&value)
    }
}

impl From<&str> for Status {
    fn from(value: &str) -> Self {
        Status::parse(value)
    }
}

impl From<Status> for String {
    fn from(value: Status) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable document key for a hackathon: MD5 hex of `lower(trim(title)) | lower(trim(organisation))`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn derive(title: &str, organisation: &str) -> Self {
        let key = format!(
            "{}|{}",
            title.trim().to_lowercase(),
            organisation.trim().to_lowercase()
        );
        Self(format!("{:x}", md5::compute(key.as_bytes())))
    }

    /// Wrap a key read back from the remote store.
    pub fn from_key(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn derive_identity(record: &HackathonRecord) -> Identity {
    Identity::derive(
        record.title.as_deref().unwrap_or_default(),
        record.organisation.as_deref().unwrap_or_default(),
    )
}

/// Loosely-typed row keyed by column name, as read from the interchange file.
pub type RawRow = BTreeMap<String, String>;

/// One observed hackathon listing. Absent or unparseable values are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HackathonRecord {
    #[serde(rename = "Title")]
    pub title: Option<String>,
    #[serde(rename = "Organisations")]
    pub organisation: Option<String>,
    #[serde(rename = "Link")]
    pub link: Option<String>,
    #[serde(rename = "Uploaded On")]
    pub uploaded_on: Option<String>,
    #[serde(rename = "Opportunity Type")]
    pub opportunity_type: Option<String>,
    #[serde(rename = "Status")]
    pub status: Option<Status>,
    #[serde(rename = "Applied")]
    pub applied_count: Option<i64>,
    #[serde(rename = "Application Deadline")]
    pub application_deadline: Option<i64>,
    #[serde(rename = "Impressions")]
    pub impressions: Option<i64>,
    #[serde(rename = "Eligibility")]
    pub eligibility: Option<String>,
    /// Same content as `eligibility`; kept as its own column for consumers.
    #[serde(rename = "Category")]
    pub category: Option<String>,
    #[serde(rename = "Region")]
    pub region: Option<String>,
}

impl HackathonRecord {
    /// Map a loosely-typed row onto the record schema. Unknown columns are ignored.
    pub fn from_row(row: &RawRow) -> Self {
        let text = |column: &str| clean_text(row.get(column).cloned());
        let count = |column: &str| row.get(column).and_then(|v| parse_count(v));
        Self {
            title: text(TITLE),
            organisation: text(ORGANISATIONS),
            link: text(LINK),
            uploaded_on: text(UPLOADED_ON),
            opportunity_type: text(OPPORTUNITY_TYPE),
            status: text(STATUS).map(Status::from),
            applied_count: count(APPLIED),
            application_deadline: count(APPLICATION_DEADLINE),
            impressions: count(IMPRESSIONS),
            eligibility: text(ELIGIBILITY),
            category: text(CATEGORY),
            region: text(REGION),
        }
    }

    pub fn identity(&self) -> Identity {
        derive_identity(self)
    }

    pub fn status_priority(&self) -> u8 {
        self.status.as_ref().map_or(UNKNOWN_PRIORITY, Status::priority)
    }

    pub fn status_str(&self) -> &str {
        self.status.as_ref().map_or("", Status::as_str)
    }

    /// Replace any remaining missing-value markers with `None`.
    pub fn normalized(self) -> Self {
        Self {
            title: clean_text(self.title),
            organisation: clean_text(self.organisation),
            link: clean_text(self.link),
            uploaded_on: clean_text(self.uploaded_on),
            opportunity_type: clean_text(self.opportunity_type),
            status: self
                .status
                .and_then(|s| clean_text(Some(s.as_str().to_string())))
                .map(Status::from),
            applied_count: self.applied_count,
            application_deadline: self.application_deadline,
            impressions: self.impressions,
            eligibility: clean_text(self.eligibility),
            category: clean_text(self.category),
            region: clean_text(self.region),
        }
    }
}

/// Store-ready form of a record, stamped with the instant it was synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HackathonDocument {
    #[serde(flatten)]
    pub record: HackathonRecord,
    pub uploaded_to_firebase: String,
}

impl HackathonDocument {
    pub fn identity(&self) -> Identity {
        self.record.identity()
    }

    /// Document body as a JSON object keyed by column name.
    pub fn to_fields(&self) -> serde_json::Result<serde_json::Map<String, serde_json::Value>> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "document serialized to non-object value: {other}"
            ))),
        }
    }
}

pub fn normalize(record: HackathonRecord) -> HackathonDocument {
    normalize_at(record, Utc::now())
}

pub fn normalize_at(record: HackathonRecord, synced_at: DateTime<Utc>) -> HackathonDocument {
    HackathonDocument {
        record: record.normalized(),
        uploaded_to_firebase: format_synced_at(synced_at),
    }
}

/// Sortable ISO-8601 stamp with microsecond precision.
pub fn format_synced_at(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn is_missing(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || MISSING_MARKERS.contains(&trimmed)
}

pub fn clean_text(value: Option<String>) -> Option<String> {
    value.filter(|v| !is_missing(v))
}

/// Parse an integer count, unwrapping float-boxed integers such as `"12.0"`.
pub fn parse_count(value: &str) -> Option<i64> {
    if is_missing(value) {
        return None;
    }
    let trimmed = value.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return Some(n);
    }
    let float = trimmed.parse::<f64>().ok()?;
    if float.is_finite() && float.fract() == 0.0 && float.abs() < i64::MAX as f64 {
        Some(float as i64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(title: &str, org: &str, status: &str) -> HackathonRecord {
        HackathonRecord {
            title: Some(title.to_string()),
            organisation: Some(org.to_string()),
            status: Some(Status::parse(status)),
            ..Default::default()
        }
    }

    #[test]
    fn identity_ignores_case_surrounding_whitespace_and_other_fields() {
        let a = record("  Code Sprint ", "ACME", "open");
        let mut b = record("code sprint", "  acme  ", "expired");
        b.link = Some("https://example.com".into());
        b.applied_count = Some(42);
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), record("code sprint 2", "acme", "open").identity());
    }

    #[test]
    fn identity_is_md5_hex_of_joined_key() {
        let id = Identity::derive("Foo", "Bar");
        assert_eq!(id.as_str(), format!("{:x}", md5::compute(b"foo|bar")));
        assert_eq!(id.as_str().len(), 32);
    }

    #[test]
    fn identity_pair_is_not_interchangeable() {
        assert_ne!(Identity::derive("a", "b"), Identity::derive("b", "a"));
        assert_ne!(Identity::derive("a|b", ""), Identity::derive("a", "b|"));
    }

    #[test]
    fn missing_title_and_organisation_hash_as_empty_strings() {
        let empty = HackathonRecord::default();
        assert_eq!(empty.identity(), Identity::derive("", ""));
    }

    #[test]
    fn status_priority_is_total_order() {
        let ordered = ["open", "recent", "closed", "expired", "upcoming"]
            .map(|s| Status::parse(s).priority());
        assert_eq!(ordered, [1, 2, 3, 4, 5]);
        assert_eq!(Status::parse(" open ").priority(), 1);
        assert_eq!(HackathonRecord::default().status_priority(), UNKNOWN_PRIORITY);
    }

    #[test]
    fn known_statuses_match_case_sensitively() {
        assert_eq!(Status::parse("OPEN"), Status::Unknown("OPEN".into()));
        assert_eq!(Status::parse("Expired").priority(), UNKNOWN_PRIORITY);
        assert_eq!(Status::parse("Open").as_str(), "Open");
    }

    #[test]
    fn unknown_status_round_trips_verbatim() {
        let status = Status::parse("Upcoming");
        assert_eq!(status, Status::Unknown("Upcoming".into()));
        assert_eq!(String::from(status), "Upcoming");
    }

    #[test]
    fn row_mapping_turns_markers_into_none_without_touching_zero() {
        let mut row = RawRow::new();
        row.insert(TITLE.into(), "Foo".into());
        row.insert(ORGANISATIONS.into(), "N/A".into());
        row.insert(STATUS.into(), "open".into());
        row.insert(APPLIED.into(), "0".into());
        row.insert(APPLICATION_DEADLINE.into(), "".into());
        row.insert(IMPRESSIONS.into(), "1532.0".into());
        row.insert(REGION.into(), "nan".into());
        row.insert("Unrelated".into(), "ignored".into());

        let rec = HackathonRecord::from_row(&row);
        assert_eq!(rec.title.as_deref(), Some("Foo"));
        assert_eq!(rec.organisation, None);
        assert_eq!(rec.status, Some(Status::Open));
        assert_eq!(rec.applied_count, Some(0));
        assert_eq!(rec.application_deadline, None);
        assert_eq!(rec.impressions, Some(1532));
        assert_eq!(rec.region, None);
        assert_eq!(rec.link, None);
    }

    #[test]
    fn pandas_na_strings_count_as_missing() {
        for marker in ["NA", "NULL", "n/a", "#N/A", "-nan", "<NA>", " NaN "] {
            assert!(is_missing(marker), "{marker}");
        }
        assert!(!is_missing("Nadia"));
        assert!(!is_missing("0"));
    }

    #[test]
    fn parse_count_rejects_fractions_and_garbage() {
        assert_eq!(parse_count("12"), Some(12));
        assert_eq!(parse_count(" 7.0 "), Some(7));
        assert_eq!(parse_count("12.5"), None);
        assert_eq!(parse_count("lots"), None);
        assert_eq!(parse_count("N/A"), None);
    }

    #[test]
    fn normalize_is_idempotent_on_clean_input() {
        let first_at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        let later_at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap();
        let mut clean = record("Foo", "Bar", "open");
        clean.applied_count = Some(3);
        clean.eligibility = Some("Engineering Students, Everyone".into());

        let once = normalize_at(clean.clone(), first_at);
        let twice = normalize_at(once.record.clone(), later_at);
        assert_eq!(once.record, clean);
        assert_eq!(twice.record, clean);
        assert_ne!(once.uploaded_to_firebase, twice.uploaded_to_firebase);
    }

    #[test]
    fn normalize_scrubs_sentinel_strings() {
        let mut dirty = record("Foo", "N/A", "N/A");
        dirty.region = Some("NaN".into());
        let doc = normalize(dirty);
        assert_eq!(doc.record.organisation, None);
        assert_eq!(doc.record.status, None);
        assert_eq!(doc.record.region, None);
    }

    #[test]
    fn document_fields_use_column_names_and_stamp() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        let doc = normalize_at(record("Foo", "Bar", "recent"), at);
        let fields = doc.to_fields().unwrap();
        assert_eq!(fields[TITLE], serde_json::json!("Foo"));
        assert_eq!(fields[STATUS], serde_json::json!("recent"));
        assert_eq!(fields[APPLIED], serde_json::Value::Null);
        assert_eq!(
            fields[SYNCED_AT_FIELD],
            serde_json::json!("2026-03-01T09:00:00.000000Z")
        );
        assert_eq!(fields.len(), COLUMNS.len() + 1);
    }
}
