//! Run configuration, read once at startup from the environment and an optional YAML file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hsync_adapters::{ScrapeConfig, UNSTOP_SEARCH_URL};
use hsync_core::Status;
use hsync_storage::{CredentialError, FirestoreCredentials, HttpClientConfig, StoreError};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_INPUT_PATH: &str = "scraped_hackathons.csv";
pub const DEFAULT_COLLECTION: &str = "hackathons";
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * *";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("reading config file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("input file not found: {0}")]
    MissingInput(PathBuf),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("building store client: {0}")]
    StoreClient(#[source] StoreError),
}

/// Values accepted in the `HSYNC_CONFIG` YAML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    input_path: Option<PathBuf>,
    allowed_statuses: Option<Vec<String>>,
    stale_statuses: Option<Vec<String>>,
    collection: Option<String>,
    batch_size: Option<usize>,
    reports_dir: Option<PathBuf>,
    source_url: Option<String>,
    page_size: Option<u32>,
    max_pages: Option<u32>,
    page_delay_ms: Option<u64>,
    user_agent: Option<String>,
    http_timeout_secs: Option<u64>,
    scheduler_enabled: Option<bool>,
    sync_cron: Option<String>,
    service_account_path: Option<PathBuf>,
    project_id: Option<String>,
}

/// Raw credential inputs; resolved into [`FirestoreCredentials`] on demand.
#[derive(Clone, Default)]
pub struct StoreSettings {
    pub emulator_host: Option<String>,
    pub project_id: Option<String>,
    pub inline_secret: Option<String>,
    pub service_account_path: Option<PathBuf>,
}

impl fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSettings")
            .field("emulator_host", &self.emulator_host)
            .field("project_id", &self.project_id)
            .field("inline_secret", &self.inline_secret.as_ref().map(|_| "<redacted>"))
            .field("service_account_path", &self.service_account_path)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub input_path: PathBuf,
    pub allowed_statuses: Vec<Status>,
    pub stale_statuses: Vec<Status>,
    pub collection: String,
    pub batch_size: usize,
    pub reports_dir: Option<PathBuf>,
    pub source_url: String,
    pub page_size: u32,
    pub max_pages: u32,
    pub page_delay: Duration,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub store: StoreSettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from(DEFAULT_INPUT_PATH),
            allowed_statuses: vec![Status::Open, Status::Recent],
            stale_statuses: vec![Status::Expired],
            collection: DEFAULT_COLLECTION.to_string(),
            batch_size: hsync_storage::MAX_BATCH_OPS,
            reports_dir: None,
            source_url: UNSTOP_SEARCH_URL.to_string(),
            page_size: 30,
            max_pages: 20,
            page_delay: Duration::from_millis(1000),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 20,
            scheduler_enabled: false,
            sync_cron: DEFAULT_SYNC_CRON.to_string(),
            store: StoreSettings::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. `HSYNC_CONFIG` names an optional
    /// YAML file whose values sit beneath the variables themselves.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let file = match var("HSYNC_CONFIG") {
            Some(path) => load_file(Path::new(&path))?,
            None => FileConfig::default(),
        };
        let defaults = Self::default();

        let input_path = var("HSYNC_INPUT_PATH")
            .map(PathBuf::from)
            .or(file.input_path)
            .unwrap_or(defaults.input_path);
        let allowed_statuses = var("HSYNC_ALLOWED_STATUSES")
            .map(|v| parse_statuses(&v))
            .or_else(|| file.allowed_statuses.map(|v| parse_status_list(&v)))
            .unwrap_or(defaults.allowed_statuses);
        let stale_statuses = var("HSYNC_STALE_STATUSES")
            .map(|v| parse_statuses(&v))
            .or_else(|| file.stale_statuses.map(|v| parse_status_list(&v)))
            .unwrap_or(defaults.stale_statuses);
        let collection = var("HSYNC_COLLECTION")
            .or(file.collection)
            .unwrap_or(defaults.collection);
        let batch_size = parse_var(&var, "HSYNC_BATCH_SIZE")?
            .or(file.batch_size)
            .unwrap_or(defaults.batch_size)
            .clamp(1, hsync_storage::MAX_BATCH_OPS);
        let reports_dir = var("HSYNC_REPORTS_DIR").map(PathBuf::from).or(file.reports_dir);
        let source_url = var("HSYNC_SOURCE_URL")
            .or(file.source_url)
            .unwrap_or(defaults.source_url);
        let page_size = parse_var(&var, "HSYNC_PAGE_SIZE")?
            .or(file.page_size)
            .unwrap_or(defaults.page_size);
        let max_pages = parse_var(&var, "HSYNC_MAX_PAGES")?
            .or(file.max_pages)
            .unwrap_or(defaults.max_pages);
        let page_delay = parse_var(&var, "HSYNC_PAGE_DELAY_MS")?
            .or(file.page_delay_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.page_delay);
        let user_agent = var("HSYNC_USER_AGENT")
            .or(file.user_agent)
            .unwrap_or(defaults.user_agent);
        let http_timeout_secs = parse_var(&var, "HSYNC_HTTP_TIMEOUT_SECS")?
            .or(file.http_timeout_secs)
            .unwrap_or(defaults.http_timeout_secs);
        let scheduler_enabled = var("HSYNC_SCHEDULER_ENABLED")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
            .or(file.scheduler_enabled)
            .unwrap_or(defaults.scheduler_enabled);
        let sync_cron = var("HSYNC_SYNC_CRON")
            .or(file.sync_cron)
            .unwrap_or(defaults.sync_cron);

        if page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "HSYNC_PAGE_SIZE",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let store = StoreSettings {
            emulator_host: var("FIRESTORE_EMULATOR_HOST"),
            project_id: var("FIREBASE_PROJECT_ID").or(file.project_id),
            inline_secret: var("FIREBASE_SECRET"),
            service_account_path: var("FIREBASE_SERVICE_ACCOUNT_PATH")
                .map(PathBuf::from)
                .or(file.service_account_path),
        };

        Ok(Self {
            input_path,
            allowed_statuses,
            stale_statuses,
            collection,
            batch_size,
            reports_dir,
            source_url,
            page_size,
            max_pages,
            page_delay,
            user_agent,
            http_timeout_secs,
            scheduler_enabled,
            sync_cron,
            store,
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout(),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn scrape_config(&self) -> ScrapeConfig {
        ScrapeConfig {
            statuses: Status::scraped().to_vec(),
            page_size: self.page_size,
            max_pages: self.max_pages,
            page_delay: self.page_delay,
        }
    }

    pub fn credentials(&self) -> Result<FirestoreCredentials, ConfigError> {
        Ok(FirestoreCredentials::resolve(
            self.store.emulator_host.as_deref(),
            self.store.project_id.as_deref(),
            self.store.inline_secret.as_deref(),
            self.store.service_account_path.as_deref(),
        )?)
    }

    /// The interchange file must exist before any remote work starts.
    pub fn require_input(&self) -> Result<(), ConfigError> {
        if self.input_path.is_file() {
            Ok(())
        } else {
            Err(ConfigError::MissingInput(self.input_path.clone()))
        }
    }
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::File {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    var(key)
        .map(|value| {
            value.trim().parse::<T>().map_err(|err| ConfigError::Invalid {
                key,
                reason: err.to_string(),
                value,
            })
        })
        .transpose()
}

/// Comma-separated status list; blank segments and repeats are dropped.
pub fn parse_statuses(raw: &str) -> Vec<Status> {
    unique_statuses(raw.split(','))
}

fn parse_status_list(raw: &[String]) -> Vec<Status> {
    unique_statuses(raw.iter().map(String::as_str))
}

fn unique_statuses<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<Status> {
    let mut out = Vec::new();
    for status in raw.map(str::trim).filter(|s| !s.is_empty()).map(Status::parse) {
        if !out.contains(&status) {
            out.push(status);
        }
    }
    out
}
