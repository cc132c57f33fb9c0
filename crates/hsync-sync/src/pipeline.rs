use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hsync_adapters::{scrape_all, ScrapeReport, UnstopAdapter};
use hsync_core::HackathonRecord;
use hsync_storage::{DocumentStore, HttpFetcher, InterchangeFile};
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::dedup::dedup;
use crate::engine::{SyncEngine, UpsertReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scrape,
    PurgeStale,
    LoadInput,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Scrape => "scrape",
            Stage::PurgeStale => "purge_stale",
            Stage::LoadInput => "load_input",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    NothingToUpload,
    Aborted { stage: Stage, reason: String },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => f.write_str("completed"),
            RunOutcome::NothingToUpload => f.write_str("nothing to upload"),
            RunOutcome::Aborted { stage, reason } => write!(f, "aborted at {stage}: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub collection: String,
    pub outcome: RunOutcome,
    pub scraped: Option<usize>,
    pub initial_count: Option<usize>,
    pub stale_deleted: usize,
    pub loaded: usize,
    pub eligible: usize,
    pub duplicates_removed: usize,
    pub status_distribution: BTreeMap<String, usize>,
    pub upsert: UpsertReport,
    pub final_count: Option<usize>,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    fn start(run_id: Uuid, collection: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            collection: collection.to_string(),
            outcome: RunOutcome::Completed,
            scraped: None,
            initial_count: None,
            stale_deleted: 0,
            loaded: 0,
            eligible: 0,
            duplicates_removed: 0,
            status_distribution: BTreeMap::new(),
            upsert: UpsertReport::default(),
            final_count: None,
            reports_dir: None,
        }
    }
}

/// Render an optional count, with `unavailable` for `None`.
pub fn display_count(count: Option<usize>) -> String {
    count.map_or_else(|| "unavailable".to_string(), |c| c.to_string())
}

/// Scrape every source status and replace `output` with the flattened rows.
pub async fn scrape_to_file(config: &SyncConfig, output: &Path) -> Result<ScrapeReport> {
    let http = HttpFetcher::new(config.http_client_config())?;
    let adapter = UnstopAdapter::new(config.source_url.clone());
    let (records, report) = scrape_all(&adapter, &http, &config.scrape_config()).await;
    InterchangeFile::new(output)
        .write_records(&records)
        .with_context(|| format!("writing scraped rows to {}", output.display()))?;
    Ok(report)
}

/// One sync run: purge stale documents, load and filter the interchange file,
/// dedup, then upsert. Stage failures end the run and are recorded in the summary.
pub struct SyncPipeline {
    config: SyncConfig,
    engine: SyncEngine,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn DocumentStore>) -> Self {
        let engine = SyncEngine::new(store).with_batch_size(config.batch_size);
        Self { config, engine }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub async fn run_once(&self) -> RunSummary {
        self.run(false).await
    }

    /// Refresh the interchange file from the source, then sync it.
    pub async fn run_with_scrape(&self) -> RunSummary {
        self.run(true).await
    }

    async fn run(&self, scrape_first: bool) -> RunSummary {
        let run_id = Uuid::new_v4();
        let collection = self.engine.store().collection().to_string();
        let span = info_span!("sync_run", %run_id, %collection);
        async move {
            let mut summary = RunSummary::start(run_id, &collection);
            let outcome = self.stages(scrape_first, &mut summary).await;
            summary.outcome = outcome;
            if let RunOutcome::Aborted { stage, reason } = &summary.outcome {
                error!(%stage, %reason, "sync run aborted");
            }
            summary.final_count = self.engine.count().await;
            summary.finished_at = Utc::now();

            if let Some(root) = &self.config.reports_dir {
                let dir = root.join(run_id.to_string());
                summary.reports_dir = Some(dir.display().to_string());
                if let Err(err) = write_reports(&dir, &summary).await {
                    warn!(error = %err, "writing run reports failed");
                    summary.reports_dir = None;
                }
            }

            info!(
                outcome = %summary.outcome,
                total = summary.upsert.total,
                created = summary.upsert.created,
                updated = summary.upsert.updated,
                errors = summary.upsert.failed,
                final_count = %display_count(summary.final_count),
                "sync run finished"
            );
            summary
        }
        .instrument(span)
        .await
    }

    async fn stages(&self, scrape_first: bool, summary: &mut RunSummary) -> RunOutcome {
        if scrape_first {
            match scrape_to_file(&self.config, &self.config.input_path).await {
                Ok(report) => summary.scraped = Some(report.total_records),
                Err(err) => return aborted(Stage::Scrape, format!("{err:#}")),
            }
        }

        summary.initial_count = self.engine.count().await;
        info!(count = %display_count(summary.initial_count), "documents before sync");

        if !self.config.stale_statuses.is_empty() {
            match self.engine.delete_by_status(&self.config.stale_statuses).await {
                Ok(deleted) => summary.stale_deleted = deleted,
                Err(err) => {
                    summary.stale_deleted = err.deleted();
                    return aborted(Stage::PurgeStale, err.to_string());
                }
            }
        }

        let loaded = match InterchangeFile::new(&self.config.input_path).read_records() {
            Ok(records) => records,
            Err(err) => return aborted(Stage::LoadInput, err.to_string()),
        };
        summary.loaded = loaded.len();

        let allowed = &self.config.allowed_statuses;
        let eligible = loaded
            .into_iter()
            .map(HackathonRecord::normalized)
            .filter(|record| record.status.as_ref().is_some_and(|s| allowed.contains(s)))
            .collect::<Vec<_>>();
        summary.eligible = eligible.len();
        if eligible.is_empty() {
            info!(loaded = summary.loaded, "no records with an allowed status");
            return RunOutcome::NothingToUpload;
        }

        let deduped = dedup(eligible);
        summary.duplicates_removed = deduped.removed;
        summary.status_distribution = deduped.status_distribution();
        info!(
            unique = deduped.len(),
            removed = deduped.removed,
            distribution = ?summary.status_distribution,
            "deduplicated records"
        );

        summary.upsert = self.engine.upsert_all(&deduped.records).await;
        RunOutcome::Completed
    }

    /// A scheduler running [`Self::run_with_scrape`] on the configured cron, when enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.as_str();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                info!("scheduled sync triggered");
                let summary = pipeline.run_with_scrape().await;
                info!(run_id = %summary.run_id, outcome = %summary.outcome, "scheduled sync done");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

fn aborted(stage: Stage, reason: String) -> RunOutcome {
    RunOutcome::Aborted { stage, reason }
}

async fn write_reports(dir: &Path, summary: &RunSummary) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(dir.join("sync_brief.md"), render_brief(summary))
        .await
        .context("writing sync_brief.md")?;
    Ok(())
}

pub fn render_brief(summary: &RunSummary) -> String {
    let distribution = if summary.status_distribution.is_empty() {
        "- (none)".to_string()
    } else {
        summary
            .status_distribution
            .iter()
            .map(|(status, count)| format!("- {status}: {count}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "# Hackathon Sync Brief\n\n\
         - Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Collection: {}\n- Outcome: {}\n\
         - Documents before: {}\n- Stale deleted: {}\n- Loaded rows: {}\n- Eligible rows: {}\n\
         - Duplicates removed: {}\n- Documents after: {}\n\n\
         ## Upsert\n- Total: {}\n- Created: {}\n- Updated: {}\n- Errors: {}\n\n\
         ## Status Counts\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.collection,
        summary.outcome,
        display_count(summary.initial_count),
        summary.stale_deleted,
        summary.loaded,
        summary.eligible,
        summary.duplicates_removed,
        display_count(summary.final_count),
        summary.upsert.total,
        summary.upsert.created,
        summary.upsert.updated,
        summary.upsert.failed,
        distribution,
    )
}
