//! Batched writes of normalized records against a [`DocumentStore`].

use std::collections::HashSet;
use std::sync::Arc;

use hsync_core::{normalize, HackathonRecord, Identity, Status};
use hsync_storage::{DocumentStore, StoreError, WriteBatch, MAX_BATCH_OPS};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("listing documents failed after {deleted} deletions: {source}")]
    Listing {
        deleted: usize,
        #[source]
        source: StoreError,
    },
    #[error("delete commit failed after {deleted} deletions: {source}")]
    DeleteCommit {
        deleted: usize,
        #[source]
        source: StoreError,
    },
}

impl SyncError {
    /// Deletions committed before the failure.
    pub fn deleted(&self) -> usize {
        match self {
            Self::Listing { deleted, .. } | Self::DeleteCommit { deleted, .. } => *deleted,
        }
    }
}

/// Result of staging one record into the pending batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub identity: String,
    pub title: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub batches: usize,
    pub failures: Vec<RecordFailure>,
}

#[derive(Debug, Default)]
struct PendingBatch {
    batch: WriteBatch,
    created: usize,
    updated: usize,
    titles: Vec<Option<String>>,
}

pub struct SyncEngine {
    store: Arc<dyn DocumentStore>,
    batch_size: usize,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            batch_size: MAX_BATCH_OPS,
        }
    }

    /// Commit size, clamped to `1..=MAX_BATCH_OPS`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_OPS);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Check whether the record's document exists, then queue an update or a full set.
    pub async fn stage_write(&self, record: &HackathonRecord, batch: &mut WriteBatch) -> WriteOutcome {
        let document = normalize(record.clone());
        let id = document.identity();
        let fields = match document.to_fields() {
            Ok(fields) => fields,
            Err(err) => return WriteOutcome::Failed(format!("cannot encode document: {err}")),
        };
        match self.store.exists(&id).await {
            Ok(true) => {
                batch.update(id, fields);
                WriteOutcome::Updated
            }
            Ok(false) => {
                batch.set(id, fields);
                WriteOutcome::Created
            }
            Err(err) => WriteOutcome::Failed(format!("existence check failed: {err}")),
        }
    }

    /// Create or update every record, committing in batches of at most `batch_size`.
    ///
    /// A failed commit counts its whole batch as failed; earlier batches stay applied.
    pub async fn upsert_all(&self, records: &[HackathonRecord]) -> UpsertReport {
        let mut report = UpsertReport {
            total: records.len(),
            ..Default::default()
        };
        let mut pending = PendingBatch::default();

        for record in records {
            match self.stage_write(record, &mut pending.batch).await {
                WriteOutcome::Created => pending.created += 1,
                WriteOutcome::Updated => pending.updated += 1,
                WriteOutcome::Failed(reason) => {
                    let identity = record.identity();
                    warn!(%identity, title = record.title.as_deref().unwrap_or_default(), %reason, "skipping record");
                    report.failed += 1;
                    report.failures.push(RecordFailure {
                        identity: identity.to_string(),
                        title: record.title.clone(),
                        reason,
                    });
                    continue;
                }
            }
            pending.titles.push(record.title.clone());
            if pending.batch.len() >= self.batch_size {
                self.flush_upserts(&mut pending, &mut report).await;
            }
        }
        if !pending.batch.is_empty() {
            self.flush_upserts(&mut pending, &mut report).await;
        }

        info!(
            collection = self.store.collection(),
            total = report.total,
            created = report.created,
            updated = report.updated,
            failed = report.failed,
            batches = report.batches,
            "upsert finished"
        );
        report
    }

    async fn flush_upserts(&self, pending: &mut PendingBatch, report: &mut UpsertReport) {
        let current = std::mem::take(pending);
        match self.store.commit(&current.batch).await {
            Ok(()) => {
                report.batches += 1;
                report.created += current.created;
                report.updated += current.updated;
                debug!(ops = current.batch.len(), "committed upsert batch");
            }
            Err(err) => {
                warn!(ops = current.batch.len(), error = %err, "upsert batch commit failed");
                report.failed += current.batch.len();
                let reason = format!("batch commit failed: {err}");
                for (op, title) in current.batch.ops().iter().zip(current.titles) {
                    report.failures.push(RecordFailure {
                        identity: op.id().to_string(),
                        title,
                        reason: reason.clone(),
                    });
                }
            }
        }
    }

    /// Delete every document whose `Status` equals one of `statuses`.
    /// Repeated statuses are listed once.
    pub async fn delete_by_status(&self, statuses: &[Status]) -> Result<usize, SyncError> {
        let mut batch = WriteBatch::new();
        let mut deleted = 0;
        let mut seen = HashSet::new();
        for status in statuses.iter().filter(|s| seen.insert(*s)) {
            let ids = self
                .store
                .list_ids(Some(status.as_str()))
                .await
                .map_err(|source| SyncError::Listing { deleted, source })?;
            info!(%status, matched = ids.len(), "deleting documents by status");
            self.queue_deletes(ids, &mut batch, &mut deleted).await?;
        }
        if !batch.is_empty() {
            self.flush_deletes(&mut batch, &mut deleted).await?;
        }
        info!(deleted, "delete by status finished");
        Ok(deleted)
    }

    /// Delete every document in the collection.
    pub async fn delete_all(&self) -> Result<usize, SyncError> {
        let mut batch = WriteBatch::new();
        let mut deleted = 0;
        let ids = self
            .store
            .list_ids(None)
            .await
            .map_err(|source| SyncError::Listing { deleted, source })?;
        info!(collection = self.store.collection(), matched = ids.len(), "deleting all documents");
        self.queue_deletes(ids, &mut batch, &mut deleted).await?;
        if !batch.is_empty() {
            self.flush_deletes(&mut batch, &mut deleted).await?;
        }
        info!(deleted, "delete all finished");
        Ok(deleted)
    }

    async fn queue_deletes(
        &self,
        ids: Vec<Identity>,
        batch: &mut WriteBatch,
        deleted: &mut usize,
    ) -> Result<(), SyncError> {
        for id in ids {
            batch.delete(id);
            if batch.len() >= self.batch_size {
                self.flush_deletes(batch, deleted).await?;
            }
        }
        Ok(())
    }

    async fn flush_deletes(&self, batch: &mut WriteBatch, deleted: &mut usize) -> Result<(), SyncError> {
        let current = batch.take();
        self.store
            .commit(&current)
            .await
            .map_err(|source| SyncError::DeleteCommit {
                deleted: *deleted,
                source,
            })?;
        *deleted += current.len();
        debug!(ops = current.len(), deleted = *deleted, "committed delete batch");
        Ok(())
    }

    /// Number of documents in the collection, or `None` when the store cannot say.
    pub async fn count(&self) -> Option<usize> {
        match self.store.count().await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(error = %err, "document count unavailable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsync_core::{SYNCED_AT_FIELD, STATUS};
    use hsync_storage::MemoryStore;
    use serde_json::{json, Map};

    fn records(n: usize) -> Vec<HackathonRecord> {
        (0..n)
            .map(|i| HackathonRecord {
                title: Some(format!("Hack {i}")),
                organisation: Some("Org".into()),
                status: Some(Status::Open),
                ..Default::default()
            })
            .collect()
    }

    fn engine(store: &Arc<MemoryStore>) -> SyncEngine {
        SyncEngine::new(store.clone())
    }

    async fn seed(store: &MemoryStore, prefix: &str, status: &str, n: usize) {
        for i in 0..n {
            let mut fields = Map::new();
            fields.insert(STATUS.into(), json!(status));
            store.insert(Identity::from_key(format!("{prefix}-{i}")), fields).await;
        }
    }

    #[tokio::test]
    async fn first_upsert_creates_second_updates() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine(&store);
        let input = records(3);

        let first = engine.upsert_all(&input).await;
        assert_eq!((first.total, first.created, first.updated, first.failed), (3, 3, 0, 0));

        let second = engine.upsert_all(&input).await;
        assert_eq!((second.total, second.created, second.updated, second.failed), (3, 0, 3, 0));
        assert_eq!(store.len().await, 3);

        let doc = store.document(&input[0].identity()).await.unwrap();
        assert_eq!(doc["Title"], json!("Hack 0"));
        assert!(doc[SYNCED_AT_FIELD].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn upsert_batches_never_exceed_limit_or_run_empty() {
        for (n, expected) in [
            (500, vec![500]),
            (501, vec![500, 1]),
            (1000, vec![500, 500]),
            (1200, vec![500, 500, 200]),
        ] {
            let store = Arc::new(MemoryStore::default());
            let report = engine(&store).upsert_all(&records(n)).await;
            assert_eq!(report.created, n);
            assert_eq!(report.batches, expected.len());
            assert_eq!(store.commit_sizes().await, expected, "n = {n}");
        }
    }

    #[tokio::test]
    async fn empty_input_commits_nothing() {
        let store = Arc::new(MemoryStore::default());
        let report = engine(&store).upsert_all(&[]).await;
        assert_eq!(report, UpsertReport::default());
        assert!(store.commit_sizes().await.is_empty());
    }

    #[tokio::test]
    async fn smaller_batch_size_is_respected_and_clamped() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine(&store).with_batch_size(2);
        engine.upsert_all(&records(5)).await;
        assert_eq!(store.commit_sizes().await, vec![2, 2, 1]);

        assert_eq!(SyncEngine::new(store.clone()).with_batch_size(0).batch_size(), 1);
        assert_eq!(SyncEngine::new(store).with_batch_size(10_000).batch_size(), MAX_BATCH_OPS);
    }

    #[tokio::test]
    async fn failed_commit_only_affects_its_batch() {
        let store = Arc::new(MemoryStore::default());
        store.fail_commit(2).await;
        let report = engine(&store).upsert_all(&records(1200)).await;

        assert_eq!(report.total, 1200);
        assert_eq!(report.created, 700);
        assert_eq!(report.failed, 500);
        assert_eq!(report.failures.len(), 500);
        assert_eq!(store.len().await, 700);
        assert_eq!(store.commit_sizes().await, vec![500, 200]);
    }

    #[tokio::test]
    async fn lookup_failure_skips_only_that_record() {
        let store = Arc::new(MemoryStore::default());
        let input = records(3);
        store.fail_lookup(&input[1].identity()).await;

        let report = engine(&store).upsert_all(&input).await;
        assert_eq!((report.created, report.failed), (2, 1));
        assert_eq!(report.failures[0].title.as_deref(), Some("Hack 1"));
        assert!(report.failures[0].reason.contains("existence check"));
    }

    #[tokio::test]
    async fn delete_by_status_spans_batches_and_spares_others() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, "old", "expired", 1200).await;
        seed(&store, "live", "open", 7).await;

        let deleted = engine(&store)
            .delete_by_status(&[Status::Expired, Status::Unknown("nonexistent".into())])
            .await
            .unwrap();
        assert_eq!(deleted, 1200);
        assert_eq!(store.commit_sizes().await, vec![500, 500, 200]);
        assert_eq!(store.len().await, 7);
    }

    #[tokio::test]
    async fn repeated_statuses_delete_each_document_once() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, "old", "expired", 3).await;
        seed(&store, "live", "open", 2).await;

        let deleted = engine(&store)
            .delete_by_status(&[Status::Expired, Status::Expired, Status::parse(" expired ")])
            .await
            .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(store.commit_sizes().await, vec![3]);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn exact_multiple_of_batch_leaves_no_trailing_commit() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, "old", "expired", 1000).await;
        let deleted = engine(&store).delete_by_status(&[Status::Expired]).await.unwrap();
        assert_eq!(deleted, 1000);
        assert_eq!(store.commit_sizes().await, vec![500, 500]);
    }

    #[tokio::test]
    async fn delete_all_empties_collection() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, "a", "open", 501).await;
        seed(&store, "b", "closed", 3).await;

        let deleted = engine(&store).delete_all().await.unwrap();
        assert_eq!(deleted, 504);
        assert!(store.is_empty().await);
        assert_eq!(store.commit_sizes().await, vec![500, 4]);

        assert_eq!(engine(&store).delete_all().await.unwrap(), 0);
        assert_eq!(store.commit_sizes().await.len(), 2);
    }

    #[tokio::test]
    async fn delete_commit_failure_reports_progress() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, "old", "expired", 1200).await;
        store.fail_commit(2).await;

        let err = engine(&store)
            .delete_by_status(&[Status::Expired])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::DeleteCommit { .. }));
        assert_eq!(err.deleted(), 500);
        assert_eq!(store.len().await, 700);
    }

    #[tokio::test]
    async fn listing_failure_is_an_error() {
        let store = Arc::new(MemoryStore::default());
        store.fail_listing().await;
        let err = engine(&store).delete_all().await.unwrap_err();
        assert!(matches!(err, SyncError::Listing { deleted: 0, .. }));
    }

    #[tokio::test]
    async fn count_reports_unavailable_instead_of_failing() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, "a", "open", 4).await;
        assert_eq!(engine(&store).count().await, Some(4));
        store.fail_count().await;
        assert_eq!(engine(&store).count().await, None);
    }
}
