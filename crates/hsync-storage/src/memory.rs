//! In-process document store used for dry runs and tests.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use hsync_core::{Identity, STATUS};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::document_store::{DocumentStore, Fields, StoreError, WriteBatch, WriteOp, MAX_BATCH_OPS};

#[derive(Debug, Default)]
struct MemoryState {
    docs: BTreeMap<String, Fields>,
    commit_sizes: Vec<usize>,
    commit_attempts: usize,
    failing_commits: HashSet<usize>,
    failing_lookups: HashSet<String>,
    listing_fails: bool,
    count_fails: bool,
}

/// Keyed collection held in memory, with the same batch semantics as the remote store.
#[derive(Debug)]
pub struct MemoryStore {
    collection: String,
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("hackathons")
    }
}

impl MemoryStore {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub async fn insert(&self, id: Identity, fields: Fields) {
        self.state.lock().await.docs.insert(id.as_str().to_string(), fields);
    }

    pub async fn document(&self, id: &Identity) -> Option<Fields> {
        self.state.lock().await.docs.get(id.as_str()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sizes of the batches committed successfully, in order.
    pub async fn commit_sizes(&self) -> Vec<usize> {
        self.state.lock().await.commit_sizes.clone()
    }

    /// Make the `nth` commit attempt (1-based) fail without applying anything.
    pub async fn fail_commit(&self, nth: usize) {
        self.state.lock().await.failing_commits.insert(nth);
    }

    pub async fn fail_lookup(&self, id: &Identity) {
        self.state
            .lock()
            .await
            .failing_lookups
            .insert(id.as_str().to_string());
    }

    pub async fn fail_listing(&self) {
        self.state.lock().await.listing_fails = true;
    }

    pub async fn fail_count(&self) {
        self.state.lock().await.count_fails = true;
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn exists(&self, id: &Identity) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        if state.failing_lookups.contains(id.as_str()) {
            return Err(StoreError::Unavailable(format!("lookup of {id} failed")));
        }
        Ok(state.docs.contains_key(id.as_str()))
    }

    async fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.len() > MAX_BATCH_OPS {
            return Err(StoreError::BatchTooLarge(batch.len()));
        }

        let mut state = self.state.lock().await;
        state.commit_attempts += 1;
        let attempt = state.commit_attempts;
        if state.failing_commits.contains(&attempt) {
            return Err(StoreError::Unavailable(format!("commit #{attempt} rejected")));
        }

        // Validate first so a bad op leaves the collection untouched.
        for op in batch.ops() {
            if let WriteOp::Update { id, .. } = op {
                if !state.docs.contains_key(id.as_str()) {
                    return Err(StoreError::NotFound(id.to_string()));
                }
            }
        }

        for op in batch.ops() {
            match op {
                WriteOp::Set { id, fields } => {
                    state.docs.insert(id.as_str().to_string(), fields.clone());
                }
                WriteOp::Update { id, fields } => {
                    if let Some(doc) = state.docs.get_mut(id.as_str()) {
                        for (key, value) in fields {
                            doc.insert(key.clone(), value.clone());
                        }
                    }
                }
                WriteOp::Delete { id } => {
                    state.docs.remove(id.as_str());
                }
            }
        }
        state.commit_sizes.push(batch.len());
        Ok(())
    }

    async fn list_ids(&self, status: Option<&str>) -> Result<Vec<Identity>, StoreError> {
        let state = self.state.lock().await;
        if state.listing_fails {
            return Err(StoreError::Unavailable("listing failed".into()));
        }
        Ok(state
            .docs
            .iter()
            .filter(|(_, fields)| match status {
                Some(wanted) => fields.get(STATUS) == Some(&Value::String(wanted.to_string())),
                None => true,
            })
            .map(|(key, _)| Identity::from_key(key.clone()))
            .collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        if state.count_fails {
            return Err(StoreError::Unavailable("count failed".into()));
        }
        Ok(state.docs.len())
    }
}
