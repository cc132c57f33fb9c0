//! Remote document store contract consumed by the sync engine.

use async_trait::async_trait;
use hsync_core::Identity;
use serde_json::{Map, Value};
use thiserror::Error;

/// Largest number of writes the store applies atomically in one commit.
pub const MAX_BATCH_OPS: usize = 500;

pub type Fields = Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("store authentication failed: {0}")]
    Auth(String),
    #[error("invalid store response: {0}")]
    Decode(String),
    #[error("value cannot be stored: {0}")]
    Encode(String),
    #[error("batch of {0} operations exceeds the commit limit of {limit}", limit = MAX_BATCH_OPS)]
    BatchTooLarge(usize),
    #[error("document {0} does not exist")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or fully overwrite the document.
    Set { id: Identity, fields: Fields },
    /// Overwrite only the provided fields of an existing document.
    Update { id: Identity, fields: Fields },
    Delete { id: Identity },
}

impl WriteOp {
    pub fn id(&self) -> &Identity {
        match self {
            WriteOp::Set { id, .. } | WriteOp::Update { id, .. } | WriteOp::Delete { id } => id,
        }
    }
}

/// Pending writes to be committed together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: Identity, fields: Fields) {
        self.ops.push(WriteOp::Set { id, fields });
    }

    pub fn update(&mut self, id: Identity, fields: Fields) {
        self.ops.push(WriteOp::Update { id, fields });
    }

    pub fn delete(&mut self, id: Identity) {
        self.ops.push(WriteOp::Delete { id });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Hand the pending writes off, leaving this batch empty.
    pub fn take(&mut self) -> WriteBatch {
        std::mem::take(self)
    }
}

/// A single keyed collection of documents.
///
/// Implementations hold their own connection state; callers construct one
/// explicitly and share it by reference.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn collection(&self) -> &str;

    async fn exists(&self, id: &Identity) -> Result<bool, StoreError>;

    /// Apply every write in `batch` atomically. Batches above [`MAX_BATCH_OPS`] are rejected.
    async fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError>;

    /// Keys of every document, or only those whose `Status` equals `status`.
    async fn list_ids(&self, status: Option<&str>) -> Result<Vec<Identity>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}
