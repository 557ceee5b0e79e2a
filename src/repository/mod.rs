// src/repository/mod.rs
//! Storage port. The engine never opens its own connections; callers hand it
//! something implementing [`ProductRepository`].

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryRepository, InjectedFault};
pub use postgres::PgProductRepository;

use async_trait::async_trait;
use std::collections::HashSet;

use crate::errors::StorageError;
use crate::models::cluster::{MergeDecision, RejectedGroup};
use crate::models::product::ProductRecord;

/// Page size used by the default `reload_records` scan.
const RELOAD_SCAN_PAGE: usize = 500;

/// Result of an optimistic merge write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The precondition failed: survivor or a merged record is no longer unmerged.
    Conflict,
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    /// Records in a stable order (by id). A page shorter than `limit` ends the scan.
    async fn read_batch(&self, offset: usize, limit: usize) -> Result<Vec<ProductRecord>, StorageError>;

    /// Applies a decision atomically, only if every record in it is still unmerged.
    async fn write_merge(&self, decision: &MergeDecision) -> Result<WriteOutcome, StorageError>;

    /// Current state of the given records. Unknown ids are left out.
    async fn reload_records(&self, ids: &[String]) -> Result<Vec<ProductRecord>, StorageError> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut found = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.read_batch(offset, RELOAD_SCAN_PAGE).await?;
            let len = page.len();
            found.extend(page.into_iter().filter(|r| wanted.contains(r.id.as_str())));
            if len < RELOAD_SCAN_PAGE || found.len() == wanted.len() {
                break;
            }
            offset += len;
        }
        Ok(found)
    }

    async fn record_rejection(&self, _group: &RejectedGroup) -> Result<(), StorageError> {
        Ok(())
    }

    async fn load_rejections(&self) -> Result<Vec<RejectedGroup>, StorageError> {
        Ok(Vec::new())
    }
}
