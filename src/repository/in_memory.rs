// src/repository/in_memory.rs

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::errors::StorageError;
use crate::models::cluster::{MergeDecision, RejectedGroup};
use crate::models::product::ProductRecord;
use crate::repository::{ProductRepository, WriteOutcome};

/// Failure to inject into the next `write_merge` call.
#[derive(Debug, Clone, PartialEq)]
pub enum InjectedFault {
    Transient(String),
    Permanent(String),
    /// Another writer merges `record_id` into `merged_into` just before the
    /// write, so the precondition sees stale state.
    ConcurrentMerge { record_id: String, merged_into: String },
}

/// Catalog held in memory, ordered by id. Backs `--catalog-file` runs and
/// doubles as the test store.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    records: Mutex<BTreeMap<String, ProductRecord>>,
    decisions: Mutex<Vec<MergeDecision>>,
    rejections: Mutex<Vec<RejectedGroup>>,
    faults: Mutex<VecDeque<InjectedFault>>,
    write_attempts: AtomicUsize,
}

impl InMemoryRepository {
    pub fn new(records: Vec<ProductRecord>) -> Self {
        Self {
            records: Mutex::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
            ..Self::default()
        }
    }

    /// Loads a JSON array of product records.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file {}", path.display()))?;
        let records: Vec<ProductRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse catalog file {}", path.display()))?;
        info!("Loaded {} records from {}", records.len(), path.display());
        Ok(Self::new(records))
    }

    pub async fn save_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let records = self.snapshot().await;
        let json = serde_json::to_string_pretty(&records).context("Failed to serialize catalog")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write catalog file {}", path.display()))?;
        info!("Wrote {} records to {}", records.len(), path.display());
        Ok(())
    }

    pub async fn inject_fault(&self, fault: InjectedFault) {
        self.faults.lock().await.push_back(fault);
    }

    pub async fn snapshot(&self) -> Vec<ProductRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<ProductRecord> {
        self.records.lock().await.get(id).cloned()
    }

    pub async fn decisions(&self) -> Vec<MergeDecision> {
        self.decisions.lock().await.clone()
    }

    pub async fn rejections(&self) -> Vec<RejectedGroup> {
        self.rejections.lock().await.clone()
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProductRepository for InMemoryRepository {
    async fn read_batch(&self, offset: usize, limit: usize) -> Result<Vec<ProductRecord>, StorageError> {
        let records = self.records.lock().await;
        Ok(records.values().skip(offset).take(limit).cloned().collect())
    }

    async fn write_merge(&self, decision: &MergeDecision) -> Result<WriteOutcome, StorageError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.lock().await;

        match self.faults.lock().await.pop_front() {
            Some(InjectedFault::Transient(msg)) => return Err(StorageError::transient(msg)),
            Some(InjectedFault::Permanent(msg)) => return Err(StorageError::permanent(msg)),
            Some(InjectedFault::ConcurrentMerge { record_id, merged_into }) => {
                if let Some(record) = records.get_mut(&record_id) {
                    record.merged_into = Some(merged_into);
                }
            }
            None => {}
        }

        for id in decision.all_ids() {
            match records.get(&id) {
                None => return Err(StorageError::permanent(format!("unknown record {}", id))),
                Some(record) if record.is_merged() => {
                    debug!("Merge precondition failed: {} already merged", id);
                    return Ok(WriteOutcome::Conflict);
                }
                Some(_) => {}
            }
        }

        for id in &decision.merged_ids {
            if let Some(record) = records.get_mut(id) {
                record.merged_into = Some(decision.survivor_id.clone());
            }
        }
        if let Some(survivor) = records.get_mut(&decision.survivor_id) {
            survivor.normalized_name = Some(decision.survivor_update.normalized_name.clone());
            survivor.unit_token = decision.survivor_update.unit_token.clone();
            survivor.price_group_token = decision.survivor_update.price_group_token.clone();
        }
        drop(records);

        self.decisions.lock().await.push(decision.clone());
        Ok(WriteOutcome::Applied)
    }

    async fn reload_records(&self, ids: &[String]) -> Result<Vec<ProductRecord>, StorageError> {
        let records = self.records.lock().await;
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    async fn record_rejection(&self, group: &RejectedGroup) -> Result<(), StorageError> {
        let mut rejections = self.rejections.lock().await;
        rejections.retain(|g| g.cluster_id != group.cluster_id);
        rejections.push(group.clone());
        Ok(())
    }

    async fn load_rejections(&self) -> Result<Vec<RejectedGroup>, StorageError> {
        Ok(self.rejections.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cluster::SurvivorUpdate;
    use chrono::Utc;

    fn decision(survivor: &str, merged: &[&str]) -> MergeDecision {
        MergeDecision {
            cluster_id: "cl-test".to_string(),
            survivor_id: survivor.to_string(),
            merged_ids: merged.iter().map(|s| s.to_string()).collect(),
            canonical_name: "tiger lon 330ml".to_string(),
            confidence: 0.93,
            dry_run: false,
            forced: false,
            executed_at: Utc::now(),
            survivor_update: SurvivorUpdate {
                normalized_name: "tiger lon 330ml".to_string(),
                unit_token: Some("ml".to_string()),
                price_group_token: None,
            },
        }
    }

    fn repo() -> InMemoryRepository {
        InMemoryRepository::new(vec![
            ProductRecord::new("b", "Tiger lon 330ml", "feed-2"),
            ProductRecord::new("a", "Tiger 330ml", "feed-1"),
            ProductRecord::new("c", "Tiger chai 330ml", "feed-1"),
        ])
    }

    #[tokio::test]
    async fn test_read_batch_orders_by_id() {
        let repo = repo();
        let first = repo.read_batch(0, 2).await.unwrap();
        let ids: Vec<&str> = first.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(repo.read_batch(2, 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_merge_applies_then_conflicts_on_replay() {
        let repo = repo();
        let d = decision("b", &["a"]);
        assert_eq!(repo.write_merge(&d).await.unwrap(), WriteOutcome::Applied);
        let a = repo.get("a").await.unwrap();
        assert_eq!(a.merged_into.as_deref(), Some("b"));
        let b = repo.get("b").await.unwrap();
        assert_eq!(b.normalized_name.as_deref(), Some("tiger lon 330ml"));
        assert_eq!(b.unit_token.as_deref(), Some("ml"));

        assert_eq!(repo.write_merge(&d).await.unwrap(), WriteOutcome::Conflict);
        assert_eq!(repo.decisions().await.len(), 1);
        assert_eq!(repo.write_attempts(), 2);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let repo = repo();
        repo.inject_fault(InjectedFault::Transient("timeout".into())).await;
        repo.inject_fault(InjectedFault::ConcurrentMerge {
            record_id: "c".into(),
            merged_into: "x".into(),
        })
        .await;
        let d = decision("b", &["a", "c"]);
        assert!(repo.write_merge(&d).await.unwrap_err().is_transient());
        assert_eq!(repo.write_merge(&d).await.unwrap(), WriteOutcome::Conflict);
        assert_eq!(repo.write_merge(&decision("b", &["a"])).await.unwrap(), WriteOutcome::Applied);

        let missing = repo.write_merge(&decision("b", &["zzz"])).await.unwrap_err();
        assert!(!missing.is_transient());
    }

    #[tokio::test]
    async fn test_rejections_upsert_by_cluster() {
        let repo = repo();
        let mut group = RejectedGroup {
            cluster_id: "cl-1".to_string(),
            member_ids: vec!["a".to_string(), "c".to_string()],
            confidence: 0.4,
            rejected_at: Utc::now(),
        };
        repo.record_rejection(&group).await.unwrap();
        group.confidence = 0.5;
        repo.record_rejection(&group).await.unwrap();
        let stored = repo.load_rejections().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].confidence, 0.5);
    }

    #[tokio::test]
    async fn test_json_file_round_trip() {
        let path = std::env::temp_dir().join(format!("dedupe-catalog-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"[{"id":"p1","raw_name":"Pepsi 330ml","source_id":"feed","price":10000.0}]"#,
        )
        .unwrap();
        let repo = InMemoryRepository::from_json_file(&path).unwrap();
        assert_eq!(repo.snapshot().await[0].price, Some(10000.0));
        repo.save_json_file(&path).await.unwrap();
        let reloaded = InMemoryRepository::from_json_file(&path).unwrap();
        assert_eq!(reloaded.snapshot().await, repo.snapshot().await);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_save_into_missing_directory_names_the_path() {
        let dir = std::env::temp_dir().join(format!("dedupe-missing-{}", uuid::Uuid::new_v4()));
        let path = dir.join("catalog.json");
        let repo = InMemoryRepository::new(vec![ProductRecord::new("p1", "Pepsi 330ml", "feed")]);
        let err = repo.save_json_file(&path).await.unwrap_err();
        assert!(err.to_string().contains("catalog.json"));
        assert!(!dir.exists());
    }
}
