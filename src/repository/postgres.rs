// src/repository/postgres.rs
// PostgreSQL-backed catalog store over a bb8 pool.

use async_trait::async_trait;
use bb8::RunError;
use log::{debug, warn};
use serde_json::json;
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;

use crate::errors::StorageError;
use crate::models::cluster::{MergeDecision, RejectedGroup};
use crate::models::product::ProductRecord;
use crate::repository::{ProductRepository, WriteOutcome};
use crate::utils::db_connect::PgPool;

const SELECT_PRODUCTS: &str = "
    SELECT id, name, source_id, price, merged_into, normalized_name, unit_token, price_group_token
    FROM public.product
    ORDER BY id
    OFFSET $1 LIMIT $2";

const SELECT_PRODUCTS_BY_ID: &str = "
    SELECT id, name, source_id, price, merged_into, normalized_name, unit_token, price_group_token
    FROM public.product
    WHERE id = ANY($1)
    ORDER BY id";

const LOCK_UNMERGED: &str = "
    SELECT id FROM public.product
    WHERE id = ANY($1) AND merged_into IS NULL
    FOR UPDATE";

const MARK_MERGED: &str = "
    UPDATE public.product
    SET merged_into = $1, updated_at = NOW()
    WHERE id = ANY($2) AND merged_into IS NULL";

const UPDATE_SURVIVOR: &str = "
    UPDATE public.product
    SET normalized_name = $2, unit_token = $3, price_group_token = $4, updated_at = NOW()
    WHERE id = $1 AND merged_into IS NULL";

const INSERT_DECISION: &str = "
    INSERT INTO dedupe.merge_decision
        (cluster_id, survivor_id, merged_ids, canonical_name, confidence, forced, executed_at, details)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";

const UPSERT_REJECTION: &str = "
    INSERT INTO dedupe.rejected_group (cluster_id, member_ids, confidence, rejected_at)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (cluster_id) DO UPDATE
    SET member_ids = EXCLUDED.member_ids,
        confidence = EXCLUDED.confidence,
        rejected_at = EXCLUDED.rejected_at";

const SELECT_REJECTIONS: &str = "
    SELECT cluster_id, member_ids, confidence, rejected_at
    FROM dedupe.rejected_group
    ORDER BY cluster_id";

pub struct PgProductRepository {
    pool: PgPool,
}

impl PgProductRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// SQLSTATE classes worth retrying: serialization/deadlock, lock timeouts
/// and connection-level failures. Errors without a code come from the client
/// side (closed socket, I/O) and are retried too.
pub fn is_transient_sql_state(code: &SqlState) -> bool {
    [
        SqlState::T_R_SERIALIZATION_FAILURE,
        SqlState::T_R_DEADLOCK_DETECTED,
        SqlState::LOCK_NOT_AVAILABLE,
        SqlState::CONNECTION_EXCEPTION,
        SqlState::CONNECTION_DOES_NOT_EXIST,
        SqlState::CONNECTION_FAILURE,
        SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION,
        SqlState::ADMIN_SHUTDOWN,
        SqlState::CANNOT_CONNECT_NOW,
        SqlState::TOO_MANY_CONNECTIONS,
    ]
    .contains(code)
}

fn classify_pg_error(err: tokio_postgres::Error) -> StorageError {
    let transient = err.is_closed() || err.code().map_or(true, is_transient_sql_state);
    let message = match err.code() {
        Some(code) => format!("{} (SQLSTATE {})", err, code.code()),
        None => err.to_string(),
    };
    if transient {
        StorageError::transient(message)
    } else {
        StorageError::permanent(message)
    }
}

fn classify_pool_error(err: RunError<tokio_postgres::Error>) -> StorageError {
    match err {
        RunError::User(e) => classify_pg_error(e),
        RunError::TimedOut => StorageError::transient("timed out waiting for a pooled connection"),
    }
}

fn row_to_record(row: &Row) -> ProductRecord {
    ProductRecord {
        id: row.get("id"),
        raw_name: row.get::<_, Option<String>>("name").unwrap_or_default(),
        source_id: row.get::<_, Option<String>>("source_id").unwrap_or_default(),
        normalized_name: row.get("normalized_name"),
        unit_token: row.get("unit_token"),
        price_group_token: row.get("price_group_token"),
        price: row.get("price"),
        merged_into: row.get("merged_into"),
    }
}

#[async_trait]
impl ProductRepository for PgProductRepository {
    async fn read_batch(&self, offset: usize, limit: usize) -> Result<Vec<ProductRecord>, StorageError> {
        let conn = self.pool.get().await.map_err(classify_pool_error)?;
        let rows = conn
            .query(SELECT_PRODUCTS, &[&(offset as i64), &(limit as i64)])
            .await
            .map_err(classify_pg_error)?;
        debug!("Read {} product rows at offset {}", rows.len(), offset);
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn write_merge(&self, decision: &MergeDecision) -> Result<WriteOutcome, StorageError> {
        let mut conn = self.pool.get().await.map_err(classify_pool_error)?;
        let tx = conn.transaction().await.map_err(classify_pg_error)?;

        let all_ids = decision.all_ids();
        let locked = tx.query(LOCK_UNMERGED, &[&all_ids]).await.map_err(classify_pg_error)?;
        if locked.len() != all_ids.len() {
            debug!(
                "Cluster {}: {} of {} records still unmerged, rolling back",
                decision.cluster_id,
                locked.len(),
                all_ids.len()
            );
            tx.rollback().await.map_err(classify_pg_error)?;
            return Ok(WriteOutcome::Conflict);
        }

        let marked = tx
            .execute(MARK_MERGED, &[&decision.survivor_id, &decision.merged_ids])
            .await
            .map_err(classify_pg_error)?;
        if marked as usize != decision.merged_ids.len() {
            warn!(
                "Cluster {}: marked {} of {} records under lock, rolling back",
                decision.cluster_id,
                marked,
                decision.merged_ids.len()
            );
            tx.rollback().await.map_err(classify_pg_error)?;
            return Ok(WriteOutcome::Conflict);
        }

        let update = &decision.survivor_update;
        tx.execute(
            UPDATE_SURVIVOR,
            &[
                &decision.survivor_id,
                &update.normalized_name,
                &update.unit_token,
                &update.price_group_token,
            ],
        )
        .await
        .map_err(classify_pg_error)?;

        let details = json!({
            "dry_run": decision.dry_run,
            "survivor_update": update,
        });
        tx.execute(
            INSERT_DECISION,
            &[
                &decision.cluster_id,
                &decision.survivor_id,
                &decision.merged_ids,
                &decision.canonical_name,
                &decision.confidence,
                &decision.forced,
                &decision.executed_at,
                &details,
            ],
        )
        .await
        .map_err(classify_pg_error)?;

        tx.commit().await.map_err(classify_pg_error)?;
        Ok(WriteOutcome::Applied)
    }

    async fn reload_records(&self, ids: &[String]) -> Result<Vec<ProductRecord>, StorageError> {
        let conn = self.pool.get().await.map_err(classify_pool_error)?;
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        let rows = conn
            .query(SELECT_PRODUCTS_BY_ID, &[&ids])
            .await
            .map_err(classify_pg_error)?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn record_rejection(&self, group: &RejectedGroup) -> Result<(), StorageError> {
        let conn = self.pool.get().await.map_err(classify_pool_error)?;
        conn.execute(
            UPSERT_REJECTION,
            &[&group.cluster_id, &group.member_ids, &group.confidence, &group.rejected_at],
        )
        .await
        .map_err(classify_pg_error)?;
        Ok(())
    }

    async fn load_rejections(&self) -> Result<Vec<RejectedGroup>, StorageError> {
        let conn = self.pool.get().await.map_err(classify_pool_error)?;
        let rows = conn.query(SELECT_REJECTIONS, &[]).await.map_err(classify_pg_error)?;
        Ok(rows
            .iter()
            .map(|row| RejectedGroup {
                cluster_id: row.get("cluster_id"),
                member_ids: row.get("member_ids"),
                confidence: row.get("confidence"),
                rejected_at: row.get("rejected_at"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_state_classification() {
        assert!(is_transient_sql_state(&SqlState::T_R_SERIALIZATION_FAILURE));
        assert!(is_transient_sql_state(&SqlState::T_R_DEADLOCK_DETECTED));
        assert!(is_transient_sql_state(&SqlState::ADMIN_SHUTDOWN));
        assert!(!is_transient_sql_state(&SqlState::UNIQUE_VIOLATION));
        assert!(!is_transient_sql_state(&SqlState::UNDEFINED_TABLE));
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(classify_pool_error(RunError::TimedOut).is_transient());
    }
}
