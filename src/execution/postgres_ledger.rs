use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::adapters::postgres::PostgresStore;
use crate::domain::{ExecutionReceipt, ExecutionStatus, LedgerEntry, ProposalId};
use crate::error::{GovError, Result};
use crate::execution::ledger::{ExecutionLedger, LedgerStats, RecoveryReport};

/// Execution ledger persisted in PostgreSQL
///
/// Survives restarts, so a restarted agent never resubmits a proposal it
/// already saw executed.
///
/// # How claims work
/// 1. `INSERT ... ON CONFLICT DO UPDATE ... WHERE` either creates the row as
///    `attempted` or flips a `failed` row from an older sweep generation
/// 2. `RETURNING` yields a row only when this caller won the claim
/// 3. Anything else (row in flight, executed, failed this generation) returns
///    nothing and the caller backs off
pub struct PostgresLedger {
    store: PostgresStore,
}

impl PostgresLedger {
    pub fn new(store: PostgresStore) -> Self {
        Self { store }
    }

    fn row_to_entry(row: &PgRow) -> Result<(ProposalId, LedgerEntry)> {
        let proposal_id: String = row.try_get("proposal_id")?;
        let status: String = row.try_get("status")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

        let status = status_from_columns(
            &proposal_id,
            &status,
            row.try_get("tx_hash")?,
            row.try_get("block_number")?,
            row.try_get("failure_reason")?,
            row.try_get("failed_sweep")?,
        )?;

        Ok((
            ProposalId::new(proposal_id),
            LedgerEntry { status, updated_at },
        ))
    }
}

/// Map the `status` column and its companion columns back to a status
fn status_from_columns(
    proposal_id: &str,
    status: &str,
    tx_hash: Option<String>,
    block_number: Option<i64>,
    failure_reason: Option<String>,
    failed_sweep: Option<i64>,
) -> Result<ExecutionStatus> {
    match status {
        "attempted" => Ok(ExecutionStatus::Attempted),
        "executed" => Ok(ExecutionStatus::Executed {
            receipt: ExecutionReceipt::new(
                tx_hash.unwrap_or_default(),
                block_number.and_then(|b| u64::try_from(b).ok()),
            ),
        }),
        "failed" => Ok(ExecutionStatus::Failed {
            reason: failure_reason.unwrap_or_default(),
            sweep: failed_sweep.unwrap_or(0).max(0) as u64,
        }),
        other => Err(GovError::Internal(format!(
            "unknown execution status '{}' for proposal {}",
            other, proposal_id
        ))),
    }
}

fn to_db_generation(sweep: u64) -> i64 {
    i64::try_from(sweep).unwrap_or(i64::MAX)
}

#[async_trait]
impl ExecutionLedger for PostgresLedger {
    async fn has_executed(&self, id: &ProposalId) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS found
            FROM proposal_executions
            WHERE proposal_id = $1 AND status = 'executed'
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(self.store.pool())
        .await?;

        Ok(row.is_some())
    }

    async fn mark_attempted(&self, id: &ProposalId, sweep: u64) -> Result<bool> {
        let claimed = sqlx::query(
            r#"
            INSERT INTO proposal_executions (proposal_id, status, updated_at)
            VALUES ($1, 'attempted', NOW())
            ON CONFLICT (proposal_id) DO UPDATE
                SET status = 'attempted',
                    failure_reason = NULL,
                    failed_sweep = NULL,
                    updated_at = NOW()
                WHERE proposal_executions.status = 'failed'
                  AND proposal_executions.failed_sweep < $2
            RETURNING proposal_id
            "#,
        )
        .bind(id.as_str())
        .bind(to_db_generation(sweep))
        .fetch_optional(self.store.pool())
        .await?;

        if claimed.is_some() {
            debug!("Claimed proposal {} (sweep {})", id, sweep);
        } else {
            debug!("Claim refused for proposal {} (sweep {})", id, sweep);
        }
        Ok(claimed.is_some())
    }

    async fn mark_executed(&self, id: &ProposalId, receipt: &ExecutionReceipt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO proposal_executions (proposal_id, status, tx_hash, block_number, updated_at)
            VALUES ($1, 'executed', $2, $3, NOW())
            ON CONFLICT (proposal_id) DO UPDATE
                SET status = 'executed',
                    tx_hash = EXCLUDED.tx_hash,
                    block_number = EXCLUDED.block_number,
                    failure_reason = NULL,
                    failed_sweep = NULL,
                    updated_at = NOW()
            "#,
        )
        .bind(id.as_str())
        .bind(&receipt.tx_hash)
        .bind(receipt.block_number.map(|b| b as i64))
        .execute(self.store.pool())
        .await?;

        debug!("Recorded proposal {} as executed ({})", id, receipt.tx_hash);
        Ok(())
    }

    async fn mark_failed(&self, id: &ProposalId, reason: &str, sweep: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO proposal_executions (proposal_id, status, failure_reason, failed_sweep, updated_at)
            VALUES ($1, 'failed', $2, $3, NOW())
            ON CONFLICT (proposal_id) DO UPDATE
                SET status = 'failed',
                    failure_reason = EXCLUDED.failure_reason,
                    failed_sweep = EXCLUDED.failed_sweep,
                    updated_at = NOW()
                WHERE proposal_executions.status <> 'executed'
            "#,
        )
        .bind(id.as_str())
        .bind(reason)
        .bind(to_db_generation(sweep))
        .execute(self.store.pool())
        .await?;

        Ok(())
    }

    async fn release(&self, id: &ProposalId) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM proposal_executions
            WHERE proposal_id = $1 AND status = 'attempted'
            "#,
        )
        .bind(id.as_str())
        .execute(self.store.pool())
        .await?;

        Ok(())
    }

    async fn entry(&self, id: &ProposalId) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(
            r#"
            SELECT proposal_id, status, tx_hash, block_number, failure_reason, failed_sweep, updated_at
            FROM proposal_executions
            WHERE proposal_id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(self.store.pool())
        .await?;

        row.as_ref()
            .map(Self::row_to_entry)
            .transpose()
            .map(|found| found.map(|(_, entry)| entry))
    }

    async fn snapshot(&self) -> Result<Vec<(ProposalId, LedgerEntry)>> {
        let rows = sqlx::query(
            r#"
            SELECT proposal_id, status, tx_hash, block_number, failure_reason, failed_sweep, updated_at
            FROM proposal_executions
            ORDER BY proposal_id
            "#,
        )
        .fetch_all(self.store.pool())
        .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'executed') AS executed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'attempted') AS in_flight
            FROM proposal_executions
            "#,
        )
        .fetch_one(self.store.pool())
        .await?;

        let executed: i64 = row.try_get("executed")?;
        let failed: i64 = row.try_get("failed")?;
        let in_flight: i64 = row.try_get("in_flight")?;

        Ok(LedgerStats {
            executed: executed.max(0) as u64,
            failed: failed.max(0) as u64,
            in_flight: in_flight.max(0) as u64,
        })
    }

    async fn recover(&self) -> Result<RecoveryReport> {
        let released = sqlx::query(
            r#"
            DELETE FROM proposal_executions
            WHERE status = 'attempted'
            RETURNING proposal_id
            "#,
        )
        .fetch_all(self.store.pool())
        .await?;

        let released_in_flight = released
            .iter()
            .map(|row| row.try_get::<String, _>("proposal_id").map(ProposalId::new))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for id in &released_in_flight {
            warn!(
                proposal_id = %id,
                "Execution outcome unknown after restart; claim released for re-evaluation"
            );
        }

        // Sweep generations restart at zero; make earlier failures eligible
        // for the first sweep of this run.
        let reset = sqlx::query(
            r#"
            UPDATE proposal_executions
            SET failed_sweep = 0
            WHERE status = 'failed'
            "#,
        )
        .execute(self.store.pool())
        .await?;

        let report = RecoveryReport {
            released_in_flight,
            reset_failed: reset.rows_affected(),
        };

        info!(
            "Execution ledger recovered ({} in-flight released, {} failed reset)",
            report.released_in_flight.len(),
            report.reset_failed
        );
        Ok(report)
    }

    async fn flush(&self) -> Result<()> {
        self.store.close().await;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_generation_fits_bigint() {
        assert_eq!(to_db_generation(5), 5);
        assert_eq!(to_db_generation(u64::MAX), i64::MAX);
    }

    #[test]
    fn status_columns_map_to_status() {
        assert_eq!(
            status_from_columns("1", "attempted", None, None, None, None).unwrap(),
            ExecutionStatus::Attempted
        );
        assert_eq!(
            status_from_columns("2", "executed", Some("0xabc".into()), Some(42), None, None)
                .unwrap(),
            ExecutionStatus::Executed {
                receipt: ExecutionReceipt::new("0xabc", Some(42))
            }
        );
        assert_eq!(
            status_from_columns("3", "failed", None, None, Some("not ready".into()), Some(7))
                .unwrap(),
            ExecutionStatus::Failed {
                reason: "not ready".to_string(),
                sweep: 7
            }
        );
    }

    #[test]
    fn status_columns_tolerate_missing_and_negative_values() {
        assert_eq!(
            status_from_columns("4", "executed", None, Some(-1), None, None).unwrap(),
            ExecutionStatus::Executed {
                receipt: ExecutionReceipt::new("", None)
            }
        );
        assert_eq!(
            status_from_columns("5", "failed", None, None, None, Some(-3)).unwrap(),
            ExecutionStatus::Failed {
                reason: String::new(),
                sweep: 0
            }
        );
    }

    #[test]
    fn unknown_status_is_an_error() {
        let err = status_from_columns("6", "pending", None, None, None, None).unwrap_err();
        assert!(err.to_string().contains("unknown execution status 'pending'"));
    }

    // Database-backed tests. Run with:
    // GOVWATCH_TEST_DATABASE_URL=postgresql://localhost/govwatch_test cargo test -- --ignored

    async fn test_ledger() -> PostgresLedger {
        let url = std::env::var("GOVWATCH_TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/govwatch_test".to_string());
        let store = PostgresStore::new(&url, 5).await.unwrap();
        store.migrate().await.unwrap();
        PostgresLedger::new(store)
    }

    fn unique_id() -> ProposalId {
        ProposalId::new(uuid::Uuid::new_v4().to_string())
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_claim_contract() {
        let ledger = test_ledger().await;
        let id = unique_id();

        assert!(ledger.mark_attempted(&id, 1).await.unwrap());
        assert!(!ledger.mark_attempted(&id, 1).await.unwrap(), "claim is exclusive");

        ledger.mark_failed(&id, "reverted", 1).await.unwrap();
        assert!(!ledger.mark_attempted(&id, 1).await.unwrap(), "same generation");
        assert!(ledger.mark_attempted(&id, 2).await.unwrap(), "next generation");

        ledger.release(&id).await.unwrap();
        assert!(ledger.entry(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_executed_is_final() {
        let ledger = test_ledger().await;
        let id = unique_id();
        let receipt = ExecutionReceipt::new("0xfeed", Some(9));

        assert!(ledger.mark_attempted(&id, 1).await.unwrap());
        ledger.mark_executed(&id, &receipt).await.unwrap();
        ledger.mark_failed(&id, "late rejection", 5).await.unwrap();
        ledger.release(&id).await.unwrap();

        assert!(ledger.has_executed(&id).await.unwrap());
        assert!(!ledger.mark_attempted(&id, 99).await.unwrap());
        assert_eq!(
            ledger.entry(&id).await.unwrap().unwrap().status,
            ExecutionStatus::Executed { receipt }
        );
    }
}
