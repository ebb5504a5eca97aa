use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info, warn};

use super::models::*;
use super::SettlementStore;
use crate::error::{AppError, AppResult, IntegrityError};

const DONATION_COLUMNS: &str = "id, event_id, org_id, donor_address, amount_wei::TEXT AS amount_wei, \
     tx_hash, block_number, created_at";

const ALLOCATION_COLUMNS: &str =
    "event_id, org_id, split_bps, source, approved_by, approved_at, tx_hash";

const PAYOUT_COLUMNS: &str = "id, event_id, org_id, amount_wei::TEXT AS amount_wei, fiat_currency, \
     fiat_amount, offramp_ref, status, tx_hash, failure_reason, created_at, updated_at";

/// Postgres-backed settlement store - THE source of truth in production
pub struct PgSettlementStore {
    pub pool: PgPool,
}

impl PgSettlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ========== ROW MAPPING ==========

    fn donation_from_row(row: &PgRow) -> AppResult<DonationRecord> {
        Ok(DonationRecord {
            id: row.try_get("id")?,
            event_id: from_db_id("event_id", row.try_get("event_id")?)?,
            org_id: from_db_id("org_id", row.try_get("org_id")?)?,
            donor_address: row.try_get("donor_address")?,
            amount_wei: parse_wei(&row.try_get::<String, _>("amount_wei")?)?,
            tx_hash: row.try_get("tx_hash")?,
            block_number: from_db_id("block_number", row.try_get("block_number")?)?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn allocation_from_row(row: &PgRow) -> AppResult<AllocationRecord> {
        let split_bps: i32 = row.try_get("split_bps")?;
        Ok(AllocationRecord {
            event_id: from_db_id("event_id", row.try_get("event_id")?)?,
            org_id: from_db_id("org_id", row.try_get("org_id")?)?,
            split_bps: u16::try_from(split_bps).map_err(|_| IntegrityError::ValueOutOfRange {
                field: "split_bps",
                value: split_bps.to_string(),
            })?,
            source: row.try_get("source")?,
            approved_by: row.try_get("approved_by")?,
            approved_at: row.try_get("approved_at")?,
            tx_hash: row.try_get("tx_hash")?,
        })
    }

    fn payout_from_row(row: &PgRow) -> AppResult<PayoutRecord> {
        Ok(PayoutRecord {
            id: row.try_get("id")?,
            event_id: from_db_id("event_id", row.try_get("event_id")?)?,
            org_id: from_db_id("org_id", row.try_get("org_id")?)?,
            amount_wei: parse_wei(&row.try_get::<String, _>("amount_wei")?)?,
            fiat_currency: row.try_get("fiat_currency")?,
            fiat_amount: row.try_get("fiat_amount")?,
            offramp_ref: row.try_get("offramp_ref")?,
            status: row.try_get("status")?,
            tx_hash: row.try_get("tx_hash")?,
            failure_reason: row.try_get("failure_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn organization_from_row(row: &PgRow) -> AppResult<Organization> {
        let method: String = row.try_get("payout_method")?;
        Ok(Organization {
            id: from_db_id("id", row.try_get("id")?)?,
            name: row.try_get("name")?,
            country: row.try_get("country")?,
            payout_method: PayoutMethod::parse(&method).ok_or(IntegrityError::ValueOutOfRange {
                field: "payout_method",
                value: method.clone(),
            })?,
            allowlisted: row.try_get("allowlisted")?,
        })
    }

    // ========== TRANSACTION-SCOPED WRITES ==========

    async fn insert_donation_in(conn: &mut PgConnection, donation: &NewDonation) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO donations (event_id, org_id, donor_address, amount_wei, tx_hash, block_number, created_at)
            VALUES ($1, $2, $3, $4::NUMERIC, $5, $6, NOW())
            ON CONFLICT (tx_hash) DO NOTHING
            "#,
        )
        .bind(to_db_id("event_id", donation.event_id)?)
        .bind(to_db_id("org_id", donation.org_id)?)
        .bind(&donation.donor_address)
        .bind(donation.amount_wei.to_string())
        .bind(&donation.tx_hash)
        .bind(to_db_id("block_number", donation.block_number)?)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Serialises writers of one event's allocation set until the transaction ends
    async fn lock_allocations_in(conn: &mut PgConnection, event_id: i64) -> AppResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended('allocations:' || $1::TEXT, 0))")
            .bind(event_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Delete-then-insert inside the caller's transaction
    async fn replace_allocations_in(
        conn: &mut PgConnection,
        update: &AllocationUpdate,
    ) -> AppResult<Vec<AllocationRecord>> {
        let event_id = to_db_id("event_id", update.event_id)?;
        Self::lock_allocations_in(conn, event_id).await?;

        sqlx::query("DELETE FROM allocations WHERE event_id = $1")
            .bind(event_id)
            .execute(&mut *conn)
            .await?;

        let approved_at: DateTime<Utc> = Utc::now();
        let mut records = Vec::with_capacity(update.splits.len());
        for split in &update.splits {
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO allocations (event_id, org_id, split_bps, source, approved_by, approved_at, tx_hash)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING {ALLOCATION_COLUMNS}
                "#
            ))
            .bind(event_id)
            .bind(to_db_id("org_id", split.org_id)?)
            .bind(i32::from(split.split_bps))
            .bind(update.source)
            .bind(&update.approved_by)
            .bind(approved_at)
            .bind(&update.tx_hash)
            .fetch_one(&mut *conn)
            .await?;
            records.push(Self::allocation_from_row(&row)?);
        }

        records.sort_by_key(|r| r.org_id);
        Ok(records)
    }

    /// Returns (inserted, reconciled)
    async fn record_receipt_in(
        conn: &mut PgConnection,
        receipt: &ChainPayoutReceipt,
    ) -> AppResult<(bool, bool)> {
        let event_id = to_db_id("event_id", receipt.event_id)?;
        let org_id = to_db_id("org_id", receipt.org_id)?;

        if !receipt.offramp_ref.is_empty() {
            let reconciled = sqlx::query(
                r#"
                UPDATE payouts
                SET tx_hash = $1, status = 'completed', updated_at = NOW()
                WHERE id = (
                    SELECT id FROM payouts
                    WHERE event_id = $2 AND org_id = $3 AND offramp_ref = $4
                      AND tx_hash IS NULL AND status IN ('processing', 'completed')
                    ORDER BY id
                    LIMIT 1
                )
                AND NOT EXISTS (SELECT 1 FROM payouts WHERE tx_hash = $1)
                "#,
            )
            .bind(&receipt.tx_hash)
            .bind(event_id)
            .bind(org_id)
            .bind(&receipt.offramp_ref)
            .execute(&mut *conn)
            .await?;

            if reconciled.rows_affected() == 1 {
                return Ok((false, true));
            }
        }

        let settled_stuck = sqlx::query(
            r#"
            UPDATE payouts
            SET tx_hash = $1, offramp_ref = $5, fiat_currency = $6, fiat_amount = $7,
                status = 'completed', updated_at = NOW()
            WHERE id = (
                SELECT id FROM payouts
                WHERE event_id = $2 AND org_id = $3 AND amount_wei = $4::NUMERIC
                  AND tx_hash IS NULL AND status = 'processing'
                ORDER BY id
                LIMIT 1
            )
            AND NOT EXISTS (SELECT 1 FROM payouts WHERE tx_hash = $1)
            "#,
        )
        .bind(&receipt.tx_hash)
        .bind(event_id)
        .bind(org_id)
        .bind(receipt.amount_wei.to_string())
        .bind(&receipt.offramp_ref)
        .bind(&receipt.fiat_currency)
        .bind(&receipt.fiat_amount)
        .execute(&mut *conn)
        .await?;

        if settled_stuck.rows_affected() == 1 {
            return Ok((false, true));
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO payouts (event_id, org_id, amount_wei, fiat_currency, fiat_amount, offramp_ref, tx_hash, status, created_at, updated_at)
            VALUES ($1, $2, $3::NUMERIC, $4, $5, $6, $7, 'completed', NOW(), NOW())
            ON CONFLICT (tx_hash) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(org_id)
        .bind(receipt.amount_wei.to_string())
        .bind(&receipt.fiat_currency)
        .bind(&receipt.fiat_amount)
        .bind(&receipt.offramp_ref)
        .bind(&receipt.tx_hash)
        .execute(&mut *conn)
        .await?;

        Ok((inserted.rows_affected() == 1, false))
    }

    /// Move a processing payout to a terminal state, or explain why not
    async fn finish_payout(
        &self,
        payout_id: i64,
        to: PayoutStatus,
        row: Option<PgRow>,
    ) -> AppResult<PayoutRecord> {
        if let Some(row) = row {
            return Self::payout_from_row(&row);
        }

        let current: Option<PayoutStatus> =
            sqlx::query_scalar("SELECT status FROM payouts WHERE id = $1")
                .bind(payout_id)
                .fetch_optional(&self.pool)
                .await?;

        match current {
            None => Err(AppError::NotFound(format!("Payout {} not found", payout_id))),
            Some(from) => Err(IntegrityError::InvalidPayoutTransition {
                id: payout_id,
                from: from.to_string(),
                to: to.to_string(),
            }
            .into()),
        }
    }
}

#[async_trait]
impl SettlementStore for PgSettlementStore {
    // ========== CURSOR ==========

    async fn cursor(&self) -> AppResult<IndexCursor> {
        let row = sqlx::query(
            "SELECT last_block_number, updated_at FROM indexer_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(IndexCursor {
                last_processed_block: from_db_id("last_block_number", row.try_get("last_block_number")?)?,
                updated_at: row.try_get("updated_at")?,
            }),
            None => Ok(IndexCursor::genesis()),
        }
    }

    // ========== INDEXER WRITES ==========

    async fn apply_chunk(&self, batch: &ChunkBatch) -> AppResult<ChunkOutcome> {
        for update in &batch.allocations {
            update.validate()?;
        }

        let mut tx = self.pool.begin().await?;

        // Row lock on the cursor serialises chunk writers across processes
        sqlx::query(
            "INSERT INTO indexer_state (id, last_block_number, updated_at) VALUES (1, 0, NOW()) ON CONFLICT (id) DO NOTHING",
        )
        .execute(&mut *tx)
        .await?;
        let last: i64 =
            sqlx::query_scalar("SELECT last_block_number FROM indexer_state WHERE id = 1 FOR UPDATE")
                .fetch_one(&mut *tx)
                .await?;
        let last = from_db_id("last_block_number", last)?;
        if batch.is_stale(last) {
            debug!(
                "Skipping blocks {}..={}: cursor already at {}",
                batch.from_block, batch.to_block, last
            );
            return Ok(ChunkOutcome::stale());
        }

        let mut outcome = ChunkOutcome::default();

        for donation in &batch.donations {
            if Self::insert_donation_in(&mut *tx, donation).await? {
                outcome.donations_inserted += 1;
            }
        }

        for update in &batch.allocations {
            Self::replace_allocations_in(&mut *tx, update).await?;
            outcome.allocation_sets_applied += 1;
        }

        for receipt in &batch.payouts {
            let (inserted, reconciled) = Self::record_receipt_in(&mut *tx, receipt).await?;
            outcome.payouts_inserted += usize::from(inserted);
            outcome.payouts_reconciled += usize::from(reconciled);
        }

        sqlx::query(
            r#"
            INSERT INTO indexer_state (id, last_block_number, updated_at)
            VALUES (1, $1, NOW())
            ON CONFLICT (id) DO UPDATE
            SET last_block_number = GREATEST(indexer_state.last_block_number, EXCLUDED.last_block_number),
                updated_at = NOW()
            "#,
        )
        .bind(to_db_id("to_block", batch.to_block)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            "Committed blocks {}..={}: {:?}",
            batch.from_block, batch.to_block, outcome
        );
        Ok(outcome)
    }

    // ========== DONATIONS ==========

    async fn insert_donation(&self, donation: &NewDonation) -> AppResult<bool> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_donation_in(&mut *conn, donation).await
    }

    async fn donations_for_event(&self, event_id: u64) -> AppResult<Vec<DonationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {DONATION_COLUMNS} FROM donations WHERE event_id = $1 ORDER BY block_number, id"
        ))
        .bind(to_db_id("event_id", event_id)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::donation_from_row).collect()
    }

    async fn donation_totals_by_org(&self, event_id: u64) -> AppResult<Vec<(u64, U256)>> {
        let rows = sqlx::query(
            r#"
            SELECT org_id, SUM(amount_wei)::TEXT AS total
            FROM donations
            WHERE event_id = $1
            GROUP BY org_id
            ORDER BY org_id
            "#,
        )
        .bind(to_db_id("event_id", event_id)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> AppResult<(u64, U256)> {
                Ok((
                    from_db_id("org_id", row.try_get("org_id")?)?,
                    parse_wei(&row.try_get::<String, _>("total")?)?,
                ))
            })
            .collect()
    }

    // ========== ALLOCATIONS ==========

    async fn replace_allocations(
        &self,
        update: &AllocationUpdate,
    ) -> AppResult<Vec<AllocationRecord>> {
        update.validate()?;

        let mut tx = self.pool.begin().await?;
        let records = Self::replace_allocations_in(&mut *tx, update).await?;
        tx.commit().await?;

        info!(
            "Allocation for event {} replaced ({} orgs, source {:?})",
            update.event_id,
            records.len(),
            update.source
        );
        Ok(records)
    }

    async fn replace_proportional_allocations(&self, update: &AllocationUpdate) -> AppResult<bool> {
        update.validate()?;
        let event_id = to_db_id("event_id", update.event_id)?;

        let mut tx = self.pool.begin().await?;
        Self::lock_allocations_in(&mut *tx, event_id).await?;

        let has_manual: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM allocations WHERE event_id = $1 AND source = 'manual')",
        )
        .bind(event_id)
        .fetch_one(&mut *tx)
        .await?;
        if has_manual {
            debug!(
                "Event {} gained a manual allocation set, derived split not stored",
                update.event_id
            );
            return Ok(false);
        }

        Self::replace_allocations_in(&mut *tx, update).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn allocations_for_event(&self, event_id: u64) -> AppResult<Vec<AllocationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE event_id = $1 ORDER BY org_id"
        ))
        .bind(to_db_id("event_id", event_id)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::allocation_from_row).collect()
    }

    // ========== PAYOUTS ==========

    async fn payouts_for_event(&self, event_id: u64) -> AppResult<Vec<PayoutRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE event_id = $1 ORDER BY id"
        ))
        .bind(to_db_id("event_id", event_id)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::payout_from_row).collect()
    }

    async fn reserve_payout(&self, payout: &NewPayout) -> AppResult<PayoutRecord> {
        let event_id = to_db_id("event_id", payout.event_id)?;
        let mut tx = self.pool.begin().await?;

        // Serialises reservations for this event across every process
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(event_id)
            .execute(&mut *tx)
            .await?;

        let donated: String = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount_wei), 0)::TEXT FROM donations WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_one(&mut *tx)
        .await?;

        let committed: String = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount_wei), 0)::TEXT
            FROM payouts
            WHERE event_id = $1 AND status IN ('processing', 'completed')
            "#,
        )
        .bind(event_id)
        .fetch_one(&mut *tx)
        .await?;

        let available = parse_wei(&donated)?.saturating_sub(parse_wei(&committed)?);
        if payout.amount_wei > available {
            warn!(
                "Refusing payout of {} wei for event {}: only {} wei undistributed",
                payout.amount_wei, payout.event_id, available
            );
            return Err(IntegrityError::OverDistribution {
                event_id: payout.event_id,
                requested: payout.amount_wei.to_string(),
                available: available.to_string(),
            }
            .into());
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO payouts (event_id, org_id, amount_wei, fiat_currency, fiat_amount, status, created_at, updated_at)
            VALUES ($1, $2, $3::NUMERIC, $4, '0', 'processing', NOW(), NOW())
            RETURNING {PAYOUT_COLUMNS}
            "#
        ))
        .bind(event_id)
        .bind(to_db_id("org_id", payout.org_id)?)
        .bind(payout.amount_wei.to_string())
        .bind(&payout.fiat_currency)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Self::payout_from_row(&row)
    }

    async fn complete_payout(
        &self,
        payout_id: i64,
        settlement: &PayoutSettlement,
    ) -> AppResult<PayoutRecord> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE payouts
            SET status = 'completed', fiat_currency = $2, fiat_amount = $3, offramp_ref = $4, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING {PAYOUT_COLUMNS}
            "#
        ))
        .bind(payout_id)
        .bind(&settlement.fiat_currency)
        .bind(&settlement.fiat_amount)
        .bind(&settlement.offramp_ref)
        .fetch_optional(&self.pool)
        .await?;

        self.finish_payout(payout_id, PayoutStatus::Completed, row).await
    }

    async fn fail_payout(&self, payout_id: i64, reason: &str) -> AppResult<PayoutRecord> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE payouts
            SET status = 'failed', failure_reason = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING {PAYOUT_COLUMNS}
            "#
        ))
        .bind(payout_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        self.finish_payout(payout_id, PayoutStatus::Failed, row).await
    }

    // ========== ORGANIZATIONS ==========

    async fn organization(&self, org_id: u64) -> AppResult<Option<Organization>> {
        let row = sqlx::query(
            "SELECT id, name, country, payout_method, allowlisted FROM organizations WHERE id = $1",
        )
        .bind(to_db_id("org_id", org_id)?)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::organization_from_row).transpose()
    }

    async fn upsert_organization(&self, organization: &Organization) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations (id, name, country, payout_method, allowlisted, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                country = EXCLUDED.country,
                payout_method = EXCLUDED.payout_method,
                allowlisted = EXCLUDED.allowlisted
            "#,
        )
        .bind(to_db_id("org_id", organization.id)?)
        .bind(&organization.name)
        .bind(&organization.country)
        .bind(organization.payout_method.as_str())
        .bind(organization.allowlisted)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Postgres has no unsigned 64-bit column; ids and block numbers must fit BIGINT
fn to_db_id(field: &'static str, value: u64) -> AppResult<i64> {
    i64::try_from(value).map_err(|_| {
        IntegrityError::ValueOutOfRange {
            field,
            value: value.to_string(),
        }
        .into()
    })
}

fn from_db_id(field: &'static str, value: i64) -> AppResult<u64> {
    u64::try_from(value).map_err(|_| {
        IntegrityError::ValueOutOfRange {
            field,
            value: value.to_string(),
        }
        .into()
    })
}
