//! PostgreSQL settlement store

use super::{check_transition, dedupe_key, stale_transition, SettlementStore};
use crate::error::{RentflowError, RentflowResult};
use crate::types::{
    CurrencyUnit, Lease, ObligationKind, ObligationPatch, ObligationState, PaymentObligation,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

const OBLIGATION_COLUMNS: &str = r#"
    obligation_id, lease_id, kind, payer_id, payee_id, amount_minor,
    currency_code, currency_decimals, due_reference, state, rail,
    external_reference, failure_reason, settled_at, replaces,
    created_at, updated_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresSettlementStore {
    pool: PgPool,
}

impl PostgresSettlementStore {
    pub async fn new(pool: PgPool) -> RentflowResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> RentflowResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS rentflow_leases (
                lease_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                document JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rentflow_obligations (
                obligation_id TEXT PRIMARY KEY,
                dedupe_key TEXT NOT NULL UNIQUE,
                lease_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payer_id TEXT NOT NULL,
                payee_id TEXT NOT NULL,
                amount_minor BIGINT NOT NULL,
                currency_code TEXT NOT NULL,
                currency_decimals SMALLINT NOT NULL,
                due_reference TEXT NOT NULL,
                state TEXT NOT NULL,
                rail TEXT NULL,
                external_reference TEXT NULL,
                failure_reason TEXT NULL,
                settled_at TIMESTAMPTZ NULL,
                replaces TEXT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_rentflow_obligations_lease ON rentflow_obligations (lease_id)",
            "CREATE INDEX IF NOT EXISTS idx_rentflow_obligations_state ON rentflow_obligations (state)",
            "CREATE INDEX IF NOT EXISTS idx_rentflow_obligations_payer ON rentflow_obligations (payer_id, updated_at)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| RentflowError::Storage(format!("postgres schema create failed: {e}")))?;
        }
        Ok(())
    }
}

fn storage_err(context: &str) -> impl Fn(sqlx::Error) -> RentflowError + '_ {
    move |e| RentflowError::Storage(format!("postgres {context} failed: {e}"))
}

fn decode_obligation(row: &PgRow) -> RentflowResult<PaymentObligation> {
    let decode = storage_err("decode obligation");
    let kind: String = row.try_get("kind").map_err(&decode)?;
    let state: String = row.try_get("state").map_err(&decode)?;
    let decimals: i16 = row.try_get("currency_decimals").map_err(&decode)?;

    Ok(PaymentObligation {
        obligation_id: row.try_get("obligation_id").map_err(&decode)?,
        lease_id: row.try_get("lease_id").map_err(&decode)?,
        kind: ObligationKind::parse(&kind)?,
        payer_id: row.try_get("payer_id").map_err(&decode)?,
        payee_id: row.try_get("payee_id").map_err(&decode)?,
        amount_minor: row.try_get("amount_minor").map_err(&decode)?,
        currency: CurrencyUnit::new(
            row.try_get::<String, _>("currency_code").map_err(&decode)?,
            u8::try_from(decimals).map_err(|_| {
                RentflowError::Storage(format!("invalid currency precision {decimals}"))
            })?,
        ),
        due_reference: row.try_get("due_reference").map_err(&decode)?,
        state: ObligationState::parse(&state)?,
        rail: row.try_get("rail").map_err(&decode)?,
        external_reference: row.try_get("external_reference").map_err(&decode)?,
        failure_reason: row.try_get("failure_reason").map_err(&decode)?,
        settled_at: row.try_get("settled_at").map_err(&decode)?,
        replaces: row.try_get("replaces").map_err(&decode)?,
        created_at: row.try_get("created_at").map_err(&decode)?,
        updated_at: row.try_get("updated_at").map_err(&decode)?,
    })
}

#[async_trait]
impl SettlementStore for PostgresSettlementStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn insert_lease(&self, lease: &Lease) -> RentflowResult<()> {
        let document = serde_json::to_value(lease)?;
        let result = sqlx::query(
            r#"
            INSERT INTO rentflow_leases (lease_id, state, document, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (lease_id) DO NOTHING
            "#,
        )
        .bind(&lease.lease_id)
        .bind(lease.state.as_str())
        .bind(&document)
        .bind(lease.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err("insert lease"))?;

        if result.rows_affected() == 0 {
            return Err(RentflowError::Validation(format!(
                "lease '{}' already exists",
                lease.lease_id
            )));
        }
        Ok(())
    }

    async fn get_lease(&self, lease_id: &str) -> RentflowResult<Option<Lease>> {
        let row = sqlx::query("SELECT document FROM rentflow_leases WHERE lease_id = $1")
            .bind(lease_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err("load lease"))?;

        match row {
            Some(row) => {
                let document: serde_json::Value = row
                    .try_get("document")
                    .map_err(storage_err("decode lease"))?;
                Ok(Some(serde_json::from_value(document)?))
            }
            None => Ok(None),
        }
    }

    async fn update_lease(&self, lease: &Lease) -> RentflowResult<()> {
        let document = serde_json::to_value(lease)?;
        let result = sqlx::query(
            "UPDATE rentflow_leases SET state = $2, document = $3, updated_at = $4 WHERE lease_id = $1",
        )
        .bind(&lease.lease_id)
        .bind(lease.state.as_str())
        .bind(&document)
        .bind(lease.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err("update lease"))?;

        if result.rows_affected() == 0 {
            return Err(RentflowError::LeaseNotFound(lease.lease_id.clone()));
        }
        Ok(())
    }

    async fn list_leases_pending_signal(&self) -> RentflowResult<Vec<Lease>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM rentflow_leases
            WHERE (document->>'activation_signal_pending')::boolean IS TRUE
            ORDER BY updated_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("list leases pending signal"))?;

        rows.iter()
            .map(|row| -> RentflowResult<Lease> {
                let document: serde_json::Value = row
                    .try_get("document")
                    .map_err(storage_err("decode lease"))?;
                Ok(serde_json::from_value(document)?)
            })
            .collect()
    }

    async fn insert_obligations(&self, obligations: &[PaymentObligation]) -> RentflowResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(storage_err("begin transaction"))?;

        for obligation in obligations {
            let result = sqlx::query(
                r#"
                INSERT INTO rentflow_obligations (
                    obligation_id, dedupe_key, lease_id, kind, payer_id, payee_id,
                    amount_minor, currency_code, currency_decimals, due_reference,
                    state, rail, external_reference, failure_reason, settled_at,
                    replaces, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&obligation.obligation_id)
            .bind(dedupe_key(obligation))
            .bind(&obligation.lease_id)
            .bind(obligation.kind.label())
            .bind(&obligation.payer_id)
            .bind(&obligation.payee_id)
            .bind(obligation.amount_minor)
            .bind(&obligation.currency.code)
            .bind(i16::from(obligation.currency.decimals))
            .bind(&obligation.due_reference)
            .bind(obligation.state.as_str())
            .bind(&obligation.rail)
            .bind(&obligation.external_reference)
            .bind(&obligation.failure_reason)
            .bind(obligation.settled_at)
            .bind(&obligation.replaces)
            .bind(obligation.created_at)
            .bind(obligation.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(storage_err("insert obligation"))?;

            if result.rows_affected() == 0 {
                // Dropping the transaction rolls back earlier rows of the batch.
                return Err(RentflowError::InvalidState(format!(
                    "obligation '{}' already exists",
                    dedupe_key(obligation)
                )));
            }
        }

        tx.commit().await.map_err(storage_err("commit obligations"))?;
        Ok(())
    }

    async fn get_obligation(
        &self,
        obligation_id: &str,
    ) -> RentflowResult<Option<PaymentObligation>> {
        let query = format!(
            "SELECT {OBLIGATION_COLUMNS} FROM rentflow_obligations WHERE obligation_id = $1"
        );
        let row = sqlx::query(&query)
            .bind(obligation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err("load obligation"))?;
        row.as_ref().map(decode_obligation).transpose()
    }

    async fn list_obligations_for_lease(
        &self,
        lease_id: &str,
    ) -> RentflowResult<Vec<PaymentObligation>> {
        let query = format!(
            "SELECT {OBLIGATION_COLUMNS} FROM rentflow_obligations WHERE lease_id = $1 ORDER BY created_at, obligation_id"
        );
        let rows = sqlx::query(&query)
            .bind(lease_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err("list lease obligations"))?;
        rows.iter().map(decode_obligation).collect()
    }

    async fn list_obligations_in_state(
        &self,
        state: ObligationState,
    ) -> RentflowResult<Vec<PaymentObligation>> {
        let query = format!(
            "SELECT {OBLIGATION_COLUMNS} FROM rentflow_obligations WHERE state = $1 ORDER BY updated_at"
        );
        let rows = sqlx::query(&query)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err("list obligations by state"))?;
        rows.iter().map(decode_obligation).collect()
    }

    async fn list_payer_history(
        &self,
        payer_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> RentflowResult<Vec<PaymentObligation>> {
        let query = format!(
            r#"
            SELECT {OBLIGATION_COLUMNS} FROM rentflow_obligations
            WHERE payer_id = $1 AND state IN ('settled', 'failed') AND updated_at >= $2
            ORDER BY updated_at DESC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&query)
            .bind(payer_id)
            .bind(since)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err("load payer history"))?;
        rows.iter().map(decode_obligation).collect()
    }

    async fn transition_obligation(
        &self,
        obligation_id: &str,
        from: ObligationState,
        to: ObligationState,
        patch: ObligationPatch,
    ) -> RentflowResult<PaymentObligation> {
        check_transition(obligation_id, from, to)?;

        let query = format!(
            r#"
            UPDATE rentflow_obligations SET
                state = $3,
                rail = COALESCE($4, rail),
                external_reference = COALESCE($5, external_reference),
                failure_reason = COALESCE($6, failure_reason),
                settled_at = COALESCE($7, settled_at),
                updated_at = $8
            WHERE obligation_id = $1 AND state = $2
            RETURNING {OBLIGATION_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(obligation_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(&patch.rail)
            .bind(&patch.external_reference)
            .bind(&patch.failure_reason)
            .bind(patch.settled_at)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err("transition obligation"))?;

        if let Some(row) = row {
            return decode_obligation(&row);
        }

        match self.get_obligation(obligation_id).await? {
            Some(current) => Err(stale_transition(obligation_id, from, current.state)),
            None => Err(RentflowError::ObligationNotFound(obligation_id.to_string())),
        }
    }
}
