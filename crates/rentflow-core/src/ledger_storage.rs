use crate::error::{RentflowError, RentflowResult};
use crate::gate::GateDecision;
use crate::ledger::{AppendOnlyLedger, AuditEvent, EntrySubject, LedgerEntry, LedgerEntryKind};
use crate::types::TransferOutcome;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Ledger shared by the executor, the state machine and the reconciler.
pub type SharedLedger = Arc<Mutex<PersistentLedger>>;

#[derive(Debug, Clone)]
enum LedgerBackend {
    Memory,
    Postgres(PostgresLedgerStore),
}

/// Runtime ledger that keeps the authoritative chain in memory and optionally
/// mirrors every entry to PostgreSQL.
///
/// - Entry hash/index is computed against the in-memory chain first.
/// - The entry is persisted before it is committed in memory.
/// - On startup, persisted entries are hydrated and hash-verified.
#[derive(Debug, Clone)]
pub struct PersistentLedger {
    ledger: AppendOnlyLedger,
    backend: LedgerBackend,
}

impl PersistentLedger {
    pub fn memory() -> Self {
        Self {
            ledger: AppendOnlyLedger::new(),
            backend: LedgerBackend::Memory,
        }
    }

    pub fn shared(self) -> SharedLedger {
        Arc::new(Mutex::new(self))
    }

    pub async fn postgres(pool: PgPool) -> RentflowResult<Self> {
        let store = PostgresLedgerStore { pool };
        store.ensure_schema().await?;
        let entries = store.load_entries().await?;
        Ok(Self {
            ledger: AppendOnlyLedger::from_entries(entries)?,
            backend: LedgerBackend::Postgres(store),
        })
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            LedgerBackend::Memory => "memory",
            LedgerBackend::Postgres(_) => "postgres",
        }
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        self.ledger.entries()
    }

    pub fn as_append_only(&self) -> &AppendOnlyLedger {
        &self.ledger
    }

    pub fn verify_chain(&self) -> bool {
        self.ledger.verify_chain()
    }

    pub async fn append_audit(
        &mut self,
        subject: EntrySubject,
        event: AuditEvent,
    ) -> RentflowResult<LedgerEntry> {
        let payload = serde_json::to_value(event)?;
        self.append(subject, LedgerEntryKind::Audit, payload).await
    }

    pub async fn append_decision(
        &mut self,
        subject: EntrySubject,
        decision: &GateDecision,
    ) -> RentflowResult<LedgerEntry> {
        let payload = serde_json::to_value(decision)?;
        self.append(subject, LedgerEntryKind::Decision, payload)
            .await
    }

    pub async fn append_outcome(
        &mut self,
        subject: EntrySubject,
        outcome: &TransferOutcome,
    ) -> RentflowResult<LedgerEntry> {
        let payload = serde_json::to_value(outcome)?;
        self.append(subject, LedgerEntryKind::Outcome, payload).await
    }

    async fn append(
        &mut self,
        subject: EntrySubject,
        kind: LedgerEntryKind,
        payload: serde_json::Value,
    ) -> RentflowResult<LedgerEntry> {
        let entry = self.ledger.build_entry(subject, kind, payload);

        if let LedgerBackend::Postgres(store) = &self.backend {
            store.insert_entry(&entry).await?;
        }

        self.ledger.commit_entry(entry.clone())?;
        Ok(entry)
    }
}

#[derive(Debug, Clone)]
struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    async fn ensure_schema(&self) -> RentflowResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rentflow_ledger_entries (
                ledger_index BIGINT PRIMARY KEY,
                entry_id TEXT NOT NULL UNIQUE,
                lease_id TEXT NULL,
                obligation_id TEXT NULL,
                kind TEXT NOT NULL,
                entry_timestamp TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RentflowError::Ledger(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_rentflow_ledger_lease_id ON rentflow_ledger_entries (lease_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RentflowError::Ledger(format!("postgres index create failed: {e}")))?;

        Ok(())
    }

    async fn load_entries(&self) -> RentflowResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT ledger_index, entry_id, lease_id, obligation_id, kind,
                   entry_timestamp, payload, previous_hash, entry_hash
            FROM rentflow_ledger_entries
            ORDER BY ledger_index ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RentflowError::Ledger(format!("postgres load failed: {e}")))?;

        rows.into_iter()
            .map(|row| {
                let decode = |e: sqlx::Error| {
                    RentflowError::Ledger(format!("postgres decode ledger row failed: {e}"))
                };
                let index: i64 = row.try_get("ledger_index").map_err(decode)?;
                let kind: String = row.try_get("kind").map_err(decode)?;
                Ok(LedgerEntry {
                    entry_id: row.try_get("entry_id").map_err(decode)?,
                    index: index.try_into().map_err(|_| {
                        RentflowError::Ledger("negative ledger index in storage".to_string())
                    })?,
                    lease_id: row.try_get("lease_id").map_err(decode)?,
                    obligation_id: row.try_get("obligation_id").map_err(decode)?,
                    kind: LedgerEntryKind::parse(&kind)?,
                    timestamp: row.try_get("entry_timestamp").map_err(decode)?,
                    payload: row.try_get("payload").map_err(decode)?,
                    previous_hash: row.try_get("previous_hash").map_err(decode)?,
                    entry_hash: row.try_get("entry_hash").map_err(decode)?,
                })
            })
            .collect()
    }

    async fn insert_entry(&self, entry: &LedgerEntry) -> RentflowResult<()> {
        let index: i64 = entry.index.try_into().map_err(|_| {
            RentflowError::Ledger("ledger index exceeds postgres BIGINT range".to_string())
        })?;
        sqlx::query(
            r#"
            INSERT INTO rentflow_ledger_entries (
                ledger_index, entry_id, lease_id, obligation_id, kind,
                entry_timestamp, payload, previous_hash, entry_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(index)
        .bind(&entry.entry_id)
        .bind(&entry.lease_id)
        .bind(&entry.obligation_id)
        .bind(entry.kind.as_str())
        .bind(entry.timestamp)
        .bind(&entry.payload)
        .bind(&entry.previous_hash)
        .bind(&entry.entry_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| RentflowError::Ledger(format!("postgres insert failed: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
impl PersistentLedger {
    /// Postgres-backed ledger whose every append fails.
    pub(crate) fn unreachable() -> Self {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(200))
            .connect_lazy("postgres://rentflow@127.0.0.1:1/rentflow")
            .unwrap();
        Self {
            ledger: AppendOnlyLedger::new(),
            backend: LedgerBackend::Postgres(PostgresLedgerStore { pool }),
        }
    }
}
