use crate::error::{RentflowError, RentflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Ledger entry types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    /// Autonomous gate decision, written before any transfer attempt.
    Decision,
    /// Lease and obligation lifecycle events.
    Audit,
    /// Transfer outcome as reported by the executor.
    Outcome,
}

impl LedgerEntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Audit => "audit",
            Self::Outcome => "outcome",
        }
    }

    pub fn parse(value: &str) -> RentflowResult<Self> {
        match value {
            "decision" => Ok(Self::Decision),
            "audit" => Ok(Self::Audit),
            "outcome" => Ok(Self::Outcome),
            other => Err(RentflowError::Ledger(format!(
                "unknown ledger kind '{other}'"
            ))),
        }
    }
}

/// Hash-chained ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub index: u64,
    pub lease_id: Option<String>,
    pub obligation_id: Option<String>,
    pub kind: LedgerEntryKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Audit payload persisted in the append-only log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEvent {
    pub stage: String,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            detail: detail.into(),
        }
    }
}

/// Subject an entry is filed under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntrySubject {
    pub lease_id: Option<String>,
    pub obligation_id: Option<String>,
}

impl EntrySubject {
    pub fn lease(lease_id: impl Into<String>) -> Self {
        Self {
            lease_id: Some(lease_id.into()),
            obligation_id: None,
        }
    }

    pub fn obligation(lease_id: impl Into<String>, obligation_id: impl Into<String>) -> Self {
        Self {
            lease_id: Some(lease_id.into()),
            obligation_id: Some(obligation_id.into()),
        }
    }
}

/// Append-only ledger with hash-chain proofs.
///
/// There is no in-place mutation API; corrections are new entries.
#[derive(Debug, Default, Clone)]
pub struct AppendOnlyLedger {
    entries: Vec<LedgerEntry>,
}

impl AppendOnlyLedger {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild a ledger from persisted entries and verify hash-chain integrity.
    pub fn from_entries(entries: Vec<LedgerEntry>) -> RentflowResult<Self> {
        for (expected_index, entry) in entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(RentflowError::Ledger(format!(
                    "ledger index gap at position {} (found {})",
                    expected_index, entry.index
                )));
            }
        }

        let ledger = Self { entries };
        if !ledger.verify_chain() {
            return Err(RentflowError::Ledger(
                "persisted ledger hash-chain verification failed".to_string(),
            ));
        }
        Ok(ledger)
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn entries_for_lease<'a>(
        &'a self,
        lease_id: &'a str,
    ) -> impl Iterator<Item = &'a LedgerEntry> + 'a {
        self.entries
            .iter()
            .filter(move |entry| entry.lease_id.as_deref() == Some(lease_id))
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            if entry.previous_hash != previous_hash {
                return false;
            }
            if entry.entry_hash != compute_entry_hash(entry, previous_hash.as_deref()) {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }

    /// Build the next entry without mutating the chain.
    pub fn build_entry(
        &self,
        subject: EntrySubject,
        kind: LedgerEntryKind,
        payload: Value,
    ) -> LedgerEntry {
        let mut entry = LedgerEntry {
            entry_id: Uuid::new_v4().to_string(),
            index: self.entries.len() as u64,
            lease_id: subject.lease_id,
            obligation_id: subject.obligation_id,
            kind,
            timestamp: Utc::now(),
            payload,
            previous_hash: self.entries.last().map(|entry| entry.entry_hash.clone()),
            entry_hash: String::new(),
        };
        entry.entry_hash = compute_entry_hash(&entry, entry.previous_hash.as_deref());
        entry
    }

    /// Commit a pre-built entry once external durability succeeded.
    pub fn commit_entry(&mut self, entry: LedgerEntry) -> RentflowResult<()> {
        let expected_index = self.entries.len() as u64;
        if entry.index != expected_index {
            return Err(RentflowError::Ledger(format!(
                "commit index mismatch: expected {}, got {}",
                expected_index, entry.index
            )));
        }

        let expected_previous = self.entries.last().map(|e| e.entry_hash.as_str());
        if entry.previous_hash.as_deref() != expected_previous {
            return Err(RentflowError::Ledger(
                "commit previous hash mismatch".to_string(),
            ));
        }

        if entry.entry_hash != compute_entry_hash(&entry, expected_previous) {
            return Err(RentflowError::Ledger(
                "commit hash mismatch for ledger entry".to_string(),
            ));
        }

        self.entries.push(entry);
        Ok(())
    }
}

fn compute_entry_hash(entry: &LedgerEntry, previous_hash: Option<&str>) -> String {
    let material = serde_json::json!({
        "index": entry.index,
        "lease_id": entry.lease_id,
        "obligation_id": entry.obligation_id,
        "kind": entry.kind,
        "timestamp": entry.timestamp,
        "payload": entry.payload,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audit(ledger: &mut AppendOnlyLedger, subject: EntrySubject, event: AuditEvent) {
        let entry = ledger.build_entry(
            subject,
            LedgerEntryKind::Audit,
            serde_json::to_value(event).unwrap(),
        );
        ledger.commit_entry(entry).unwrap();
    }

    #[test]
    fn verifies_hash_chain() {
        let mut ledger = AppendOnlyLedger::new();
        audit(
            &mut ledger,
            EntrySubject::lease("lease-1"),
            AuditEvent::new("lease_issued", "draft"),
        );
        audit(
            &mut ledger,
            EntrySubject::obligation("lease-1", "obl-1"),
            AuditEvent::new("obligation_submitted", "ref=abc"),
        );

        assert!(ledger.verify_chain());
        assert_eq!(ledger.entries_for_lease("lease-1").count(), 2);
    }

    #[test]
    fn detects_tampered_entries() {
        let mut ledger = AppendOnlyLedger::new();
        audit(
            &mut ledger,
            EntrySubject::lease("lease-2"),
            AuditEvent::new("lease_signed", "landlord"),
        );

        let mut tampered = ledger.clone();
        tampered.entries[0].payload = serde_json::json!({"tampered": true});

        assert!(!tampered.verify_chain());
        assert!(AppendOnlyLedger::from_entries(tampered.entries).is_err());
    }

    #[test]
    fn from_entries_rehydrates_verified_chain() {
        let mut base = AppendOnlyLedger::new();
        audit(&mut base, EntrySubject::lease("lease-a"), AuditEvent::new("issued", "ok"));
        audit(&mut base, EntrySubject::lease("lease-a"), AuditEvent::new("signed", "tenant"));

        let rehydrated = AppendOnlyLedger::from_entries(base.entries().to_vec()).unwrap();
        assert_eq!(rehydrated.entries().len(), 2);
        assert_eq!(rehydrated.entries()[0].entry_id, base.entries()[0].entry_id);
        assert!(rehydrated.verify_chain());
    }

    #[test]
    fn commit_rejects_stale_entry() {
        let mut ledger = AppendOnlyLedger::new();
        let stale = ledger.build_entry(
            EntrySubject::default(),
            LedgerEntryKind::Audit,
            serde_json::json!({}),
        );
        audit(&mut ledger, EntrySubject::default(), AuditEvent::new("a", "b"));

        assert!(ledger.commit_entry(stale).is_err());
    }
}
