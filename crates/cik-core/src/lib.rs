//! Core domain model for the company ticker reference sync.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cik-core";

/// Process name under which the reconciliation job records its last execution.
pub const PROCESS_NAME: &str = "CIK_DATA_UPDATE";

/// Stable integer key (SEC CIK) matching remote records to persisted rows.
pub type ExternalId = i64;

/// One complete fetch of the remote dataset, keyed by external id.
pub type Snapshot = BTreeMap<ExternalId, RemoteRecord>;

/// Transient record decoded from the remote dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub external_id: ExternalId,
    pub ticker: String,
    pub title: String,
}

/// Durable reference row. `updated_at` stays empty until a field actually changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub external_id: ExternalId,
    pub ticker: String,
    pub title: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PersistedRecord {
    pub fn from_remote(remote: &RemoteRecord) -> Self {
        Self {
            external_id: remote.external_id,
            ticker: remote.ticker.clone(),
            title: remote.title.clone(),
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub process_name: String,
    pub last_executed_at: DateTime<Utc>,
}

/// What a reconciliation pass did with a single snapshot key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFailure {
    pub external_id: ExternalId,
    pub error: String,
}

/// Authoritative outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub failures: Vec<KeyFailure>,
    /// Hex SHA-256 of the fetched body, when the snapshot came over HTTP.
    pub snapshot_sha256: Option<String>,
    /// Snapshot entries dropped because their id had already been seen.
    pub duplicate_ids: usize,
}

impl RunSummary {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            failed: 0,
            failures: Vec::new(),
            snapshot_sha256: None,
            duplicate_ids: 0,
        }
    }

    pub fn record(&mut self, outcome: KeyOutcome) {
        match outcome {
            KeyOutcome::Inserted => self.inserted += 1,
            KeyOutcome::Updated => self.updated += 1,
            KeyOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn record_failure(&mut self, external_id: ExternalId, error: impl ToString) {
        self.failed += 1;
        self.failures.push(KeyFailure {
            external_id,
            error: error.to_string(),
        });
    }

    pub fn processed(&self) -> usize {
        self.inserted + self.updated + self.unchanged + self.failed
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_from_remote_has_no_update_stamp() {
        let remote = RemoteRecord {
            external_id: 1001,
            ticker: "ABC".into(),
            title: "Alpha Inc".into(),
        };
        let record = PersistedRecord::from_remote(&remote);
        assert_eq!(record.external_id, 1001);
        assert_eq!(record.ticker, "ABC");
        assert_eq!(record.title, "Alpha Inc");
        assert!(record.updated_at.is_none());
    }

    #[test]
    fn summary_counts_outcomes_and_failures() {
        let mut summary = RunSummary::new(Uuid::new_v4(), Utc::now());
        summary.record(KeyOutcome::Inserted);
        summary.record(KeyOutcome::Unchanged);
        summary.record(KeyOutcome::Unchanged);
        summary.record_failure(7, "constraint violation");

        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.unchanged, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.processed(), 4);
        assert!(summary.has_failures());
        assert_eq!(summary.failures[0].external_id, 7);
    }

    #[test]
    fn summary_serializes_counts() {
        let summary = RunSummary::new(Uuid::nil(), Utc::now());
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["inserted"], 0);
        assert_eq!(json["failures"].as_array().map(Vec::len), Some(0));
    }
}
