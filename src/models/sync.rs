//! Record synchronization models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// A change record arriving from an upstream source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingRecord {
    pub id: String,
    pub source_table: String,
    pub payload: Map<String, JsonValue>,
    /// Source-side modification time, used to resolve conflicting versions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl IncomingRecord {
    pub fn new(
        id: impl Into<String>,
        source_table: impl Into<String>,
        payload: Map<String, JsonValue>,
    ) -> Self {
        Self {
            id: id.into(),
            source_table: source_table.into(),
            payload,
            updated_at: None,
        }
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }
}

/// Status persisted in the tracking table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Written by producers that claim a record before applying it
    Pending,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the tracking table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub record_id: String,
    pub source_table: String,
    pub content_hash: String,
    pub status: SyncStatus,
    pub last_synced_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_updated_at: Option<DateTime<Utc>>,
}

/// What reconciliation did with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStatus {
    Applied,
    SkippedDuplicate,
    SkippedStale,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub record_id: String,
    pub status: OutcomeStatus,
    pub content_hash: String,
    /// True when a previously failed attempt with the same content was re-applied
    #[serde(default)]
    pub retried: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SyncOutcome {
    pub fn new(record_id: impl Into<String>, status: OutcomeStatus, hash: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            status,
            content_hash: hash.into(),
            retried: false,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Body of the sync endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub records: Vec<IncomingRecord>,
    /// Makes the batch resumable: a re-submitted batch skips completed chunks
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub outcomes: Vec<SyncOutcome>,
    /// First chunk run by this call when a batch was resumed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_names() {
        for status in [SyncStatus::Pending, SyncStatus::Success, SyncStatus::Failed] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SyncStatus::parse("unknown"), None);
    }

    #[test]
    fn test_outcome_serializes_kebab_case() {
        let outcome = SyncOutcome::new("r1", OutcomeStatus::SkippedDuplicate, "sha256:ab");
        let value = serde_json::to_value(outcome).unwrap();
        assert_eq!(value["status"], "skipped-duplicate");
        assert_eq!(value["recordId"], "r1");
    }

    #[test]
    fn test_incoming_record_from_json() {
        let record: IncomingRecord = serde_json::from_value(serde_json::json!({
            "id": "42",
            "sourceTable": "customers",
            "payload": { "name": "Ada" },
            "updatedAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(record.source_table, "customers");
        assert!(record.updated_at.is_some());
    }
}
