// =============================================================================
// models.rs - THE DATA THAT FLOWS THROUGH THE ENGINE
// =============================================================================
//
// Case documents as fetched from the portal, snapshots as persisted, update
// deltas as detected, and the per-item / per-batch records the orchestrator
// produces. Everything here is plain data: serde in, serde out.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::classifier::CaseCategory;

// =============================================================================
// PORTAL DOCUMENTS
// =============================================================================

/// One scheduled hearing as listed by the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HearingEntry {
    /// `YYYY.MM.DD` or `YYYYMMDD`, whatever the portal sent.
    pub date: String,
    pub time: String,
    pub kind: String,
    pub place: String,
    pub result: Option<String>,
}

impl HearingEntry {
    /// Identity of a hearing across snapshots.
    pub fn key(&self) -> String {
        format!("{}_{}_{}", self.date, self.time, self.kind)
    }
}

/// One progress (docket) line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub date: String,
    pub content: String,
    pub result: Option<String>,
}

impl ProgressEntry {
    /// Identity of a progress line: date plus the first 50 characters.
    pub fn key(&self) -> String {
        let head: String = self.content.chars().take(50).collect();
        format!("{}_{}", self.date, head)
    }
}

/// Encrypted case number together with the monitor cookie it was issued
/// under. The portal only resolves the number for that same cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncBinding {
    pub enc_case_no: String,
    pub monitor_id: String,
}

/// A case document as extracted from a portal lookup. Fields are already
/// bounded and validated by the session layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCaseDocument {
    pub case_key: String,
    pub enc: Option<EncBinding>,
    pub basic: BTreeMap<String, String>,
    pub hearings: Vec<HearingEntry>,
    pub progress: Vec<ProgressEntry>,
}

/// Persisted view of a case at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseSnapshot {
    pub case_id: String,
    pub category: CaseCategory,
    pub basic: BTreeMap<String, String>,
    pub hearings: Vec<HearingEntry>,
    pub progress: Vec<ProgressEntry>,
    pub content_hash: String,
    pub captured_at: DateTime<Utc>,
}

// =============================================================================
// UPDATE DELTAS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    HearingNew,
    HearingChanged,
    HearingCanceled,
    HearingResult,
    DocumentFiled,
    DocumentServed,
    Served,
    ResultAnnounced,
    AppealFiled,
    StatusChanged,
    Other,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::HearingNew => "hearing_new",
            UpdateType::HearingChanged => "hearing_changed",
            UpdateType::HearingCanceled => "hearing_canceled",
            UpdateType::HearingResult => "hearing_result",
            UpdateType::DocumentFiled => "document_filed",
            UpdateType::DocumentServed => "document_served",
            UpdateType::Served => "served",
            UpdateType::ResultAnnounced => "result_announced",
            UpdateType::AppealFiled => "appeal_filed",
            UpdateType::StatusChanged => "status_changed",
            UpdateType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    High,
    Normal,
    Low,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Importance::High => "high",
            Importance::Normal => "normal",
            Importance::Low => "low",
        }
    }
}

/// A detected change, before it is attached to a case and timestamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseUpdate {
    pub update_type: UpdateType,
    pub summary: String,
    pub importance: Importance,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// A persisted update-delta record. `read_at` stays empty until a downstream
/// reader marks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseUpdateRecord {
    pub id: Uuid,
    pub case_id: String,
    pub update_type: UpdateType,
    pub summary: String,
    pub importance: Importance,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl CaseUpdateRecord {
    pub fn new(case_id: &str, update: CaseUpdate, detected_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            case_id: case_id.to_string(),
            update_type: update.update_type,
            summary: update.summary,
            importance: update.importance,
            old_value: update.old_value,
            new_value: update.new_value,
            detected_at,
            read_at: None,
        }
    }
}

// =============================================================================
// SYNC REQUESTS & RESULTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Sequential,
    Parallel,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Sequential => write!(f, "sequential"),
            SyncMode::Parallel => write!(f, "parallel"),
        }
    }
}

/// A case offered to a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCandidate {
    pub case_id: String,
    pub case_number: String,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Input to the single-case handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseSyncRequest {
    pub case_id: String,
    pub case_number: String,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CaseSyncOutcome {
    Synced { update_count: usize },
    Skipped,
}

/// One processed item of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub case_id: String,
    pub case_number: String,
    pub success: bool,
    #[serde(default)]
    pub skipped: bool,
    pub update_count: usize,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A case number rejected before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseFailure {
    pub case_id: String,
    pub raw: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Partial,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Partial => "partial",
        }
    }
}

/// The one record a batch run leaves behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: Uuid,
    pub action: String,
    pub status: SyncStatus,
    pub mode: SyncMode,
    pub total_cases: usize,
    pub cases_synced: usize,
    pub cases_failed: usize,
    pub total_updates: usize,
    pub duration_ms: u64,
    /// Truncated sample of individual results.
    pub results: Vec<SyncResult>,
    pub created_at: DateTime<Utc>,
}

/// Everything a batch run produced, for the caller. The log entry is the
/// persisted subset.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub log: SyncLogEntry,
    pub results: Vec<SyncResult>,
    pub parse_errors: Vec<ParseFailure>,
    pub skipped_recent: usize,
    pub aborted: bool,
}

impl BatchReport {
    pub fn total_count(&self) -> usize {
        self.results.len()
    }

    pub fn avg_time_per_case_ms(&self) -> u64 {
        if self.results.is_empty() {
            0
        } else {
            self.log.duration_ms / self.results.len() as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_key_truncates_content() {
        let entry = ProgressEntry {
            date: "2025.01.02".into(),
            content: "가".repeat(80),
            result: None,
        };
        let key = entry.key();
        assert_eq!(key.chars().count(), "2025.01.02_".chars().count() + 50);
    }

    #[test]
    fn test_sync_request_accepts_camel_case() {
        let req: CaseSyncRequest = serde_json::from_str(
            r#"{"caseId":"c1","caseNumber":"2024가단1","forceRefresh":true}"#,
        )
        .unwrap();
        assert_eq!(req.case_id, "c1");
        assert!(req.force_refresh);

        let req: CaseSyncRequest =
            serde_json::from_str(r#"{"caseId":"c2","caseNumber":"2024가단2"}"#).unwrap();
        assert!(!req.force_refresh);
    }

    #[test]
    fn test_sync_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&SyncMode::Parallel).unwrap(), "\"parallel\"");
        assert_eq!(SyncMode::Sequential.to_string(), "sequential");
    }

    #[test]
    fn test_importance_orders_high_first() {
        let mut levels = vec![Importance::Low, Importance::High, Importance::Normal];
        levels.sort();
        assert_eq!(levels, vec![Importance::High, Importance::Normal, Importance::Low]);
    }
}
