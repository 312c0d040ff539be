//! The per-job registry record and its lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an extraction job.
///
/// Live registry records only ever hold the first four states; `Completed`
/// appears exclusively on archived records, since completion is a removal
/// into the archive rather than an in-place flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractJobStatus {
    WaitingForCollectionInfo,
    WaitingForStatuses,
    ReadyForChecks,
    Failed,
    Completed,
}

impl ExtractJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractJobStatus::WaitingForCollectionInfo => "waiting_for_collection_info",
            ExtractJobStatus::WaitingForStatuses => "waiting_for_statuses",
            ExtractJobStatus::ReadyForChecks => "ready_for_checks",
            ExtractJobStatus::Failed => "failed",
            ExtractJobStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for ExtractJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting_for_collection_info" => Ok(ExtractJobStatus::WaitingForCollectionInfo),
            "waiting_for_statuses" => Ok(ExtractJobStatus::WaitingForStatuses),
            "ready_for_checks" => Ok(ExtractJobStatus::ReadyForChecks),
            "failed" => Ok(ExtractJobStatus::Failed),
            "completed" => Ok(ExtractJobStatus::Completed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

impl std::fmt::Display for ExtractJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic details recorded when a job is marked as failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailureInfo {
    pub failed_at: DateTime<Utc>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inner_message: Option<String>,
}

impl JobFailureInfo {
    /// Builds failure info from an error chain. The direct message comes
    /// from the error itself, the inner message from its source (if any).
    pub fn from_error(error: &dyn std::error::Error, failed_at: DateTime<Utc>) -> Self {
        Self {
            failed_at,
            message: error.to_string(),
            stack: None,
            inner_message: error.source().map(|s| s.to_string()),
        }
    }
}

/// One in-progress extraction job. Owned exclusively by the store from
/// creation until removal (completed) or terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractJobRecord {
    /// Globally unique job identifier, assigned upstream.
    pub job_id: Uuid,
    pub status: ExtractJobStatus,
    pub project_number: String,
    pub extraction_directory: String,
    pub submitted_at: DateTime<Utc>,
    /// Name of the identifier type used to select images, e.g.
    /// "SeriesInstanceUID".
    pub key_tag: String,
    /// Declared number of distinct keys the job fans out into. Always >= 1.
    pub key_count: u32,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modality: Option<String>,
    pub is_identifiable: bool,
    pub is_no_filter: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<JobFailureInfo>,
}

/// Sealed copy of a job held in the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedJobRecord {
    #[serde(flatten)]
    pub job: ExtractJobRecord,
    pub completed_at: DateTime<Utc>,
}

impl CompletedJobRecord {
    /// Seals a live record for archival.
    pub fn seal(mut job: ExtractJobRecord, completed_at: DateTime<Utc>) -> Self {
        job.status = ExtractJobStatus::Completed;
        Self { job, completed_at }
    }
}
