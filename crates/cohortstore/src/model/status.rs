//! Per-file terminal status records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of the anonymisation/extraction stage for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractedFileStatus {
    Pending,
    Anonymised,
    ErrorRetryable,
    ErrorPermanent,
}

impl ExtractedFileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractedFileStatus::Pending => "pending",
            ExtractedFileStatus::Anonymised => "anonymised",
            ExtractedFileStatus::ErrorRetryable => "error_retryable",
            ExtractedFileStatus::ErrorPermanent => "error_permanent",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ExtractedFileStatus::ErrorRetryable | ExtractedFileStatus::ErrorPermanent
        )
    }
}

impl std::str::FromStr for ExtractedFileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExtractedFileStatus::Pending),
            "anonymised" => Ok(ExtractedFileStatus::Anonymised),
            "error_retryable" => Ok(ExtractedFileStatus::ErrorRetryable),
            "error_permanent" => Ok(ExtractedFileStatus::ErrorPermanent),
            other => Err(format!("unknown extracted file status '{}'", other)),
        }
    }
}

/// Verdict of the verification stage for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifiedFileStatus {
    NotVerified,
    Identifiable,
    NotIdentifiable,
}

impl VerifiedFileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifiedFileStatus::NotVerified => "not_verified",
            VerifiedFileStatus::Identifiable => "identifiable",
            VerifiedFileStatus::NotIdentifiable => "not_identifiable",
        }
    }
}

impl std::str::FromStr for VerifiedFileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_verified" => Ok(VerifiedFileStatus::NotVerified),
            "identifiable" => Ok(VerifiedFileStatus::Identifiable),
            "not_identifiable" => Ok(VerifiedFileStatus::NotIdentifiable),
            other => Err(format!("unknown verified file status '{}'", other)),
        }
    }
}

/// The terminal status for one file of a job. Exactly one record exists per
/// (job, file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatusRecord {
    pub job_id: Uuid,
    pub file_id: Uuid,
    pub source_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    pub extracted: ExtractedFileStatus,
    pub verified: VerifiedFileStatus,
    /// Failure reason from the extraction stage, or the verification report
    /// payload. Only absent for files that never produced either.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_extracted_status_round_trips() {
        for status in [
            ExtractedFileStatus::Pending,
            ExtractedFileStatus::Anonymised,
            ExtractedFileStatus::ErrorRetryable,
            ExtractedFileStatus::ErrorPermanent,
        ] {
            assert_eq!(ExtractedFileStatus::from_str(status.as_str()), Ok(status));
        }
        assert!(ExtractedFileStatus::from_str("copied").is_err());
    }

    #[test]
    fn test_verified_status_round_trips() {
        for status in [
            VerifiedFileStatus::NotVerified,
            VerifiedFileStatus::Identifiable,
            VerifiedFileStatus::NotIdentifiable,
        ] {
            assert_eq!(VerifiedFileStatus::from_str(status.as_str()), Ok(status));
        }
        assert!(VerifiedFileStatus::from_str("clean").is_err());
    }

    #[test]
    fn test_is_error() {
        assert!(ExtractedFileStatus::ErrorRetryable.is_error());
        assert!(ExtractedFileStatus::ErrorPermanent.is_error());
        assert!(!ExtractedFileStatus::Anonymised.is_error());
        assert!(!ExtractedFileStatus::Pending.is_error());
    }
}
