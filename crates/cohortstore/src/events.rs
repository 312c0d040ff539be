//! Parsed inbound bus events.
//!
//! The transport (delivery, acknowledgement, retry) lives outside this
//! crate; what arrives here is an already-parsed event plus an opaque
//! delivery token the caller acknowledges once the corresponding store
//! operation has succeeded. Structural validation happens before any store
//! write so malformed events never touch a ledger.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::model::{
    ExpectedFile, ExtractJobRecord, ExtractJobStatus, ExtractedFileStatus, FileStatusRecord,
    KeyExpectationRecord, VerifiedFileStatus,
};

/// Opaque bus delivery token, acknowledged by the caller after the matching
/// store write succeeds.
pub type DeliveryToken = u64;

fn require_non_blank(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(StoreError::Validation(format!("{} must not be blank", field)));
    }
    Ok(())
}

/// A new extraction job was submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmitted {
    pub job_id: Uuid,
    pub project_number: String,
    pub extraction_directory: String,
    pub submitted_at: DateTime<Utc>,
    pub key_tag: String,
    pub key_count: u32,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modality: Option<String>,
    pub is_identifiable: bool,
    pub is_no_filter: bool,
}

impl JobSubmitted {
    pub fn validate(&self) -> Result<()> {
        require_non_blank("projectNumber", &self.project_number)?;
        require_non_blank("extractionDirectory", &self.extraction_directory)?;
        require_non_blank("keyTag", &self.key_tag)?;
        require_non_blank("user", &self.user_name)?;
        if self.key_count == 0 {
            return Err(StoreError::Validation("keyCount must be at least 1".into()));
        }
        if let Some(modality) = &self.modality {
            require_non_blank("modality", modality)?;
        }
        Ok(())
    }

    pub fn to_record(&self) -> ExtractJobRecord {
        ExtractJobRecord {
            job_id: self.job_id,
            status: ExtractJobStatus::WaitingForCollectionInfo,
            project_number: self.project_number.clone(),
            extraction_directory: self.extraction_directory.clone(),
            submitted_at: self.submitted_at,
            key_tag: self.key_tag.clone(),
            key_count: self.key_count,
            user_name: self.user_name.clone(),
            modality: self.modality.clone(),
            is_identifiable: self.is_identifiable,
            is_no_filter: self.is_no_filter,
            failure_info: None,
        }
    }
}

/// One key of a job was resolved to its expected files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyResolved {
    pub job_id: Uuid,
    pub key: String,
    pub files: Vec<ExpectedFile>,
    /// Rejection reason -> count for identifiers under this key that were
    /// excluded from extraction.
    #[serde(default)]
    pub rejection_reasons: BTreeMap<String, u32>,
}

impl KeyResolved {
    pub fn validate(&self) -> Result<()> {
        require_non_blank("key", &self.key)?;
        for file in &self.files {
            require_non_blank("files[].outputPath", &file.output_path)?;
        }
        Ok(())
    }

    pub fn to_record(&self) -> KeyExpectationRecord {
        KeyExpectationRecord {
            job_id: self.job_id,
            key: self.key.clone(),
            expected_files: self.files.clone(),
            rejections: self.rejection_reasons.clone(),
        }
    }
}

/// The extraction stage reported a terminal (non-success) outcome for a
/// file. Successful files travel on the verification path instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatusReported {
    pub job_id: Uuid,
    pub file_id: Uuid,
    pub source_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    pub extracted_status: ExtractedFileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl FileStatusReported {
    pub fn validate(&self) -> Result<()> {
        require_non_blank("sourcePath", &self.source_path)?;
        match self.extracted_status {
            ExtractedFileStatus::Pending => {
                return Err(StoreError::Validation(
                    "extractedStatus was still pending".into(),
                ));
            }
            ExtractedFileStatus::Anonymised => {
                return Err(StoreError::Validation(
                    "received a successful anonymisation on the failure path".into(),
                ));
            }
            _ => {}
        }
        match &self.status_message {
            Some(message) => require_non_blank("statusMessage", message)?,
            None => {
                return Err(StoreError::Validation(
                    "a failure status requires a statusMessage".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn to_record(&self) -> FileStatusRecord {
        FileStatusRecord {
            job_id: self.job_id,
            file_id: self.file_id,
            source_path: self.source_path.clone(),
            output_path: self.output_path.clone(),
            extracted: self.extracted_status,
            verified: VerifiedFileStatus::NotVerified,
            status_message: self.status_message.clone(),
        }
    }
}

/// The verification stage produced a verdict and report for an anonymised
/// file. Highest-volume event type; routed through the write buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVerified {
    pub job_id: Uuid,
    pub file_id: Uuid,
    pub source_path: String,
    pub output_path: String,
    pub verified_status: VerifiedFileStatus,
    pub report: String,
}

impl FileVerified {
    pub fn validate(&self) -> Result<()> {
        require_non_blank("sourcePath", &self.source_path)?;
        require_non_blank("outputPath", &self.output_path)?;
        require_non_blank("report", &self.report)?;
        if self.verified_status == VerifiedFileStatus::Identifiable && self.report == "[]" {
            return Err(StoreError::Validation(
                "no report data for a file marked as identifiable".into(),
            ));
        }
        Ok(())
    }

    pub fn to_record(&self) -> FileStatusRecord {
        FileStatusRecord {
            job_id: self.job_id,
            file_id: self.file_id,
            source_path: self.source_path.clone(),
            output_path: Some(self.output_path.clone()),
            extracted: ExtractedFileStatus::Anonymised,
            verified: self.verified_status,
            status_message: Some(self.report.clone()),
        }
    }
}

/// One inbound bus event, any type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BusEvent {
    JobSubmitted(JobSubmitted),
    KeyResolved(KeyResolved),
    FileStatusReported(FileStatusReported),
    FileVerified(FileVerified),
}

impl BusEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            BusEvent::JobSubmitted(e) => e.job_id,
            BusEvent::KeyResolved(e) => e.job_id,
            BusEvent::FileStatusReported(e) => e.job_id,
            BusEvent::FileVerified(e) => e.job_id,
        }
    }
}
