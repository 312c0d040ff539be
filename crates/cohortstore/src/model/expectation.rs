//! Per-key expectation records: which files a resolved key should produce.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One file the extraction stage promised to produce for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedFile {
    pub file_id: Uuid,
    pub output_path: String,
}

/// The full expectation for one (job, key) pair: the promised files plus a
/// histogram of rejection reasons for identifiers under the key that were
/// excluded from extraction.
///
/// Exactly one record exists per (job, key); a second submission for the
/// same key is a protocol violation, never a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExpectationRecord {
    pub job_id: Uuid,
    pub key: String,
    pub expected_files: Vec<ExpectedFile>,
    /// Rejection reason -> count of identifiers excluded for that reason.
    pub rejections: BTreeMap<String, u32>,
}

impl KeyExpectationRecord {
    pub fn expected_file_count(&self) -> u64 {
        self.expected_files.len() as u64
    }

    pub fn has_rejections(&self) -> bool {
        !self.rejections.is_empty()
    }
}
