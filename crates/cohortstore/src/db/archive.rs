//! Archive store — sealed records for completed jobs.
//!
//! Holds the immutable copy of each finished job plus the archived ledger
//! rows the reporting stage interrogates. Rows only ever arrive here through
//! the completion transaction.

use std::collections::BTreeMap;

use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::model::CompletedJobRecord;

use super::{expectation_ledger, format_timestamp, is_unique_violation, parse_timestamp,
    registry, status_ledger};

/// Rejection histogram archived for one key of a completed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRejectionInfo {
    pub key: String,
    /// Rejection reason -> count. Never empty.
    pub rejections: BTreeMap<String, u32>,
}

/// A file that failed anonymisation and so never reached verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAnonFailureInfo {
    pub source_path: String,
    pub reason: String,
}

/// A file the verification stage flagged as identifiable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVerificationFailureInfo {
    pub output_path: String,
    pub report: String,
}

/// Inserts the sealed copy of a job. A conflict means the job was already
/// archived.
pub fn insert_completed_job(conn: &Connection, record: &CompletedJobRecord) -> Result<()> {
    let job = &record.job;
    let failure = job.failure_info.as_ref();
    let res = conn.execute(
        "INSERT INTO completed_jobs (job_id, status, project_number, extraction_directory,
         submitted_at, key_tag, key_count, user_name, modality, is_identifiable,
         is_no_filter, failed_at, failure_message, failure_stack, failure_inner_message,
         completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            job.job_id.to_string(),
            job.status.as_str(),
            job.project_number,
            job.extraction_directory,
            format_timestamp(job.submitted_at),
            job.key_tag,
            job.key_count,
            job.user_name,
            job.modality,
            job.is_identifiable,
            job.is_no_filter,
            failure.map(|f| format_timestamp(f.failed_at)),
            failure.map(|f| f.message.clone()),
            failure.and_then(|f| f.stack.clone()),
            failure.and_then(|f| f.inner_message.clone()),
            format_timestamp(record.completed_at),
        ],
    );

    match res {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateJob(job.job_id)),
        Err(e) => Err(e.into()),
    }
}

/// True when a job with this id has already been archived.
pub fn contains(conn: &Connection, job_id: Uuid) -> Result<bool> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM completed_jobs WHERE job_id = ?1",
        params![job_id.to_string()],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Loads the sealed record for a completed job.
pub fn completed_job_info(conn: &Connection, job_id: Uuid) -> Result<CompletedJobRecord> {
    let mut stmt = conn.prepare("SELECT * FROM completed_jobs WHERE job_id = ?1")?;
    let mut rows = stmt.query_map(params![job_id.to_string()], |row| {
        let job = registry::job_from_row(row)?;
        let completed_at = parse_timestamp(&row.get::<_, String>("completed_at")?)?;
        Ok(CompletedJobRecord { job, completed_at })
    })?;
    match rows.next() {
        Some(Ok(record)) => Ok(record),
        Some(Err(e)) => Err(e.into()),
        None => Err(StoreError::NotFound(job_id)),
    }
}

/// Copies the job's expectation partition into the persistent archive table.
/// A missing or empty partition at completion time means the registry and
/// ledgers disagree about the job.
pub(crate) fn copy_expectations(conn: &Connection, job_id: Uuid) -> Result<()> {
    let (keys, _) = expectation_ledger::completeness(conn, job_id)?;
    if keys == 0 {
        return Err(StoreError::StoreInconsistency(format!(
            "expectation partition for job {} was missing or empty",
            job_id
        )));
    }

    conn.execute(
        &format!(
            "INSERT INTO completed_expected_files
             (job_id, key_value, expected_files, expected_count, rejections)
             SELECT job_id, key_value, expected_files, expected_count, rejections FROM {}",
            expectation_ledger::table_name(job_id)
        ),
        [],
    )?;
    Ok(())
}

/// Copies the job's status partition into the persistent archive table.
pub(crate) fn copy_statuses(conn: &Connection, job_id: Uuid) -> Result<()> {
    if status_ledger::count(conn, job_id)? == 0 {
        return Err(StoreError::StoreInconsistency(format!(
            "status partition for job {} was missing or empty",
            job_id
        )));
    }

    conn.execute(
        &format!(
            "INSERT INTO completed_statuses
             (job_id, file_id, source_path, output_path, extracted_status,
              verified_status, status_message)
             SELECT job_id, file_id, source_path, output_path, extracted_status,
              verified_status, status_message FROM {}",
            status_ledger::table_name(job_id)
        ),
        [],
    )?;
    Ok(())
}

/// Keys of a completed job whose histogram recorded at least one rejection.
pub fn completed_job_rejections(conn: &Connection, job_id: Uuid) -> Result<Vec<KeyRejectionInfo>> {
    let mut stmt = conn.prepare(
        "SELECT key_value, rejections FROM completed_expected_files
         WHERE job_id = ?1 ORDER BY key_value",
    )?;
    let rows = stmt
        .query_map(params![job_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut infos = Vec::new();
    for (key, rejections) in rows {
        let rejections: BTreeMap<String, u32> = serde_json::from_str(&rejections)?;
        if rejections.is_empty() {
            continue;
        }
        infos.push(KeyRejectionInfo { key, rejections });
    }
    Ok(infos)
}

/// Files of a completed job that failed anonymisation: never verified, and
/// the extraction stage reported an error.
pub fn completed_job_anonymisation_failures(
    conn: &Connection,
    job_id: Uuid,
) -> Result<Vec<FileAnonFailureInfo>> {
    let mut stmt = conn.prepare(
        "SELECT source_path, status_message FROM completed_statuses
         WHERE job_id = ?1
           AND verified_status = 'not_verified'
           AND extracted_status IN ('error_retryable', 'error_permanent')
         ORDER BY source_path",
    )?;
    let infos = stmt
        .query_map(params![job_id.to_string()], |row| {
            Ok(FileAnonFailureInfo {
                source_path: row.get(0)?,
                reason: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(infos)
}

/// Files of a completed job the verification stage flagged as identifiable,
/// with the report payload for each.
pub fn completed_job_verification_failures(
    conn: &Connection,
    job_id: Uuid,
) -> Result<Vec<FileVerificationFailureInfo>> {
    let mut stmt = conn.prepare(
        "SELECT output_path, status_message FROM completed_statuses
         WHERE job_id = ?1 AND verified_status = 'identifiable'
         ORDER BY output_path",
    )?;
    let infos = stmt
        .query_map(params![job_id.to_string()], |row| {
            Ok(FileVerificationFailureInfo {
                output_path: row.get(0)?,
                report: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(infos)
}
