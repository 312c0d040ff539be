//! Job registry — the authoritative status holder for in-progress jobs.
//!
//! One row per job in the `jobs` table. Rows are created on the first info
//! event, mutated only through the operations here, and removed when the job
//! is archived.

use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::model::{ExtractJobRecord, ExtractJobStatus, JobFailureInfo};

use super::{format_timestamp, is_unique_violation, parse_timestamp, parse_uuid};

pub(crate) fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ExtractJobRecord> {
    let job_id = parse_uuid(&row.get::<_, String>("job_id")?)?;
    let status: ExtractJobStatus = row
        .get::<_, String>("status")?
        .parse()
        .map_err(super::column_error)?;
    let submitted_at = parse_timestamp(&row.get::<_, String>("submitted_at")?)?;

    let failure_info = match row.get::<_, Option<String>>("failed_at")? {
        Some(failed_at) => Some(JobFailureInfo {
            failed_at: parse_timestamp(&failed_at)?,
            message: row.get("failure_message")?,
            stack: row.get("failure_stack")?,
            inner_message: row.get("failure_inner_message")?,
        }),
        None => None,
    };

    Ok(ExtractJobRecord {
        job_id,
        status,
        project_number: row.get("project_number")?,
        extraction_directory: row.get("extraction_directory")?,
        submitted_at,
        key_tag: row.get("key_tag")?,
        key_count: row.get("key_count")?,
        user_name: row.get("user_name")?,
        modality: row.get("modality")?,
        is_identifiable: row.get("is_identifiable")?,
        is_no_filter: row.get("is_no_filter")?,
        failure_info,
    })
}

/// Inserts a new job row. The caller must have checked the archive first;
/// registry duplicates surface here via the primary key.
pub fn insert(conn: &Connection, job: &ExtractJobRecord) -> Result<()> {
    let failure = job.failure_info.as_ref();
    let res = conn.execute(
        "INSERT INTO jobs (job_id, status, project_number, extraction_directory,
         submitted_at, key_tag, key_count, user_name, modality, is_identifiable,
         is_no_filter, failed_at, failure_message, failure_stack, failure_inner_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
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
        ],
    );

    match res {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateJob(job.job_id)),
        Err(e) => Err(e.into()),
    }
}

/// Finds a job by its id.
pub fn get(conn: &Connection, job_id: Uuid) -> Result<Option<ExtractJobRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM jobs WHERE job_id = ?1")?;
    let mut rows = stmt.query_map(params![job_id.to_string()], job_from_row)?;
    match rows.next() {
        Some(Ok(row)) => Ok(Some(row)),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

/// Returns every in-progress job, oldest submission first.
pub fn active_jobs(conn: &Connection) -> Result<Vec<ExtractJobRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY submitted_at, job_id")?;
    let jobs = stmt
        .query_map([], job_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(jobs)
}

/// Advances a job's status. The store's write must land on exactly one row;
/// anything else means the registry no longer matches what was just read.
pub fn update_status(conn: &Connection, job_id: Uuid, status: ExtractJobStatus) -> Result<()> {
    let rows = conn.execute(
        "UPDATE jobs SET status = ?2 WHERE job_id = ?1",
        params![job_id.to_string(), status.as_str()],
    )?;
    if rows != 1 {
        return Err(StoreError::StoreInconsistency(format!(
            "status update for job {} changed {} rows",
            job_id, rows
        )));
    }
    Ok(())
}

/// Marks a job as failed, recording the diagnostic info. Duplicate failure
/// deliveries are rejected rather than silently ignored, and never overwrite
/// the original failure info.
pub fn record_failure(conn: &Connection, job_id: Uuid, info: &JobFailureInfo) -> Result<()> {
    let job = get(conn, job_id)?.ok_or(StoreError::NotFound(job_id))?;
    if job.status == ExtractJobStatus::Failed || job.failure_info.is_some() {
        return Err(StoreError::AlreadyFailed(job_id));
    }

    let rows = conn.execute(
        "UPDATE jobs SET status = ?2, failed_at = ?3, failure_message = ?4,
         failure_stack = ?5, failure_inner_message = ?6
         WHERE job_id = ?1",
        params![
            job_id.to_string(),
            ExtractJobStatus::Failed.as_str(),
            format_timestamp(info.failed_at),
            info.message,
            info.stack,
            info.inner_message,
        ],
    )?;
    if rows != 1 {
        return Err(StoreError::StoreInconsistency(format!(
            "failure update for job {} changed {} rows",
            job_id, rows
        )));
    }
    Ok(())
}

/// Removes a job row as part of the completion transaction.
pub fn delete(conn: &Connection, job_id: Uuid) -> Result<()> {
    let rows = conn.execute(
        "DELETE FROM jobs WHERE job_id = ?1",
        params![job_id.to_string()],
    )?;
    if rows != 1 {
        return Err(StoreError::StoreInconsistency(format!(
            "delete for job {} changed {} rows",
            job_id, rows
        )));
    }
    Ok(())
}

/// Counts in-progress jobs.
pub fn count(conn: &Connection) -> Result<u64> {
    let count: u64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
    Ok(count)
}
