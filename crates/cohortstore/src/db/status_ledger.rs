//! File status ledger — one storage partition per job.
//!
//! One row per (job, file) holding the file's terminal anonymisation and
//! verification outcome. Layout mirrors the expectation ledger: lazily
//! created per-job tables, dropped when the job completes.

use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::model::FileStatusRecord;

use super::{is_unique_violation, parse_uuid};

pub(crate) fn table_name(job_id: Uuid) -> String {
    format!("statuses_{}", job_id.simple())
}

pub(crate) fn partition_exists(conn: &Connection, job_id: Uuid) -> Result<bool> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table_name(job_id)],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

fn ensure_partition(conn: &Connection, job_id: Uuid) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            job_id TEXT NOT NULL,
            file_id TEXT PRIMARY KEY,
            source_path TEXT NOT NULL,
            output_path TEXT,
            extracted_status TEXT NOT NULL,
            verified_status TEXT NOT NULL,
            status_message TEXT
        );",
        table_name(job_id)
    ))?;
    Ok(())
}

pub(crate) fn status_from_row(row: &Row<'_>) -> rusqlite::Result<FileStatusRecord> {
    Ok(FileStatusRecord {
        job_id: parse_uuid(&row.get::<_, String>("job_id")?)?,
        file_id: parse_uuid(&row.get::<_, String>("file_id")?)?,
        source_path: row.get("source_path")?,
        output_path: row.get("output_path")?,
        extracted: row
            .get::<_, String>("extracted_status")?
            .parse()
            .map_err(super::column_error)?,
        verified: row
            .get::<_, String>("verified_status")?
            .parse()
            .map_err(super::column_error)?,
        status_message: row.get("status_message")?,
    })
}

/// Records the status for one (job, file) pair. A second submission for the
/// same file loses against the primary key and is reported as a duplicate.
pub fn record_status(conn: &Connection, record: &FileStatusRecord) -> Result<()> {
    ensure_partition(conn, record.job_id)?;

    let res = conn.execute(
        &format!(
            "INSERT INTO {} (job_id, file_id, source_path, output_path,
             extracted_status, verified_status, status_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            table_name(record.job_id)
        ),
        params![
            record.job_id.to_string(),
            record.file_id.to_string(),
            record.source_path,
            record.output_path,
            record.extracted.as_str(),
            record.verified.as_str(),
            record.status_message,
        ],
    );

    match res {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateFile {
            job_id: record.job_id,
            file_id: record.file_id,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Bulk write used by the verification flush path. The caller supplies the
/// transaction; every record lands or the whole call errors.
pub fn insert_many(conn: &Connection, records: &[FileStatusRecord]) -> Result<()> {
    for record in records {
        record_status(conn, record)?;
    }
    Ok(())
}

/// Number of statuses recorded for the job so far.
pub fn count(conn: &Connection, job_id: Uuid) -> Result<u64> {
    if !partition_exists(conn, job_id)? {
        return Ok(0);
    }
    let count: u64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", table_name(job_id)),
        [],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Loads every status recorded for the job.
pub fn all_records(conn: &Connection, job_id: Uuid) -> Result<Vec<FileStatusRecord>> {
    if !partition_exists(conn, job_id)? {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM {} ORDER BY file_id",
        table_name(job_id)
    ))?;
    let records = stmt
        .query_map([], status_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// Drops the job's partition. Part of the completion transaction.
pub(crate) fn drop_partition(conn: &Connection, job_id: Uuid) -> Result<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", table_name(job_id)))?;
    Ok(())
}
