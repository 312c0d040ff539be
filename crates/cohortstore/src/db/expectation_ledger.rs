//! Key expectation ledger — one storage partition per job.
//!
//! Each job gets its own deterministically-named table holding one row per
//! resolved key, so partition size is bounded by the job's key count rather
//! than the cohort size. Partitions are created lazily on first write and
//! dropped inside the completion transaction.

use std::collections::BTreeMap;

use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::model::{ExpectedFile, KeyExpectationRecord};

use super::is_unique_violation;

pub(crate) fn table_name(job_id: Uuid) -> String {
    format!("expected_files_{}", job_id.simple())
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
            key_value TEXT PRIMARY KEY,
            expected_files TEXT NOT NULL,
            expected_count INTEGER NOT NULL,
            rejections TEXT NOT NULL
        );",
        table_name(job_id)
    ))?;
    Ok(())
}

/// Records the expectation for one (job, key) pair. A second submission for
/// the same key loses against the primary key and is reported as a
/// duplicate, never merged.
pub fn record_expectation(conn: &Connection, record: &KeyExpectationRecord) -> Result<()> {
    ensure_partition(conn, record.job_id)?;

    let expected_files = serde_json::to_string(&record.expected_files)?;
    let rejections = serde_json::to_string(&record.rejections)?;

    let res = conn.execute(
        &format!(
            "INSERT INTO {} (job_id, key_value, expected_files, expected_count, rejections)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            table_name(record.job_id)
        ),
        params![
            record.job_id.to_string(),
            record.key,
            expected_files,
            record.expected_file_count(),
            rejections,
        ],
    );

    match res {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateKey {
            job_id: record.job_id,
            key: record.key.clone(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Returns `(keys_recorded, total_expected_files)` for the job. A job with
/// no partition yet has recorded nothing.
pub fn completeness(conn: &Connection, job_id: Uuid) -> Result<(u64, u64)> {
    if !partition_exists(conn, job_id)? {
        return Ok((0, 0));
    }

    let counts = conn.query_row(
        &format!(
            "SELECT COUNT(*), COALESCE(SUM(expected_count), 0) FROM {}",
            table_name(job_id)
        ),
        [],
        |r| Ok((r.get::<_, u64>(0)?, r.get::<_, u64>(1)?)),
    )?;
    Ok(counts)
}

/// Loads every expectation recorded for the job.
pub fn all_records(conn: &Connection, job_id: Uuid) -> Result<Vec<KeyExpectationRecord>> {
    if !partition_exists(conn, job_id)? {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT key_value, expected_files, rejections FROM {} ORDER BY key_value",
        table_name(job_id)
    ))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut records = Vec::with_capacity(rows.len());
    for (key, expected_files, rejections) in rows {
        let expected_files: Vec<ExpectedFile> = serde_json::from_str(&expected_files)?;
        let rejections: BTreeMap<String, u32> = serde_json::from_str(&rejections)?;
        records.push(KeyExpectationRecord {
            job_id,
            key,
            expected_files,
            rejections,
        });
    }
    Ok(records)
}

/// Drops the job's partition. Part of the completion transaction.
pub(crate) fn drop_partition(conn: &Connection, job_id: Uuid) -> Result<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", table_name(job_id)))?;
    Ok(())
}
