//! Job repository: CRUD operations for the `jobs` table.
//!
//! Every write that changes a row's lifecycle state is a single statement,
//! either an `INSERT … ON CONFLICT` upsert or a conditional `UPDATE … WHERE`,
//! so concurrent writers in other processes cannot interleave a read and a
//! write on the same row.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// Column list shared by every `SELECT` and `RETURNING` clause.
const COLUMNS: &str = "rowid AS seq, id, parent_id, stage_name, queue, status, progress, attempt,
     started_at, finished_at, exception, order_in_chain, metadata, linkage_unresolved,
     version, expected_stages, created_at, updated_at";

/// A raw job row from the database.
#[derive(Debug, Clone, Default)]
pub struct JobRow {
    /// Insertion sequence (SQLite rowid); tie-breaker for equal `created_at`.
    pub seq: i64,
    pub id: String,
    pub parent_id: Option<String>,
    pub stage_name: String,
    pub queue: String,
    pub status: String,
    pub progress: i64,
    pub attempt: i64,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub exception: Option<String>,
    pub order_in_chain: i64,
    pub metadata: Option<String>,
    pub linkage_unresolved: bool,
    pub version: i64,
    /// JSON array of declared stage names (roots only).
    pub expected_stages: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            seq: row.get("seq")?,
            id: row.get("id")?,
            parent_id: row.get("parent_id")?,
            stage_name: row.get("stage_name")?,
            queue: row.get("queue")?,
            status: row.get("status")?,
            progress: row.get("progress")?,
            attempt: row.get("attempt")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            exception: row.get("exception")?,
            order_in_chain: row.get("order_in_chain")?,
            metadata: row.get("metadata")?,
            linkage_unresolved: row.get("linkage_unresolved")?,
            version: row.get("version")?,
            expected_stages: row.get("expected_stages")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Query filter parameters for root listing.
#[derive(Debug, Default, Clone)]
pub struct RootFilter {
    pub status: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

fn insert_row(conn: &Connection, job: &JobRow, or_ignore: bool) -> Result<usize, DatabaseError> {
    let conflict = if or_ignore {
        "ON CONFLICT(id) DO NOTHING"
    } else {
        ""
    };
    let sql = format!(
        "INSERT INTO jobs (id, parent_id, stage_name, queue, status, progress, attempt,
         started_at, finished_at, exception, order_in_chain, metadata, linkage_unresolved,
         expected_stages, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16) {}",
        conflict
    );
    let changed = conn.execute(
        &sql,
        params![
            job.id,
            job.parent_id,
            job.stage_name,
            job.queue,
            job.status,
            job.progress,
            job.attempt,
            job.started_at,
            job.finished_at,
            job.exception,
            job.order_in_chain,
            job.metadata,
            job.linkage_unresolved,
            job.expected_stages,
            job.created_at,
            job.updated_at,
        ],
    )?;
    Ok(changed)
}

/// Inserts a new job row. Fails if the id already exists.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| insert_row(conn, job, false).map(|_| ()))
}

/// Inserts the row unless its id is already taken. Returns `true` if inserted.
///
/// Racing callers creating the same root all succeed; exactly one inserts.
pub fn insert_if_absent(db: &Database, job: &JobRow) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| insert_row(conn, job, true).map(|changed| changed == 1))
}

/// Creates or overwrites the mutable fields of a row in one statement.
///
/// `attempt`, `version` and `created_at` of an existing row are preserved;
/// a `None` metadata never clears stored metadata.
pub fn upsert(db: &Database, job: &JobRow) -> Result<JobRow, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "INSERT INTO jobs (id, parent_id, stage_name, queue, status, progress, attempt,
             started_at, finished_at, exception, order_in_chain, metadata, linkage_unresolved,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET
               parent_id = COALESCE(excluded.parent_id, jobs.parent_id),
               stage_name = excluded.stage_name,
               queue = excluded.queue,
               status = excluded.status,
               progress = excluded.progress,
               started_at = COALESCE(excluded.started_at, jobs.started_at),
               finished_at = excluded.finished_at,
               exception = excluded.exception,
               order_in_chain = excluded.order_in_chain,
               metadata = COALESCE(excluded.metadata, jobs.metadata),
               linkage_unresolved = excluded.linkage_unresolved,
               updated_at = excluded.updated_at
             RETURNING {}",
            COLUMNS
        );
        let row = conn.query_row(
            &sql,
            params![
                job.id,
                job.parent_id,
                job.stage_name,
                job.queue,
                job.status,
                job.progress,
                job.attempt.max(1),
                job.started_at,
                job.finished_at,
                job.exception,
                job.order_in_chain,
                job.metadata,
                job.linkage_unresolved,
                job.created_at,
                job.updated_at,
            ],
            JobRow::from_row,
        )?;
        Ok(row)
    })
}

/// Records a stage start: creates the row as `processing`, or moves an
/// existing row back to `processing` as a new attempt.
///
/// The attempt counter only increments when the row had been started before,
/// so a row pre-registered as `pending` starts at attempt 1.
/// `job.started_at` must be set; it doubles as the creation time of new rows.
pub fn upsert_started(db: &Database, job: &JobRow) -> Result<JobRow, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "INSERT INTO jobs (id, parent_id, stage_name, queue, status, progress, attempt,
             started_at, order_in_chain, linkage_unresolved, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'processing', 0, 1, ?5, ?6, ?7, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
               status = 'processing',
               progress = 0,
               attempt = CASE WHEN jobs.started_at IS NULL THEN jobs.attempt
                              ELSE jobs.attempt + 1 END,
               started_at = excluded.started_at,
               finished_at = NULL,
               exception = NULL,
               queue = excluded.queue,
               parent_id = COALESCE(excluded.parent_id, jobs.parent_id),
               linkage_unresolved = CASE WHEN excluded.parent_id IS NOT NULL THEN 0
                                         ELSE jobs.linkage_unresolved END,
               updated_at = excluded.updated_at
             RETURNING {}",
            COLUMNS
        );
        let row = conn.query_row(
            &sql,
            params![
                job.id,
                job.parent_id,
                job.stage_name,
                job.queue,
                job.started_at,
                job.order_in_chain,
                job.linkage_unresolved,
            ],
            JobRow::from_row,
        )?;
        Ok(row)
    })
}

/// Moves a `processing` row of the given attempt into a terminal status.
///
/// Returns the number of rows changed: 0 means the row is missing, not
/// running, or belongs to a different attempt.
pub fn mark_terminal(
    db: &Database,
    id: &str,
    attempt: i64,
    status: &str,
    progress: Option<i64>,
    exception: Option<&str>,
    finished_at: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3, progress = COALESCE(?4, progress), exception = ?5,
             finished_at = ?6, updated_at = ?6
             WHERE id = ?1 AND attempt = ?2 AND status = 'processing'",
            params![id, attempt, status, progress, exception, finished_at],
        )?;
        Ok(changed)
    })
}

/// Fails a row only if it is still `processing` in the given attempt.
pub fn fail_if_processing(
    db: &Database,
    id: &str,
    attempt: i64,
    exception: &str,
    finished_at: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'failed', exception = ?3, finished_at = ?4, updated_at = ?4
             WHERE id = ?1 AND attempt = ?2 AND status = 'processing'",
            params![id, attempt, exception, finished_at],
        )?;
        Ok(changed)
    })
}

/// Resets a failed row to `pending` under the next attempt number.
///
/// `started_at` is cleared so the following start keeps that attempt; reports
/// still in flight for the failed attempt no longer match the row.
pub fn reset_failed(db: &Database, id: &str, updated_at: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'pending', progress = 0, exception = NULL,
             attempt = attempt + 1, started_at = NULL, finished_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'failed'",
            params![id, updated_at],
        )?;
        Ok(changed)
    })
}

/// Writes derived root fields if nobody else wrote the root since `expected_version`.
///
/// Returns the number of rows changed (0 on a version conflict).
pub fn update_root_aggregate(
    db: &Database,
    root: &JobRow,
    expected_version: i64,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3, progress = ?4, exception = ?5, started_at = ?6,
             finished_at = ?7, updated_at = ?8, version = version + 1
             WHERE id = ?1 AND version = ?2 AND parent_id IS NULL",
            params![
                root.id,
                expected_version,
                root.status,
                root.progress,
                root.exception,
                root.started_at,
                root.finished_at,
                root.updated_at,
            ],
        )?;
        Ok(changed)
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", COLUMNS);
        let row = conn
            .query_row(&sql, params![id], JobRow::from_row)
            .optional()?;
        Ok(row)
    })
}

/// Returns every row owned by `parent_id`, all attempts, oldest first.
pub fn children_of(db: &Database, parent_id: &str) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "SELECT {} FROM jobs WHERE parent_id = ?1 ORDER BY created_at ASC, rowid ASC",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![parent_id], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Returns stage rows still `processing` whose `started_at` is before `cutoff`.
///
/// Includes rows with unresolved linkage; excludes roots.
pub fn find_processing_started_before(
    db: &Database,
    cutoff: &str,
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "SELECT {} FROM jobs
             WHERE status = 'processing' AND started_at IS NOT NULL AND started_at < ?1
               AND (parent_id IS NOT NULL OR linkage_unresolved = 1)
             ORDER BY started_at ASC",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![cutoff], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Queries root rows with filters, returning (rows, total_count).
pub fn query_roots(db: &Database, filter: &RootFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = vec![
            "parent_id IS NULL".to_string(),
            "linkage_unresolved = 0".to_string(),
        ];
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }
        if let Some(ref from_date) = filter.from_date {
            conditions.push(format!("created_at >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(from_date.clone()));
        }
        if let Some(ref to_date) = filter.to_date {
            conditions.push(format!("created_at <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(to_date.clone()));
        }

        let where_clause = format!("WHERE {}", conditions.join(" AND "));

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT {} FROM jobs {} ORDER BY created_at DESC, rowid DESC LIMIT ?{} OFFSET ?{}",
            COLUMNS,
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Counts root rows with the given status.
pub fn count_roots_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs
             WHERE parent_id IS NULL AND linkage_unresolved = 0 AND status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
