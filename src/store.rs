//! Persistence of labs and their measurements.
//!
//! The ingestor talks to a [`LabStore`] through a unit of work: one
//! [`LabUnitOfWork`] per document, committed once after every visit has been
//! written. Dropping a unit of work without committing rolls it back.
//!
//! [`SqliteLabStore`] keeps one connection behind a mutex. The uniqueness
//! rule "one lab per (pet, visit date, source)" lives in the schema as an
//! expression index, because SQLite treats NULLs in a plain UNIQUE index as
//! distinct and unknown dates are stored as NULL.

use crate::error::PersistenceError;
use crate::model::{Lab, LabTest, LabWithTests, NewLab, TestRecord};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Schema for the `labs` and `lab_tests` tables.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS labs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pet_id INTEGER NOT NULL,
    visit_date TEXT,
    created_at TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    source_path TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_labs_visit_key
    ON labs(pet_id, IFNULL(visit_date, 'unknown'), source_path);
CREATE INDEX IF NOT EXISTS idx_labs_pet ON labs(pet_id, visit_date);

CREATE TABLE IF NOT EXISTS lab_tests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lab_id INTEGER NOT NULL REFERENCES labs(id) ON DELETE CASCADE,
    test_name TEXT NOT NULL,
    value TEXT NOT NULL,
    unit TEXT NOT NULL,
    reference_range TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lab_tests_lab ON lab_tests(lab_id);
"#;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Outcome of inserting one lab.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(LabWithTests),
    /// The uniqueness constraint rejected the row; nothing was written.
    Conflict,
}

/// Storage for labs.
pub trait LabStore: Send + Sync {
    /// Start a unit of work. Holds the store's write lock until committed
    /// or dropped.
    fn begin(&self) -> Result<Box<dyn LabUnitOfWork + '_>, PersistenceError>;

    /// All labs of a subject with their tests, ordered by visit date
    /// (unknown dates first), then by id.
    fn labs_for_subject(&self, pet_id: i64) -> Result<Vec<LabWithTests>, PersistenceError>;

    /// Delete every lab of a subject (tests cascade). Returns labs removed.
    fn delete_subject(&self, pet_id: i64) -> Result<usize, PersistenceError>;
}

/// Writes belonging to one document.
pub trait LabUnitOfWork {
    fn find_by(
        &mut self,
        pet_id: i64,
        visit_date: Option<NaiveDate>,
        source_path: &str,
    ) -> Result<Option<Lab>, PersistenceError>;

    /// Insert a lab and one test row per record.
    fn insert_lab(
        &mut self,
        lab: &NewLab,
        records: &[TestRecord],
    ) -> Result<InsertOutcome, PersistenceError>;

    fn commit(self: Box<Self>) -> Result<(), PersistenceError>;
}

// ── SQLite ───────────────────────────────────────────────────────────────

/// [`LabStore`] on a single SQLite connection.
pub struct SqliteLabStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteLabStore {
    /// Open or create the database file, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PersistenceError::Open {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        }
        let conn = Connection::open(path).map_err(|e| PersistenceError::Open {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("SQLite journal mode: {}", mode);
        let store = Self::init(conn, Some(path.to_path_buf()))?;
        info!("Lab store opened at {}", path.display());
        Ok(store)
    }

    /// A private in-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, db_path: Option<PathBuf>) -> Result<Self, PersistenceError> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }
}

impl LabStore for SqliteLabStore {
    fn begin(&self) -> Result<Box<dyn LabUnitOfWork + '_>, PersistenceError> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteUnitOfWork {
            conn,
            finished: false,
        }))
    }

    fn labs_for_subject(&self, pet_id: i64) -> Result<Vec<LabWithTests>, PersistenceError> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare_cached(
            "SELECT id, pet_id, visit_date, created_at, content_hash, source_path
             FROM labs WHERE pet_id = ?1
             ORDER BY visit_date IS NOT NULL, visit_date, id",
        )?;
        let labs = stmt
            .query_map(params![pet_id], lab_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare_cached(
            "SELECT t.id, t.lab_id, t.test_name, t.value, t.unit, t.reference_range
             FROM lab_tests t JOIN labs l ON l.id = t.lab_id
             WHERE l.pet_id = ?1
             ORDER BY t.id",
        )?;
        let mut tests_by_lab: HashMap<i64, Vec<LabTest>> = HashMap::new();
        for test in stmt.query_map(params![pet_id], test_from_row)? {
            let test = test?;
            tests_by_lab.entry(test.lab_id).or_default().push(test);
        }

        Ok(labs
            .into_iter()
            .map(|lab| LabWithTests {
                tests: tests_by_lab.remove(&lab.id).unwrap_or_default(),
                lab,
            })
            .collect())
    }

    fn delete_subject(&self, pet_id: i64) -> Result<usize, PersistenceError> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM labs WHERE pet_id = ?1", params![pet_id])?;
        info!("Deleted {} labs for pet {}", removed, pet_id);
        Ok(removed)
    }
}

struct SqliteUnitOfWork<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl LabUnitOfWork for SqliteUnitOfWork<'_> {
    fn find_by(
        &mut self,
        pet_id: i64,
        visit_date: Option<NaiveDate>,
        source_path: &str,
    ) -> Result<Option<Lab>, PersistenceError> {
        let date = visit_date.map(|d| d.format(DATE_FORMAT).to_string());
        let lab = self
            .conn
            .prepare_cached(
                "SELECT id, pet_id, visit_date, created_at, content_hash, source_path
                 FROM labs
                 WHERE pet_id = ?1 AND visit_date IS ?2 AND source_path = ?3",
            )?
            .query_row(params![pet_id, date, source_path], lab_from_row)
            .optional()?;
        Ok(lab)
    }

    fn insert_lab(
        &mut self,
        lab: &NewLab,
        records: &[TestRecord],
    ) -> Result<InsertOutcome, PersistenceError> {
        let created_at = Utc::now();
        let date = lab.visit_date.map(|d| d.format(DATE_FORMAT).to_string());

        let inserted = self
            .conn
            .prepare_cached(
                "INSERT INTO labs (pet_id, visit_date, created_at, content_hash, source_path)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .insert(params![
                lab.pet_id,
                date,
                created_at.to_rfc3339(),
                lab.content_hash,
                lab.source_path
            ]);

        let lab_id = match inserted {
            Ok(id) => id,
            Err(rusqlite::Error::SqliteFailure(err, msg))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE {
                    debug!(
                        "Unique constraint hit for pet {} on {:?} ({})",
                        lab.pet_id, date, lab.source_path
                    );
                    return Ok(InsertOutcome::Conflict);
                }
                return Err(PersistenceError::Constraint(
                    msg.unwrap_or_else(|| err.to_string()),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let mut tests = Vec::with_capacity(records.len());
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO lab_tests (lab_id, test_name, value, unit, reference_range)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for record in records {
            let id = stmt.insert(params![
                lab_id,
                record.test_name,
                record.value,
                record.unit,
                record.reference_range
            ])?;
            tests.push(LabTest {
                id,
                lab_id,
                test_name: record.test_name.clone(),
                value: record.value.clone(),
                unit: record.unit.clone(),
                reference_range: record.reference_range.clone(),
            });
        }

        Ok(InsertOutcome::Inserted(LabWithTests {
            lab: Lab {
                id: lab_id,
                pet_id: lab.pet_id,
                visit_date: lab.visit_date,
                created_at,
                content_hash: lab.content_hash.clone(),
                source_path: lab.source_path.clone(),
            },
            tests,
        }))
    }

    fn commit(mut self: Box<Self>) -> Result<(), PersistenceError> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteUnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("Rollback failed: {}", e);
            }
        }
    }
}

fn lab_from_row(row: &Row<'_>) -> rusqlite::Result<Lab> {
    let visit_date: Option<String> = row.get(2)?;
    let created_at: String = row.get(3)?;
    Ok(Lab {
        id: row.get(0)?,
        pet_id: row.get(1)?,
        visit_date: visit_date
            .map(|d| NaiveDate::parse_from_str(&d, DATE_FORMAT))
            .transpose()
            .map_err(|e| conversion_error(2, e))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(3, e))?,
        content_hash: row.get(4)?,
        source_path: row.get(5)?,
    })
}

fn test_from_row(row: &Row<'_>) -> rusqlite::Result<LabTest> {
    Ok(LabTest {
        id: row.get(0)?,
        lab_id: row.get(1)?,
        test_name: row.get(2)?,
        value: row.get(3)?,
        unit: row.get(4)?,
        reference_range: row.get(5)?,
    })
}

fn conversion_error(column: usize, e: chrono::ParseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(e),
    )
}
