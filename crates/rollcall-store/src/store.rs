//! SQLite-backed subject registry, gallery source and attendance table.

use crate::models::{ReportRow, SubjectProfile};
use crate::schema;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{
    AttendanceRecord, AttendanceStore, Embedding, GallerySource, RawSubject, SourceError,
    SubjectRegistry, Timestamp,
};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("invalid subject: {0}")]
    Validation(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err.into())
    }
}

/// Attendance row as stored, before timestamp parsing.
type RawRecord = (String, String, Option<String>, Option<String>);

/// Handle to the attendance database. Cheap to clone; all clones share one
/// background connection thread.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Validation(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|c| {
            schema::init(c)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Insert or replace a subject's profile and reference embedding.
    pub async fn register_subject(
        &self,
        profile: SubjectProfile,
        embedding: &serde_json::Value,
    ) -> Result<(), StoreError> {
        for (field, value) in [
            ("subject_id", &profile.subject_id),
            ("first_name", &profile.first_name),
            ("last_name", &profile.last_name),
        ] {
            if value.trim().is_empty() {
                return Err(StoreError::Validation(format!("{field} is required")));
            }
        }
        let embedding = Embedding::from_json(embedding)
            .map_err(|e| StoreError::Validation(format!("embedding: {e}")))?;
        let encoded = serde_json::to_string(&embedding)
            .map_err(|e| StoreError::Validation(format!("embedding: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let subject_id = profile.subject_id.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO subjects (
                        subject_id, first_name, last_name, middle_name,
                        course, year_level, section, email, embedding, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                     ON CONFLICT (subject_id) DO UPDATE SET
                        first_name = excluded.first_name,
                        last_name = excluded.last_name,
                        middle_name = excluded.middle_name,
                        course = excluded.course,
                        year_level = excluded.year_level,
                        section = excluded.section,
                        email = excluded.email,
                        embedding = excluded.embedding,
                        updated_at = excluded.updated_at",
                    params![
                        profile.subject_id,
                        profile.first_name,
                        profile.last_name,
                        profile.middle_name,
                        profile.course,
                        profile.year_level,
                        profile.section,
                        profile.email,
                        encoded,
                        now,
                    ],
                )?;
                Ok(())
            })
            .await?;

        tracing::info!(subject = %subject_id, "subject registered");
        Ok(())
    }

    /// All registered subjects, ordered by id.
    pub async fn list_subjects(&self) -> Result<Vec<SubjectProfile>, StoreError> {
        let rows = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare(
                    "SELECT subject_id, first_name, last_name, middle_name,
                            course, year_level, section, email
                     FROM subjects ORDER BY subject_id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(SubjectProfile {
                            subject_id: row.get(0)?,
                            first_name: row.get(1)?,
                            last_name: row.get(2)?,
                            middle_name: row.get(3)?,
                            course: row.get(4)?,
                            year_level: row.get(5)?,
                            section: row.get(6)?,
                            email: row.get(7)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    pub async fn subject_count(&self) -> Result<u64, StoreError> {
        self.count("SELECT COUNT(*) FROM subjects").await
    }

    pub async fn attendance_count(&self) -> Result<u64, StoreError> {
        self.count("SELECT COUNT(*) FROM attendance").await
    }

    async fn count(&self, sql: &'static str) -> Result<u64, StoreError> {
        let n: i64 = self
            .conn
            .call(move |c| Ok(c.query_row(sql, [], |row| row.get(0))?))
            .await?;
        u64::try_from(n).map_err(|_| StoreError::Corrupt(format!("negative count {n}")))
    }

    /// Attendance rows with `from <= date <= to`, newest day first, then by
    /// last and first name.
    pub async fn attendance_report(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        subject_id: Option<String>,
    ) -> Result<Vec<ReportRow>, StoreError> {
        let from = from.to_string();
        let to = to.to_string();
        let raw = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT s.subject_id, s.first_name, s.last_name,
                            a.date, a.time_in, a.time_out, a.status, a.remarks
                     FROM attendance a
                     JOIN subjects s ON s.subject_id = a.subject_id
                     WHERE a.date BETWEEN ?1 AND ?2
                       AND (?3 IS NULL OR s.subject_id = ?3)
                     ORDER BY a.date DESC, s.last_name, s.first_name",
                )?;
                let rows = stmt
                    .query_map(params![from, to, subject_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, Option<String>>(6)?,
                            row.get::<_, Option<String>>(7)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        raw.into_iter()
            .map(
                |(subject_id, first_name, last_name, date, time_in, time_out, status, remarks)| {
                    Ok(ReportRow {
                        subject_id,
                        first_name,
                        last_name,
                        date: parse_date(&date)?,
                        time_in: parse_optional_timestamp(time_in)?,
                        time_out: parse_optional_timestamp(time_out)?,
                        status,
                        remarks,
                    })
                },
            )
            .collect()
    }

    /// Set the operator status and remarks on an existing attendance row.
    /// Returns false when the subject has no row for `date`. Time fields are
    /// left untouched.
    pub async fn annotate_attendance(
        &self,
        subject_id: &str,
        date: NaiveDate,
        status: Option<String>,
        remarks: Option<String>,
    ) -> Result<bool, StoreError> {
        let key = (subject_id.to_string(), date.to_string());
        let changed = self
            .conn
            .call(move |c| {
                let n = c.execute(
                    "UPDATE attendance
                     SET status = COALESCE(?3, status), remarks = COALESCE(?4, remarks)
                     WHERE subject_id = ?1 AND date = ?2",
                    params![key.0, key.1, status, remarks],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed == 1)
    }

    async fn load_record(
        &self,
        subject_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let key = (subject_id.to_string(), date.to_string());
        let raw: Option<RawRecord> = self
            .conn
            .call(move |c| {
                let row = c
                    .query_row(
                        "SELECT subject_id, date, time_in, time_out
                         FROM attendance WHERE subject_id = ?1 AND date = ?2",
                        params![key.0, key.1],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        raw.map(|(subject_id, date, time_in, time_out)| {
            Ok(AttendanceRecord {
                subject_id,
                date: parse_date(&date)?,
                time_in: parse_optional_timestamp(time_in)?,
                time_out: parse_optional_timestamp(time_out)?,
            })
        })
        .transpose()
    }

    async fn compare_and_set(
        &self,
        record: &AttendanceRecord,
        expected_prior: Option<&AttendanceRecord>,
    ) -> Result<bool, StoreError> {
        let subject_id = record.subject_id.clone();
        let date = record.date.to_string();
        let time_in = record.time_in.map(|t| t.to_rfc3339());
        let time_out = record.time_out.map(|t| t.to_rfc3339());
        let prior = expected_prior.map(|p| {
            (
                p.time_in.map(|t| t.to_rfc3339()),
                p.time_out.map(|t| t.to_rfc3339()),
            )
        });

        let changed = self
            .conn
            .call(move |c| {
                let n = match prior {
                    None => c.execute(
                        "INSERT INTO attendance (subject_id, date, time_in, time_out)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT (subject_id, date) DO NOTHING",
                        params![subject_id, date, time_in, time_out],
                    )?,
                    Some((prior_in, prior_out)) => c.execute(
                        "UPDATE attendance SET time_in = ?3, time_out = ?4
                         WHERE subject_id = ?1 AND date = ?2
                           AND time_in IS ?5 AND time_out IS ?6",
                        params![subject_id, date, time_in, time_out, prior_in, prior_out],
                    )?,
                };
                Ok(n)
            })
            .await?;
        Ok(changed == 1)
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| StoreError::Corrupt(format!("invalid date '{value}': {e}")))
}

fn parse_optional_timestamp(value: Option<String>) -> Result<Option<Timestamp>, StoreError> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(&v)
                .map_err(|e| StoreError::Corrupt(format!("invalid timestamp '{v}': {e}")))
        })
        .transpose()
}

#[async_trait]
impl GallerySource for SqliteStore {
    async fn list(&self) -> Result<Vec<RawSubject>, SourceError> {
        let rows = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare(
                    "SELECT subject_id, first_name, last_name, middle_name,
                            course, year_level, section, email, embedding
                     FROM subjects ORDER BY created_at, subject_id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        let profile = SubjectProfile {
                            subject_id: row.get(0)?,
                            first_name: row.get(1)?,
                            last_name: row.get(2)?,
                            middle_name: row.get(3)?,
                            course: row.get(4)?,
                            year_level: row.get(5)?,
                            section: row.get(6)?,
                            email: row.get(7)?,
                        };
                        Ok((profile, row.get::<_, String>(8)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(StoreError::from)?;

        let mut subjects = Vec::with_capacity(rows.len());
        for (profile, embedding) in rows {
            subjects.push(RawSubject {
                id: profile.subject_id.clone(),
                // Stored as text; the gallery resolves it into a vector.
                embedding: serde_json::Value::String(embedding),
                metadata: serde_json::to_value(&profile)?,
            });
        }
        Ok(subjects)
    }
}

#[async_trait]
impl SubjectRegistry for SqliteStore {
    async fn exists(&self, subject_id: &str) -> Result<bool, SourceError> {
        let id = subject_id.to_string();
        let found = self
            .conn
            .call(move |c| {
                let row = c
                    .query_row("SELECT 1 FROM subjects WHERE subject_id = ?1", [id], |_| Ok(()))
                    .optional()?;
                Ok(row.is_some())
            })
            .await
            .map_err(StoreError::from)?;
        Ok(found)
    }
}

#[async_trait]
impl AttendanceStore for SqliteStore {
    async fn get_record(
        &self,
        subject_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, SourceError> {
        Ok(self.load_record(subject_id, date).await?)
    }

    async fn upsert_record(
        &self,
        record: &AttendanceRecord,
        expected_prior: Option<&AttendanceRecord>,
    ) -> Result<bool, SourceError> {
        Ok(self.compare_and_set(record, expected_prior).await?)
    }
}
