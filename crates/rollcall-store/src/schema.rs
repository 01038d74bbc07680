use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS subjects (
    subject_id  TEXT PRIMARY KEY,
    first_name  TEXT NOT NULL,
    last_name   TEXT NOT NULL,
    middle_name TEXT,
    course      TEXT,
    year_level  TEXT,
    section     TEXT,
    email       TEXT,
    embedding   TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    subject_id TEXT NOT NULL REFERENCES subjects(subject_id) ON DELETE CASCADE,
    date       TEXT NOT NULL,
    time_in    TEXT,
    time_out   TEXT,
    status     TEXT,
    remarks    TEXT,
    PRIMARY KEY (subject_id, date)
);

CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
";

/// Connection pragmas plus table creation. Safe to run on every open.
pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    match conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0)) {
        Ok(mode) => tracing::debug!(mode = %mode, "journal mode set"),
        Err(err) => tracing::warn!(error = %err, "failed to enable WAL mode"),
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA)
}
