//! rollcall-store — SQLite persistence for rollcall.
//!
//! One database holds registered subjects (profile + reference embedding)
//! and the per-day attendance table the ledger writes to.

pub mod models;
mod schema;
pub mod store;

use std::path::PathBuf;

pub use models::{ReportRow, SubjectProfile};
pub use store::{SqliteStore, StoreError};

/// `$XDG_DATA_HOME/rollcall/attendance.db`, falling back to `~/.local/share`.
pub fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
        .join("attendance.db")
}
