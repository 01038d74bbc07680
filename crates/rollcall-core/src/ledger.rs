//! Per-subject, per-day attendance ledger.
//!
//! Each (subject, date) pair owns at most one record whose `time_in` and
//! `time_out` fields are write-once. Writes go through the store's
//! conditional upsert: the ledger reads the current record, derives the next
//! state, and commits only if the stored record still equals what it read.
//! A lost race is re-read; the write-once rule then usually turns it into
//! [`Outcome::Ignored`].

use crate::gallery::SourceError;
use crate::types::{AttendanceRecord, EventKind, Outcome, RecordState, Timestamp};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use thiserror::Error;

/// Upper bound on read/compare/write rounds for one event. Two successful
/// writes complete a record, so three rounds always settle it.
const MAX_WRITE_ATTEMPTS: usize = 4;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("subject not found: {0}")]
    SubjectNotFound(String),
    #[error("ledger write failed: {0}")]
    WriteFailure(String),
}

/// Authority on which subject ids may receive attendance events.
#[async_trait]
pub trait SubjectRegistry: Send + Sync {
    async fn exists(&self, subject_id: &str) -> Result<bool, SourceError>;
}

/// Durable attendance rows with a compare-and-set write primitive.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn get_record(
        &self,
        subject_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, SourceError>;

    /// Write `record` only if the stored row for its key currently equals
    /// `expected_prior` (`None` meaning no row). Returns whether it wrote.
    async fn upsert_record(
        &self,
        record: &AttendanceRecord,
        expected_prior: Option<&AttendanceRecord>,
    ) -> Result<bool, SourceError>;
}

/// Next record after applying `kind` at `timestamp`, or `None` when the
/// targeted field is already set.
pub fn apply_event(
    prior: Option<&AttendanceRecord>,
    subject_id: &str,
    date: NaiveDate,
    kind: EventKind,
    timestamp: Timestamp,
) -> Option<AttendanceRecord> {
    if !RecordState::of(prior).accepts(kind) {
        return None;
    }

    let mut next = prior.cloned().unwrap_or_else(|| AttendanceRecord {
        subject_id: subject_id.to_string(),
        date,
        time_in: None,
        time_out: None,
    });
    match kind {
        EventKind::Arrival => next.time_in = Some(timestamp),
        EventKind::Departure => next.time_out = Some(timestamp),
    }
    Some(next)
}

/// Write-once attendance ledger over pluggable registry and storage.
#[derive(Clone)]
pub struct AttendanceLedger {
    registry: Arc<dyn SubjectRegistry>,
    store: Arc<dyn AttendanceStore>,
}

impl AttendanceLedger {
    pub fn new(registry: Arc<dyn SubjectRegistry>, store: Arc<dyn AttendanceStore>) -> Self {
        Self { registry, store }
    }

    /// Record an arrival or departure for the calendar day of `timestamp`.
    pub async fn record_event(
        &self,
        subject_id: &str,
        kind: EventKind,
        timestamp: Timestamp,
    ) -> Result<Outcome, LedgerError> {
        let known = self
            .registry
            .exists(subject_id)
            .await
            .map_err(|e| LedgerError::WriteFailure(format!("subject lookup: {e}")))?;
        if !known {
            return Err(LedgerError::SubjectNotFound(subject_id.to_string()));
        }

        let date = timestamp.date_naive();

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let prior = self
                .store
                .get_record(subject_id, date)
                .await
                .map_err(|e| LedgerError::WriteFailure(format!("read: {e}")))?;

            let Some(next) = apply_event(prior.as_ref(), subject_id, date, kind, timestamp) else {
                tracing::debug!(
                    subject = subject_id,
                    %date,
                    %kind,
                    "field already set; event ignored"
                );
                return Ok(Outcome::Ignored);
            };

            let written = self
                .store
                .upsert_record(&next, prior.as_ref())
                .await
                .map_err(|e| LedgerError::WriteFailure(format!("write: {e}")))?;

            if written {
                tracing::info!(
                    subject = subject_id,
                    %date,
                    %kind,
                    at = %timestamp,
                    "attendance recorded"
                );
                return Ok(Outcome::Recorded);
            }
            tracing::debug!(
                subject = subject_id,
                %date,
                attempt,
                "record changed underneath; retrying"
            );
        }

        Err(LedgerError::WriteFailure(format!(
            "record for {subject_id} on {date} kept changing after {MAX_WRITE_ATTEMPTS} attempts"
        )))
    }

    pub async fn get_record(
        &self,
        subject_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, LedgerError> {
        self.store
            .get_record(subject_id, date)
            .await
            .map_err(|e| LedgerError::WriteFailure(format!("read: {e}")))
    }
}
