//! In-process implementation of every collaborator trait.
//!
//! Backs tests and dry runs where no database is wanted.

use crate::gallery::{GallerySource, SourceError};
use crate::ledger::{AttendanceStore, SubjectRegistry};
use crate::types::{AttendanceRecord, RawSubject};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

#[derive(Debug, Default)]
pub struct MemoryStore {
    subjects: RwLock<Vec<RawSubject>>,
    records: Mutex<HashMap<(String, NaiveDate), AttendanceRecord>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new(subjects: Vec<RawSubject>) -> Self {
        Self {
            subjects: RwLock::new(subjects),
            ..Default::default()
        }
    }

    /// Registry-only store: ids are known but carry no embedding.
    pub fn with_subject_ids(ids: &[&str]) -> Self {
        Self::new(
            ids.iter()
                .map(|id| RawSubject {
                    id: id.to_string(),
                    embedding: serde_json::Value::Null,
                    metadata: serde_json::Value::Null,
                })
                .collect(),
        )
    }

    pub fn add_subject(&self, subject: RawSubject) {
        let mut subjects = match self.subjects.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subjects.retain(|s| s.id != subject.id);
        subjects.push(subject);
    }

    pub fn record(&self, subject_id: &str, date: NaiveDate) -> Option<AttendanceRecord> {
        self.lock_records()
            .get(&(subject_id.to_string(), date))
            .cloned()
    }

    /// Number of stored attendance records.
    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of conditional writes that were applied.
    pub fn successful_writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<(String, NaiveDate), AttendanceRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl GallerySource for MemoryStore {
    async fn list(&self) -> Result<Vec<RawSubject>, SourceError> {
        let subjects = match self.subjects.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(subjects.clone())
    }
}

#[async_trait]
impl SubjectRegistry for MemoryStore {
    async fn exists(&self, subject_id: &str) -> Result<bool, SourceError> {
        let subjects = match self.subjects.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(subjects.iter().any(|s| s.id == subject_id))
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn get_record(
        &self,
        subject_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, SourceError> {
        Ok(self.record(subject_id, date))
    }

    async fn upsert_record(
        &self,
        record: &AttendanceRecord,
        expected_prior: Option<&AttendanceRecord>,
    ) -> Result<bool, SourceError> {
        let key = (record.subject_id.clone(), record.date);
        let mut records = self.lock_records();
        if records.get(&key) != expected_prior {
            return Ok(false);
        }
        records.insert(key, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}
