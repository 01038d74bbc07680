//! Gallery of known subjects.
//!
//! A [`GallerySnapshot`] is validated once at load time and never mutated.
//! [`GalleryCache`] hands out shared references to the current snapshot and
//! swaps in a new one on refresh; readers holding the old `Arc` keep a
//! complete view of the old gallery until they drop it.

use crate::types::{Embedding, RawSubject, Subject};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Transport-level failure reported by a collaborator.
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum GalleryLoadError {
    #[error("gallery source unreachable: {0}")]
    Source(#[source] SourceError),
    #[error("gallery contains no valid subjects")]
    Empty,
}

/// Supplier of raw subject records, e.g. the subject table of a database.
#[async_trait]
pub trait GallerySource: Send + Sync {
    async fn list(&self) -> Result<Vec<RawSubject>, SourceError>;
}

/// Immutable, ordered set of validated subjects.
#[derive(Debug, Default)]
pub struct GallerySnapshot {
    subjects: Vec<Subject>,
}

impl GallerySnapshot {
    /// Validate raw records, dropping any with a malformed embedding or a
    /// duplicate id. Source order is preserved.
    pub fn build(raw: Vec<RawSubject>) -> Self {
        let mut seen = HashSet::with_capacity(raw.len());
        let mut subjects = Vec::with_capacity(raw.len());

        for record in raw {
            let embedding = match Embedding::from_json(&record.embedding) {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(
                        subject = %record.id,
                        error = %err,
                        "dropping subject with invalid embedding"
                    );
                    continue;
                }
            };
            if !seen.insert(record.id.clone()) {
                tracing::warn!(subject = %record.id, "dropping duplicate subject id");
                continue;
            }
            subjects.push(Subject {
                id: record.id,
                embedding,
                metadata: record.metadata,
            });
        }

        Self { subjects }
    }

    pub fn from_subjects(subjects: Vec<Subject>) -> Self {
        Self { subjects }
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    pub fn get(&self, id: &str) -> Option<&Subject> {
        self.subjects.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

/// Holder of the current gallery snapshot.
pub struct GalleryCache {
    current: RwLock<Arc<GallerySnapshot>>,
}

impl GalleryCache {
    pub fn new(snapshot: GallerySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Build a cache from the source.
    ///
    /// With `require_subjects`, a source yielding no valid subject is an error.
    pub async fn load(
        source: &dyn GallerySource,
        require_subjects: bool,
    ) -> Result<Self, GalleryLoadError> {
        let snapshot = fetch(source, require_subjects).await?;
        Ok(Self::new(snapshot))
    }

    /// Current snapshot. Callers keep using it even if a refresh lands meanwhile.
    pub fn snapshot(&self) -> Arc<GallerySnapshot> {
        let guard = match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(&guard)
    }

    /// Reload from the source and swap the result in.
    ///
    /// On error the previous snapshot stays current.
    pub async fn refresh(
        &self,
        source: &dyn GallerySource,
        require_subjects: bool,
    ) -> Result<Arc<GallerySnapshot>, GalleryLoadError> {
        let snapshot = Arc::new(fetch(source, require_subjects).await?);
        self.swap(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub fn replace(&self, snapshot: GallerySnapshot) {
        self.swap(Arc::new(snapshot));
    }

    fn swap(&self, snapshot: Arc<GallerySnapshot>) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = snapshot;
    }
}

async fn fetch(
    source: &dyn GallerySource,
    require_subjects: bool,
) -> Result<GallerySnapshot, GalleryLoadError> {
    let raw = source.list().await.map_err(GalleryLoadError::Source)?;
    let total = raw.len();
    let snapshot = GallerySnapshot::build(raw);

    tracing::info!(
        loaded = snapshot.len(),
        dropped = total - snapshot.len(),
        "gallery snapshot built"
    );

    if require_subjects && snapshot.is_empty() {
        return Err(GalleryLoadError::Empty);
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EMBEDDING_DIM;
    use std::sync::Mutex;

    struct VecSource(Mutex<Vec<RawSubject>>);

    #[async_trait]
    impl GallerySource for VecSource {
        async fn list(&self) -> Result<Vec<RawSubject>, SourceError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    struct DownSource;

    #[async_trait]
    impl GallerySource for DownSource {
        async fn list(&self) -> Result<Vec<RawSubject>, SourceError> {
            Err("connection refused".into())
        }
    }

    fn raw(id: &str, len: usize) -> RawSubject {
        RawSubject {
            id: id.into(),
            embedding: serde_json::json!(vec![0.1f32; len]),
            metadata: serde_json::json!({ "first_name": id }),
        }
    }

    #[test]
    fn test_build_drops_short_embedding() {
        let snap = GallerySnapshot::build(vec![raw("S001", 127), raw("S002", EMBEDDING_DIM)]);
        assert_eq!(snap.len(), 1);
        assert!(snap.get("S001").is_none());
        assert!(snap.get("S002").is_some());
    }

    #[test]
    fn test_build_keeps_order_and_first_duplicate() {
        let mut dup = raw("A", EMBEDDING_DIM);
        dup.metadata = serde_json::json!("second");
        let snap = GallerySnapshot::build(vec![
            raw("B", EMBEDDING_DIM),
            raw("A", EMBEDDING_DIM),
            dup,
        ]);
        let ids: Vec<_> = snap.subjects().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["B", "A"]);
        assert_eq!(snap.get("A").unwrap().metadata["first_name"], "A");
    }

    #[tokio::test]
    async fn test_load_unreachable_source() {
        let err = GalleryCache::load(&DownSource, false).await.err().unwrap();
        assert!(matches!(err, GalleryLoadError::Source(_)));
    }

    #[tokio::test]
    async fn test_load_empty_when_required() {
        let source = VecSource(Mutex::new(vec![raw("S001", 127)]));
        let err = GalleryCache::load(&source, true).await.err().unwrap();
        assert!(matches!(err, GalleryLoadError::Empty));

        let cache = GalleryCache::load(&source, false).await.unwrap();
        assert!(cache.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_swaps_without_touching_held_snapshot() {
        let source = VecSource(Mutex::new(vec![raw("S001", EMBEDDING_DIM)]));
        let cache = GalleryCache::load(&source, true).await.unwrap();
        let before = cache.snapshot();

        source.0.lock().unwrap().push(raw("S002", EMBEDDING_DIM));
        cache.refresh(&source, true).await.unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(cache.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous() {
        let source = VecSource(Mutex::new(vec![raw("S001", EMBEDDING_DIM)]));
        let cache = GalleryCache::load(&source, true).await.unwrap();
        assert!(cache.refresh(&DownSource, true).await.is_err());
        assert_eq!(cache.snapshot().len(), 1);
    }
}
