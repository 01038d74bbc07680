use crate::gallery::GallerySnapshot;
use crate::types::{Embedding, MatchResult};
use std::sync::Arc;

/// Default Euclidean distance threshold for a positive match.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// Nearest-neighbour classifier over one gallery snapshot.
///
/// Scans every subject on every call; galleries are expected to stay in the
/// tens to low thousands of entries.
#[derive(Debug, Clone)]
pub struct Matcher {
    snapshot: Arc<GallerySnapshot>,
    threshold: f32,
}

impl Matcher {
    pub fn build(snapshot: Arc<GallerySnapshot>, threshold: f32) -> Self {
        Self {
            snapshot,
            threshold,
        }
    }

    pub fn snapshot(&self) -> &Arc<GallerySnapshot> {
        &self.snapshot
    }

    /// Find the closest subject to `query`.
    ///
    /// Accepted only when the distance is strictly below the threshold.
    /// On equal distances the subject earlier in the snapshot wins.
    pub fn find_best_match(&self, query: &Embedding) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, subject) in self.snapshot.subjects().iter().enumerate() {
            let dist = query.euclidean_distance(&subject.embedding);
            // Strict comparison keeps the earliest subject on ties.
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist < self.threshold => MatchResult {
                subject_id: Some(self.snapshot.subjects()[idx].id.clone()),
                distance: best_dist,
                accepted: true,
            },
            _ => MatchResult {
                subject_id: None,
                distance: best_dist,
                accepted: false,
            },
        }
    }
}
