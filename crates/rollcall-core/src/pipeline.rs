//! Per-frame recognition: match, throttle, dispatch to the ledger.

use crate::clock::Clock;
use crate::gallery::{GalleryCache, GalleryLoadError, GallerySource};
use crate::ledger::{AttendanceLedger, LedgerError};
use crate::matcher::{Matcher, DEFAULT_THRESHOLD};
use crate::throttle::{EventThrottle, DEFAULT_WINDOW_MS};
use crate::types::{BoundingBox, Embedding, EventKind, Outcome, Timestamp};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

/// Pipeline settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// A match is accepted iff its distance is strictly below this.
    pub threshold: f32,
    pub throttle_window: Duration,
    /// Session mode: which ledger field recognitions write.
    pub event_kind: EventKind,
    /// Refuse to start with an empty gallery.
    pub require_subjects: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            throttle_window: Duration::milliseconds(DEFAULT_WINDOW_MS),
            event_kind: EventKind::Arrival,
            require_subjects: true,
        }
    }
}

/// One face found in a frame, with its descriptor already extracted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    #[serde(alias = "box")]
    pub bounding_box: BoundingBox,
    pub descriptor: Embedding,
}

/// What the caller needs to draw one detection.
///
/// `metadata` carries the matched subject's display fields (name, course)
/// from the frame's gallery snapshot so the overlay can label the box.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderResult {
    pub bounding_box: BoundingBox,
    pub subject_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub distance: f32,
    pub accepted: bool,
}

/// Render results for a frame plus how many ledger writes it dispatched.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub results: Vec<RenderResult>,
    pub dispatched: usize,
}

/// A recognition that survived throttling.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEvent {
    pub subject_id: String,
    pub kind: EventKind,
    pub timestamp: Timestamp,
}

/// Completion notice for a dispatched ledger write.
#[derive(Debug)]
pub struct LedgerReport {
    pub event: LedgerEvent,
    pub result: Result<Outcome, LedgerError>,
}

/// Fire-and-forget handle to the ledger.
///
/// Each event runs as its own task. Dropping every handle stops accepting
/// events but lets writes already dispatched finish.
#[derive(Clone)]
pub struct LedgerWriter {
    tx: mpsc::UnboundedSender<LedgerEvent>,
    tasks: TaskTracker,
}

impl LedgerWriter {
    /// Start the writer task. Must be called inside a Tokio runtime.
    pub fn spawn(ledger: AttendanceLedger) -> Self {
        Self::spawn_with_reports(ledger, None)
    }

    /// Like [`spawn`](Self::spawn), also sending every outcome to `reports`.
    pub fn spawn_with_reports(
        ledger: AttendanceLedger,
        reports: Option<mpsc::UnboundedSender<LedgerReport>>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LedgerEvent>();
        let tasks = TaskTracker::new();
        let spawner = tasks.clone();

        tasks.spawn(async move {
            while let Some(event) = rx.recv().await {
                let ledger = ledger.clone();
                let reports = reports.clone();
                spawner.spawn(async move {
                    let result = ledger
                        .record_event(&event.subject_id, event.kind, event.timestamp)
                        .await;
                    match &result {
                        Ok(_) => {}
                        Err(LedgerError::SubjectNotFound(id)) => {
                            tracing::warn!(
                                subject = %id,
                                "recognized subject missing from registry"
                            );
                        }
                        Err(err @ LedgerError::WriteFailure(_)) => {
                            tracing::error!(
                                subject = %event.subject_id,
                                error = %err,
                                "ledger write dropped"
                            );
                        }
                    }
                    if let Some(reports) = reports {
                        let _ = reports.send(LedgerReport { event, result });
                    }
                });
            }
            tracing::debug!("ledger writer closed");
        });

        Self { tx, tasks }
    }

    /// Queue an event without waiting. False if the writer is gone.
    pub fn dispatch(&self, event: LedgerEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Wait until every dispatched write has finished.
    ///
    /// Only returns once all other handles (including the pipeline's) are
    /// dropped, since until then new events may still arrive.
    pub async fn drain(self) {
        let Self { tx, tasks } = self;
        drop(tx);
        tasks.close();
        tasks.wait().await;
    }
}

/// Matches detections against the gallery and forwards recognitions.
pub struct RecognitionPipeline {
    config: PipelineConfig,
    gallery: Arc<GalleryCache>,
    throttle: Arc<EventThrottle>,
    writer: LedgerWriter,
    clock: Arc<dyn Clock>,
}

impl RecognitionPipeline {
    pub fn new(
        config: PipelineConfig,
        gallery: Arc<GalleryCache>,
        writer: LedgerWriter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let throttle = Arc::new(EventThrottle::new(config.throttle_window));
        Self::with_throttle(config, gallery, throttle, writer, clock)
    }

    pub fn with_throttle(
        config: PipelineConfig,
        gallery: Arc<GalleryCache>,
        throttle: Arc<EventThrottle>,
        writer: LedgerWriter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            gallery,
            throttle,
            writer,
            clock,
        }
    }

    /// Load the gallery and assemble a pipeline. An unusable gallery is fatal.
    pub async fn start(
        config: PipelineConfig,
        source: &dyn GallerySource,
        writer: LedgerWriter,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GalleryLoadError> {
        let gallery = GalleryCache::load(source, config.require_subjects).await?;
        let pipeline = Self::new(config, Arc::new(gallery), writer, clock);
        tracing::info!(
            subjects = pipeline.gallery.snapshot().len(),
            threshold = pipeline.config.threshold,
            window_ms = pipeline.throttle.window().num_milliseconds(),
            kind = %pipeline.config.event_kind,
            "recognition pipeline ready"
        );
        Ok(pipeline)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gallery(&self) -> &Arc<GalleryCache> {
        &self.gallery
    }

    pub fn throttle(&self) -> &Arc<EventThrottle> {
        &self.throttle
    }

    /// Render results for every detection, known or not.
    pub fn process(&self, detections: &[Detection]) -> Vec<RenderResult> {
        self.process_frame(detections).results
    }

    pub fn process_frame(&self, detections: &[Detection]) -> ProcessedFrame {
        // One snapshot per frame; a concurrent refresh shows up next frame.
        let matcher = Matcher::build(self.gallery.snapshot(), self.config.threshold);
        let now = self.clock.now();
        let mut dispatched = 0;

        let results = detections
            .iter()
            .map(|detection| {
                let result = matcher.find_best_match(&detection.descriptor);
                let mut metadata = None;

                if let (true, Some(id)) = (result.accepted, result.subject_id.as_deref()) {
                    metadata = matcher
                        .snapshot()
                        .get(id)
                        .map(|subject| subject.metadata.clone())
                        .filter(|m| !m.is_null());

                    if self.throttle.should_emit(id, now) {
                        let event = LedgerEvent {
                            subject_id: id.to_string(),
                            kind: self.config.event_kind,
                            timestamp: now,
                        };
                        if self.writer.dispatch(event) {
                            dispatched += 1;
                        } else {
                            tracing::warn!(subject = id, "ledger writer closed; event dropped");
                        }
                    }
                }

                RenderResult {
                    bounding_box: detection.bounding_box,
                    subject_id: result.subject_id,
                    metadata,
                    distance: result.distance,
                    accepted: result.accepted,
                }
            })
            .collect();

        ProcessedFrame {
            results,
            dispatched,
        }
    }

    /// End of session: forget throttle state.
    pub fn stop(&self) {
        self.throttle.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gallery::{GallerySnapshot, SourceError};
    use crate::ledger::AttendanceStore;
    use crate::memory::MemoryStore;
    use crate::types::{AttendanceRecord, RawSubject, EMBEDDING_DIM};
    use async_trait::async_trait;
    use chrono::{FixedOffset, NaiveDate, TimeZone};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn axis(index: usize, value: f32) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[index] = value;
        v
    }

    fn raw(id: &str, values: Vec<f32>) -> RawSubject {
        RawSubject {
            id: id.into(),
            embedding: serde_json::json!(values),
            metadata: serde_json::Value::Null,
        }
    }

    fn detection(values: Vec<f32>) -> Detection {
        Detection {
            bounding_box: BoundingBox {
                x: 10.0,
                y: 20.0,
                width: 64.0,
                height: 64.0,
            },
            descriptor: Embedding::new(values).unwrap(),
        }
    }

    fn start_time() -> Timestamp {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2026, 3, 2, 8, 0, 0)
            .unwrap()
    }

    struct Harness {
        pipeline: RecognitionPipeline,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        reports: mpsc::UnboundedReceiver<LedgerReport>,
    }

    async fn harness(kind: EventKind) -> Harness {
        let store = Arc::new(MemoryStore::new(vec![
            raw("S001", axis(0, 1.0)),
            raw("S002", axis(1, 1.0)),
        ]));
        let clock = Arc::new(ManualClock::new(start_time()));
        let (tx, reports) = mpsc::unbounded_channel();
        let ledger = AttendanceLedger::new(store.clone(), store.clone());
        let writer = LedgerWriter::spawn_with_reports(ledger, Some(tx));
        let config = PipelineConfig {
            event_kind: kind,
            ..Default::default()
        };
        let pipeline = RecognitionPipeline::start(config, store.as_ref(), writer, clock.clone())
            .await
            .unwrap();
        Harness {
            pipeline,
            clock,
            store,
            reports,
        }
    }

    async fn drain(
        pipeline: RecognitionPipeline,
        mut reports: mpsc::UnboundedReceiver<LedgerReport>,
    ) -> Vec<LedgerReport> {
        drop(pipeline);
        let mut all = Vec::new();
        while let Some(r) = reports.recv().await {
            all.push(r);
        }
        all
    }

    #[tokio::test]
    async fn test_results_for_known_and_unknown() {
        let h = harness(EventKind::Arrival).await;
        let results = h
            .pipeline
            .process(&[detection(axis(0, 1.1)), detection(axis(5, 3.0))]);

        assert_eq!(results.len(), 2);
        assert!(results[0].accepted);
        assert_eq!(results[0].subject_id.as_deref(), Some("S001"));
        assert_eq!(results[0].bounding_box.x, 10.0);
        assert!(!results[1].accepted);
        assert_eq!(results[1].subject_id, None);

        let reports = drain(h.pipeline, h.reports).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].event.subject_id, "S001");
        assert!(matches!(reports[0].result, Ok(Outcome::Recorded)));
    }

    #[tokio::test]
    async fn test_accepted_result_carries_subject_metadata() {
        let h = harness(EventKind::Arrival).await;
        h.pipeline.gallery().replace(GallerySnapshot::build(vec![RawSubject {
            id: "S001".into(),
            embedding: serde_json::json!(axis(0, 1.0)),
            metadata: serde_json::json!({ "first_name": "Ada", "last_name": "Lovelace" }),
        }]));

        let results = h
            .pipeline
            .process(&[detection(axis(0, 1.0)), detection(axis(7, 2.0))]);
        let meta = results[0].metadata.as_ref().unwrap();
        assert_eq!(meta["first_name"], "Ada");
        assert_eq!(results[1].metadata, None);

        // Subjects without display fields leave it unset.
        h.pipeline
            .gallery()
            .replace(GallerySnapshot::build(vec![raw("S001", axis(0, 1.0))]));
        assert_eq!(h.pipeline.process(&[detection(axis(0, 1.0))])[0].metadata, None);
    }

    #[tokio::test]
    async fn test_throttled_frames_still_render() {
        let h = harness(EventKind::Arrival).await;
        let first = h.pipeline.process_frame(&[detection(axis(0, 1.0))]);
        h.clock.advance(Duration::milliseconds(100));
        let second = h.pipeline.process_frame(&[detection(axis(0, 1.0))]);

        assert_eq!(first.dispatched, 1);
        assert_eq!(second.dispatched, 0);
        assert_eq!(second.results.len(), 1);
        assert!(second.results[0].accepted);
    }

    #[tokio::test]
    async fn test_burst_dispatches_once_per_window() {
        let h = harness(EventKind::Arrival).await;
        let mut dispatched = 0;
        for _ in 0..150 {
            dispatched += h
                .pipeline
                .process_frame(&[detection(axis(0, 1.0))])
                .dispatched;
            h.clock.advance(Duration::microseconds(6_666));
        }
        assert_eq!(dispatched, 1);

        let store = h.store.clone();
        let reports = drain(h.pipeline, h.reports).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(store.successful_writes(), 1);
    }

    #[tokio::test]
    async fn test_ledger_dedupes_after_window_expires() {
        let h = harness(EventKind::Departure).await;
        h.pipeline.process(&[detection(axis(1, 1.0))]);
        h.clock.advance(Duration::milliseconds(6000));
        h.pipeline.process(&[detection(axis(1, 1.0))]);

        let store = h.store.clone();
        let reports = drain(h.pipeline, h.reports).await;
        assert_eq!(reports.len(), 2);
        let recorded: Vec<_> = reports
            .iter()
            .filter(|r| matches!(r.result, Ok(Outcome::Recorded)))
            .collect();
        assert_eq!(recorded.len(), 1);
        assert!(reports
            .iter()
            .any(|r| matches!(r.result, Ok(Outcome::Ignored))));

        let rec = store.record("S002", start_time().date_naive()).unwrap();
        assert_eq!(rec.time_out, Some(recorded[0].event.timestamp));
        assert_eq!(rec.time_in, None);
    }

    #[tokio::test]
    async fn test_refresh_visible_on_next_frame() {
        let h = harness(EventKind::Arrival).await;
        let newcomer = detection(axis(2, 1.0));
        assert!(!h.pipeline.process(&[newcomer.clone()])[0].accepted);

        let snapshot = GallerySnapshot::build(vec![raw("S003", axis(2, 1.0))]);
        h.pipeline.gallery().replace(snapshot);
        let after = h.pipeline.process(&[newcomer]);
        assert_eq!(after[0].subject_id.as_deref(), Some("S003"));

        // S003 is in the gallery but not the registry.
        let reports = drain(h.pipeline, h.reports).await;
        assert!(matches!(
            reports[0].result,
            Err(LedgerError::SubjectNotFound(_))
        ));
    }

    /// Attendance store whose writes fail while `down` is set.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        down: AtomicBool,
    }

    #[async_trait]
    impl AttendanceStore for FlakyStore {
        async fn get_record(
            &self,
            subject_id: &str,
            date: NaiveDate,
        ) -> Result<Option<AttendanceRecord>, SourceError> {
            self.inner.get_record(subject_id, date).await
        }

        async fn upsert_record(
            &self,
            record: &AttendanceRecord,
            expected_prior: Option<&AttendanceRecord>,
        ) -> Result<bool, SourceError> {
            if self.down.load(Ordering::SeqCst) {
                return Err("database is locked".into());
            }
            self.inner.upsert_record(record, expected_prior).await
        }
    }

    #[tokio::test]
    async fn test_write_failure_is_dropped_and_later_frames_record() {
        let memory = Arc::new(MemoryStore::new(vec![raw("S001", axis(0, 1.0))]));
        let store = Arc::new(FlakyStore {
            inner: memory.clone(),
            down: AtomicBool::new(true),
        });
        let (tx, mut reports) = mpsc::unbounded_channel();
        let ledger = AttendanceLedger::new(memory.clone(), store.clone());
        let writer = LedgerWriter::spawn_with_reports(ledger, Some(tx));
        let clock = Arc::new(ManualClock::new(start_time()));
        let pipeline = RecognitionPipeline::start(
            PipelineConfig::default(),
            memory.as_ref(),
            writer,
            clock.clone(),
        )
        .await
        .unwrap();

        assert_eq!(pipeline.process_frame(&[detection(axis(0, 1.0))]).dispatched, 1);
        let failed = reports.recv().await.unwrap();
        assert!(matches!(failed.result, Err(LedgerError::WriteFailure(_))));
        assert_eq!(memory.successful_writes(), 0);

        // Still processing; the next detection after the window records.
        store.down.store(false, Ordering::SeqCst);
        clock.advance(Duration::milliseconds(DEFAULT_WINDOW_MS));
        let frame = pipeline.process_frame(&[detection(axis(0, 1.0))]);
        assert!(frame.results[0].accepted);
        assert_eq!(frame.dispatched, 1);

        let reports = drain(pipeline, reports).await;
        assert!(matches!(reports[0].result, Ok(Outcome::Recorded)));
        let rec = memory.record("S001", start_time().date_naive()).unwrap();
        assert_eq!(
            rec.time_in,
            Some(start_time() + Duration::milliseconds(DEFAULT_WINDOW_MS))
        );
    }

    #[tokio::test]
    async fn test_drain_waits_for_dispatched_writes() {
        let store = Arc::new(MemoryStore::new(vec![raw("S001", axis(0, 1.0))]));
        let ledger = AttendanceLedger::new(store.clone(), store.clone());
        let writer = LedgerWriter::spawn(ledger);
        let handle = writer.clone();
        let clock = Arc::new(ManualClock::new(start_time()));
        let pipeline =
            RecognitionPipeline::start(PipelineConfig::default(), store.as_ref(), writer, clock)
                .await
                .unwrap();

        assert_eq!(pipeline.process_frame(&[detection(axis(0, 1.0))]).dispatched, 1);
        drop(pipeline);
        handle.drain().await;
        assert_eq!(store.successful_writes(), 1);
    }

    #[tokio::test]
    async fn test_start_fails_without_subjects() {
        let store = MemoryStore::new(vec![raw("short", vec![0.0; 127])]);
        let ledger = AttendanceLedger::new(
            Arc::new(MemoryStore::default()),
            Arc::new(MemoryStore::default()),
        );
        let writer = LedgerWriter::spawn(ledger);
        let clock = Arc::new(ManualClock::new(start_time()));
        let err = RecognitionPipeline::start(PipelineConfig::default(), &store, writer, clock)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GalleryLoadError::Empty));
    }
}
