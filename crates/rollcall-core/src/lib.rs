//! rollcall-core — Face recognition attendance core.
//!
//! Matches 128-d face descriptors against a gallery of known subjects,
//! rate-limits repeated recognitions, and keeps a write-once arrival /
//! departure ledger per subject per day.

pub mod clock;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod memory;
pub mod pipeline;
pub mod session;
pub mod throttle;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use gallery::{GalleryCache, GalleryLoadError, GallerySnapshot, GallerySource, SourceError};
pub use ledger::{AttendanceLedger, AttendanceStore, LedgerError, SubjectRegistry};
pub use matcher::Matcher;
pub use memory::MemoryStore;
pub use pipeline::{
    Detection, LedgerEvent, LedgerReport, LedgerWriter, PipelineConfig, RecognitionPipeline,
    RenderResult,
};
pub use session::{run_session, FrameSource, RenderSink, SessionSummary};
pub use throttle::EventThrottle;
pub use types::{
    AttendanceRecord, BoundingBox, Embedding, EventKind, InvalidEmbedding, MatchResult, Outcome,
    RawSubject, RecordState, Subject, Timestamp, EMBEDDING_DIM,
};
