//! Continuous recognition loop.
//!
//! Awaiting the next frame is the only suspension point. Cancellation is
//! observed between frames; ledger writes already dispatched are left to
//! finish on their own.

use crate::gallery::SourceError;
use crate::pipeline::{Detection, RecognitionPipeline, RenderResult};
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Producer of per-frame detections (camera + detector + descriptor model).
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame's detections; `None` once the source is exhausted.
    async fn next_frame(&mut self) -> Option<Result<Vec<Detection>, SourceError>>;
}

/// Consumer of render results, e.g. an overlay or a result stream.
#[async_trait]
pub trait RenderSink: Send {
    async fn render(&mut self, results: &[RenderResult]) -> Result<(), SourceError>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub frames: u64,
    pub frame_errors: u64,
    pub detections: u64,
    pub recognized: u64,
    pub dispatched: u64,
}

/// Drive `pipeline` with frames from `source` until the source ends, the
/// sink fails, or `cancel` fires. Clears the throttle on exit.
pub async fn run_session(
    pipeline: &RecognitionPipeline,
    source: &mut dyn FrameSource,
    sink: &mut dyn RenderSink,
    cancel: &CancellationToken,
) -> SessionSummary {
    let mut summary = SessionSummary::default();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = source.next_frame() => next,
        };

        let detections = match next {
            None => {
                tracing::info!("frame source exhausted");
                break;
            }
            Some(Ok(detections)) => detections,
            Some(Err(err)) => {
                summary.frame_errors += 1;
                tracing::warn!(error = %err, "skipping unreadable frame");
                continue;
            }
        };

        let frame = pipeline.process_frame(&detections);
        summary.frames += 1;
        summary.detections += detections.len() as u64;
        summary.recognized += frame.results.iter().filter(|r| r.accepted).count() as u64;
        summary.dispatched += frame.dispatched as u64;

        if summary.frames % 300 == 0 {
            tracing::debug!(
                frames = summary.frames,
                recognized = summary.recognized,
                "session progress"
            );
        }

        if let Err(err) = sink.render(&frame.results).await {
            tracing::error!(error = %err, "render sink failed; stopping session");
            break;
        }
    }

    pipeline.stop();
    tracing::info!(
        frames = summary.frames,
        frame_errors = summary.frame_errors,
        recognized = summary.recognized,
        dispatched = summary.dispatched,
        "recognition session stopped"
    );
    summary
}
