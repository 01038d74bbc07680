//! Daemon I/O: detection frames in, render results out, gallery refresh.
//!
//! Frames arrive as one JSON object per line from the upstream detector
//! (`{"detections": [{"box": {...}, "descriptor": [128 floats]}]}`) and
//! results leave the same way, one line per frame.

use async_trait::async_trait;
use rollcall_core::{
    Detection, FrameSource, GalleryCache, GallerySource, RenderResult, RenderSink, SourceError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Deserialize)]
#[serde(untagged)]
enum FrameMessage {
    Frame { detections: Vec<Detection> },
    Bare(Vec<Detection>),
}

/// Line-delimited JSON frame reader.
///
/// A line that fails to decode (bad UTF-8 included) is a frame error, not the
/// end of input.
pub struct JsonLinesFrames<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesFrames<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> FrameSource for JsonLinesFrames<R> {
    async fn next_frame(&mut self) -> Option<Result<Vec<Detection>, SourceError>> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf).await {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "frame input failed");
                    return None;
                }
            }
            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(
                serde_json::from_slice::<FrameMessage>(&self.buf)
                    .map(|msg| match msg {
                        FrameMessage::Frame { detections } => detections,
                        FrameMessage::Bare(detections) => detections,
                    })
                    .map_err(Into::into),
            );
        }
    }
}

#[derive(Serialize)]
struct FrameOutput<'a> {
    frame: u64,
    results: &'a [RenderResult],
}

/// Line-delimited JSON result writer.
pub struct JsonLinesSink<W> {
    writer: W,
    frame: u64,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, frame: 0 }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RenderSink for JsonLinesSink<W> {
    async fn render(&mut self, results: &[RenderResult]) -> Result<(), SourceError> {
        self.frame += 1;
        let mut line = serde_json::to_vec(&FrameOutput {
            frame: self.frame,
            results,
        })?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Reload the gallery every `interval` until cancelled. A failed reload
/// keeps the current snapshot.
pub fn spawn_gallery_refresh(
    cache: Arc<GalleryCache>,
    source: Arc<dyn GallerySource>,
    interval: Duration,
    require_subjects: bool,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the gallery was just loaded.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match cache.refresh(source.as_ref(), require_subjects).await {
                        Ok(snapshot) => {
                            tracing::debug!(subjects = snapshot.len(), "gallery refreshed")
                        }
                        Err(err) => tracing::warn!(
                            error = %err,
                            "gallery refresh failed; keeping previous snapshot"
                        ),
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("gallery refresh stopped");
                    break;
                }
            }
        }
    })
}
