use anyhow::{Context, Result};
use rollcall_core::{
    run_session, AttendanceLedger, LedgerWriter, RecognitionPipeline, SystemClock, EMBEDDING_DIM,
};
use rollcall_store::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::{spawn_gallery_refresh, JsonLinesFrames, JsonLinesSink};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries results; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;
    let session_id = uuid::Uuid::new_v4();
    tracing::info!(
        %session_id,
        db = %config.db_path.display(),
        kind = %config.event_kind,
        threshold = config.threshold,
        embedding_dim = EMBEDDING_DIM,
        "rollcalld starting"
    );

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?,
    );

    let ledger = AttendanceLedger::new(store.clone(), store.clone());
    let writer = LedgerWriter::spawn(ledger);
    let pending_writes = writer.clone();

    let pipeline = RecognitionPipeline::start(
        config.pipeline_config(),
        store.as_ref(),
        writer,
        Arc::new(SystemClock),
    )
    .await
    .context("cannot start recognition session")?;

    let cancel = CancellationToken::new();

    let refresh = (config.gallery_refresh_secs > 0).then(|| {
        spawn_gallery_refresh(
            pipeline.gallery().clone(),
            store.clone(),
            Duration::from_secs(config.gallery_refresh_secs),
            config.require_subjects,
            cancel.clone(),
        )
    });

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; stopping after current frame");
            signal_cancel.cancel();
        }
    });

    tracing::info!(%session_id, "rollcalld ready; reading frames from stdin");

    let mut frames = JsonLinesFrames::new(BufReader::new(tokio::io::stdin()));
    let mut sink = JsonLinesSink::new(tokio::io::stdout());
    let summary = run_session(&pipeline, &mut frames, &mut sink, &cancel).await;

    cancel.cancel();
    if let Some(handle) = refresh {
        let _ = handle.await;
    }

    // Stop taking new events, then let dispatched writes land.
    drop(pipeline);
    pending_writes.drain().await;

    tracing::info!(
        %session_id,
        frames = summary.frames,
        recognized = summary.recognized,
        dispatched = summary.dispatched,
        "rollcalld shutting down"
    );

    Ok(())
}
