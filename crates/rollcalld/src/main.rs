use anyhow::{Context, Result};
use rollcall_capture::{CameraSource, FrameSampler, MjpegStreamSource, SnapshotSource};
use rollcall_core::{DecisionEngine, DedupLedger, SharedKnownSet};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod audit_store;
mod config;
mod dbus_interface;
mod dispatcher;
mod encoder;
mod pipeline;
mod roster;
mod shutdown;

use config::{CaptureMode, Config};
use dispatcher::{Dispatcher, HttpTransport};
use encoder::HttpEncoder;
use pipeline::Pipeline;
use roster::{HttpRosterProvider, RosterRefresher};
use shutdown::Shutdown;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        api_base = %config.api_base,
        capture_mode = ?config.capture_mode,
        tolerance = config.match_tolerance,
        dedup_seconds = config.dedup_seconds,
        dual_submit = config.consolidate_endpoint.is_some(),
        "configuration loaded"
    );

    let encoder = HttpEncoder::new(&config.encoder_url, config.request_timeout())?;
    let provider = HttpRosterProvider::new(&config.roster_url(), config.request_timeout())?;
    tracing::info!(roster = %provider.url(), encoder = %encoder.url(), "services configured");
    let known = Arc::new(SharedKnownSet::default());
    let refresher = Arc::new(RosterRefresher::new(provider, encoder.clone(), known.clone()));
    let enrolled = refresher
        .refresh()
        .await
        .context("building the known identity set")?;
    if enrolled == 0 {
        tracing::warn!("no identities enrolled; every face will be ignored until a refresh");
    }

    let ledger = Arc::new(DedupLedger::new());
    let engine = DecisionEngine::new(
        ledger.clone(),
        config.match_tolerance,
        config.dedup_cooldown(),
    )?;

    let transport = HttpTransport::new(config.api_key.clone(), config.request_timeout())?;
    let dispatcher = Arc::new(Dispatcher::new(
        transport,
        config.dispatch_mode(),
        config.device_label.clone(),
        config.classroom_code.clone(),
    ));

    let sink = audit_store::open_sink(&config.audit_path, config.audit_backend())
        .with_context(|| format!("opening audit log {}", config.audit_path.display()))?;
    let (audit, audit_thread) = audit_store::spawn_audit_writer(sink)?;

    let (source, sampler) = match config.capture_mode {
        CaptureMode::Snapshot => (
            CameraSource::Snapshot(SnapshotSource::new(
                &config.snapshot_url,
                config.poll_period(),
                config.frame_timeout(),
            )?),
            // The snapshot source paces itself.
            FrameSampler::unthrottled(),
        ),
        CaptureMode::Stream => (
            CameraSource::Stream(MjpegStreamSource::new(
                &config.stream_url,
                config.frame_timeout(),
            )?),
            FrameSampler::from_fps(config.sampler_fps),
        ),
    };
    tracing::info!(url = %source.url(), "camera source configured");

    let pipeline = Pipeline::new(
        source,
        sampler,
        encoder,
        engine,
        known,
        dispatcher,
        audit,
    )
    .with_retry_backoff(config.retry_backoff());

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown::wait_for_signal(shutdown.clone()));

    let periodic_refresh = config.roster_refresh().map(|every| {
        tracing::info!(every = ?every, "periodic roster refresh enabled");
        tokio::spawn(roster::run_periodic_refresh(
            refresher.clone(),
            every,
            shutdown.clone(),
        ))
    });

    let service = dbus_interface::AttendanceService::new(
        refresher,
        ledger,
        pipeline.stats(),
        config.capture_mode,
        shutdown.clone(),
    );
    // Held for the lifetime of the daemon; dropping it unregisters the name.
    let _bus = match dbus_interface::serve(config.dbus, service).await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(error = %e, "D-Bus registration failed; running without it");
            None
        }
    };

    tracing::info!("rollcalld ready");
    let result = pipeline.run(shutdown.clone()).await;
    if !shutdown.is_triggered() {
        tracing::error!("sampling loop stopped unexpectedly; shutting down");
        shutdown.trigger();
    }

    tokio::task::spawn_blocking(move || audit_thread.join())
        .await?
        .map_err(|_| anyhow::anyhow!("audit writer thread panicked"))?;

    result.context("sampling loop failed")?;
    if let Some(task) = periodic_refresh {
        task.await?.context("roster refresh failed")?;
    }
    tracing::info!("rollcalld shut down");
    Ok(())
}
