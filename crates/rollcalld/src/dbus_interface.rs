use crate::config::{BusKind, CaptureMode};
use crate::encoder::HttpEncoder;
use crate::pipeline::PipelineStats;
use crate::roster::{HttpRosterProvider, RosterRefresher};
use crate::shutdown::Shutdown;
use rollcall_core::DedupLedger;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

pub type DaemonRefresher = RosterRefresher<HttpRosterProvider, HttpEncoder>;

/// D-Bus control surface of the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    refresher: Arc<DaemonRefresher>,
    ledger: Arc<DedupLedger>,
    stats: Arc<PipelineStats>,
    capture_mode: CaptureMode,
    shutdown: Shutdown,
}

impl AttendanceService {
    pub fn new(
        refresher: Arc<DaemonRefresher>,
        ledger: Arc<DedupLedger>,
        stats: Arc<PipelineStats>,
        capture_mode: CaptureMode,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            refresher,
            ledger,
            stats,
            capture_mode,
            shutdown,
        }
    }

    fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "capture_mode": match self.capture_mode {
                CaptureMode::Snapshot => "snapshot",
                CaptureMode::Stream => "stream",
            },
            "roster_size": self.refresher.known().load().len(),
            "ledger_size": self.ledger.len(),
            "pipeline": self.stats.snapshot(),
        })
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Return daemon status as a JSON document.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json().to_string())
    }

    /// Rebuild the roster now and return the number of enrolled identities.
    /// An incompatible encoder also shuts the daemon down.
    async fn refresh_roster(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("roster refresh requested over D-Bus");
        match self.refresher.refresh().await {
            Ok(count) => Ok(u32::try_from(count).unwrap_or(u32::MAX)),
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "requested roster refresh hit an unrecoverable error");
                self.shutdown.trigger();
                Err(zbus::fdo::Error::Failed(e.to_string()))
            }
            Err(e) => {
                tracing::warn!(error = %e, "requested roster refresh failed");
                Err(zbus::fdo::Error::Failed(e.to_string()))
            }
        }
    }
}

/// Publish the service on the configured bus. `Ok(None)` when disabled.
pub async fn serve(
    bus: BusKind,
    service: AttendanceService,
) -> zbus::Result<Option<zbus::Connection>> {
    let builder = match bus {
        BusKind::Off => return Ok(None),
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;
    tracing::info!(bus = ?bus, name = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");
    Ok(Some(connection))
}
