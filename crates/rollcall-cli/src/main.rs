use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_capture::{FrameSource, MjpegStreamSource, SnapshotSource};
use std::time::Duration;

const DEFAULT_SNAPSHOT_URL: &str = "http://localhost:4000/api/cam/capture";
const DEFAULT_STREAM_URL: &str = "http://localhost:8080/stream";

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance daemon CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Rebuild the daemon's roster now
    Refresh,
    /// Fetch one frame straight from the camera (bypasses the daemon)
    TestCamera {
        /// Camera URL; defaults to ROLLCALL_SNAPSHOT_URL or ROLLCALL_STREAM_URL
        #[arg(long)]
        url: Option<String>,
        /// Treat the URL as an MJPEG stream instead of a snapshot endpoint
        #[arg(long)]
        stream: bool,
        /// Seconds to wait for a frame
        #[arg(long, default_value_t = 20)]
        timeout: u64,
    },
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn status(&self) -> zbus::Result<String>;
    async fn refresh_roster(&self) -> zbus::Result<u32>;
}

async fn connect(system: bool) -> Result<AttendanceProxy<'static>> {
    tracing::debug!(system, "connecting to rollcalld");
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable on D-Bus")
}

fn camera_url(explicit: Option<String>, stream: bool) -> String {
    explicit.unwrap_or_else(|| {
        let (var, default) = if stream {
            ("ROLLCALL_STREAM_URL", DEFAULT_STREAM_URL)
        } else {
            ("ROLLCALL_SNAPSHOT_URL", DEFAULT_SNAPSHOT_URL)
        };
        std::env::var(var).unwrap_or_else(|_| default.to_string())
    })
}

async fn test_camera(url: &str, stream: bool, timeout: Duration) -> Result<()> {
    println!("Fetching one frame from {url}...");
    tracing::debug!(url, stream, timeout = ?timeout, "test-camera");
    let frame = if stream {
        let mut source = MjpegStreamSource::new(url, timeout)?;
        source.next_frame().await?
    } else {
        let mut source = SnapshotSource::new(url, Duration::from_secs(1), timeout)?;
        source.capture().await?
    };
    tracing::debug!(bytes = frame.data.len(), "frame received");
    println!("  bytes: {}", frame.data.len());
    match image::load_from_memory(&frame.data) {
        Ok(image) => println!("  decoded: {}x{}", image.width(), image.height()),
        Err(e) => println!("  decode failed: {e}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let proxy = connect(cli.system).await?;
            let raw = proxy.status().await?;
            match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(status) => println!("{}", serde_json::to_string_pretty(&status)?),
                Err(_) => println!("{raw}"),
            }
        }
        Commands::Refresh => {
            let proxy = connect(cli.system).await?;
            let count = proxy.refresh_roster().await?;
            println!("Roster refreshed: {count} identities enrolled");
        }
        Commands::TestCamera {
            url,
            stream,
            timeout,
        } => {
            let url = camera_url(url, stream);
            test_camera(&url, stream, Duration::from_secs(timeout)).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_test_camera() {
        let cli = Cli::try_parse_from([
            "rollcall",
            "test-camera",
            "--stream",
            "--url",
            "http://cam/stream",
        ])
        .unwrap();
        let Commands::TestCamera {
            url,
            stream,
            timeout,
        } = cli.command
        else {
            panic!("expected test-camera");
        };
        assert_eq!(url.as_deref(), Some("http://cam/stream"));
        assert!(stream);
        assert_eq!(timeout, 20);
    }

    #[test]
    fn test_system_flag_is_global() {
        let cli = Cli::try_parse_from(["rollcall", "status", "--system"]).unwrap();
        assert!(cli.system);
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_explicit_camera_url_wins() {
        assert_eq!(
            camera_url(Some("http://cam/capture".into()), false),
            "http://cam/capture"
        );
    }
}
