use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use zbus::proxy;

#[proxy(
    interface = "org.officewatch.Monitor1",
    default_service = "org.officewatch.Monitor1",
    default_path = "/org/officewatch/Monitor1"
)]
trait Monitor {
    fn start(&self) -> zbus::Result<bool>;
    fn stop(&self) -> zbus::Result<bool>;
    fn is_running(&self) -> zbus::Result<bool>;
    fn snapshot(&self) -> zbus::Result<Vec<u8>>;
    fn snapshot_annotations(&self) -> zbus::Result<String>;
    fn reload_gallery(&self) -> zbus::Result<u32>;
    fn status(&self) -> zbus::Result<String>;
    fn current_attendance(&self) -> zbus::Result<String>;
    fn is_inside(&self, identity_id: i64) -> zbus::Result<bool>;

    #[zbus(signal)]
    fn presence_changed(&self, kind: &str, identity_id: i64, name: &str, at: &str) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "officewatch", about = "Control the officewatch presence monitor")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start monitoring the camera
    Start,
    /// Stop monitoring and release the camera
    Stop,
    /// Show daemon status
    Status,
    /// Save the latest annotated frame (format chosen by file extension)
    Snapshot {
        /// Output image path
        path: PathBuf,
    },
    /// Reload the encoding gallery from disk
    Reload,
    /// List today's attendance
    Attendance,
    /// Check whether an employee is currently inside
    Inside {
        /// Employee id
        id: i64,
    },
    /// Print entry/exit events as they happen
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    tracing::debug!(system_bus = cli.system, "connecting to officewatchd");

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = MonitorProxy::new(&connection)
        .await
        .context("officewatchd is not reachable")?;

    match cli.command {
        Commands::Start => {
            proxy.start().await.context("failed to start monitoring")?;
            println!("monitoring");
        }
        Commands::Stop => {
            if proxy.stop().await? {
                println!("stopped");
            } else {
                println!("not running");
            }
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Snapshot { path } => {
            let jpeg = proxy.snapshot().await?;
            if jpeg.is_empty() {
                bail!("no frame captured yet; is monitoring running?");
            }
            let image = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
                .context("daemon returned an undecodable frame")?;
            image
                .save(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("{}x{} frame saved to {}", image.width(), image.height(), path.display());

            let summary: serde_json::Value = serde_json::from_str(&proxy.snapshot_annotations().await?)?;
            for face in summary["faces"].as_array().into_iter().flatten() {
                let distance = face["distance"]
                    .as_f64()
                    .map_or_else(|| "-".to_string(), |d| format!("{d:.3}"));
                println!(
                    "  {:<24} distance {}  at ({:.0}, {:.0})",
                    face["label"].as_str().unwrap_or("?"),
                    distance,
                    face["bbox"]["x"].as_f64().unwrap_or(0.0),
                    face["bbox"]["y"].as_f64().unwrap_or(0.0),
                );
            }
        }
        Commands::Reload => {
            let entries = proxy.reload_gallery().await.context("gallery reload failed")?;
            println!("gallery reloaded: {entries} entries");
        }
        Commands::Attendance => {
            let records: Vec<serde_json::Value> =
                serde_json::from_str(&proxy.current_attendance().await?)?;
            if records.is_empty() {
                println!("no attendance recorded today");
            }
            for r in &records {
                println!(
                    "{:<24} {:<7} in {}  out {}",
                    r["name"].as_str().unwrap_or("?"),
                    r["status"].as_str().unwrap_or("?"),
                    r["entry_time"].as_str().unwrap_or("-"),
                    r["exit_time"].as_str().unwrap_or("-"),
                );
            }
        }
        Commands::Inside { id } => {
            let inside = proxy.is_inside(id).await?;
            println!("{}", if inside { "inside" } else { "not inside" });
        }
        Commands::Watch => {
            let mut changes = proxy.receive_presence_changed().await?;
            println!("watching for presence changes (ctrl-c to quit)");
            while let Some(signal) = changes.next().await {
                let args = signal.args()?;
                println!("{}  {} has {} the office", args.at, args.name, args.kind);
            }
        }
    }

    Ok(())
}
