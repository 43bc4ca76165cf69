use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fundus_hw::profiles::list_profiles;
use fundus_hw::V4l2Camera;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.fundus.Rig1",
    default_service = "org.fundus.Rig1",
    default_path = "/org/fundus/Rig1"
)]
trait Rig {
    async fn capture_visible(&self) -> zbus::Result<String>;
    async fn capture_infrared(&self) -> zbus::Result<String>;
    async fn zoom(&self, delta: f64) -> zbus::Result<f64>;
    async fn focus(&self, delta: f64) -> zbus::Result<f64>;
    async fn enable_autofocus(&self) -> zbus::Result<()>;
    async fn reset(&self) -> zbus::Result<String>;
    async fn start_preview(&self) -> zbus::Result<()>;
    async fn stop_preview(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
    async fn preview_frame(&self) -> zbus::Result<Vec<u8>>;
}

#[derive(Parser)]
#[command(name = "fundus", about = "Fundus camera rig CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start live preview (IR light on)
    Start,
    /// Stop live preview (all lights off)
    Stop,
    /// Take a photo
    Capture {
        /// Infrared photo instead of a visible flash
        #[arg(long)]
        ir: bool,
    },
    /// Zoom in
    ZoomIn {
        #[arg(short, long, default_value_t = 0.1, value_parser = parse_step)]
        step: f64,
    },
    /// Zoom out
    ZoomOut {
        #[arg(short, long, default_value_t = 0.1, value_parser = parse_step)]
        step: f64,
    },
    /// Focus nearer
    Near {
        #[arg(short, long, default_value_t = 0.1, value_parser = parse_step)]
        step: f64,
    },
    /// Focus farther
    Far {
        #[arg(short, long, default_value_t = 0.1, value_parser = parse_step)]
        step: f64,
    },
    /// Switch to continuous autofocus
    Autofocus,
    /// Reset zoom and focus to their initial values
    Reset,
    /// Show daemon status
    Status,
    /// Save the latest preview frame as JPEG
    Frame {
        /// Output file
        #[arg(default_value = "preview.jpg")]
        output: PathBuf,
    },
    /// List cameras and rig profiles (no daemon needed)
    Test,
}

fn parse_step(s: &str) -> Result<f64, String> {
    let step: f64 = s.parse().map_err(|e| format!("{s}: {e}"))?;
    if fundus_core::is_step_choice(step) {
        Ok(step)
    } else {
        Err(format!(
            "step must be one of {:?}",
            fundus_core::STEP_CHOICES
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Test = cli.command {
        run_diagnostics();
        return Ok(());
    }

    tracing::debug!(
        bus = if cli.system { "system" } else { "session" },
        "connecting to fundusd"
    );
    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let rig = RigProxy::new(&conn)
        .await
        .context("fundusd is not reachable")?;

    match cli.command {
        Commands::Start => {
            rig.start_preview().await?;
            println!("preview started");
        }
        Commands::Stop => {
            rig.stop_preview().await?;
            println!("preview stopped");
        }
        Commands::Capture { ir } => {
            let path = if ir {
                rig.capture_infrared().await?
            } else {
                rig.capture_visible().await?
            };
            println!("saved {path}");
        }
        Commands::ZoomIn { step } => println!("zoom {:.1}x", rig.zoom(step).await?),
        Commands::ZoomOut { step } => println!("zoom {:.1}x", rig.zoom(-step).await?),
        Commands::Near { step } => println!("focus {:.2}", rig.focus(step).await?),
        Commands::Far { step } => println!("focus {:.2}", rig.focus(-step).await?),
        Commands::Autofocus => {
            rig.enable_autofocus().await?;
            println!("autofocus on");
        }
        Commands::Reset => println!("{}", rig.reset().await?),
        Commands::Status => {
            let raw = rig.status().await?;
            let value: serde_json::Value =
                serde_json::from_str(&raw).context("daemon returned invalid status")?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Frame { output } => {
            let jpeg = rig.preview_frame().await?;
            std::fs::write(&output, &jpeg)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("wrote {} ({} bytes)", output.display(), jpeg.len());
        }
        Commands::Test => run_diagnostics(),
    }

    Ok(())
}

/// Print what the daemon would find, without opening anything for streaming.
fn run_diagnostics() {
    println!("V4L2 capture devices:");
    let devices = V4l2Camera::list_devices();
    if devices.is_empty() {
        println!("  (none)");
    }
    for dev in devices {
        println!("  {}  {} [{}] {}", dev.path, dev.name, dev.driver, dev.bus);
    }

    println!("Rig profiles:");
    for profile in list_profiles() {
        let lights = &profile.lights;
        println!(
            "  {}  {}: {} IR={} visible={}{}",
            profile.board.id,
            profile.board.name,
            lights.chip,
            lights.infrared_line,
            lights.visible_line,
            if lights.active_high { "" } else { " (active low)" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_must_be_a_choice() {
        assert_eq!(parse_step("2.5"), Ok(2.5));
        assert!(parse_step("0.3").is_err());
        assert!(parse_step("abc").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["fundus", "zoom-in", "--step", "0.5"]).unwrap();
        assert!(matches!(cli.command, Commands::ZoomIn { step } if step == 0.5));
        let cli = Cli::try_parse_from(["fundus", "--system", "capture", "--ir"]).unwrap();
        assert!(cli.system);
        assert!(matches!(cli.command, Commands::Capture { ir: true }));
        assert!(Cli::try_parse_from(["fundus", "near", "--step", "0.2"]).is_err());
    }
}
