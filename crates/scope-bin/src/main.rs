//! `scope-ctl`: drive filter wheels, lasers and stages from the command line.
//!
//! Devices come from a hardware file (`--config`) or from the built-in
//! simulated bench (`--mock`).
//!
//! ```bash
//! scope-ctl --config hardware.toml list
//! scope-ctl --config hardware.toml wheel set emission 3
//! scope-ctl --mock laser set-power omicron 0.5
//! scope-ctl --mock stage move-by stage z -2.5
//! RUST_LOG=scope_core=debug scope-ctl --mock laser status cobolt
//! ```

// Global allocator
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use scope_core::capabilities::{FilterWheel, LightSource, SoftwareTriggered, Stage};
use scope_hardware::{create_mock_registry, create_registry_from_file, DeviceRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "scope-ctl")]
#[command(about = "Control microscope filter wheels, lasers and stages", long_about = None)]
struct Cli {
    /// Hardware configuration file (TOML format)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use simulated devices instead of a hardware file
    #[arg(long, global = true, conflicts_with = "config")]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered devices and failed registrations
    List,

    /// Filter wheel commands
    #[command(subcommand)]
    Wheel(WheelCommands),

    /// Laser commands
    #[command(subcommand)]
    Laser(LaserCommands),

    /// Stage commands
    #[command(subcommand)]
    Stage(StageCommands),
}

#[derive(Subcommand)]
enum WheelCommands {
    /// Print the current slot
    Get {
        /// Device ID
        device: String,
    },
    /// Move to a slot (0-based)
    Set {
        /// Device ID
        device: String,
        slot: usize,
    },
}

#[derive(Subcommand)]
enum LaserCommands {
    /// Print measured power as a fraction of maximum
    Power {
        /// Device ID
        device: String,
    },
    /// Set power as a fraction of maximum (0.0 - 1.0)
    SetPower {
        /// Device ID
        device: String,
        fraction: f64,
    },
    /// Turn emission on
    Enable {
        /// Device ID
        device: String,
    },
    /// Turn emission off
    Disable {
        /// Device ID
        device: String,
    },
    /// Print the device status report
    Status {
        /// Device ID
        device: String,
    },
    /// Fire one software-triggered exposure
    Trigger {
        /// Device ID
        device: String,
        /// Exposure override in milliseconds
        #[arg(long)]
        exposure_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum StageCommands {
    /// Print position and travel limits of every axis
    Position {
        /// Device ID
        device: String,
    },
    /// Move an axis to an absolute position
    MoveTo {
        /// Device ID
        device: String,
        axis: String,
        #[arg(allow_negative_numbers = true)]
        position: f64,
    },
    /// Move an axis by a relative step
    MoveBy {
        /// Device ID
        device: String,
        axis: String,
        #[arg(allow_negative_numbers = true)]
        delta: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let registry = build_registry(&cli).await?;
    for failure in registry.list_registration_failures() {
        eprintln!(
            "Warning: device '{}' ({}) not available: {}",
            failure.device_id, failure.driver_type, failure.error
        );
    }

    let result = run(&registry, cli.command).await;
    if let Err(e) = registry.shutdown_all().await {
        tracing::warn!(error = %e, "Shutdown reported errors");
    }
    result
}

async fn build_registry(cli: &Cli) -> Result<DeviceRegistry> {
    if cli.mock {
        tracing::info!("Using simulated devices");
        return Ok(create_mock_registry().await);
    }
    let path = cli
        .config
        .as_ref()
        .ok_or_else(|| anyhow!("pass --config <file> or --mock"))?;
    create_registry_from_file(path)
        .await
        .with_context(|| format!("loading {}", path.display()))
}

async fn run(registry: &DeviceRegistry, command: Commands) -> Result<()> {
    match command {
        Commands::List => {
            for info in registry.list_devices() {
                let caps: Vec<&str> = info.capabilities.iter().map(|c| c.name()).collect();
                println!(
                    "{:<16} {:<24} {:<22} {}",
                    info.id,
                    info.name,
                    info.driver_type,
                    caps.join(", ")
                );
            }
            Ok(())
        }
        Commands::Wheel(cmd) => run_wheel(registry, cmd).await,
        Commands::Laser(cmd) => run_laser(registry, cmd).await,
        Commands::Stage(cmd) => run_stage(registry, cmd).await,
    }
}

fn wheel(registry: &DeviceRegistry, id: &str) -> Result<Arc<dyn FilterWheel>> {
    registry
        .filter_wheel(id)
        .ok_or_else(|| anyhow!("no filter wheel named '{}'", id))
}

fn laser(registry: &DeviceRegistry, id: &str) -> Result<Arc<dyn LightSource>> {
    registry
        .light_source(id)
        .ok_or_else(|| anyhow!("no light source named '{}'", id))
}

fn triggered(registry: &DeviceRegistry, id: &str) -> Result<Arc<dyn SoftwareTriggered>> {
    registry
        .triggered(id)
        .ok_or_else(|| anyhow!("'{}' has no software trigger", id))
}

fn stage(registry: &DeviceRegistry, id: &str) -> Result<Arc<dyn Stage>> {
    registry
        .stage(id)
        .ok_or_else(|| anyhow!("no stage named '{}'", id))
}

async fn run_wheel(registry: &DeviceRegistry, command: WheelCommands) -> Result<()> {
    match command {
        WheelCommands::Get { device } => {
            let wheel = wheel(registry, &device)?;
            println!(
                "{}: slot {} of {}",
                device,
                wheel.position().await?,
                wheel.position_count()
            );
        }
        WheelCommands::Set { device, slot } => {
            let wheel = wheel(registry, &device)?;
            wheel.set_position(slot).await?;
            println!("{}: slot {}", device, wheel.position().await?);
        }
    }
    Ok(())
}

async fn run_laser(registry: &DeviceRegistry, command: LaserCommands) -> Result<()> {
    match command {
        LaserCommands::Power { device } => {
            let power = laser(registry, &device)?.power().await?;
            println!("{}: {:.4}", device, power);
        }
        LaserCommands::SetPower { device, fraction } => {
            let source = laser(registry, &device)?;
            source.set_power(fraction).await?;
            println!("{}: set point {:.4}", device, source.power_setpoint());
        }
        LaserCommands::Enable { device } => {
            if laser(registry, &device)?.enable().await? {
                println!("{}: emission on", device);
            } else {
                return Err(anyhow!("{} refused to turn on", device));
            }
        }
        LaserCommands::Disable { device } => {
            if laser(registry, &device)?.disable().await? {
                println!("{}: emission off", device);
            } else {
                return Err(anyhow!("{} refused to turn off", device));
            }
        }
        LaserCommands::Status { device } => {
            for line in laser(registry, &device)?.status().await? {
                println!("{}", line);
            }
        }
        LaserCommands::Trigger {
            device,
            exposure_ms,
        } => {
            let trigger = triggered(registry, &device)?;
            if let Some(ms) = exposure_ms {
                trigger.set_exposure(Duration::from_millis(ms));
            }
            let exposure = trigger.exposure();
            trigger.trigger().await?;
            // Let the return to standby run before the registry shuts down.
            tokio::time::sleep(exposure + Duration::from_millis(50)).await;
            println!("{}: triggered for {} ms", device, exposure.as_millis());
        }
    }
    Ok(())
}

async fn run_stage(registry: &DeviceRegistry, command: StageCommands) -> Result<()> {
    match command {
        StageCommands::Position { device } => {
            let stage = stage(registry, &device)?;
            for axis in stage.axes() {
                let limits = stage.limits(&axis).await?;
                println!(
                    "{}.{}: {} [{}, {}]",
                    device,
                    axis,
                    stage.position(&axis).await?,
                    limits.lower,
                    limits.upper
                );
            }
        }
        StageCommands::MoveTo {
            device,
            axis,
            position,
        } => {
            let stage = stage(registry, &device)?;
            stage.move_to(&axis, position).await?;
            println!("{}.{}: {}", device, axis, stage.position(&axis).await?);
        }
        StageCommands::MoveBy {
            device,
            axis,
            delta,
        } => {
            let stage = stage(registry, &device)?;
            stage.move_by(&axis, delta).await?;
            println!("{}.{}: {}", device, axis, stage.position(&axis).await?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_laser_trigger() {
        let cli = Cli::parse_from([
            "scope-ctl",
            "--mock",
            "laser",
            "trigger",
            "dpl",
            "--exposure-ms",
            "20",
        ]);
        assert!(cli.mock);
        assert!(matches!(
            cli.command,
            Commands::Laser(LaserCommands::Trigger {
                exposure_ms: Some(20),
                ..
            })
        ));
    }

    #[test]
    fn test_parse_negative_stage_step() {
        let cli = Cli::parse_from(["scope-ctl", "--mock", "stage", "move-by", "stage", "z", "-2.5"]);
        match cli.command {
            Commands::Stage(StageCommands::MoveBy { axis, delta, .. }) => {
                assert_eq!(axis, "z");
                assert_eq!(delta, -2.5);
            }
            _ => panic!("expected stage move-by"),
        }
    }

    #[test]
    fn test_config_and_mock_conflict() {
        let parsed = Cli::try_parse_from(["scope-ctl", "--mock", "--config", "x.toml", "list"]);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn test_commands_against_mock_bench() {
        let registry = create_mock_registry().await;
        run(&registry, Commands::List).await.unwrap();
        run_wheel(
            &registry,
            WheelCommands::Set {
                device: "wheel".into(),
                slot: 2,
            },
        )
        .await
        .unwrap();
        assert_eq!(registry.filter_wheel("wheel").unwrap().position().await.unwrap(), 2);

        run_laser(
            &registry,
            LaserCommands::SetPower {
                device: "omicron".into(),
                fraction: 0.5,
            },
        )
        .await
        .unwrap();
        assert!(run_laser(
            &registry,
            LaserCommands::Trigger {
                device: "cobolt".into(),
                exposure_ms: None,
            },
        )
        .await
        .is_err());

        run_stage(
            &registry,
            StageCommands::MoveTo {
                device: "stage".into(),
                axis: "z".into(),
                position: 40.0,
            },
        )
        .await
        .unwrap();
        run_stage(
            &registry,
            StageCommands::MoveBy {
                device: "stage".into(),
                axis: "z".into(),
                delta: -2.5,
            },
        )
        .await
        .unwrap();
        assert_eq!(registry.stage("stage").unwrap().position("z").await.unwrap(), 37.5);
        assert!(run_stage(
            &registry,
            StageCommands::MoveTo {
                device: "stage".into(),
                axis: "z".into(),
                position: 250.0,
            },
        )
        .await
        .is_err());
        registry.shutdown_all().await.unwrap();
    }
}
