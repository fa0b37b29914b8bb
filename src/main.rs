use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use idotmatrix_link::config::LinkConfig;
use idotmatrix_link::connection::{ConnectionListener, ConnectionManager};
use idotmatrix_link::display::{CommonCommands, GifUpload, ImageUpload};
use idotmatrix_link::transport::{BleConfig, BleTransport, ScanConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "idm")]
#[command(version, about = "Drive an iDotMatrix LED display over Bluetooth LE")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Bluetooth address of the display (discovered when omitted)
    #[arg(long, global = true, env = "IDM_ADDRESS")]
    address: Option<String>,

    /// TOML configuration file
    #[arg(long, global = true, env = "IDM_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby displays, strongest signal first
    Discover,

    /// Switch the panel on
    On,

    /// Switch the panel off
    Off,

    /// Set brightness in percent
    Brightness {
        #[arg(value_parser = clap::value_parser!(u8).range(5..=100))]
        percent: u8,
    },

    /// Rotate the screen by 180 degrees
    Flip {
        #[arg(action = ArgAction::Set)]
        flipped: bool,
    },

    /// Set the device clock to local time
    SyncTime,

    /// Clear stuck device state
    Reset,

    /// Upload a GIF already sized for the panel
    UploadGif {
        file: PathBuf,

        /// Time-signature key (1-4)
        #[arg(long, default_value_t = 1)]
        time_sign: u8,
    },

    /// Upload a raw RGB888 frame already sized for the panel
    UploadImage { file: PathBuf },

    /// Stay connected and reconnect on drops until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => LinkConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => LinkConfig::default(),
    };
    if cli.address.is_some() {
        config.address = cli.address;
    }

    let transport = BleTransport::new(BleConfig {
        scan: ScanConfig {
            scan_duration: config.scan_duration,
            name_prefix: config.name_prefix.clone(),
        },
        ..Default::default()
    })
    .await
    .context("Failed to open Bluetooth adapter")?;

    let link = ConnectionManager::new(Arc::new(transport), config);
    info!("Using {} transport", link.transport_name());

    match cli.command {
        Commands::Discover => {
            for address in link.discover_devices().await? {
                println!("{}", address);
            }
            return Ok(());
        }
        Commands::Watch => return watch(&link).await,
        Commands::On => CommonCommands::new(&link).screen_on().await?,
        Commands::Off => CommonCommands::new(&link).screen_off().await?,
        Commands::Brightness { percent } => {
            CommonCommands::new(&link).set_brightness(percent).await?
        }
        Commands::Flip { flipped } => CommonCommands::new(&link).flip_screen(flipped).await?,
        Commands::SyncTime => CommonCommands::new(&link).sync_time().await?,
        Commands::Reset => CommonCommands::new(&link).reset().await?,
        Commands::UploadGif { file, time_sign } => {
            let gif = read_file(&file).await?;
            GifUpload::new(&link).upload(&gif, time_sign).await?;
        }
        Commands::UploadImage { file } => {
            let rgb = read_file(&file).await?;
            let images = ImageUpload::new(&link);
            images.set_mode(1).await?;
            images.upload_rgb(&rgb).await?;
        }
    }

    link.disconnect().await;
    Ok(())
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

/// Keep the link up until Ctrl-C
async fn watch(link: &ConnectionManager) -> Result<()> {
    link.add_connection_listener(
        ConnectionListener::new()
            .on_connected(|| async { info!("Display connected") })
            .on_disconnected(|| async { warn!("Display disconnected") }),
    )
    .await;

    link.connect().await?;
    let mut state = link.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow();
                info!("Link state: {}", current);
            }
        }
    }

    link.disconnect().await;
    Ok(())
}
