// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use pano_rig::config::RigConfig;
use pano_rig::constants;
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "pano-rig")]
#[command(about = "Synchronized multi-camera panoramic rig control")]
#[command(version = constants::app_info::version())]
struct Cli {
    /// Config file (default: ~/.config/pano-rig/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone, Copy)]
struct RigArgs {
    /// Number of cameras in the rig
    #[arg(short, long, default_value = "2")]
    cameras: usize,

    #[arg(long, default_value_t = constants::DEFAULT_PREVIEW_SIZE.0)]
    width: u32,

    #[arg(long, default_value_t = constants::DEFAULT_PREVIEW_SIZE.1)]
    height: u32,

    #[arg(long, default_value_t = constants::DEFAULT_PREVIEW_FPS)]
    fps: u32,
}

impl From<RigArgs> for cli::PreviewArgs {
    fn from(args: RigArgs) -> Self {
        cli::PreviewArgs {
            cameras: args.cameras,
            width: args.width,
            height: args.height,
            fps: args.fps,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Open the synchronized preview and print camera status
    Preview {
        #[command(flatten)]
        rig: RigArgs,
    },

    /// Stream into per-camera targets, then restart the preview
    Capture {
        #[command(flatten)]
        rig: RigArgs,

        /// Capture duration in seconds
        #[arg(short, long, default_value = "3")]
        seconds: u64,

        /// Use the exclusive 940x940@60 capture size
        #[arg(long)]
        exclusive: bool,
    },

    /// Take a bracketed HDR photo, or a single still with --count 0
    Hdr {
        #[command(flatten)]
        rig: RigArgs,

        /// Exposures in the bracket (3, 5, 7 or 9)
        #[arg(short = 'n', long, default_value = "3")]
        count: usize,

        /// Output directory (default: ~/Pictures/pano-rig)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep the per-exposure source frames
        #[arg(long)]
        keep_sources: bool,

        /// Write single stills as DNG
        #[arg(long)]
        dng: bool,
    },

    /// Print how a resolution change would be carried out
    Resolve {
        /// Current env as id,width,height,fps (omit for a closed camera)
        #[arg(long, value_parser = cli::parse_env)]
        current: Option<pano_rig::backends::camera::CameraEnvParams>,

        /// Requested env as id,width,height,fps
        #[arg(long, value_parser = cli::parse_env)]
        requested: pano_rig::backends::camera::CameraEnvParams,

        /// Rebuild the session even when nothing changed
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise warn, or debug with -v
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let config = match &cli.config {
        Some(path) => {
            let mut config = RigConfig::load(path)?;
            config.apply_env_overrides(|key| std::env::var(key).ok());
            config
        }
        None => RigConfig::load_or_default(),
    };

    match cli.command {
        Commands::Preview { rig } => cli::preview(config, rig.into()).await,
        Commands::Capture {
            rig,
            seconds,
            exclusive,
        } => cli::capture(config, rig.into(), seconds, exclusive).await,
        Commands::Hdr {
            rig,
            count,
            output,
            keep_sources,
            dng,
        } => {
            let hdr_count = (count > 0).then_some(count);
            cli::photo(config, rig.into(), hdr_count, output, keep_sources, dng).await
        }
        Commands::Resolve {
            current,
            requested,
            force,
        } => cli::resolve(current, requested, force),
        Commands::Config => cli::show_config(&config),
    }
}
