//! CLI entry point for rust-scan
//!
//! - `demo` runs a snake grid scan against the simulated beamline and prints the
//!   datasets the file will contain
//! - `check-config` loads a configuration file and validates it
//!
//! ```bash
//! rust-scan demo --rows 3 --cols 4 --duration 0.05 --dir /tmp/scan
//! rust-scan check-config config/rust_scan.toml
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_scan::config::ScanConfig;
use rust_scan::generator::{CompoundGenerator, LineSpec};
use rust_scan::hooks::ConfigureParams;
use rust_scan::sim::Beamline;
use rust_scan::tracing_config;

#[derive(Parser)]
#[command(name = "rust-scan")]
#[command(about = "Scan coordination for motion controllers, detectors and file writers", long_about = None)]
struct Cli {
    /// Configuration file; defaults to config/rust_scan.toml plus environment
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a snake grid scan on simulated hardware
    Demo {
        /// Points along y (outer)
        #[arg(long, default_value = "2")]
        rows: usize,

        /// Points along x (inner)
        #[arg(long, default_value = "3")]
        cols: usize,

        /// Seconds per point
        #[arg(long, default_value = "0.1")]
        duration: f64,

        /// Directory for the layout and data files
        #[arg(long, default_value = "/tmp")]
        dir: String,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// File to check
        path: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<ScanConfig> {
    let config = match path {
        Some(path) => ScanConfig::load_from(path),
        None => ScanConfig::load(),
    }
    .context("loading configuration")?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            rows,
            cols,
            duration,
            dir,
        } => {
            let config = load_config(cli.config.as_ref())?;
            tracing_config::init_from_config(&config)?;
            run_demo(&config, rows, cols, duration, dir).await
        }
        Commands::CheckConfig { path } => {
            let config = load_config(Some(&path))?;
            println!("{} is valid", path.display());
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_demo(config: &ScanConfig, rows: usize, cols: usize, duration: f64, dir: String) -> Result<()> {
    let beamline = Beamline::build("DEMO", config).await?;
    let generator = CompoundGenerator::new(
        vec![
            LineSpec::new("y", "mm", 0.0, 1.0, rows),
            LineSpec::new("x", "mm", 0.0, 1.0, cols),
        ],
        duration,
        true,
    );
    let params = ConfigureParams::new(generator).with_file_dir(dir);

    let params = beamline.controller.configure(params).await?;
    println!(
        "Configured {} steps, {:.3}s per point",
        params.generator.size(),
        params.generator.duration
    );
    beamline.controller.run().await?;
    println!(
        "Scan finished: {} steps, state {}",
        beamline.controller.completed_steps(),
        beamline.controller.state()
    );

    println!("Datasets:");
    for producer in beamline.controller.dataset_producers() {
        println!(
            "  {:<20} {:<14} rank {} {}",
            producer.name,
            format!("{:?}", producer.dataset_type),
            producer.rank,
            producer.path
        );
    }
    Ok(())
}
