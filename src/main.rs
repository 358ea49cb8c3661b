//! vde-pipeline - Vehicle document extraction
//!
//! Finds the document in each photograph, rectifies it, tightens the text
//! boxes reported by a detection service, collects recognized text and
//! corrects place names against a gazetteer.

mod config;
mod correction;
mod error;
mod pipeline;
mod services;
mod storage;
mod vision;

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::AppConfig;
use crate::pipeline::{Collaborators, PipelineOrchestrator};
use crate::services::{RemoteOcrClient, TextDetectionService, TextRecognitionService};

/// Vehicle document extraction pipeline
#[derive(Parser, Debug)]
#[command(name = "vde-pipeline")]
#[command(about = "Detect, rectify and read vehicle documents from photographs")]
struct Args {
    /// Configuration file (TOML). Defaults to config.toml in the user config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Folder with input photographs
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Root folder for every stage output
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Maximum number of photographs fed to vehicle detection
    #[arg(long)]
    limit: Option<usize>,

    /// Write the effective configuration to this path and exit
    #[arg(long)]
    write_config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let mut config = load_or_default_config(args.config.as_deref())?;
    if let Some(input) = args.input {
        config.paths.input_folder = input;
    }
    if let Some(output) = args.output {
        config.paths.base_path = output;
    }
    if let Some(limit) = args.limit {
        config.stages.limit = Some(limit);
    }

    if let Some(path) = args.write_config {
        config::save_config(&config, &path)?;
        info!("Wrote configuration to {:?}", path);
        return Ok(());
    }

    info!("Input folder: {:?}", config.paths.input_folder);
    info!("Output folder: {:?}", config.paths.base_path);

    let collaborators = build_collaborators(&config)?;
    let orchestrator = PipelineOrchestrator::new(config, collaborators);

    match orchestrator.run() {
        Ok(report) => {
            for summary in &report.summaries {
                info!(
                    "{}: {} ok, {} failed, {} not found",
                    summary.stage, summary.successful, summary.failed, summary.not_found
                );
            }
            println!("{}", serde_json::to_string_pretty(&report.results)?);
            info!(
                "Run {} results saved to {:?}",
                report.run_id,
                orchestrator.config().paths.final_results_file()
            );
            Ok(())
        }
        Err(failure) => {
            error!("{}", failure);
            println!("{}", serde_json::to_string_pretty(&failure)?);
            std::process::exit(1);
        }
    }
}

/// Configuration from an explicit path, the user config directory, or defaults
fn load_or_default_config(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        let config = config::load_config(path)?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(config_dir) = storage::get_config_dir() {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            match config::load_config(&config_path) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", config_path);
                    return Ok(config);
                }
                Err(e) => warn!("Ignoring unreadable configuration {:?}: {:#}", config_path, e),
            }
        }
    }

    info!("Using default configuration");
    Ok(AppConfig::default())
}

/// Remote services when their endpoints are configured. Vehicle detection
/// and local OCR need model-backed engines, which this binary does not bundle.
fn build_collaborators(config: &AppConfig) -> Result<Collaborators> {
    let mut collaborators = Collaborators::default();

    let detection = RemoteOcrClient::new(&config.services)?;
    if detection.has_detection() {
        collaborators.text_detector = Some(Box::new(detection) as Box<dyn TextDetectionService>);
    }

    let recognition = RemoteOcrClient::new(&config.services)?;
    if recognition.has_recognition() {
        collaborators.text_recognizer = Some(Box::new(recognition) as Box<dyn TextRecognitionService>);
    }

    Ok(collaborators)
}
