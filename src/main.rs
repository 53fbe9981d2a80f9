//! Headless front end for the on-device image classifier.

use clap::{Parser, Subcommand};
use image_lens_lib::commands::classifier::{self, OrtController};
use image_lens_lib::models::classify_types::{DevicePreference, SessionEvent};
use image_lens_lib::{ClassifierConfig, ImageHandle};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run the model on the CPU only
    #[arg(long, global = true)]
    cpu: bool,

    /// Directory the model files are cached in
    #[arg(long, global = true, env = "IMAGE_LENS_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify one or more images
    Classify {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Download and load the model ahead of time
    Load,
    /// Show the model session state
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(cli.log_level.parse().unwrap_or(LevelFilter::INFO).into())
                .from_env_lossy(),
        )
        .with_target(false)
        .init();

    let mut config = match ClassifierConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if cli.cpu {
        config.device = DevicePreference::Cpu;
    }
    if let Some(dir) = cli.model_dir {
        config.model.dir = dir;
    }

    let controller = classifier::build_controller(&config);
    let logger = tokio::spawn(log_events(controller.subscribe()));

    let code = run(&controller, cli.command).await;

    drop(controller);
    let _ = logger.await;
    code
}

async fn run(controller: &OrtController, command: Commands) -> ExitCode {
    match command {
        Commands::Status => {
            let status = classifier::get_model_status(controller);
            let downloaded = controller.orchestrator().manager().loader().is_downloaded();
            println!("model:      {}", controller.orchestrator().manager().spec().model_id);
            println!("downloaded: {}", downloaded);
            println!("state:      {:?}", status.state);
            ExitCode::SUCCESS
        }
        Commands::Load => match classifier::load_model(controller).await {
            Ok(status) => {
                println!("state: {:?}", status.state);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{}", e);
                ExitCode::FAILURE
            }
        },
        Commands::Classify { images } => {
            let handles: Vec<ImageHandle> = images.iter().map(ImageHandle::from_path).collect();
            let reports = classifier::classify_images(controller, &handles).await;

            let mut failed = false;
            for report in &reports {
                println!("{}", report.file_name);
                match &report.error {
                    Some(e) => {
                        failed = true;
                        println!("  error: {}", e);
                    }
                    None => {
                        for (rank, p) in report.predictions.iter().enumerate() {
                            println!("  {}. {:<40} {:>6.2}%", rank + 1, p.label, p.score * 100.0);
                        }
                    }
                }
            }

            if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
    }
}

async fn log_events(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        match rx.recv().await {
            Ok(SessionEvent::Busy { busy }) => debug!(?busy, "busy"),
            Ok(SessionEvent::StateChanged { state }) => debug!(?state, "state"),
            Ok(SessionEvent::DownloadProgress { percent }) => {
                if percent % 10 == 0 {
                    info!("Downloading model... {}%", percent);
                }
            }
            Ok(SessionEvent::ResultsReady { results }) => debug!(count = results.len(), "results ready"),
            Ok(SessionEvent::Error { kind, message }) => debug!(%kind, %message, "error event"),
            Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "event log lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
