//! screenchat - talk to Gemini Live with your microphone, screen and keyboard.

#![forbid(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use screenchat::audio::PulseBackend;
use screenchat::config::{load_env_file, AppConfig, ENV_FILE};
use screenchat::gemini::GeminiConnector;
use screenchat::screen::{FrameSource, XcapScreen};
use screenchat::supervisor::{RunReport, Supervisor};
use screenchat::text_input::StdinLines;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Blocking device and console calls run here, off the scheduler thread.
const BLOCKING_THREADS: usize = 4;
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> ExitCode {
    // Before parsing, so GEMINI_API_KEY and SYSTEM_PROMPT can come from the file.
    let env_file = load_env_file(Path::new(ENV_FILE));
    let config = AppConfig::parse();
    init_tracing(config.verbose);
    match env_file {
        Ok(true) => info!("Loaded {}", ENV_FILE),
        Ok(false) => {}
        Err(e) => warn!("Ignoring {}: {}", ENV_FILE, e),
    }

    match run(config) {
        Ok(report) if report.is_fatal() => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info,screenchat=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(config: AppConfig) -> anyhow::Result<RunReport> {
    config.validate()?;
    info!("Starting screenchat ({})", config.model);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(BLOCKING_THREADS)
        .build()
        .context("failed to build runtime")?;

    let audio = PulseBackend::new("screenchat")
        .with_input_device(config.input_device.clone())
        .with_output_device(config.output_device.clone());
    let screen: Option<Box<dyn FrameSource>> = if config.no_screen {
        None
    } else {
        Some(Box::new(XcapScreen::new()))
    };

    let supervisor = Supervisor::new(
        Arc::new(GeminiConnector::new(config.gemini())),
        Arc::new(audio),
        screen,
        Box::new(StdinLines::spawn()),
        config.run_settings(),
    );

    let result = runtime.block_on(supervisor.run(ctrl_c()));
    // A device call still blocked on the pool must not keep the process alive.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    let report = result?;
    for failure in &report.failures {
        error!("{} failed: {}", failure.task, failure.error);
    }
    for e in &report.teardown_errors {
        warn!("{}", e);
    }
    info!("Session ended: {:?}", report.reason);
    Ok(report)
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl-C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}
