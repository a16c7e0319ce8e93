use anyhow::Context;
use cita_autobook::utils::ScreenshotRecorder;
use cita_autobook::{
    AutobookError, ChromeSessionFactory, Config, CycleSupervisor, FlowVariant, Identity, Pacer,
    PageAudioAlarm, SupervisorExit,
};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Watches the cita previa portal and books the first appointment it sees.
#[derive(Debug, Parser)]
#[command(name = "cita-autobook", version)]
struct Cli {
    /// TOML file overriding the built-in portal settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Which procedure to book.
    #[arg(long, env = "TRAMITE_MODE")]
    flow: Option<FlowVariant>,

    #[arg(long)]
    headless: bool,

    /// Save a screenshot after each step.
    #[arg(long)]
    shots: bool,

    /// Chrome profile directory, kept between cycles.
    #[arg(long)]
    profile_dir: Option<PathBuf>,

    /// Audio clip played when the availability page changes.
    #[arg(long)]
    alarm_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Missing .env is fine; identity may come from the real environment.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let configuration = e
                .downcast_ref::<AutobookError>()
                .map(AutobookError::is_configuration)
                .unwrap_or(false);
            error!("{:#}", e);
            if configuration {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(flow) = cli.flow {
        config.flow = flow;
    }
    if cli.headless {
        config.browser.headless = true;
    }
    if cli.shots {
        config.observability.screenshots = true;
    }
    if let Some(dir) = &cli.profile_dir {
        config.browser.profile_dir = dir.clone();
    }
    if let Some(file) = &cli.alarm_file {
        config.alert.audio_file = Some(file.clone());
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli);
    config.validate()?;

    let identity = Identity::from_env(config.flow)?;
    let alarm = PageAudioAlarm::from_config(&config.alert).context("loading the alarm clip")?;
    info!(flow = %config.flow, ?identity, headless = config.browser.headless, "configuration loaded");

    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("interrupt received, stopping");
            if stop_tx.send(true).is_err() {
                return;
            }
        }
    });

    let config = Arc::new(config);
    let supervisor = CycleSupervisor::new(
        config.clone(),
        Arc::new(identity),
        ChromeSessionFactory::new(config.browser.clone()),
        Arc::new(alarm),
        ScreenshotRecorder::new(&config.observability),
        Arc::new(Pacer::new(config.pacing.clone())),
    );

    match supervisor.run_forever(stop_rx.clone()).await {
        SupervisorExit::Booked(session) => {
            info!(session = %session.id(), "appointment booked; the browser stays open until Ctrl-C");
            while !*stop_rx.borrow() {
                if stop_rx.changed().await.is_err() {
                    break;
                }
            }
            if let Err(e) = session.close().await {
                warn!(error = %e, "browser did not close cleanly");
            }
        }
        SupervisorExit::Cancelled => info!("stopped before a booking"),
    }
    Ok(())
}
