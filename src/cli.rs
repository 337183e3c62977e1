use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::api::{self, AppState};
use crate::config::AppConfig;
use crate::domain::plan::PlanStatus;
use crate::fixture::{self, resolve_fixture_paths};
use crate::planner::service::EmsPlanService;
use crate::planner::Planner;
use crate::resolver::provider::RestProvider;
use crate::telemetry;

pub const EXIT_OK: u8 = 0;
pub const EXIT_CONFIG: u8 = 1;
pub const EXIT_NOT_OPTIMAL: u8 = 2;
pub const EXIT_IO: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "home-ems", about = "Home EMS dispatch planner", version)]
pub struct Cli {
    /// Path to the YAML configuration.
    #[arg(long, global = true, default_value = "ems_config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP planning service (default).
    Serve,
    /// Deterministic fixture replay and capture.
    Fixture {
        #[command(subcommand)]
        command: FixtureCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum FixtureCommand {
    /// Replay a captured fixture and compare against its stored baseline.
    Replay {
        /// Base directory holding fixture bundles.
        #[arg(long)]
        dir: PathBuf,
        /// Fixture name under the base directory.
        #[arg(long)]
        fixture: String,
        /// Optional scenario subdirectory.
        #[arg(long)]
        scenario: Option<String>,
        /// Fail with exit code 2 when the solver is not Optimal.
        #[arg(long)]
        strict: bool,
        /// Write the summary and hash as the new baseline.
        #[arg(long)]
        write: bool,
    },
    /// Capture a fresh snapshot from the live provider.
    Capture {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        fixture: String,
        #[arg(long)]
        scenario: Option<String>,
    },
}

pub async fn run() -> ExitCode {
    telemetry::init_tracing();
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(error = %format!("{err:#}"), "fatal");
            ExitCode::from(classify_error(&err))
        }
    }
}

fn classify_error(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<std::io::Error>().is_some() {
        return EXIT_IO;
    }
    if let Some(ems) = err.downcast_ref::<crate::error::EmsError>() {
        if matches!(ems, crate::error::EmsError::Io(_)) {
            return EXIT_IO;
        }
    }
    EXIT_CONFIG
}

async fn dispatch(cli: Cli) -> Result<u8> {
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&cli.config).await,
        Command::Fixture { command } => match command {
            FixtureCommand::Replay { dir, fixture, scenario, strict, write } => {
                replay(&cli.config, dir, &fixture, scenario.as_deref(), strict, write)
            }
            FixtureCommand::Capture { dir, fixture, scenario } => {
                capture(&cli.config, dir, &fixture, scenario.as_deref()).await
            }
        },
    }
}

async fn serve(config_path: &std::path::Path) -> Result<u8> {
    let config = Arc::new(AppConfig::load(config_path)?);
    let provider = Arc::new(RestProvider::new(
        &config.provider.base_url,
        &config.provider.token,
        Duration::from_secs(config.provider.timeout_secs),
    )?);
    let service = Arc::new(EmsPlanService::new(Arc::clone(&config), provider));
    let planner = Planner::new(service, Duration::from_secs(config.ems.replan_debounce_seconds));

    let state = AppState { config: Arc::clone(&config), planner: planner.clone() };
    let app = api::router(state);

    let addr = config.server.socket_addr()?;
    info!(%addr, "starting home EMS planner");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(telemetry::shutdown_signal()).await?;

    planner.stop().await;
    info!("shutdown complete");
    Ok(EXIT_OK)
}

fn replay(
    config_path: &std::path::Path,
    dir: PathBuf,
    fixture: &str,
    scenario: Option<&str>,
    strict: bool,
    write: bool,
) -> Result<u8> {
    let paths = resolve_fixture_paths(&dir, fixture, scenario);
    let config_path = if paths.config_path.exists() {
        paths.config_path.clone()
    } else {
        config_path.to_path_buf()
    };
    let config = AppConfig::load(&config_path)?;

    let outcome = fixture::replay(&config, &paths, write)
        .with_context(|| format!("replay of fixture {fixture} failed"))?;

    info!(
        status = %outcome.plan.status,
        hash = %outcome.hash,
        baseline = ?outcome.matches_baseline,
        "fixture replayed"
    );

    if strict && outcome.plan.status != PlanStatus::Optimal {
        error!(status = %outcome.plan.status, "solver did not reach optimality");
        return Ok(EXIT_NOT_OPTIMAL);
    }
    if outcome.matches_baseline == Some(false) {
        error!(hash = %outcome.hash, "plan summary drifted from stored baseline");
        return Ok(EXIT_CONFIG);
    }
    Ok(EXIT_OK)
}

async fn capture(
    config_path: &std::path::Path,
    dir: PathBuf,
    fixture: &str,
    scenario: Option<&str>,
) -> Result<u8> {
    let config = AppConfig::load(config_path)?;
    let provider = Arc::new(RestProvider::new(
        &config.provider.base_url,
        &config.provider.token,
        Duration::from_secs(config.provider.timeout_secs),
    )?);
    let snapshot = fixture::capture_snapshot(&config, provider).await?;

    let paths = resolve_fixture_paths(&dir, fixture, scenario);
    snapshot.write(&paths.fixture_path)?;
    // Redacted config sits alongside the snapshot for self-contained
    // replay.
    std::fs::create_dir_all(&paths.fixture_dir)?;
    std::fs::write(&paths.config_path, serde_yaml::to_string(&config)?)?;
    info!(path = %paths.fixture_path.display(), "fixture captured");
    Ok(EXIT_OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_arguments_parse() {
        let cli = Cli::parse_from([
            "home-ems",
            "fixture",
            "replay",
            "--dir",
            "fixtures",
            "--fixture",
            "winter_day",
            "--scenario",
            "no_pv",
            "--strict",
        ]);
        match cli.command {
            Some(Command::Fixture { command: FixtureCommand::Replay { fixture, scenario, strict, write, .. } }) => {
                assert_eq!(fixture, "winter_day");
                assert_eq!(scenario.as_deref(), Some("no_pv"));
                assert!(strict);
                assert!(!write);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn default_command_is_serve() {
        let cli = Cli::parse_from(["home-ems"]);
        assert!(cli.command.is_none());
    }
}
