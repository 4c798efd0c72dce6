use anyhow::Result;
use chrono::{Duration, Local};
use clap::Parser;
use tracing::{info, warn};

mod config;
mod db;
mod error;
mod features;
mod games;
mod ledger;
mod model;
mod pipeline;
mod retry;

use config::{Command, Config};
use db::Database;
use games::provider::GameLogSource;
use games::stats_api::{FileSource, StatsApiSource};
use ledger::{LedgerSink, RestLedgerSink};
use model::{LogisticScorer, PlattCalibration, PredictionService, Scorer};
use pipeline::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    let source: Option<Box<dyn GameLogSource>> = match (&config.game_log_url, &config.game_log_file) {
        (Some(url), _) => Some(Box::new(StatsApiSource::new(url)?)),
        (None, Some(path)) => Some(Box::new(FileSource::new(path.clone()))),
        (None, None) => None,
    };
    let sink: Option<Box<dyn LedgerSink>> = match &config.remote_ledger_url {
        Some(url) => Some(Box::new(RestLedgerSink::new(
            url,
            config.remote_ledger_key.as_deref(),
        )?)),
        None => None,
    };

    let pipeline = Pipeline {
        db,
        source,
        sink,
        retry: config.retry_policy(),
        upsert_chunk_size: config.upsert_chunk_size,
        thresholds: config.explain_thresholds(),
    };
    let today = Local::now().date_naive();

    match &config.command {
        Command::Ingest => {
            if pipeline.refresh_games().await?.is_none() {
                warn!("Nothing to ingest: set --game-log-url or --game-log-file");
            }
        }
        Command::Features { out } => {
            pipeline.export_features(out).await?;
        }
        Command::Predict { date } => {
            let service = load_service(&config, &pipeline.db)?;
            let report = pipeline.predict(&service, date.unwrap_or(today)).await?;
            for f in &report.failures {
                warn!("Not predicted: {} ({:?}): {}", f.key, f.stage, f.cause);
            }
            if let Some(d) = &report.dispatch {
                for (key, cause) in &d.failed {
                    warn!("Remote ledger missing {}: {}", key, cause);
                }
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Pull => match pipeline.pull().await? {
            Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            None => warn!("Nothing to pull: set --remote-ledger-url"),
        },
        Command::Verify { date } => {
            let report = pipeline.verify(today, *date).await?;
            if let Some(d) = &report.dispatch {
                for (key, cause) in &d.failed {
                    warn!("Remote ledger outcome missing {}: {}", key, cause);
                }
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Status { date } => {
            let date = date.unwrap_or(today - Duration::days(1));
            let status = pipeline.status(date).await?;
            if status.all_final() {
                info!("All {} games on {} are final", status.total, date);
                std::process::exit(0);
            }
            info!(
                "{} of {} games on {} still pending",
                status.total - status.finished,
                status.total,
                date
            );
            std::process::exit(1);
        }
        Command::Calibrate => {
            let scorer = LogisticScorer::load(&config.model_path)?;
            if let Some(cal) = pipeline.calibrate(scorer.model_version())? {
                println!("{}", serde_json::to_string_pretty(&cal)?);
            }
        }
    }

    Ok(())
}

/// Scorer from the model file, with its stored calibration when one exists.
fn load_service(config: &Config, db: &Database) -> Result<PredictionService> {
    let scorer = LogisticScorer::load(&config.model_path)?;
    let calibration = db
        .load_calibration(scorer.model_version())?
        .map(|c| PlattCalibration { a: c.a, b: c.b });
    info!(
        "Model {} (feature set {}){}",
        scorer.model_version(),
        scorer.feature_set_version(),
        if calibration.is_some() { ", calibrated" } else { "" }
    );
    Ok(PredictionService::new(Box::new(scorer), calibration))
}
