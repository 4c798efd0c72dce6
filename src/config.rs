use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::model::Thresholds;
use crate::retry::RetryPolicy;

/// NBA game-log feature engine, win-probability picks and bet ledger
#[derive(Parser, Debug, Clone)]
#[command(name = "hoopcast", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, global = true, env = "HOOPCAST_DB", default_value = "hoopcast.db")]
    pub database_path: String,

    /// Game log endpoint (league game-finder JSON)
    #[arg(long, global = true, env = "GAME_LOG_URL")]
    pub game_log_url: Option<String>,

    /// Game log JSON export on disk, used instead of the endpoint
    #[arg(long, global = true, env = "GAME_LOG_FILE")]
    pub game_log_file: Option<PathBuf>,

    /// Fitted model (JSON coefficients)
    #[arg(long, global = true, env = "MODEL_PATH", default_value = "model_v13.json")]
    pub model_path: PathBuf,

    /// Remote ledger table endpoint; upserts are skipped when unset
    #[arg(long, global = true, env = "REMOTE_LEDGER_URL")]
    pub remote_ledger_url: Option<String>,

    /// API key for the remote ledger
    #[arg(long, global = true, env = "REMOTE_LEDGER_KEY")]
    pub remote_ledger_key: Option<String>,

    /// Attempts per fetch / upsert before giving up
    #[arg(long, global = true, env = "FETCH_ATTEMPTS", default_value = "3")]
    pub fetch_attempts: u32,

    /// Pause between attempts in milliseconds
    #[arg(long, global = true, env = "FETCH_BACKOFF_MS", default_value = "2000")]
    pub fetch_backoff_ms: u64,

    /// Timeout of a single attempt in seconds
    #[arg(long, global = true, env = "FETCH_TIMEOUT_SECS", default_value = "60")]
    pub fetch_timeout_secs: u64,

    /// Ledger rows per remote upsert request
    #[arg(long, global = true, env = "UPSERT_CHUNK_SIZE", default_value = "50")]
    pub upsert_chunk_size: usize,

    #[command(flatten)]
    pub thresholds: ThresholdArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct ThresholdArgs {
    /// Weighted recent margin gap that counts as a collapse
    #[arg(long, global = true, env = "CRASH_THRESHOLD", default_value = "-7.0", allow_negative_numbers = true)]
    pub crash_threshold: f64,

    /// Point-differential volatility gap that counts as instability
    #[arg(long, global = true, env = "VOLATILITY_THRESHOLD", default_value = "5.0")]
    pub volatility_threshold: f64,

    /// Venue-specific win rate gap that counts as a structural edge
    #[arg(long, global = true, env = "STRUCTURE_THRESHOLD", default_value = "0.20")]
    pub structure_threshold: f64,

    /// Probability from which a side is a strong favorite
    #[arg(long, global = true, env = "FAVORITE_THRESHOLD", default_value = "0.60")]
    pub favorite_threshold: f64,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Fetch the game log and store it
    Ingest,
    /// Export the training set as JSON
    Features {
        #[arg(long)]
        out: PathBuf,
    },
    /// Predict a slate and reconcile it into the ledger (default: today)
    Predict {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Copy votes entered on the remote ledger into empty local user fields
    Pull,
    /// Fill outcomes of past ledger records from final games
    Verify {
        /// Only verify records of this date
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Exit 0 when every game of the date is final, 1 otherwise (default: yesterday)
    Status {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Fit and store a probability calibration from settled records
    Calibrate,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.game_log_url.is_some() && self.game_log_file.is_some() {
            anyhow::bail!("--game-log-url and --game-log-file are mutually exclusive");
        }
        if self.fetch_attempts == 0 {
            anyhow::bail!("fetch_attempts must be at least 1");
        }
        if self.fetch_timeout_secs == 0 {
            anyhow::bail!("fetch_timeout_secs must be positive");
        }
        if self.upsert_chunk_size == 0 {
            anyhow::bail!("upsert_chunk_size must be positive");
        }
        let t = &self.thresholds;
        if t.crash_threshold > 0.0 {
            anyhow::bail!("crash_threshold must be zero or negative");
        }
        if t.volatility_threshold < 0.0 {
            anyhow::bail!("volatility_threshold must not be negative");
        }
        if !(0.0..=1.0).contains(&t.structure_threshold) {
            anyhow::bail!("structure_threshold must be between 0.0 and 1.0");
        }
        if !(0.5..=1.0).contains(&t.favorite_threshold) {
            anyhow::bail!("favorite_threshold must be between 0.5 and 1.0");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.fetch_attempts,
            backoff: Duration::from_millis(self.fetch_backoff_ms),
            timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }

    pub fn explain_thresholds(&self) -> Thresholds {
        Thresholds {
            crash: self.thresholds.crash_threshold,
            volatility: self.thresholds.volatility_threshold,
            structure: self.thresholds.structure_threshold,
            favorite: self.thresholds.favorite_threshold,
        }
    }
}
