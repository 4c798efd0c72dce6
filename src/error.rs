use chrono::NaiveDate;
use thiserror::Error;

use crate::db::models::TeamId;

/// Failures raised by the feature / prediction / ledger pipeline.
///
/// Per-matchup variants (`MissingHistory`, `ScorerFailure`) are isolated by the
/// caller: the matchup is skipped and the batch continues. `SourceUnavailable`
/// aborts the whole run before the ledger is touched.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("team {team_id} has no final games before {reference_date}")]
    MissingHistory {
        team_id: TeamId,
        reference_date: NaiveDate,
    },

    #[error("scorer failed: {0}")]
    ScorerFailure(String),

    #[error("feature set mismatch: engine builds {expected}, scorer expects {found}")]
    FeatureSetMismatch { expected: String, found: String },

    #[error("{source_name} unavailable after {attempts} attempt(s): {cause}")]
    SourceUnavailable {
        source_name: String,
        attempts: u32,
        cause: String,
    },

    #[error("malformed game row (game {game_id}): {reason}")]
    MalformedRow { game_id: String, reason: String },
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
