use chrono::NaiveDate;
use serde::Serialize;

use super::calibration::PlattCalibration;
use super::scorer::Scorer;
use crate::db::models::{MatchKey, TeamId};
use crate::error::{PipelineError, PipelineResult};
use crate::features::schema::{FeatureVector, FEATURE_SET_VERSION};
use crate::games::log::Matchup;

/// Immutable output of one scoring pass. Regeneration replaces it wholesale.
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub game_date: NaiveDate,
    pub home_id: TeamId,
    pub home_team: String,
    pub away_id: TeamId,
    pub away_team: String,
    pub win_probability_home: f64,
    pub predicted_winner: String,
    /// max(p, 1 − p) × 100
    pub confidence: f64,
    pub model_version: String,
    pub features: FeatureVector,
}

impl Prediction {
    pub fn key(&self) -> MatchKey {
        MatchKey::new(self.game_date, self.home_team.clone())
    }
}

pub struct PredictionService {
    scorer: Box<dyn Scorer>,
    calibration: Option<PlattCalibration>,
}

impl PredictionService {
    pub fn new(scorer: Box<dyn Scorer>, calibration: Option<PlattCalibration>) -> Self {
        PredictionService {
            scorer,
            calibration,
        }
    }

    /// Fails when the scorer was fitted on another feature-set version.
    pub fn check_compatible(&self) -> PipelineResult<()> {
        check_version(FEATURE_SET_VERSION, self.scorer.feature_set_version())
    }

    pub fn predict(&self, matchup: &Matchup, features: FeatureVector) -> PipelineResult<Prediction> {
        check_version(features.version(), self.scorer.feature_set_version())?;

        let raw = self
            .scorer
            .predict(features.values())
            .map_err(|e| PipelineError::ScorerFailure(format!("{:#}", e)))?;
        if !raw.is_finite() || !(0.0..=1.0).contains(&raw) {
            return Err(PipelineError::ScorerFailure(format!(
                "probability {} outside [0, 1]",
                raw
            )));
        }
        let p = match &self.calibration {
            Some(cal) => cal.apply(raw),
            None => raw,
        };

        let predicted_winner = if p >= 0.5 {
            matchup.home_name.clone()
        } else {
            matchup.away_name.clone()
        };
        Ok(Prediction {
            game_date: matchup.game_date,
            home_id: matchup.home_id,
            home_team: matchup.home_name.clone(),
            away_id: matchup.away_id,
            away_team: matchup.away_name.clone(),
            win_probability_home: p,
            predicted_winner,
            confidence: p.max(1.0 - p) * 100.0,
            model_version: self.scorer.model_version().to_string(),
            features,
        })
    }
}

fn check_version(built: &str, fitted: &str) -> PipelineResult<()> {
    if built != fitted {
        return Err(PipelineError::FeatureSetMismatch {
            expected: built.to_string(),
            found: fitted.to_string(),
        });
    }
    Ok(())
}
