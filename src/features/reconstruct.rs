use chrono::NaiveDate;

use super::form::TeamForm;
use super::schema::FeatureVector;
use super::window::WindowPolicy;
use crate::db::models::TeamId;
use crate::error::{PipelineError, PipelineResult};
use crate::games::log::GameLog;

/// Rebuilds the inference-time feature vector for an upcoming matchup from
/// final games strictly before the reference date.
pub struct FeatureReconstructor<'a> {
    log: &'a GameLog,
}

impl<'a> FeatureReconstructor<'a> {
    pub fn new(log: &'a GameLog) -> Self {
        FeatureReconstructor { log }
    }

    /// Form of `team` entering a game on `date`; windows may be partial.
    pub fn team_form(&self, team: TeamId, is_home: bool, date: NaiveDate) -> PipelineResult<TeamForm> {
        let history = self.log.final_history(team, date);
        if history.is_empty() {
            return Err(PipelineError::MissingHistory {
                team_id: team,
                reference_date: date,
            });
        }
        Ok(TeamForm::compute(&history, date, is_home, WindowPolicy::Partial))
    }

    pub fn reconstruct(
        &self,
        home: TeamId,
        away: TeamId,
        date: NaiveDate,
    ) -> PipelineResult<FeatureVector> {
        let home_form = self.team_form(home, true, date)?;
        let away_form = self.team_form(away, false, date)?;
        Ok(FeatureVector::assemble(&home_form, &away_form))
    }
}
