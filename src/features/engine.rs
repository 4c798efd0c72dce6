use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use super::form::TeamForm;
use super::schema::{feature_names, FeatureVector, FEATURE_SET_VERSION};
use super::window::WindowPolicy;
use crate::db::models::{GameRow, TeamId};

/// A final game together with the team's form entering it.
#[derive(Debug, Clone)]
pub struct EnrichedRow {
    pub game: GameRow,
    pub form: TeamForm,
}

/// Output of the batch engine, ordered by (date, team).
#[derive(Debug, Clone, Default)]
pub struct EnrichedLog {
    rows: Vec<EnrichedRow>,
}

/// Attach causal form statistics to every final row.
///
/// Rows are sorted by (date, team) right here, whatever order the caller
/// supplied, and each row only sees the team's earlier games. Windows must
/// be full; short histories leave values missing.
pub fn derive(rows: &[GameRow]) -> EnrichedLog {
    let mut finals: Vec<&GameRow> = rows.iter().filter(|r| r.is_final()).collect();
    finals.sort_by(|a, b| {
        (a.game_date, a.team_id, &a.game_id).cmp(&(b.game_date, b.team_id, &b.game_id))
    });

    let mut timelines: BTreeMap<TeamId, Vec<&GameRow>> = BTreeMap::new();
    let mut enriched = Vec::with_capacity(finals.len());
    for game in finals {
        let timeline = timelines.entry(game.team_id).or_default();
        let form = TeamForm::compute(timeline, game.game_date, game.is_home, WindowPolicy::Full);
        timeline.push(game);
        enriched.push(EnrichedRow {
            game: game.clone(),
            form,
        });
    }

    debug!(
        "Derived form for {} rows across {} teams",
        enriched.len(),
        timelines.len()
    );
    EnrichedLog { rows: enriched }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingRow {
    pub game_id: String,
    pub game_date: NaiveDate,
    pub home_team: String,
    pub away_team: String,
    pub features: Vec<Option<f64>>,
    pub home_won: bool,
}

/// Model-fitting input: one row per final contest with full five-game history.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSet {
    pub feature_set_version: &'static str,
    pub feature_names: Vec<&'static str>,
    pub rows: Vec<TrainingRow>,
}

impl EnrichedLog {
    pub fn rows(&self) -> &[EnrichedRow] {
        &self.rows
    }

    /// Pair home and away rows by game and build the shared feature vector.
    pub fn training_set(&self) -> TrainingSet {
        let mut by_game: BTreeMap<&str, (Option<&EnrichedRow>, Option<&EnrichedRow>)> =
            BTreeMap::new();
        for r in self.rows() {
            let slot = by_game.entry(r.game.game_id.as_str()).or_default();
            if r.game.is_home {
                slot.0 = Some(r);
            } else {
                slot.1 = Some(r);
            }
        }

        let mut rows: Vec<TrainingRow> = by_game
            .into_values()
            .filter_map(|pair| match pair {
                (Some(home), Some(away)) => Some((home, away)),
                _ => None,
            })
            .filter(|(home, away)| home.form.has_full_last_5() && away.form.has_full_last_5())
            .map(|(home, away)| TrainingRow {
                game_id: home.game.game_id.clone(),
                game_date: home.game.game_date,
                home_team: home.game.team_name.clone(),
                away_team: away.game.team_name.clone(),
                features: FeatureVector::assemble(&home.form, &away.form)
                    .values()
                    .to_vec(),
                home_won: home.game.won(),
            })
            .collect();
        rows.sort_by(|a, b| (a.game_date, &a.game_id).cmp(&(b.game_date, &b.game_id)));

        TrainingSet {
            feature_set_version: FEATURE_SET_VERSION,
            feature_names: feature_names().collect(),
            rows,
        }
    }
}
