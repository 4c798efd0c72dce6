use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::db::models::{GameRow, TeamId};

/// What an upsert did to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Appended,
    /// A pending row received its final outcome
    Finalized,
    /// A pending row was replaced by a newer pending snapshot
    Updated,
    /// Identical row, or an attempt to rewrite a final row
    Ignored,
}

/// A contest on the slate, both sides resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Matchup {
    pub game_id: String,
    pub game_date: NaiveDate,
    pub home_id: TeamId,
    pub home_name: String,
    pub away_id: TeamId,
    pub away_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlateStatus {
    pub total: usize,
    pub finished: usize,
}

impl SlateStatus {
    /// An empty slate has nothing left to wait for.
    pub fn all_final(&self) -> bool {
        self.finished == self.total
    }
}

/// Append-only per-team game log, kept ordered by (date, team, game).
///
/// Rows are keyed by `(game_id, team_id)`. A final row is immutable; a
/// pending row may be replaced until its outcome is known.
#[derive(Debug, Clone, Default)]
pub struct GameLog {
    rows: Vec<GameRow>,
    /// (game_id, team_id) -> date the stored row sorts under
    index: HashMap<(String, TeamId), NaiveDate>,
}

fn order_key(row: &GameRow) -> (NaiveDate, TeamId, &str) {
    (row.game_date, row.team_id, row.game_id.as_str())
}

impl GameLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = GameRow>) -> Self {
        let mut rows: Vec<GameRow> = rows.into_iter().collect();
        // stable, so snapshots of one row keep their arrival order and each
        // insert lands at the tail
        rows.sort_by(|a, b| order_key(a).cmp(&order_key(b)));
        let mut log = GameLog::new();
        for row in rows {
            log.upsert(row);
        }
        log
    }

    fn find(&self, game_id: &str, team_id: TeamId) -> Option<usize> {
        let date = *self.index.get(&(game_id.to_string(), team_id))?;
        self.rows
            .binary_search_by(|r| order_key(r).cmp(&(date, team_id, game_id)))
            .ok()
    }

    pub fn upsert(&mut self, row: GameRow) -> UpsertOutcome {
        let existing = self.find(&row.game_id, row.team_id);

        match existing {
            Some(i) if self.rows[i].is_final() || self.rows[i] == row => UpsertOutcome::Ignored,
            Some(i) => {
                let outcome = if row.is_final() {
                    UpsertOutcome::Finalized
                } else {
                    UpsertOutcome::Updated
                };
                self.rows.remove(i);
                self.insert_sorted(row);
                outcome
            }
            None => {
                self.insert_sorted(row);
                UpsertOutcome::Appended
            }
        }
    }

    fn insert_sorted(&mut self, row: GameRow) {
        self.index
            .insert((row.game_id.clone(), row.team_id), row.game_date);
        let at = self
            .rows
            .partition_point(|r| order_key(r) < order_key(&row));
        self.rows.insert(at, row);
    }

    pub fn rows(&self) -> &[GameRow] {
        &self.rows
    }

    /// Final games of `team` strictly before `before`, oldest first.
    pub fn final_history(&self, team: TeamId, before: NaiveDate) -> Vec<&GameRow> {
        self.rows
            .iter()
            .filter(|r| r.team_id == team && r.is_final() && r.game_date < before)
            .collect()
    }

    fn contests_on(&self, date: NaiveDate) -> BTreeMap<&str, Vec<&GameRow>> {
        let mut by_game: BTreeMap<&str, Vec<&GameRow>> = BTreeMap::new();
        for row in self.rows.iter().filter(|r| r.game_date == date) {
            by_game.entry(row.game_id.as_str()).or_default().push(row);
        }
        by_game
    }

    /// Every contest on `date` for which both a home and an away row exist.
    pub fn matchups_on(&self, date: NaiveDate) -> Vec<Matchup> {
        self.contests_on(date)
            .into_iter()
            .filter_map(|(game_id, rows)| {
                let home = rows.iter().find(|r| r.is_home)?;
                let away = rows.iter().find(|r| !r.is_home)?;
                Some(Matchup {
                    game_id: game_id.to_string(),
                    game_date: date,
                    home_id: home.team_id,
                    home_name: home.team_name.clone(),
                    away_id: away.team_id,
                    away_name: away.team_name.clone(),
                })
            })
            .collect()
    }

    /// Distinct contests on `date` and how many of them are final.
    pub fn slate_status(&self, date: NaiveDate) -> SlateStatus {
        let contests = self.contests_on(date);
        SlateStatus {
            total: contests.len(),
            finished: contests
                .values()
                .filter(|rows| rows.iter().any(|r| r.is_final()))
                .count(),
        }
    }

    /// Final contests that do not have exactly two rows.
    pub fn pairing_violations(&self) -> Vec<String> {
        let mut counts: BTreeMap<&str, (usize, bool)> = BTreeMap::new();
        for row in &self.rows {
            let e = counts.entry(row.game_id.as_str()).or_insert((0, false));
            e.0 += 1;
            e.1 |= row.is_final();
        }
        counts
            .into_iter()
            .filter(|(_, (n, is_final))| *is_final && *n != 2)
            .map(|(id, _)| id.to_string())
            .collect()
    }

    /// Display name of the winner of the game `home_team` hosted on `date`,
    /// once the home row is final.
    pub fn winner_of(&self, date: NaiveDate, home_team: &str) -> Option<String> {
        let home = self.rows.iter().find(|r| {
            r.game_date == date && r.is_home && r.team_name == home_team && r.is_final()
        })?;
        if home.won() {
            return Some(home.team_name.clone());
        }
        self.rows
            .iter()
            .find(|r| r.game_id == home.game_id && r.team_id != home.team_id)
            .map(|away| away.team_name.clone())
    }
}
