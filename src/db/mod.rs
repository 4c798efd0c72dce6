use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

pub mod models;
use models::*;

/// Thread-safe SQLite handle (single connection behind a mutex).
/// Holds the game log, the bet-record ledger and stored calibrations.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Game log ──────────────────────────────────────────────────────────────

    /// Upsert game rows. A final row is never rewritten; a pending row is
    /// replaced in place when its outcome arrives. Returns rows written.
    pub fn upsert_games(&self, rows: &[GameRow]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO games (
                    game_id, team_id, team_name, game_date, is_home, points,
                    fgm, fga, fg3m, ftm, fta, oreb, tov, plus_minus, win_loss
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
                 ON CONFLICT(game_id, team_id) DO UPDATE SET
                    team_name=excluded.team_name,
                    game_date=excluded.game_date,
                    is_home=excluded.is_home,
                    points=excluded.points,
                    fgm=excluded.fgm,
                    fga=excluded.fga,
                    fg3m=excluded.fg3m,
                    ftm=excluded.ftm,
                    fta=excluded.fta,
                    oreb=excluded.oreb,
                    tov=excluded.tov,
                    plus_minus=excluded.plus_minus,
                    win_loss=excluded.win_loss
                 WHERE games.win_loss IS NULL",
            )?;
            for row in rows {
                written += stmt.execute(params![
                    row.game_id,
                    row.team_id,
                    row.team_name,
                    row.game_date,
                    row.is_home,
                    row.points,
                    row.fgm,
                    row.fga,
                    row.fg3m,
                    row.ftm,
                    row.fta,
                    row.oreb,
                    row.tov,
                    row.point_differential,
                    row.win_loss.map(|w| w.as_str()),
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Every stored game row, oldest first.
    pub fn load_games(&self) -> Result<Vec<GameRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT game_id, team_id, team_name, game_date, is_home, points,
                    fgm, fga, fg3m, ftm, fta, oreb, tov, plus_minus, win_loss
             FROM games ORDER BY game_date, team_id, game_id",
        )?;
        let rows = stmt
            .query_map([], map_game)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Ledger ────────────────────────────────────────────────────────────────

    /// Write a reconciled batch. System columns are overwritten; user and
    /// outcome columns are only filled where still empty, and a record whose
    /// outcome is already stored is left alone entirely.
    pub fn upsert_bet_records(&self, records: &[BetRecord]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO bet_records (
                    game_date, home_team, away_team, predicted_winner,
                    win_probability_home, confidence, rationale, risk_tier, badges,
                    home_rest_days, away_rest_days, home_b2b, away_b2b,
                    feature_set_version,
                    user_prediction, user_result, user_reason, user_confidence,
                    real_winner, result
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)
                 ON CONFLICT(game_date, home_team) DO UPDATE SET
                    away_team=excluded.away_team,
                    predicted_winner=excluded.predicted_winner,
                    win_probability_home=excluded.win_probability_home,
                    confidence=excluded.confidence,
                    rationale=excluded.rationale,
                    risk_tier=excluded.risk_tier,
                    badges=excluded.badges,
                    home_rest_days=excluded.home_rest_days,
                    away_rest_days=excluded.away_rest_days,
                    home_b2b=excluded.home_b2b,
                    away_b2b=excluded.away_b2b,
                    feature_set_version=excluded.feature_set_version,
                    user_prediction=COALESCE(NULLIF(bet_records.user_prediction, ''), excluded.user_prediction),
                    user_result=COALESCE(NULLIF(bet_records.user_result, ''), excluded.user_result),
                    user_reason=COALESCE(NULLIF(bet_records.user_reason, ''), excluded.user_reason),
                    user_confidence=COALESCE(bet_records.user_confidence, excluded.user_confidence)
                 WHERE NULLIF(bet_records.real_winner, '') IS NULL
                   AND NULLIF(bet_records.result, '') IS NULL",
            )?;
            for r in records {
                let user = r.user();
                let outcome = r.outcome();
                written += stmt.execute(params![
                    r.key.game_date,
                    r.key.home_team,
                    r.system.away_team,
                    r.system.predicted_winner,
                    r.system.win_probability_home,
                    r.system.confidence,
                    r.system.rationale,
                    r.system.risk_tier.as_str(),
                    r.system.badges.join("|"),
                    r.system.home_rest_days,
                    r.system.away_rest_days,
                    r.system.home_b2b,
                    r.system.away_b2b,
                    r.system.feature_set_version,
                    user.user_prediction,
                    user.user_result.map(|p| p.as_str()),
                    user.user_reason,
                    user.user_confidence,
                    outcome.real_winner,
                    outcome.result.map(|p| p.as_str()),
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Persist settled outcomes. Columns that already hold a value are kept.
    pub fn save_outcomes(&self, records: &[BetRecord]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare(
                "UPDATE bet_records SET
                    real_winner=COALESCE(NULLIF(real_winner, ''), ?1),
                    result=COALESCE(NULLIF(result, ''), ?2),
                    user_result=COALESCE(NULLIF(user_result, ''), ?3)
                 WHERE game_date=?4 AND home_team=?5",
            )?;
            for r in records {
                let outcome = r.outcome();
                written += stmt.execute(params![
                    outcome.real_winner,
                    outcome.result.map(|p| p.as_str()),
                    r.user().user_result.map(|p| p.as_str()),
                    r.key.game_date,
                    r.key.home_team,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Persist pulled votes. User columns only receive a value where empty.
    pub fn save_votes(&self, records: &[BetRecord]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare(
                "UPDATE bet_records SET
                    user_prediction=COALESCE(NULLIF(user_prediction, ''), ?1),
                    user_reason=COALESCE(NULLIF(user_reason, ''), ?2),
                    user_confidence=COALESCE(user_confidence, ?3),
                    user_result=COALESCE(NULLIF(user_result, ''), ?4)
                 WHERE game_date=?5 AND home_team=?6",
            )?;
            for r in records {
                let user = r.user();
                written += stmt.execute(params![
                    user.user_prediction,
                    user.user_reason,
                    user.user_confidence,
                    user.user_result.map(|p| p.as_str()),
                    r.key.game_date,
                    r.key.home_team,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// The whole ledger, ordered by natural key.
    pub fn load_ledger(&self) -> Result<Vec<BetRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT game_date, home_team, away_team, predicted_winner,
                    win_probability_home, confidence, rationale, risk_tier, badges,
                    home_rest_days, away_rest_days, home_b2b, away_b2b,
                    feature_set_version,
                    user_prediction, user_result, user_reason, user_confidence,
                    real_winner, result
             FROM bet_records ORDER BY game_date, home_team",
        )?;
        let records = stmt
            .query_map([], map_bet_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    // ── Calibration ───────────────────────────────────────────────────────────

    pub fn save_calibration(&self, cal: &ModelCalibration) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO model_calibrations (
                model_version, a, b, samples, logloss_before, logloss_after, fitted_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(model_version) DO UPDATE SET
                a=excluded.a,
                b=excluded.b,
                samples=excluded.samples,
                logloss_before=excluded.logloss_before,
                logloss_after=excluded.logloss_after,
                fitted_at=excluded.fitted_at",
            params![
                cal.model_version,
                cal.a,
                cal.b,
                cal.samples,
                cal.logloss_before,
                cal.logloss_after,
                cal.fitted_at,
            ],
        )?;
        Ok(())
    }

    pub fn load_calibration(&self, model_version: &str) -> Result<Option<ModelCalibration>> {
        let conn = self.lock()?;
        let cal = conn
            .query_row(
                "SELECT model_version, a, b, samples, logloss_before, logloss_after, fitted_at
                 FROM model_calibrations WHERE model_version=?1",
                params![model_version],
                |row| {
                    Ok(ModelCalibration {
                        model_version: row.get(0)?,
                        a: row.get(1)?,
                        b: row.get(2)?,
                        samples: row.get(3)?,
                        logloss_before: row.get(4)?,
                        logloss_after: row.get(5)?,
                        fitted_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(cal)
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    /// Aggregate pick accuracy over the ledger
    pub fn get_stats(&self) -> Result<Stats> {
        let conn = self.lock()?;
        let total_records: i64 = conn.query_row("SELECT COUNT(*) FROM bet_records", [], |r| r.get(0))?;
        let resolved: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bet_records WHERE result IS NOT NULL AND result != ''",
            [],
            |r| r.get(0),
        )?;
        let won: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bet_records WHERE result='Won'",
            [],
            |r| r.get(0),
        )?;
        let user_resolved: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bet_records WHERE user_result IS NOT NULL AND user_result != ''",
            [],
            |r| r.get(0),
        )?;
        let user_won: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bet_records WHERE user_result='Won'",
            [],
            |r| r.get(0),
        )?;
        Ok(Stats {
            total_records,
            resolved,
            won,
            user_resolved,
            user_won,
        })
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn map_game(row: &rusqlite::Row) -> rusqlite::Result<GameRow> {
    let win_loss: Option<String> = row.get(14)?;
    Ok(GameRow {
        game_id: row.get(0)?,
        team_id: row.get(1)?,
        team_name: row.get(2)?,
        game_date: row.get(3)?,
        is_home: row.get(4)?,
        points: row.get(5)?,
        fgm: row.get(6)?,
        fga: row.get(7)?,
        fg3m: row.get(8)?,
        ftm: row.get(9)?,
        fta: row.get(10)?,
        oreb: row.get(11)?,
        tov: row.get(12)?,
        point_differential: row.get(13)?,
        win_loss: parse_column(14, win_loss)?,
    })
}

fn map_bet_record(row: &rusqlite::Row) -> rusqlite::Result<BetRecord> {
    let key = MatchKey {
        game_date: row.get(0)?,
        home_team: row.get(1)?,
    };
    let risk_tier: String = row.get(7)?;
    let badges: String = row.get(8)?;
    let system = SystemFields {
        away_team: row.get(2)?,
        predicted_winner: row.get(3)?,
        win_probability_home: row.get(4)?,
        confidence: row.get(5)?,
        rationale: row.get(6)?,
        risk_tier: parse_column(7, Some(risk_tier))?.unwrap_or(RiskTier::Medium),
        badges: badges
            .split('|')
            .filter(|b| !b.is_empty())
            .map(String::from)
            .collect(),
        home_rest_days: row.get(9)?,
        away_rest_days: row.get(10)?,
        home_b2b: row.get(11)?,
        away_b2b: row.get(12)?,
        feature_set_version: row.get(13)?,
    };
    let user = UserFields {
        user_prediction: non_empty(row.get(14)?),
        user_result: parse_column(15, row.get(15)?)?,
        user_reason: non_empty(row.get(16)?),
        user_confidence: row.get(17)?,
    };
    let outcome = OutcomeFields {
        real_winner: non_empty(row.get(18)?),
        result: parse_column(19, row.get(19)?)?,
    };
    Ok(BetRecord::restore(key, system, user, outcome))
}

/// The ledger is also edited by hand; blank strings mean "not set".
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn parse_column<T: std::str::FromStr<Err = String>>(
    idx: usize,
    value: Option<String>,
) -> rusqlite::Result<Option<T>> {
    match non_empty(value) {
        None => Ok(None),
        Some(s) => s.parse::<T>().map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                e.into(),
            )
        }),
    }
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS games (
    game_id     TEXT    NOT NULL,
    team_id     INTEGER NOT NULL,
    team_name   TEXT    NOT NULL,
    game_date   TEXT    NOT NULL,
    is_home     INTEGER NOT NULL,
    points      INTEGER NOT NULL,
    fgm         INTEGER NOT NULL,
    fga         INTEGER NOT NULL,
    fg3m        INTEGER NOT NULL,
    ftm         INTEGER NOT NULL,
    fta         INTEGER NOT NULL,
    oreb        INTEGER NOT NULL,
    tov         INTEGER NOT NULL,
    plus_minus  REAL    NOT NULL,
    win_loss    TEXT,
    PRIMARY KEY (game_id, team_id)
);

CREATE TABLE IF NOT EXISTS bet_records (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    game_date            TEXT    NOT NULL,
    home_team            TEXT    NOT NULL,
    away_team            TEXT    NOT NULL,
    predicted_winner     TEXT    NOT NULL,
    win_probability_home REAL    NOT NULL,
    confidence           REAL    NOT NULL,
    rationale            TEXT    NOT NULL,
    risk_tier            TEXT    NOT NULL,
    badges               TEXT    NOT NULL DEFAULT '',
    home_rest_days       INTEGER NOT NULL,
    away_rest_days       INTEGER NOT NULL,
    home_b2b             INTEGER NOT NULL,
    away_b2b             INTEGER NOT NULL,
    feature_set_version  TEXT    NOT NULL,
    user_prediction      TEXT,
    user_result          TEXT,
    user_reason          TEXT,
    user_confidence      INTEGER,
    real_winner          TEXT,
    result               TEXT,
    UNIQUE (game_date, home_team)
);

CREATE TABLE IF NOT EXISTS model_calibrations (
    model_version  TEXT    PRIMARY KEY,
    a              REAL    NOT NULL,
    b              REAL    NOT NULL,
    samples        INTEGER NOT NULL,
    logloss_before REAL    NOT NULL,
    logloss_after  REAL    NOT NULL,
    fitted_at      TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_games_team_date ON games(team_id, game_date);
CREATE INDEX IF NOT EXISTS idx_bet_records_pending ON bet_records(real_winner);
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCalibration {
    pub model_version: String,
    pub a: f64,
    pub b: f64,
    pub samples: i64,
    pub logloss_before: f64,
    pub logloss_after: f64,
    pub fitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub total_records: i64,
    pub resolved: i64,
    pub won: i64,
    pub user_resolved: i64,
    pub user_won: i64,
}

impl Stats {
    pub fn accuracy(&self) -> Option<f64> {
        (self.resolved > 0).then(|| self.won as f64 / self.resolved as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::models::fixtures;
    use super::*;
    use chrono::NaiveDate;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn game(game_id: &str, team_id: TeamId, d: u32, wl: Option<WinLoss>) -> GameRow {
        GameRow {
            game_id: game_id.into(),
            team_id,
            team_name: format!("Team {}", team_id),
            game_date: date(d),
            is_home: team_id == 1,
            points: 100,
            fgm: 40,
            fga: 85,
            fg3m: 10,
            ftm: 15,
            fta: 20,
            oreb: 9,
            tov: 12,
            point_differential: 0.0,
            win_loss: wl,
        }
    }

    #[test]
    fn pending_game_is_finalised_in_place_but_final_is_frozen() {
        let db = Database::open(":memory:").unwrap();
        db.upsert_games(&[game("g1", 1, 2, None)]).unwrap();
        db.upsert_games(&[game("g1", 1, 2, Some(WinLoss::W))]).unwrap();
        // A late, contradicting feed must not rewrite a final row.
        db.upsert_games(&[game("g1", 1, 2, Some(WinLoss::L))]).unwrap();

        let rows = db.load_games().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].win_loss, Some(WinLoss::W));
    }

    #[test]
    fn refresh_keeps_user_columns_written_concurrently() {
        let db = Database::open(":memory:").unwrap();
        let key = MatchKey::new(date(6), "Lakers");
        db.upsert_bet_records(&[fixtures::voted(
            key.clone(),
            fixtures::system("Celtics", "Lakers", 0.6),
            "Celtics",
        )])
        .unwrap();

        // An automated refresh built without the user's vote.
        let fresh = BetRecord::new(key.clone(), fixtures::system("Celtics", "Celtics", 0.4));
        db.upsert_bet_records(&[fresh]).unwrap();

        let ledger = db.load_ledger().unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].system.predicted_winner, "Celtics");
        assert_eq!(ledger[0].user().user_prediction.as_deref(), Some("Celtics"));
        assert_eq!(ledger[0].user().user_confidence, Some(70));
    }

    #[test]
    fn pulled_vote_never_replaces_a_stored_one() {
        let db = Database::open(":memory:").unwrap();
        let voted_key = MatchKey::new(date(6), "Lakers");
        let open_key = MatchKey::new(date(6), "Knicks");
        db.upsert_bet_records(&[
            fixtures::voted(voted_key.clone(), fixtures::system("Celtics", "Lakers", 0.6), "Lakers"),
            BetRecord::new(open_key.clone(), fixtures::system("Heat", "Knicks", 0.6)),
        ])
        .unwrap();

        // stale copies carrying another vote for both keys
        let stale = [
            fixtures::voted(voted_key, fixtures::system("Celtics", "Lakers", 0.6), "Celtics"),
            fixtures::voted(open_key, fixtures::system("Heat", "Knicks", 0.6), "Heat"),
        ];
        assert_eq!(db.save_votes(&stale).unwrap(), 2);

        let ledger = db.load_ledger().unwrap();
        let by_home = |h: &str| ledger.iter().find(|r| r.key.home_team == h).unwrap();
        assert_eq!(by_home("Lakers").user().user_prediction.as_deref(), Some("Lakers"));
        assert_eq!(by_home("Knicks").user().user_prediction.as_deref(), Some("Heat"));
        assert_eq!(by_home("Knicks").user().user_reason.as_deref(), Some("gut feeling"));
    }

    #[test]
    fn settled_record_is_not_refreshed() {
        let db = Database::open(":memory:").unwrap();
        let key = MatchKey::new(date(6), "Lakers");
        let mut rec = BetRecord::new(key.clone(), fixtures::system("Celtics", "Lakers", 0.6));
        db.upsert_bet_records(&[rec.clone()]).unwrap();
        rec.settle("Lakers");
        db.save_outcomes(&[rec]).unwrap();

        db.upsert_bet_records(&[BetRecord::new(key, fixtures::system("Celtics", "Celtics", 0.3))])
            .unwrap();
        let ledger = db.load_ledger().unwrap();
        assert_eq!(ledger[0].system.predicted_winner, "Lakers");
        assert_eq!(ledger[0].outcome().result, Some(PickResult::Won));

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.accuracy(), Some(1.0));
    }

    #[test]
    fn calibration_round_trips_by_model_version() {
        let db = Database::open(":memory:").unwrap();
        assert!(db.load_calibration("logit-v13").unwrap().is_none());
        db.save_calibration(&ModelCalibration {
            model_version: "logit-v13".into(),
            a: 0.9,
            b: -0.05,
            samples: 120,
            logloss_before: 0.68,
            logloss_after: 0.66,
            fitted_at: Utc::now(),
        })
        .unwrap();
        let cal = db.load_calibration("logit-v13").unwrap().expect("stored");
        assert_eq!(cal.samples, 120);
    }
}
