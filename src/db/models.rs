use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

pub type TeamId = i64;

// ── Game log ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WinLoss {
    W,
    L,
}

impl WinLoss {
    pub fn as_str(&self) -> &'static str {
        match self {
            WinLoss::W => "W",
            WinLoss::L => "L",
        }
    }

    pub fn is_win(self) -> bool {
        self == WinLoss::W
    }
}

impl FromStr for WinLoss {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "W" | "w" => Ok(WinLoss::W),
            "L" | "l" => Ok(WinLoss::L),
            other => Err(format!("unknown win/loss marker '{}'", other)),
        }
    }
}

/// Row as delivered by the stats service (league game finder column names).
/// Every field is optional here; `GameRow::try_from` decides what is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RawGameRow {
    pub game_id: Option<String>,
    pub team_id: Option<i64>,
    pub team_name: Option<String>,
    pub game_date: Option<String>,
    pub matchup: Option<String>,
    pub wl: Option<String>,
    pub pts: Option<i64>,
    pub fgm: Option<i64>,
    pub fga: Option<i64>,
    pub fg3m: Option<i64>,
    pub ftm: Option<i64>,
    pub fta: Option<i64>,
    pub oreb: Option<i64>,
    pub tov: Option<i64>,
    pub plus_minus: Option<f64>,
}

impl TryFrom<serde_json::Value> for RawGameRow {
    type Error = PipelineError;

    /// A row whose columns have the wrong JSON type is rejected on its own.
    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        let game_id = match &value["GAME_ID"] {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => "?".to_string(),
        };
        serde_json::from_value(value).map_err(|e| malformed(&game_id, &e.to_string()))
    }
}

/// One team's participation in one contest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRow {
    /// Shared by the two rows of a contest
    pub game_id: String,
    pub team_id: TeamId,
    pub team_name: String,
    pub game_date: NaiveDate,
    pub is_home: bool,
    pub points: u32,
    pub fgm: u32,
    pub fga: u32,
    pub fg3m: u32,
    pub ftm: u32,
    pub fta: u32,
    pub oreb: u32,
    pub tov: u32,
    pub point_differential: f64,
    /// `None` while the contest is scheduled or in progress
    pub win_loss: Option<WinLoss>,
}

impl GameRow {
    pub fn is_final(&self) -> bool {
        self.win_loss.is_some()
    }

    pub fn won(&self) -> bool {
        self.win_loss.map(WinLoss::is_win).unwrap_or(false)
    }
}

/// Venue marker: "LAL vs. BOS" is a home game, "LAL @ BOS" an away game.
fn parse_venue(matchup: &str) -> Option<bool> {
    if matchup.contains("vs.") {
        Some(true)
    } else if matchup.contains('@') {
        Some(false)
    } else {
        None
    }
}

/// Dates arrive either as `YYYY-MM-DD` or with a time part, which is ignored.
pub(crate) fn parse_game_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.trim().get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

impl TryFrom<RawGameRow> for GameRow {
    type Error = PipelineError;

    fn try_from(raw: RawGameRow) -> Result<Self, Self::Error> {
        let game_id = raw
            .game_id
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| malformed("?", "missing GAME_ID"))?;
        let bad = |reason: &str| malformed(&game_id, reason);

        let team_id = raw.team_id.ok_or_else(|| bad("missing TEAM_ID"))?;
        let team_name = raw
            .team_name
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| bad("missing TEAM_NAME"))?;
        let game_date = raw
            .game_date
            .as_deref()
            .and_then(parse_game_date)
            .ok_or_else(|| bad("missing or unparseable GAME_DATE"))?;
        let is_home = raw
            .matchup
            .as_deref()
            .and_then(parse_venue)
            .ok_or_else(|| bad("MATCHUP carries no venue marker"))?;
        let win_loss = match raw.wl.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(s.parse::<WinLoss>().map_err(|e| bad(&e))?),
        };

        // A final row must carry every box-score count; a scheduled one may not have any yet.
        let count = |value: Option<i64>, column: &str| -> Result<u32, PipelineError> {
            match value {
                Some(v) => u32::try_from(v).map_err(|_| bad(&format!("negative {}", column))),
                None if win_loss.is_none() => Ok(0),
                None => Err(bad(&format!("final row missing {}", column))),
            }
        };

        let points = count(raw.pts, "PTS")?;
        let fgm = count(raw.fgm, "FGM")?;
        let fga = count(raw.fga, "FGA")?;
        let fg3m = count(raw.fg3m, "FG3M")?;
        let ftm = count(raw.ftm, "FTM")?;
        let fta = count(raw.fta, "FTA")?;
        let oreb = count(raw.oreb, "OREB")?;
        let tov = count(raw.tov, "TOV")?;

        let point_differential = match raw.plus_minus {
            Some(v) if v.is_finite() => v,
            Some(_) => return Err(bad("non-finite PLUS_MINUS")),
            None if win_loss.is_none() => 0.0,
            None => return Err(bad("final row missing PLUS_MINUS")),
        };

        Ok(GameRow {
            game_id,
            team_id,
            team_name,
            game_date,
            is_home,
            points,
            fgm,
            fga,
            fg3m,
            ftm,
            fta,
            oreb,
            tov,
            point_differential,
            win_loss,
        })
    }
}

fn malformed(game_id: &str, reason: &str) -> PipelineError {
    PipelineError::MalformedRow {
        game_id: game_id.to_string(),
        reason: reason.to_string(),
    }
}

// ── Ledger ────────────────────────────────────────────────────────────────────

/// Natural key of a ledger entry: a team hosts at most one game per date.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MatchKey {
    pub game_date: NaiveDate,
    pub home_team: String,
}

impl MatchKey {
    pub fn new(game_date: NaiveDate, home_team: impl Into<String>) -> Self {
        MatchKey {
            game_date,
            home_team: home_team.into(),
        }
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.game_date, self.home_team)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "Low",
            RiskTier::Medium => "Medium",
            RiskTier::High => "High",
        }
    }
}

impl FromStr for RiskTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Low" => Ok(RiskTier::Low),
            "Medium" => Ok(RiskTier::Medium),
            "High" => Ok(RiskTier::High),
            other => Err(format!("unknown risk tier '{}'", other)),
        }
    }
}

/// Whether a pick (system or user) matched the real winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PickResult {
    Won,
    Lost,
}

impl PickResult {
    pub fn grade(pick: &str, real_winner: &str) -> Self {
        if pick == real_winner {
            PickResult::Won
        } else {
            PickResult::Lost
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PickResult::Won => "Won",
            PickResult::Lost => "Lost",
        }
    }
}

impl FromStr for PickResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Won" => Ok(PickResult::Won),
            "Lost" => Ok(PickResult::Lost),
            other => Err(format!("unknown pick result '{}'", other)),
        }
    }
}

/// Fields owned by the prediction pipeline. Re-runs overwrite them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemFields {
    pub away_team: String,
    pub predicted_winner: String,
    pub win_probability_home: f64,
    /// max(p, 1 - p) × 100
    pub confidence: f64,
    pub rationale: String,
    pub risk_tier: RiskTier,
    pub badges: Vec<String>,
    pub home_rest_days: u32,
    pub away_rest_days: u32,
    pub home_b2b: bool,
    pub away_b2b: bool,
    pub feature_set_version: String,
}

/// Fields entered by the user. Automated regeneration never writes them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserFields {
    pub user_prediction: Option<String>,
    pub user_result: Option<PickResult>,
    pub user_reason: Option<String>,
    pub user_confidence: Option<u8>,
}

/// Filled once by verification when the real winner is known; never reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeFields {
    pub real_winner: Option<String>,
    pub result: Option<PickResult>,
}

impl OutcomeFields {
    pub fn is_known(&self) -> bool {
        self.real_winner.is_some() || self.result.is_some()
    }
}

/// One ledger entry, split into its three field groups.
///
/// The user and outcome groups are private: the only ways to populate them are
/// loading a stored record (`restore`) and settling a finished game (`settle`).
/// Nothing built from a prediction can reach them.
#[derive(Debug, Clone, PartialEq)]
pub struct BetRecord {
    pub key: MatchKey,
    pub system: SystemFields,
    user: UserFields,
    outcome: OutcomeFields,
}

impl BetRecord {
    /// A freshly seen matchup: system fields only.
    pub fn new(key: MatchKey, system: SystemFields) -> Self {
        BetRecord {
            key,
            system,
            user: UserFields::default(),
            outcome: OutcomeFields::default(),
        }
    }

    /// Rebuild a stored record with all of its field groups.
    pub fn restore(
        key: MatchKey,
        system: SystemFields,
        user: UserFields,
        outcome: OutcomeFields,
    ) -> Self {
        BetRecord {
            key,
            system,
            user,
            outcome,
        }
    }

    /// Replace the system group; user and outcome groups carry forward.
    pub fn refreshed(self, system: SystemFields) -> Self {
        BetRecord { system, ..self }
    }

    pub fn user(&self) -> &UserFields {
        &self.user
    }

    pub fn outcome(&self) -> &OutcomeFields {
        &self.outcome
    }

    /// Record the real winner and grade the picks. Fields already set are
    /// kept; a stored winner always takes precedence over `real_winner`.
    /// Returns whether anything changed.
    pub fn settle(&mut self, real_winner: &str) -> bool {
        let mut changed = false;
        if self.outcome.real_winner.is_none() {
            self.outcome.real_winner = Some(real_winner.to_string());
            changed = true;
        }
        let winner = self
            .outcome
            .real_winner
            .clone()
            .unwrap_or_else(|| real_winner.to_string());

        if self.outcome.result.is_none() {
            self.outcome.result = Some(PickResult::grade(&self.system.predicted_winner, &winner));
            changed = true;
        }
        if self.user.user_result.is_none() {
            if let Some(pick) = &self.user.user_prediction {
                self.user.user_result = Some(PickResult::grade(pick, &winner));
                changed = true;
            }
        }
        changed
    }

    /// Winner known but a grade still missing (e.g. the user voted after settlement).
    pub fn needs_grading(&self) -> bool {
        self.outcome.real_winner.is_some()
            && (self.outcome.result.is_none()
                || (self.user.user_prediction.is_some() && self.user.user_result.is_none()))
    }

    /// Take a remote vote into an empty user group. A local vote always
    /// stands; reason and confidence are only filled for the same pick and
    /// only where still empty. A settled record grades the new vote at once.
    /// Returns whether anything changed.
    pub fn accept_vote(&mut self, vote: &RemoteVote) -> bool {
        let mut changed = false;
        match &self.user.user_prediction {
            None => {
                self.user.user_prediction = Some(vote.user_prediction.clone());
                changed = true;
            }
            Some(local) if *local == vote.user_prediction => {}
            Some(_) => return false,
        }
        if self.user.user_reason.is_none() && vote.user_reason.is_some() {
            self.user.user_reason = vote.user_reason.clone();
            changed = true;
        }
        if self.user.user_confidence.is_none() && vote.user_confidence.is_some() {
            self.user.user_confidence = vote.user_confidence;
            changed = true;
        }
        if let Some(winner) = self.outcome.real_winner.clone() {
            changed |= self.settle(&winner);
        }
        changed
    }
}

/// Settled outcome, in remote-ledger column names.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeColumns {
    pub result_ia: String,
    pub real_winner: String,
}

/// Flat row pushed to the remote ledger (one per natural key).
///
/// It carries the key, the system group and, once settled, the outcome.
/// User columns are never part of it, so a merge-on-key upsert cannot touch
/// a vote entered on the remote side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerRow {
    pub game_date: NaiveDate,
    pub home_team: String,
    pub away_team: String,
    pub predicted_winner: String,
    pub confidence: String,
    pub win_probability_home: f64,
    pub ai_explanation: String,
    pub risk_level: String,
    /// "Badge1|Badge2"
    pub badges: String,
    pub home_rest: u32,
    pub away_rest: u32,
    pub home_b2b: bool,
    pub away_b2b: bool,
    pub feature_set_version: String,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeColumns>,
}

impl LedgerRow {
    /// Key and system group.
    pub fn system(r: &BetRecord) -> Self {
        LedgerRow {
            game_date: r.key.game_date,
            home_team: r.key.home_team.clone(),
            away_team: r.system.away_team.clone(),
            predicted_winner: r.system.predicted_winner.clone(),
            confidence: format!("{:.1}%", r.system.confidence),
            win_probability_home: r.system.win_probability_home,
            ai_explanation: r.system.rationale.clone(),
            risk_level: r.system.risk_tier.as_str().to_string(),
            badges: r.system.badges.join("|"),
            home_rest: r.system.home_rest_days,
            away_rest: r.system.away_rest_days,
            home_b2b: r.system.home_b2b,
            away_b2b: r.system.away_b2b,
            feature_set_version: r.system.feature_set_version.clone(),
            outcome: None,
        }
    }

    /// Key, system group and the outcome, when both outcome fields are known.
    pub fn settled(r: &BetRecord) -> Self {
        let outcome = match (&r.outcome.real_winner, r.outcome.result) {
            (Some(winner), Some(result)) => Some(OutcomeColumns {
                result_ia: result.as_str().to_string(),
                real_winner: winner.clone(),
            }),
            _ => None,
        };
        LedgerRow {
            outcome,
            ..LedgerRow::system(r)
        }
    }
}

/// A vote read back from the remote ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteVote {
    pub key: MatchKey,
    pub user_prediction: String,
    pub user_reason: Option<String>,
    pub user_confidence: Option<u8>,
}
