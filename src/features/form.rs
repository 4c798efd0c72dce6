use chrono::NaiveDate;
use serde::Serialize;

use super::window::{
    trailing_mean, trailing_std, trailing_sum, trailing_weighted_mean, WindowPolicy,
};
use crate::db::models::GameRow;

pub const LAST_N: usize = 5;
pub const LAST10: usize = 10;
pub const SHOCK_SHORT: usize = 3;
pub const SHOCK_LONG: usize = 10;
pub const VOLATILITY_WINDOW: usize = 10;
pub const CRASH_WINDOW: usize = 3;

/// Rest days assumed before a team's first game.
pub const FIRST_GAME_REST: u32 = 3;
pub const MAX_REST: u32 = 7;
/// Venue-specific win rate before any game on that side.
pub const NEUTRAL_WIN_RATE: f64 = 0.5;

/// Per-game factors, computed from one box score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Factor {
    EfgPct,
    TovPct,
    FtRate,
    OrbRaw,
    Win,
}

impl Factor {
    /// `None` when the ratio's denominator is zero.
    pub fn of(self, g: &GameRow) -> Option<f64> {
        let fga = f64::from(g.fga);
        match self {
            Factor::EfgPct => ratio(f64::from(g.fgm) + 0.5 * f64::from(g.fg3m), fga),
            Factor::TovPct => {
                let tov = f64::from(g.tov);
                ratio(tov, fga + 0.44 * f64::from(g.fta) + tov)
            }
            Factor::FtRate => ratio(f64::from(g.ftm), fga),
            Factor::OrbRaw => Some(f64::from(g.oreb)),
            Factor::Win => Some(if g.won() { 1.0 } else { 0.0 }),
        }
    }
}

fn ratio(num: f64, den: f64) -> Option<f64> {
    if den == 0.0 {
        None
    } else {
        Some(num / den)
    }
}

/// Days off between two games, clamped to `[0, MAX_REST]`.
pub fn rest_days(previous: Option<NaiveDate>, current: NaiveDate) -> u32 {
    match previous {
        None => FIRST_GAME_REST,
        Some(prev) => {
            let gap = (current - prev).num_days() - 1;
            gap.clamp(0, i64::from(MAX_REST)) as u32
        }
    }
}

/// Signed run length after the given results (oldest first): +k for k
/// straight wins, −k for k straight losses, 0 with no games.
pub fn streak_after(results: impl IntoIterator<Item = bool>) -> i32 {
    results.into_iter().fold(0, |streak, won| match (won, streak) {
        (true, s) if s > 0 => s + 1,
        (true, _) => 1,
        (false, s) if s < 0 => s - 1,
        (false, _) => -1,
    })
}

/// Team-level statistics a feature vector is assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormStat {
    EfgLast5,
    TovLast5,
    OrbLast5,
    WinLast5,
    RestDays,
    IsB2b,
    Streak,
    Last10Wins,
    WinRateSpecific,
    EffShock,
    Volatility,
    MarginCrash,
}

/// A team's form entering one game.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamForm {
    pub efg_pct_last_5: Option<f64>,
    pub tov_pct_last_5: Option<f64>,
    pub ft_rate_last_5: Option<f64>,
    pub orb_raw_last_5: Option<f64>,
    pub win_last_5: Option<f64>,
    pub rest_days: u32,
    pub is_b2b: bool,
    pub streak_current: i32,
    pub last10_wins: Option<f64>,
    pub win_rate_specific: f64,
    pub eff_shock: Option<f64>,
    pub volatility: Option<f64>,
    pub margin_crash: Option<f64>,
}

impl TeamForm {
    /// Form entering a game on `date` at the given venue side, from the
    /// team's final games before it (oldest first). This is the single
    /// derivation shared by the batch engine and the reconstructor.
    pub fn compute(
        history: &[&GameRow],
        date: NaiveDate,
        is_home: bool,
        policy: WindowPolicy,
    ) -> TeamForm {
        let series = |f: Factor| -> Vec<Option<f64>> { history.iter().map(|g| f.of(g)).collect() };
        let efg = series(Factor::EfgPct);
        let wins = series(Factor::Win);
        let margins: Vec<Option<f64>> = history.iter().map(|g| Some(g.point_differential)).collect();

        let rest = rest_days(history.last().map(|g| g.game_date), date);

        let same_side: Vec<f64> = history
            .iter()
            .filter(|g| g.is_home == is_home)
            .map(|g| if g.won() { 1.0 } else { 0.0 })
            .collect();
        let win_rate_specific = if same_side.is_empty() {
            NEUTRAL_WIN_RATE
        } else {
            same_side.iter().sum::<f64>() / same_side.len() as f64
        };

        let eff_shock = match (
            trailing_mean(&efg, SHOCK_SHORT, policy),
            trailing_mean(&efg, SHOCK_LONG, policy),
        ) {
            (Some(short), Some(long)) => Some(100.0 * (short - long)),
            _ => None,
        };

        TeamForm {
            efg_pct_last_5: trailing_mean(&efg, LAST_N, policy),
            tov_pct_last_5: trailing_mean(&series(Factor::TovPct), LAST_N, policy),
            ft_rate_last_5: trailing_mean(&series(Factor::FtRate), LAST_N, policy),
            orb_raw_last_5: trailing_mean(&series(Factor::OrbRaw), LAST_N, policy),
            win_last_5: trailing_mean(&wins, LAST_N, policy),
            rest_days: rest,
            is_b2b: rest == 0,
            streak_current: streak_after(history.iter().map(|g| g.won())),
            // a short ten-game window reads as zero wins when windows must be full
            last10_wins: match policy {
                WindowPolicy::Full => Some(trailing_sum(&wins, LAST10, policy).unwrap_or(0.0)),
                WindowPolicy::Partial => trailing_sum(&wins, LAST10, policy),
            },
            win_rate_specific,
            eff_shock,
            volatility: trailing_std(&margins, VOLATILITY_WINDOW, policy),
            margin_crash: trailing_weighted_mean(&margins, CRASH_WINDOW, policy),
        }
    }

    pub fn get(&self, stat: FormStat) -> Option<f64> {
        match stat {
            FormStat::EfgLast5 => self.efg_pct_last_5,
            FormStat::TovLast5 => self.tov_pct_last_5,
            FormStat::OrbLast5 => self.orb_raw_last_5,
            FormStat::WinLast5 => self.win_last_5,
            FormStat::RestDays => Some(f64::from(self.rest_days)),
            FormStat::IsB2b => Some(if self.is_b2b { 1.0 } else { 0.0 }),
            FormStat::Streak => Some(f64::from(self.streak_current)),
            FormStat::Last10Wins => self.last10_wins,
            FormStat::WinRateSpecific => Some(self.win_rate_specific),
            FormStat::EffShock => self.eff_shock,
            FormStat::Volatility => self.volatility,
            FormStat::MarginCrash => self.margin_crash,
        }
    }

    /// Every five-game mean is defined.
    pub fn has_full_last_5(&self) -> bool {
        [
            self.efg_pct_last_5,
            self.tov_pct_last_5,
            self.ft_rate_last_5,
            self.orb_raw_last_5,
            self.win_last_5,
        ]
        .iter()
        .all(Option::is_some)
    }
}
