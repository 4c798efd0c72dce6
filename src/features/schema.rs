//! The versioned feature schema. Training export and inference both build
//! vectors through [`FeatureVector::assemble`], so the column order below is
//! the only copy of the contract.

use serde::Serialize;

use super::form::{FormStat, TeamForm};

pub const FEATURE_SET_VERSION: &str = "v13";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Home(FormStat),
    Away(FormStat),
    /// home − away
    Diff(FormStat),
}

pub const SCHEMA: [(&str, Slot); 33] = [
    ("EFG_PCT_LAST_5_HOME", Slot::Home(FormStat::EfgLast5)),
    ("EFG_PCT_LAST_5_AWAY", Slot::Away(FormStat::EfgLast5)),
    ("TOV_PCT_LAST_5_HOME", Slot::Home(FormStat::TovLast5)),
    ("TOV_PCT_LAST_5_AWAY", Slot::Away(FormStat::TovLast5)),
    ("ORB_RAW_LAST_5_HOME", Slot::Home(FormStat::OrbLast5)),
    ("ORB_RAW_LAST_5_AWAY", Slot::Away(FormStat::OrbLast5)),
    ("DIFF_EFG", Slot::Diff(FormStat::EfgLast5)),
    ("DIFF_TOV", Slot::Diff(FormStat::TovLast5)),
    ("DIFF_ORB", Slot::Diff(FormStat::OrbLast5)),
    ("DIFF_WIN", Slot::Diff(FormStat::WinLast5)),
    ("REST_DAYS_HOME", Slot::Home(FormStat::RestDays)),
    ("REST_DAYS_AWAY", Slot::Away(FormStat::RestDays)),
    ("DIFF_REST", Slot::Diff(FormStat::RestDays)),
    ("IS_B2B_HOME_INT", Slot::Home(FormStat::IsB2b)),
    ("IS_B2B_AWAY_INT", Slot::Away(FormStat::IsB2b)),
    ("STREAK_CURRENT_HOME", Slot::Home(FormStat::Streak)),
    ("STREAK_CURRENT_AWAY", Slot::Away(FormStat::Streak)),
    ("DIFF_STREAK", Slot::Diff(FormStat::Streak)),
    ("LAST10_WINS_HOME", Slot::Home(FormStat::Last10Wins)),
    ("LAST10_WINS_AWAY", Slot::Away(FormStat::Last10Wins)),
    ("DIFF_LAST10", Slot::Diff(FormStat::Last10Wins)),
    ("WIN_RATE_SPECIFIC_HOME", Slot::Home(FormStat::WinRateSpecific)),
    ("WIN_RATE_SPECIFIC_AWAY", Slot::Away(FormStat::WinRateSpecific)),
    ("DIFF_SPECIFIC_WIN_RATE", Slot::Diff(FormStat::WinRateSpecific)),
    ("EFF_SHOCK_HOME", Slot::Home(FormStat::EffShock)),
    ("EFF_SHOCK_AWAY", Slot::Away(FormStat::EffShock)),
    ("DIFF_EFF_SHOCK", Slot::Diff(FormStat::EffShock)),
    ("VOLATILITY_HOME", Slot::Home(FormStat::Volatility)),
    ("VOLATILITY_AWAY", Slot::Away(FormStat::Volatility)),
    ("DIFF_VOLATILITY", Slot::Diff(FormStat::Volatility)),
    ("MARGIN_CRASH_HOME", Slot::Home(FormStat::MarginCrash)),
    ("MARGIN_CRASH_AWAY", Slot::Away(FormStat::MarginCrash)),
    ("DIFF_MARGIN_CRASH", Slot::Diff(FormStat::MarginCrash)),
];

pub fn feature_names() -> impl Iterator<Item = &'static str> {
    SCHEMA.iter().map(|(name, _)| *name)
}

pub fn position(name: &str) -> Option<usize> {
    SCHEMA.iter().position(|(n, _)| *n == name)
}

/// Fixed-order feature values for one matchup. `None` is a missing value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    version: &'static str,
    values: Vec<Option<f64>>,
}

impl FeatureVector {
    pub fn assemble(home: &TeamForm, away: &TeamForm) -> Self {
        let values = SCHEMA
            .iter()
            .map(|(_, slot)| match *slot {
                Slot::Home(stat) => home.get(stat),
                Slot::Away(stat) => away.get(stat),
                Slot::Diff(stat) => Some(home.get(stat)? - away.get(stat)?),
            })
            .collect();
        FeatureVector {
            version: FEATURE_SET_VERSION,
            values,
        }
    }

    pub fn version(&self) -> &str {
        self.version
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    /// Value by feature name; `None` when missing or not in the schema.
    pub fn get(&self, name: &str) -> Option<f64> {
        position(name).and_then(|i| self.values[i])
    }

    /// Like [`get`](Self::get) but a missing value reads as 0.
    pub fn get_or_zero(&self, name: &str) -> f64 {
        self.get(name).unwrap_or(0.0)
    }
}
