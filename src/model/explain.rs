use serde::{Deserialize, Serialize};

use crate::db::models::RiskTier;
use crate::features::schema::FeatureVector;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Weighted recent margin gap (points)
    pub crash: f64,
    /// Point-differential standard deviation gap
    pub volatility: f64,
    /// Venue-specific win rate gap
    pub structure: f64,
    /// Probability above which a side is a strong favorite
    pub favorite: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            crash: -7.0,
            volatility: 5.0,
            structure: 0.20,
            favorite: 0.60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Explanation {
    pub rationale: String,
    pub risk_tier: RiskTier,
    /// At most two, rationale badge first
    pub badges: Vec<String>,
}

/// Gaps between the picked side (winner/favorite) and the other side,
/// read off the home − away differentials. Missing values count as 0.
struct Gaps {
    /// picked − other, weighted recent margin
    crash: f64,
    /// picked − other, point-differential volatility
    volatility: f64,
    /// picked − other, venue-specific win rate
    structure: f64,
}

impl Gaps {
    fn for_side(features: &FeatureVector, home_picked: bool) -> Self {
        let sign = if home_picked { 1.0 } else { -1.0 };
        Gaps {
            crash: sign * features.get_or_zero("DIFF_MARGIN_CRASH"),
            volatility: sign * features.get_or_zero("DIFF_VOLATILITY"),
            structure: sign * features.get_or_zero("DIFF_SPECIFIC_WIN_RATE"),
        }
    }
}

/// Rationale, risk tier and badges for a matchup. Deterministic in the
/// features and the home-win probability.
pub fn explain(
    features: &FeatureVector,
    win_probability_home: f64,
    home_name: &str,
    away_name: &str,
    t: &Thresholds,
) -> Explanation {
    let home_picked = win_probability_home >= 0.5;
    let (winner, loser) = if home_picked {
        (home_name, away_name)
    } else {
        (away_name, home_name)
    };
    // The winner is also the favorite, so one set of gaps serves both.
    let gaps = Gaps::for_side(features, home_picked);

    let (rationale, badge) = if -gaps.crash <= t.crash {
        (
            format!("{} shows signs of a recent collective collapse.", loser),
            "Collapse",
        )
    } else if -gaps.volatility >= t.volatility {
        (
            format!("{} is going through a stretch of heavy instability.", loser),
            "Instability",
        )
    } else if gaps.structure >= t.structure {
        (
            format!("{} holds a solid structural edge at this venue.", winner),
            "Solid",
        )
    } else {
        (
            format!("{} carries the better overall form and efficiency.", winner),
            "Form",
        )
    };

    let risk_tier = risk_tier(&gaps, win_probability_home, t);
    let mut badges = vec![badge.to_string()];
    if risk_tier == RiskTier::High {
        badges.push("Trap".to_string());
    }

    Explanation {
        rationale,
        risk_tier,
        badges,
    }
}

fn risk_tier(favorite: &Gaps, win_probability_home: f64, t: &Thresholds) -> RiskTier {
    let favorite_prob = win_probability_home.max(1.0 - win_probability_home);
    if favorite_prob < t.favorite {
        return RiskTier::Medium;
    }
    if favorite.structure >= t.structure {
        return RiskTier::Low;
    }
    let crash = favorite.crash <= t.crash;
    let volatile = favorite.volatility >= t.volatility;
    match (crash, volatile) {
        (true, true) => RiskTier::High,
        (true, false) | (false, true) => RiskTier::Medium,
        (false, false) => RiskTier::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::form::TeamForm;

    fn form(margin_crash: f64, volatility: f64, win_rate_specific: f64) -> TeamForm {
        TeamForm {
            efg_pct_last_5: Some(0.52),
            tov_pct_last_5: Some(0.13),
            ft_rate_last_5: Some(0.2),
            orb_raw_last_5: Some(10.0),
            win_last_5: Some(0.6),
            rest_days: 1,
            is_b2b: false,
            streak_current: 1,
            last10_wins: Some(6.0),
            win_rate_specific,
            eff_shock: Some(0.0),
            volatility: Some(volatility),
            margin_crash: Some(margin_crash),
        }
    }

    fn run(home: TeamForm, away: TeamForm, p: f64) -> Explanation {
        let v = FeatureVector::assemble(&home, &away);
        explain(&v, p, "Home", "Away", &Thresholds::default())
    }

    #[test]
    fn loser_collapse_wins_priority() {
        // away (loser) margin 10 below home, and far more volatile
        let e = run(form(4.0, 6.0, 0.5), form(-6.0, 14.0, 0.5), 0.58);
        assert_eq!(e.badges, vec!["Collapse"]);
        assert!(e.rationale.starts_with("Away"));
        assert_eq!(e.risk_tier, RiskTier::Medium);
    }

    #[test]
    fn rationale_is_symmetric_for_away_picks() {
        // home (loser) is the unstable side
        let e = run(form(0.0, 13.0, 0.5), form(0.0, 6.0, 0.5), 0.35);
        assert_eq!(e.badges, vec!["Instability"]);
        assert!(e.rationale.starts_with("Home"));

        let e = run(form(0.0, 6.0, 0.3), form(0.0, 6.0, 0.6), 0.4);
        assert_eq!(e.badges, vec!["Solid"]);
        assert!(e.rationale.starts_with("Away"));

        let e = run(form(0.0, 6.0, 0.5), form(0.0, 6.0, 0.5), 0.55);
        assert_eq!(e.badges, vec!["Form"]);
    }

    #[test]
    fn fragile_strong_favorite_is_a_trap() {
        // home favorite: crashing and more volatile, no venue edge
        let e = run(form(-5.0, 12.0, 0.5), form(3.0, 5.0, 0.5), 0.72);
        assert_eq!(e.risk_tier, RiskTier::High);
        assert_eq!(e.badges.len(), 2);
        assert_eq!(e.badges[1], "Trap");
    }

    #[test]
    fn one_warning_sign_is_medium_and_structure_is_low() {
        let e = run(form(-5.0, 5.0, 0.5), form(3.0, 5.0, 0.5), 0.72);
        assert_eq!(e.risk_tier, RiskTier::Medium);
        assert_eq!(e.badges.len(), 1);

        let e = run(form(-5.0, 12.0, 0.8), form(3.0, 5.0, 0.5), 0.72);
        assert_eq!(e.risk_tier, RiskTier::Low);
    }

    #[test]
    fn away_favorite_uses_its_own_side() {
        // away favorite (p_home = 0.25) is the crashing, volatile side
        let e = run(form(3.0, 5.0, 0.5), form(-5.0, 12.0, 0.5), 0.25);
        assert_eq!(e.risk_tier, RiskTier::High);
    }

    #[test]
    fn toss_up_is_medium_and_missing_reads_as_zero() {
        let mut away = form(0.0, 6.0, 0.5);
        away.margin_crash = None;
        away.volatility = None;
        let e = run(form(-20.0, 30.0, 0.5), away, 0.52);
        assert_eq!(e.risk_tier, RiskTier::Medium);
        assert_eq!(e.badges, vec!["Form"]);
    }
}
