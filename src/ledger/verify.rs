use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info};

use crate::db::models::BetRecord;
use crate::games::log::GameLog;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Records whose real winner was filled in this pass
    pub resolved: usize,
    /// Records that had a winner but were missing a grade
    pub repaired: usize,
    /// Past records whose game is not final yet
    pub pending: usize,
}

/// Settle past ledger records from final games in the log.
///
/// Only records dated before `today` are looked up, optionally restricted to
/// one date. Returns the records that changed; outcome fields already set
/// are never touched.
pub fn verify_outcomes(
    ledger: &[BetRecord],
    log: &GameLog,
    today: NaiveDate,
    only: Option<NaiveDate>,
) -> (Vec<BetRecord>, VerifyReport) {
    let mut report = VerifyReport::default();
    let mut updated = Vec::new();

    for record in ledger {
        if only.map_or(false, |d| d != record.key.game_date) {
            continue;
        }

        if let Some(winner) = record.outcome().real_winner.clone() {
            if record.needs_grading() {
                let mut r = record.clone();
                r.settle(&winner);
                report.repaired += 1;
                updated.push(r);
            }
            continue;
        }

        if record.key.game_date >= today {
            continue;
        }
        match log.winner_of(record.key.game_date, &record.key.home_team) {
            Some(winner) => {
                let mut r = record.clone();
                if r.settle(&winner) {
                    debug!("{} settled: {} won", r.key, winner);
                    report.resolved += 1;
                    updated.push(r);
                }
            }
            None => report.pending += 1,
        }
    }

    info!(
        "Verification: {} resolved, {} repaired, {} pending",
        report.resolved, report.repaired, report.pending
    );
    (updated, report)
}
