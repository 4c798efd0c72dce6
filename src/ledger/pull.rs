use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::db::models::{BetRecord, MatchKey, RemoteVote};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub fetched: usize,
    /// Local records that took a remote vote
    pub accepted: usize,
    /// Votes for keys the local ledger does not have
    pub unknown: usize,
}

/// Fold remote votes into the local ledger. Only empty user fields are
/// filled; returns the records that changed.
pub fn merge_votes(ledger: &[BetRecord], votes: &[RemoteVote]) -> (Vec<BetRecord>, PullReport) {
    let mut report = PullReport {
        fetched: votes.len(),
        ..PullReport::default()
    };
    let mut changed: HashMap<&MatchKey, BetRecord> = HashMap::new();
    let local: HashMap<&MatchKey, &BetRecord> = ledger.iter().map(|r| (&r.key, r)).collect();

    for vote in votes {
        let mut record = match changed.get(&vote.key) {
            Some(r) => r.clone(),
            None => match local.get(&vote.key) {
                Some(r) => (*r).clone(),
                None => {
                    debug!("Remote vote for unknown {}", vote.key);
                    report.unknown += 1;
                    continue;
                }
            },
        };
        if record.accept_vote(vote) {
            changed.insert(&vote.key, record);
        }
    }

    let mut updated: Vec<BetRecord> = changed.into_values().collect();
    updated.sort_by(|a, b| a.key.cmp(&b.key));
    report.accepted = updated.len();
    info!(
        "Pulled {} remote votes: {} taken, {} for unknown matchups",
        report.fetched, report.accepted, report.unknown
    );
    (updated, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::fixtures;
    use crate::games::log::fixtures::date;

    fn vote(home: &str, pick: &str) -> RemoteVote {
        RemoteVote {
            key: MatchKey::new(date(2024, 1, 6), home),
            user_prediction: pick.into(),
            user_reason: Some("rested legs".into()),
            user_confidence: None,
        }
    }

    #[test]
    fn votes_fill_empty_records_and_skip_the_rest() {
        let ledger = vec![
            BetRecord::new(MatchKey::new(date(2024, 1, 6), "Knicks"), fixtures::system("Heat", "Knicks", 0.6)),
            fixtures::voted(
                MatchKey::new(date(2024, 1, 6), "Lakers"),
                fixtures::system("Celtics", "Lakers", 0.6),
                "Lakers",
            ),
        ];
        let votes = [vote("Knicks", "Heat"), vote("Lakers", "Celtics"), vote("Bulls", "Bulls")];
        let (updated, report) = merge_votes(&ledger, &votes);

        assert_eq!(report, PullReport { fetched: 3, accepted: 1, unknown: 1 });
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].key.home_team, "Knicks");
        assert_eq!(updated[0].user().user_prediction.as_deref(), Some("Heat"));
        assert_eq!(updated[0].user().user_reason.as_deref(), Some("rested legs"));
    }

    #[test]
    fn repeated_vote_for_one_key_keeps_the_first() {
        let ledger = vec![BetRecord::new(
            MatchKey::new(date(2024, 1, 6), "Knicks"),
            fixtures::system("Heat", "Knicks", 0.6),
        )];
        let (updated, _) = merge_votes(&ledger, &[vote("Knicks", "Heat"), vote("Knicks", "Knicks")]);
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].user().user_prediction.as_deref(), Some("Heat"));
    }
}
