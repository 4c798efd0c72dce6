use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::db::models::{BetRecord, MatchKey, SystemFields};
use crate::model::{Explanation, Prediction};

/// What reconciliation decided for one natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transition {
    /// No prior record: system fields only
    Inserted,
    /// Prior record: system fields replaced, user and outcome fields carried
    Refreshed,
    /// Prior record already settled: left untouched and not sent
    Unchanged,
}

/// Records to upsert, at most one per key, ordered by key.
#[derive(Debug, Clone, Default)]
pub struct UpsertBatch {
    records: Vec<BetRecord>,
}

impl UpsertBatch {
    pub fn records(&self) -> &[BetRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub transitions: Vec<(MatchKey, Transition)>,
    pub batch: UpsertBatch,
    /// Candidates dropped because a later one had the same key
    pub collapsed: usize,
}

impl Reconciliation {
    pub fn count(&self, t: Transition) -> usize {
        self.transitions.iter().filter(|(_, x)| *x == t).count()
    }
}

pub fn system_fields(p: &Prediction, e: &Explanation) -> SystemFields {
    let rest = |name: &str| p.features.get(name).map(|v| v.max(0.0) as u32).unwrap_or(0);
    let flag = |name: &str| p.features.get(name).map(|v| v >= 0.5).unwrap_or(false);
    SystemFields {
        away_team: p.away_team.clone(),
        predicted_winner: p.predicted_winner.clone(),
        win_probability_home: p.win_probability_home,
        confidence: p.confidence,
        rationale: e.rationale.clone(),
        risk_tier: e.risk_tier,
        badges: e.badges.clone(),
        home_rest_days: rest("REST_DAYS_HOME"),
        away_rest_days: rest("REST_DAYS_AWAY"),
        home_b2b: flag("IS_B2B_HOME_INT"),
        away_b2b: flag("IS_B2B_AWAY_INT"),
        feature_set_version: p.features.version().to_string(),
    }
}

/// A ledger candidate for a fresh prediction. User and outcome groups are empty.
pub fn candidate(p: &Prediction, e: &Explanation) -> BetRecord {
    BetRecord::new(p.key(), system_fields(p, e))
}

/// Merge candidates into the existing ledger by natural key.
///
/// Duplicate candidate keys collapse to the last one before anything else
/// happens, so the batch never carries a key twice.
pub fn reconcile(
    ledger: &[BetRecord],
    candidates: impl IntoIterator<Item = BetRecord>,
) -> Reconciliation {
    let mut unique: BTreeMap<MatchKey, BetRecord> = BTreeMap::new();
    let mut collapsed = 0usize;
    for c in candidates {
        let key = c.key.clone();
        if unique.insert(key.clone(), c).is_some() {
            warn!("Duplicate ledger key {} in batch, keeping the last prediction", key);
            collapsed += 1;
        }
    }

    let existing: HashMap<&MatchKey, &BetRecord> = ledger.iter().map(|r| (&r.key, r)).collect();

    let mut out = Reconciliation {
        collapsed,
        ..Reconciliation::default()
    };
    for (key, fresh) in unique {
        let transition = match existing.get(&key) {
            None => {
                out.batch.records.push(fresh);
                Transition::Inserted
            }
            Some(prev) if prev.outcome().is_known() => Transition::Unchanged,
            Some(prev) => {
                out.batch.records.push((*prev).clone().refreshed(fresh.system));
                Transition::Refreshed
            }
        };
        out.transitions.push((key, transition));
    }
    out
}
