use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

use crate::db::models::MatchKey;
use crate::db::{Database, ModelCalibration};
use crate::error::{PipelineError, PipelineResult};
use crate::features::{derive, FeatureReconstructor};
use crate::games::log::{GameLog, SlateStatus};
use crate::games::provider::GameLogSource;
use crate::games::{ingest, IngestReport};
use crate::ledger::{
    candidate, dispatch, dispatch_outcomes, merge_votes, reconcile, verify_outcomes,
    DispatchReport, LedgerSink, PullReport, Transition, VerifyReport,
};
use crate::model::calibration::{samples_from_ledger, FitOptions};
use crate::model::{explain, Explanation, PlattCalibration, Prediction, PredictionService, Thresholds};
use crate::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Features,
    Scoring,
}

/// A matchup that could not be predicted. The rest of the slate goes on.
#[derive(Debug, Clone, Serialize)]
pub struct MatchupFailure {
    pub key: MatchKey,
    pub stage: Stage,
    pub cause: String,
}

#[derive(Debug, Clone)]
pub struct SlatePick {
    pub prediction: Prediction,
    pub explanation: Explanation,
}

/// Reconstruct, score and explain every matchup on `date`.
///
/// Per-matchup failures are collected; a scorer fitted on another feature
/// set fails the whole slate.
pub fn predict_slate(
    log: &GameLog,
    date: NaiveDate,
    service: &PredictionService,
    thresholds: &Thresholds,
) -> PipelineResult<(Vec<SlatePick>, Vec<MatchupFailure>)> {
    service.check_compatible()?;

    let reconstructor = FeatureReconstructor::new(log);
    let mut picks = Vec::new();
    let mut failures = Vec::new();

    for m in log.matchups_on(date) {
        let key = MatchKey::new(date, m.home_name.clone());
        let outcome = reconstructor
            .reconstruct(m.home_id, m.away_id, date)
            .map_err(|e| (Stage::Features, e))
            .and_then(|features| {
                service
                    .predict(&m, features)
                    .map_err(|e| (Stage::Scoring, e))
            });

        match outcome {
            Ok(prediction) => {
                let explanation = explain(
                    &prediction.features,
                    prediction.win_probability_home,
                    &prediction.home_team,
                    &prediction.away_team,
                    thresholds,
                );
                picks.push(SlatePick {
                    prediction,
                    explanation,
                });
            }
            Err((_, e @ PipelineError::FeatureSetMismatch { .. })) => return Err(e),
            Err((stage, e)) => {
                warn!("Skipping {} at {:?}: {}", key, stage, e);
                failures.push(MatchupFailure {
                    key,
                    stage,
                    cause: e.to_string(),
                });
            }
        }
    }

    Ok((picks, failures))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub matchups: usize,
    pub predicted: usize,
    pub failures: Vec<MatchupFailure>,
    pub inserted: usize,
    pub refreshed: usize,
    pub unchanged: usize,
    pub collapsed: usize,
    pub dispatch: Option<DispatchReport>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyRun {
    #[serde(flatten)]
    pub outcomes: VerifyReport,
    pub dispatch: Option<DispatchReport>,
}

/// Everything a run needs, with every path and endpoint passed in explicitly.
pub struct Pipeline {
    pub db: Database,
    pub source: Option<Box<dyn GameLogSource>>,
    pub sink: Option<Box<dyn LedgerSink>>,
    pub retry: RetryPolicy,
    pub upsert_chunk_size: usize,
    pub thresholds: Thresholds,
}

impl Pipeline {
    /// Pull the game log into the store. Without a configured source the
    /// stored log is used as is.
    pub async fn refresh_games(&self) -> Result<Option<IngestReport>> {
        let source = match &self.source {
            Some(s) => s.as_ref(),
            None => {
                info!("No game log source configured, using stored games");
                return Ok(None);
            }
        };
        let report = ingest(source, &self.retry).await?;
        let written = self.db.upsert_games(&report.accepted)?;
        info!("Stored {} new or updated game rows", written);
        Ok(Some(report))
    }

    pub fn load_log(&self) -> Result<GameLog> {
        let log = GameLog::from_rows(self.db.load_games()?);
        for game_id in log.pairing_violations() {
            warn!("Final game {} does not have exactly two team rows", game_id);
        }
        Ok(log)
    }

    /// Ingest, predict the slate on `date`, and reconcile it into the ledger.
    /// An unreachable game-log source aborts before the ledger is touched.
    pub async fn predict(&self, service: &PredictionService, date: NaiveDate) -> Result<RunReport> {
        self.refresh_games().await?;
        let log = self.load_log()?;

        let (picks, failures) = predict_slate(&log, date, service, &self.thresholds)?;
        let mut report = RunReport {
            matchups: picks.len() + failures.len(),
            predicted: picks.len(),
            failures,
            ..RunReport::default()
        };

        let ledger = self.db.load_ledger()?;
        let rec = reconcile(
            &ledger,
            picks.iter().map(|p| candidate(&p.prediction, &p.explanation)),
        );
        report.inserted = rec.count(Transition::Inserted);
        report.refreshed = rec.count(Transition::Refreshed);
        report.unchanged = rec.count(Transition::Unchanged);
        report.collapsed = rec.collapsed;

        self.db.upsert_bet_records(rec.batch.records())?;
        if rec.batch.is_empty() {
            info!("Nothing to send to the remote ledger");
        } else if let Some(sink) = &self.sink {
            info!("Sending {} ledger rows to {}", rec.batch.len(), sink.name());
            report.dispatch = Some(
                dispatch(sink.as_ref(), &rec.batch, self.upsert_chunk_size, &self.retry).await,
            );
        }

        info!(
            "{}: {} predicted, {} skipped, ledger {} inserted / {} refreshed / {} unchanged",
            date,
            report.predicted,
            report.failures.len(),
            report.inserted,
            report.refreshed,
            report.unchanged
        );
        Ok(report)
    }

    /// Settle past records from final games, store the outcomes, and send
    /// the settled rows to the remote ledger when one is configured.
    pub async fn verify(&self, today: NaiveDate, only: Option<NaiveDate>) -> Result<VerifyRun> {
        self.refresh_games().await?;
        let log = self.load_log()?;
        let ledger = self.db.load_ledger()?;
        let (updated, outcomes) = verify_outcomes(&ledger, &log, today, only);
        self.db.save_outcomes(&updated)?;

        let mut report = VerifyRun {
            outcomes,
            dispatch: None,
        };
        match &self.sink {
            Some(sink) if !updated.is_empty() => {
                info!("Sending {} settled rows to {}", updated.len(), sink.name());
                report.dispatch = Some(
                    dispatch_outcomes(sink.as_ref(), &updated, self.upsert_chunk_size, &self.retry)
                        .await,
                );
            }
            _ => {}
        }

        let stats = self.db.get_stats()?;
        if let Some(acc) = stats.accuracy() {
            info!(
                "Ledger: {} records, system {}/{} ({:.1}%), user {}/{}",
                stats.total_records,
                stats.won,
                stats.resolved,
                acc * 100.0,
                stats.user_won,
                stats.user_resolved
            );
        }
        Ok(report)
    }

    /// Copy votes from the remote ledger into local records whose user
    /// fields are still empty. `None` without a configured remote ledger.
    pub async fn pull(&self) -> Result<Option<PullReport>> {
        let sink = match &self.sink {
            Some(s) => s.as_ref(),
            None => {
                info!("No remote ledger configured, nothing to pull");
                return Ok(None);
            }
        };
        let votes = with_retry(&self.retry, sink.name(), || sink.fetch_votes()).await?;
        let (updated, report) = merge_votes(&self.db.load_ledger()?, &votes);
        let written = self.db.save_votes(&updated)?;
        info!("Stored votes on {} ledger records", written);
        Ok(Some(report))
    }

    pub async fn status(&self, date: NaiveDate) -> Result<SlateStatus> {
        self.refresh_games().await?;
        let status = self.load_log()?.slate_status(date);
        info!(
            "{}: {}/{} games final",
            date, status.finished, status.total
        );
        Ok(status)
    }

    /// Write the training set to `out` as JSON. Returns the number of rows.
    pub async fn export_features(&self, out: &Path) -> Result<usize> {
        self.refresh_games().await?;
        let log = self.load_log()?;
        let set = derive(log.rows()).training_set();
        let json = serde_json::to_string_pretty(&set)?;
        std::fs::write(out, json).with_context(|| format!("Failed to write {}", out.display()))?;
        info!(
            "Wrote {} training rows ({}) to {}",
            set.rows.len(),
            set.feature_set_version,
            out.display()
        );
        Ok(set.rows.len())
    }

    /// Fit a Platt calibration on settled ledger records and store it for
    /// `model_version`. `None` when there is not enough data.
    pub fn calibrate(&self, model_version: &str) -> Result<Option<ModelCalibration>> {
        let samples = samples_from_ledger(&self.db.load_ledger()?);
        let fit = match PlattCalibration::fit(&samples, FitOptions::default()) {
            Some(f) => f,
            None => {
                warn!(
                    "Not enough settled records to calibrate ({} samples)",
                    samples.len()
                );
                return Ok(None);
            }
        };
        let cal = ModelCalibration {
            model_version: model_version.to_string(),
            a: fit.calibration.a,
            b: fit.calibration.b,
            samples: fit.samples as i64,
            logloss_before: fit.before.logloss,
            logloss_after: fit.after.logloss,
            fitted_at: Utc::now(),
        };
        self.db.save_calibration(&cal)?;
        info!(
            "Calibration for {} after {} steps: a={:.3} b={:.3}, logloss {:.4} -> {:.4}, brier {:.4} -> {:.4}",
            model_version,
            fit.iterations,
            cal.a,
            cal.b,
            cal.logloss_before,
            cal.logloss_after,
            fit.before.brier,
            fit.after.brier
        );
        Ok(Some(cal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{GameRow, LedgerRow, RawGameRow, RemoteVote, WinLoss};
    use crate::games::log::fixtures::{contest, date};
    use crate::model::scorer::fixtures::{logistic, FixedScorer};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct StaticSource(Vec<serde_json::Value>);

    #[async_trait]
    impl GameLogSource for StaticSource {
        fn name(&self) -> &str {
            "static"
        }

        async fn fetch_game_log(&self) -> Result<Vec<serde_json::Value>> {
            Ok(self.0.clone())
        }
    }

    struct DeadSource;

    #[async_trait]
    impl GameLogSource for DeadSource {
        fn name(&self) -> &str {
            "dead"
        }

        async fn fetch_game_log(&self) -> Result<Vec<serde_json::Value>> {
            anyhow::bail!("connection refused")
        }
    }

    /// Remote ledger double: keeps every row sent as JSON and serves fixed votes.
    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<serde_json::Value>>>,
        votes: Vec<RemoteVote>,
    }

    #[async_trait]
    impl LedgerSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn upsert(&self, rows: &[LedgerRow]) -> Result<()> {
            let mut sent = self.sent.lock().unwrap();
            for r in rows {
                sent.push(serde_json::to_value(r)?);
            }
            Ok(())
        }

        async fn fetch_votes(&self) -> Result<Vec<RemoteVote>> {
            Ok(self.votes.clone())
        }
    }

    fn to_raw(g: &GameRow) -> serde_json::Value {
        let raw = RawGameRow {
            game_id: Some(g.game_id.clone()),
            team_id: Some(g.team_id),
            team_name: Some(g.team_name.clone()),
            game_date: Some(g.game_date.to_string()),
            matchup: Some(if g.is_home { "X vs. Y" } else { "X @ Y" }.to_string()),
            wl: g.win_loss.map(|w| w.as_str().to_string()),
            pts: Some(i64::from(g.points)),
            fgm: Some(i64::from(g.fgm)),
            fga: Some(i64::from(g.fga)),
            fg3m: Some(i64::from(g.fg3m)),
            ftm: Some(i64::from(g.ftm)),
            fta: Some(i64::from(g.fta)),
            oreb: Some(i64::from(g.oreb)),
            tov: Some(i64::from(g.tov)),
            plus_minus: Some(g.point_differential),
        };
        serde_json::to_value(raw).unwrap()
    }

    /// A beat B twice, then C (no history) hosts D on the slate date too.
    fn games() -> Vec<GameRow> {
        let mut rows = Vec::new();
        rows.extend(contest("g1", date(2024, 1, 1), (1, "A"), (2, "B"), Some(8.0)));
        rows.extend(contest("g2", date(2024, 1, 3), (2, "B"), (1, "A"), Some(-3.0)));
        rows.extend(contest("g3", date(2024, 1, 6), (1, "A"), (2, "B"), None));
        rows.extend(contest("g4", date(2024, 1, 6), (3, "C"), (4, "D"), None));
        rows
    }

    fn pipeline(source: Option<Box<dyn GameLogSource>>) -> Pipeline {
        Pipeline {
            db: Database::open(":memory:").unwrap(),
            source,
            sink: None,
            retry: RetryPolicy {
                attempts: 2,
                backoff: Duration::from_millis(1),
                timeout: Duration::from_secs(1),
            },
            upsert_chunk_size: 50,
            thresholds: Thresholds::default(),
        }
    }

    fn service() -> PredictionService {
        PredictionService::new(Box::new(logistic(&[("DIFF_STREAK", 0.4)])), None)
    }

    #[test]
    fn slate_skips_matchups_without_history() {
        let log = GameLog::from_rows(games());
        let (picks, failures) =
            predict_slate(&log, date(2024, 1, 6), &service(), &Thresholds::default()).unwrap();

        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].prediction.home_team, "A");
        // A enters on +2, B on −2
        assert!(picks[0].prediction.win_probability_home > 0.5);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, MatchKey::new(date(2024, 1, 6), "C"));
        assert_eq!(failures[0].stage, Stage::Features);
    }

    #[test]
    fn stale_scorer_fails_the_whole_slate() {
        let log = GameLog::from_rows(games());
        let svc = PredictionService::new(
            Box::new(FixedScorer {
                version: "v12",
                output: Ok(0.6),
            }),
            None,
        );
        let err = predict_slate(&log, date(2024, 1, 6), &svc, &Thresholds::default()).unwrap_err();
        assert!(matches!(err, PipelineError::FeatureSetMismatch { .. }));
    }

    #[tokio::test]
    async fn predict_twice_then_verify() {
        let raw: Vec<serde_json::Value> = games().iter().map(to_raw).collect();
        let p = pipeline(Some(Box::new(StaticSource(raw))));
        let day = date(2024, 1, 6);

        let first = p.predict(&service(), day).await.unwrap();
        assert_eq!((first.predicted, first.inserted), (1, 1));
        assert_eq!(first.failures.len(), 1);

        let second = p.predict(&service(), day).await.unwrap();
        assert_eq!((second.inserted, second.refreshed), (0, 1));
        assert_eq!(p.db.load_ledger().unwrap().len(), 1);

        // the game finishes: B wins at A
        let p = Pipeline {
            source: Some(Box::new(StaticSource(finished_games()))),
            ..p
        };
        let report = p.verify(date(2024, 1, 7), None).await.unwrap();
        assert_eq!(report.outcomes.resolved, 1);
        assert!(report.dispatch.is_none());

        let ledger = p.db.load_ledger().unwrap();
        assert_eq!(ledger[0].outcome().real_winner.as_deref(), Some("B"));

        // settled: a later re-run must not touch it
        let third = p.predict(&service(), day).await.unwrap();
        assert_eq!(third.unchanged, 1);
        assert!(!p.status(day).await.unwrap().all_final());
    }

    fn finished_games() -> Vec<serde_json::Value> {
        let mut finished = games();
        for g in finished.iter_mut().filter(|g| g.game_id == "g3") {
            let won = !g.is_home;
            g.win_loss = Some(if won { WinLoss::W } else { WinLoss::L });
            g.point_differential = if won { 5.0 } else { -5.0 };
        }
        finished.iter().map(to_raw).collect()
    }

    #[tokio::test]
    async fn remote_vote_survives_pull_predict_and_dispatch() {
        let day = date(2024, 1, 6);
        let sink = RecordingSink {
            votes: vec![RemoteVote {
                key: MatchKey::new(day, "A"),
                user_prediction: "B".into(),
                user_reason: Some("A on a back-to-back".into()),
                user_confidence: Some(65),
            }],
            ..RecordingSink::default()
        };
        let sent = sink.sent.clone();
        let raw: Vec<serde_json::Value> = games().iter().map(to_raw).collect();
        let p = Pipeline {
            sink: Some(Box::new(sink)),
            ..pipeline(Some(Box::new(StaticSource(raw))))
        };

        p.predict(&service(), day).await.unwrap();
        let pulled = p.pull().await.unwrap().unwrap();
        assert_eq!((pulled.fetched, pulled.accepted), (1, 1));
        let again = p.predict(&service(), day).await.unwrap();
        assert_eq!(again.refreshed, 1);
        assert_eq!(again.dispatch.unwrap().committed, 1);

        let ledger = p.db.load_ledger().unwrap();
        assert_eq!(ledger[0].user().user_prediction.as_deref(), Some("B"));
        assert_eq!(ledger[0].user().user_confidence, Some(65));

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        for row in sent.iter() {
            let obj = row.as_object().unwrap();
            assert!(obj.keys().all(|k| !k.starts_with("user_")), "{:?}", obj.keys());
        }
    }

    #[tokio::test]
    async fn verified_outcome_reaches_the_remote_ledger() {
        let day = date(2024, 1, 6);
        let sink = RecordingSink::default();
        let sent = sink.sent.clone();
        let raw: Vec<serde_json::Value> = games().iter().map(to_raw).collect();
        let p = Pipeline {
            sink: Some(Box::new(sink)),
            ..pipeline(Some(Box::new(StaticSource(raw))))
        };
        p.predict(&service(), day).await.unwrap();

        let p = Pipeline {
            source: Some(Box::new(StaticSource(finished_games()))),
            ..p
        };
        let report = p.verify(date(2024, 1, 7), None).await.unwrap();
        assert_eq!(report.outcomes.resolved, 1);
        assert_eq!(report.dispatch.unwrap().committed, 1);

        let sent = sent.lock().unwrap();
        let last = sent.last().unwrap();
        assert_eq!(last["home_team"], "A");
        assert_eq!(last["real_winner"], "B");
        assert_eq!(last["result_ia"], "Lost");

        // nothing left to settle: a second pass sends nothing
        drop(sent);
        let again = p.verify(date(2024, 1, 7), None).await.unwrap();
        assert!(again.dispatch.is_none());
    }

    #[tokio::test]
    async fn pull_without_remote_is_a_no_op() {
        assert!(pipeline(None).pull().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_source_leaves_the_ledger_alone() {
        let p = pipeline(Some(Box::new(DeadSource)));
        let err = p.predict(&service(), date(2024, 1, 6)).await.unwrap_err();
        assert!(err.to_string().contains("dead unavailable"));
        assert!(p.db.load_ledger().unwrap().is_empty());
    }
}
