use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use url::Url;

use super::reconcile::UpsertBatch;
use crate::db::models::{parse_game_date, BetRecord, LedgerRow, MatchKey, RemoteVote};
use crate::retry::{with_retry, RetryPolicy};

/// Remote ledger accepting merge-on-key batch upserts.
#[async_trait]
pub trait LedgerSink: Send + Sync {
    async fn upsert(&self, rows: &[LedgerRow]) -> Result<()>;

    /// Every vote entered on the remote side.
    async fn fetch_votes(&self) -> Result<Vec<RemoteVote>>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

/// REST table endpoint that merges rows on `(game_date, home_team)`.
pub struct RestLedgerSink {
    http: Client,
    /// Table URL as configured, minus any conflict target
    table: Url,
    upsert_url: Url,
    api_key: Option<String>,
}

impl RestLedgerSink {
    pub fn new(url: &str, api_key: Option<&str>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        let parsed = Url::parse(url).with_context(|| format!("Invalid ledger URL {}", url))?;

        let conflict = parsed
            .query_pairs()
            .find(|(k, _)| k == "on_conflict")
            .map(|(_, v)| v.into_owned());
        let rest: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(k, _)| k != "on_conflict")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut table = parsed.clone();
        table.set_query(None);
        if !rest.is_empty() {
            table.query_pairs_mut().extend_pairs(&rest);
        }
        let mut upsert_url = table.clone();
        upsert_url.query_pairs_mut().append_pair(
            "on_conflict",
            conflict.as_deref().unwrap_or("game_date,home_team"),
        );

        Ok(RestLedgerSink {
            http,
            table,
            upsert_url,
            api_key: api_key.map(String::from),
        })
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("apikey", key).bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl LedgerSink for RestLedgerSink {
    fn name(&self) -> &str {
        "remote-ledger"
    }

    async fn upsert(&self, rows: &[LedgerRow]) -> Result<()> {
        debug!("Upserting {} ledger rows to {}", rows.len(), self.upsert_url);

        let req = self
            .http
            .post(self.upsert_url.clone())
            .header("Prefer", "resolution=merge-duplicates")
            .json(rows);
        let resp = self
            .authed(req)
            .send()
            .await
            .context("Ledger upsert request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Ledger upsert error {}: {}", status, body);
        }
        Ok(())
    }

    async fn fetch_votes(&self) -> Result<Vec<RemoteVote>> {
        let mut url = self.table.clone();
        url.query_pairs_mut()
            .append_pair(
                "select",
                "game_date,home_team,user_prediction,user_reason,user_confidence",
            )
            .append_pair("user_prediction", "not.is.null");
        debug!("Fetching votes from {}", url);

        let resp = self
            .authed(self.http.get(url))
            .send()
            .await
            .context("Ledger vote request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Ledger vote endpoint error: {}", resp.status());
        }
        let raw: serde_json::Value = resp
            .json()
            .await
            .context("Failed to parse ledger vote response")?;
        parse_votes(&raw)
    }
}

#[derive(Deserialize)]
struct VoteRow {
    game_date: String,
    home_team: String,
    user_prediction: Option<String>,
    user_reason: Option<String>,
    user_confidence: Option<u8>,
}

/// Votes from a JSON array of ledger rows. Rows without a usable key or
/// with mistyped columns are logged and skipped; rows without a vote are
/// dropped quietly.
pub fn parse_votes(raw: &serde_json::Value) -> Result<Vec<RemoteVote>> {
    let rows = raw.as_array().context("Ledger vote response is not an array")?;
    let mut votes = Vec::with_capacity(rows.len());
    for value in rows {
        let row: VoteRow = match serde_json::from_value(value.clone()) {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping remote ledger row: {}", e);
                continue;
            }
        };
        let game_date = match parse_game_date(&row.game_date) {
            Some(d) => d,
            None => {
                warn!("Skipping remote ledger row with date '{}'", row.game_date);
                continue;
            }
        };
        let pick = match row.user_prediction.map(|p| p.trim().to_string()) {
            Some(p) if !p.is_empty() => p,
            _ => continue,
        };
        votes.push(RemoteVote {
            key: MatchKey::new(game_date, row.home_team.trim()),
            user_prediction: pick,
            user_reason: row.user_reason.filter(|r| !r.trim().is_empty()),
            user_confidence: row.user_confidence,
        });
    }
    Ok(votes)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub committed: usize,
    /// Keys of the chunks that exhausted their retries, with the cause
    pub failed: Vec<(MatchKey, String)>,
}

/// Send a reconciled batch chunk by chunk: key and system group only.
/// A failed chunk does not stop later ones, and chunks already sent stay
/// committed.
pub async fn dispatch(
    sink: &dyn LedgerSink,
    batch: &UpsertBatch,
    chunk_size: usize,
    policy: &RetryPolicy,
) -> DispatchReport {
    send(sink, batch.records(), LedgerRow::system, chunk_size, policy).await
}

/// Send records settled by verification together with their outcome.
pub async fn dispatch_outcomes(
    sink: &dyn LedgerSink,
    settled: &[BetRecord],
    chunk_size: usize,
    policy: &RetryPolicy,
) -> DispatchReport {
    send(sink, settled, LedgerRow::settled, chunk_size, policy).await
}

async fn send(
    sink: &dyn LedgerSink,
    records: &[BetRecord],
    to_row: fn(&BetRecord) -> LedgerRow,
    chunk_size: usize,
    policy: &RetryPolicy,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    for chunk in records.chunks(chunk_size.max(1)) {
        let rows: Vec<LedgerRow> = chunk.iter().map(to_row).collect();
        let rows = &rows;
        match with_retry(policy, sink.name(), || sink.upsert(rows)).await {
            Ok(()) => report.committed += chunk.len(),
            Err(e) => {
                error!("Ledger chunk of {} rows not committed: {}", chunk.len(), e);
                let cause = e.to_string();
                report
                    .failed
                    .extend(chunk.iter().map(|r| (r.key.clone(), cause.clone())));
            }
        }
    }
    info!(
        "Dispatched {} ledger rows to {} ({} failed)",
        report.committed,
        sink.name(),
        report.failed.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::fixtures;
    use crate::games::log::fixtures::date;
    use serde_json::json;
    use crate::ledger::reconcile::reconcile;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every accepted chunk; rejects chunks containing `poison`.
    struct FakeSink {
        poison: Option<String>,
        accepted: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl LedgerSink for FakeSink {
        fn name(&self) -> &str {
            "fake"
        }

        async fn upsert(&self, rows: &[LedgerRow]) -> Result<()> {
            if let Some(p) = &self.poison {
                if rows.iter().any(|r| &r.home_team == p) {
                    anyhow::bail!("409 conflict");
                }
            }
            let mut keys: Vec<String> = rows.iter().map(|r| r.home_team.clone()).collect();
            // a merge-on-key endpoint rejects a batch carrying the same key twice
            let n = keys.len();
            keys.sort();
            keys.dedup();
            if keys.len() != n {
                anyhow::bail!("ON CONFLICT DO UPDATE command cannot affect row a second time");
            }
            self.accepted.lock().unwrap().push(keys);
            Ok(())
        }

        async fn fetch_votes(&self) -> Result<Vec<RemoteVote>> {
            Ok(vec![])
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(1),
            timeout: Duration::from_secs(1),
        }
    }

    fn batch(homes: &[&str]) -> UpsertBatch {
        let candidates = homes.iter().map(|h| {
            BetRecord::new(
                MatchKey::new(date(2024, 1, 6), *h),
                fixtures::system("Away", h, 0.6),
            )
        });
        reconcile(&[], candidates).batch
    }

    #[tokio::test]
    async fn duplicate_candidates_reach_the_sink_once() {
        let sink = FakeSink {
            poison: None,
            accepted: Mutex::new(vec![]),
        };
        let report = dispatch(&sink, &batch(&["A", "B", "A"]), 10, &policy()).await;
        assert_eq!(report.committed, 2);
        assert!(report.failed.is_empty());
        assert_eq!(sink.accepted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_chunk_reports_exact_keys_and_keeps_the_rest() {
        let sink = FakeSink {
            poison: Some("C".into()),
            accepted: Mutex::new(vec![]),
        };
        let report = dispatch(&sink, &batch(&["A", "B", "C", "D", "E"]), 2, &policy()).await;

        // chunks: [A, B] [C, D] [E]
        assert_eq!(report.committed, 3);
        let failed: Vec<&str> = report.failed.iter().map(|(k, _)| k.home_team.as_str()).collect();
        assert_eq!(failed, vec!["C", "D"]);
        assert!(report.failed[0].1.contains("409"));
        assert_eq!(
            *sink.accepted.lock().unwrap(),
            vec![vec!["A".to_string(), "B".to_string()], vec!["E".to_string()]]
        );
    }

    #[tokio::test]
    async fn outcome_dispatch_reports_failed_keys_too() {
        let sink = FakeSink {
            poison: Some("B".into()),
            accepted: Mutex::new(vec![]),
        };
        let settled: Vec<BetRecord> = ["A", "B"]
            .iter()
            .map(|h| {
                let mut r = BetRecord::new(MatchKey::new(date(2024, 1, 6), *h), fixtures::system("Away", h, 0.6));
                r.settle("Away");
                r
            })
            .collect();
        let report = dispatch_outcomes(&sink, &settled, 1, &policy()).await;
        assert_eq!(report.committed, 1);
        assert_eq!(report.failed[0].0, MatchKey::new(date(2024, 1, 6), "B"));
    }

    #[test]
    fn conflict_target_is_added_once() {
        let sink = RestLedgerSink::new("https://db.example.com/rest/v1/bets", None).unwrap();
        assert_eq!(sink.upsert_url.query(), Some("on_conflict=game_date%2Chome_team"));
        assert_eq!(sink.table.query(), None);
        let sink = RestLedgerSink::new(
            "https://db.example.com/rest/v1/bets?on_conflict=game_date&schema=public",
            None,
        )
        .unwrap();
        assert_eq!(sink.upsert_url.query(), Some("schema=public&on_conflict=game_date"));
        assert_eq!(sink.table.query(), Some("schema=public"));
    }

    #[test]
    fn votes_skip_bad_rows_and_blank_picks() {
        let raw = json!([
            {"game_date": "2024-01-06T00:00:00", "home_team": "Lakers", "user_prediction": "Celtics", "user_reason": "", "user_confidence": 60},
            {"game_date": "2024-01-06", "home_team": "Knicks", "user_prediction": "  "},
            {"game_date": "soon", "home_team": "Heat", "user_prediction": "Heat"},
            {"game_date": "2024-01-06", "home_team": "Bulls", "user_prediction": "Bulls", "user_confidence": "high"}
        ]);
        let votes = parse_votes(&raw).unwrap();
        assert_eq!(
            votes,
            vec![RemoteVote {
                key: MatchKey::new(date(2024, 1, 6), "Lakers"),
                user_prediction: "Celtics".into(),
                user_reason: None,
                user_confidence: Some(60),
            }]
        );
        assert!(parse_votes(&json!({"rows": []})).is_err());
    }
}
