pub mod log;
pub mod provider;
pub mod stats_api;

use tracing::{info, warn};

use crate::db::models::{GameRow, RawGameRow};
use crate::error::PipelineResult;
use crate::retry::{with_retry, RetryPolicy};
use provider::GameLogSource;

#[derive(Debug, Default)]
pub struct IngestReport {
    pub fetched: usize,
    pub accepted: Vec<GameRow>,
    pub rejected: usize,
}

/// Fetch the raw log under the retry policy and validate every row.
/// Malformed rows, whether mistyped or missing required columns, are logged
/// and dropped one by one; only an unreachable source is an error.
pub async fn ingest(
    source: &dyn GameLogSource,
    policy: &RetryPolicy,
) -> PipelineResult<IngestReport> {
    let raw = with_retry(policy, source.name(), || source.fetch_game_log()).await?;

    let mut report = IngestReport {
        fetched: raw.len(),
        ..IngestReport::default()
    };
    for row in raw {
        match RawGameRow::try_from(row).and_then(GameRow::try_from) {
            Ok(row) => report.accepted.push(row),
            Err(e) => {
                warn!("Rejected game row from {}: {}", source.name(), e);
                report.rejected += 1;
            }
        }
    }

    info!(
        "Ingested {}/{} rows from {} ({} rejected)",
        report.accepted.len(),
        report.fetched,
        source.name(),
        report.rejected
    );
    Ok(report)
}
