use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::path::PathBuf;
use tracing::debug;
use url::Url;

use super::provider::GameLogSource;

/// Game-log source backed by an HTTP endpoint returning league game-finder rows.
pub struct StatsApiSource {
    http: Client,
    url: Url,
}

impl StatsApiSource {
    pub fn new(url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .user_agent("hoopcast/0.3")
            .build()
            .context("Failed to build HTTP client")?;
        let url = Url::parse(url).with_context(|| format!("Invalid game log URL {}", url))?;
        Ok(StatsApiSource { http, url })
    }
}

#[async_trait]
impl GameLogSource for StatsApiSource {
    fn name(&self) -> &str {
        "stats-api"
    }

    async fn fetch_game_log(&self) -> Result<Vec<serde_json::Value>> {
        debug!("Fetching game log from {}", self.url);

        let resp = self
            .http
            .get(self.url.clone())
            .send()
            .await
            .context("Game log request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("Game log endpoint error: {}", resp.status());
        }

        let raw: serde_json::Value = resp
            .json()
            .await
            .context("Failed to parse game log response")?;

        parse_game_log_response(&raw)
    }
}

/// Game-log source reading a JSON export from disk.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSource { path: path.into() }
    }
}

#[async_trait]
impl GameLogSource for FileSource {
    fn name(&self) -> &str {
        "game-log-file"
    }

    async fn fetch_game_log(&self) -> Result<Vec<serde_json::Value>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let raw: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("{} is not valid JSON", self.path.display()))?;
        parse_game_log_response(&raw)
    }
}

/// Accepts three layouts: a bare array of row objects, `{"rows": [...]}`, or
/// the stats service's `resultSets[0]` with `headers` and positional `rowSet`.
/// Rows come back as JSON objects; their columns are checked at ingestion.
pub fn parse_game_log_response(raw: &serde_json::Value) -> Result<Vec<serde_json::Value>> {
    if let Some(rows) = raw.as_array().or_else(|| raw["rows"].as_array()) {
        return Ok(rows.clone());
    }

    let set = raw["resultSets"]
        .as_array()
        .and_then(|sets| sets.first())
        .context("Game log response has no rows")?;
    let headers: Vec<&str> = set["headers"]
        .as_array()
        .context("resultSets entry has no headers")?
        .iter()
        .filter_map(|h| h.as_str())
        .collect();
    let rows = match set["rowSet"].as_array() {
        Some(a) => a,
        None => return Ok(vec![]),
    };

    Ok(rows
        .iter()
        .map(|row| match row.as_array() {
            Some(cells) => serde_json::Value::Object(
                headers
                    .iter()
                    .zip(cells)
                    .map(|(h, v)| (h.to_string(), v.clone()))
                    .collect(),
            ),
            // left for ingestion to reject with the rest of the bad rows
            None => row.clone(),
        })
        .collect())
}
