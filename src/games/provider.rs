use anyhow::Result;
use async_trait::async_trait;

/// Trait every game-log source must implement.
#[async_trait]
pub trait GameLogSource: Send + Sync {
    /// Return the full per-team game log as one JSON object per team-game,
    /// unvalidated. Only a failure to reach or read the source is an error.
    async fn fetch_game_log(&self) -> Result<Vec<serde_json::Value>>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
