//! Full-snapshot retrieval from the backing store.
//!
//! The snapshot path is the consistency backstop: it runs once at startup
//! and on a fixed interval, and a failed fetch leaves the previous state
//! untouched. Live delivery happens on the channel; this path only has to
//! eventually agree with the store.

use async_trait::async_trait;
use concern_protocol::ConcernRecord;
use log::warn;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};

use crate::error::Result;

/// Seam for the snapshot backend. Implementations must be idempotent and
/// safe to call concurrently with themselves; overlapping calls are not
/// de-duplicated (last response to complete wins).
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_all(&self) -> Result<Vec<ConcernRecord>>;
}

/// Production source: GET `{api_url}/api/concerns` returning a JSON array
/// of concern records.
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSnapshotSource {
    #[must_use]
    pub fn new(api_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/api/concerns", api_url.trim_end_matches('/')),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_all(&self) -> Result<Vec<ConcernRecord>> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<Vec<ConcernRecord>>().await?)
    }
}

/// Spawn the poll loop: one fetch immediately, then one per `interval`,
/// plus one per manual refresh request. Results go to `snapshot_tx`;
/// failures are logged and skipped, preserving the last good state.
pub(crate) fn spawn_snapshot_loop(
    source: Arc<dyn SnapshotSource>,
    interval: Duration,
    mut refresh_rx: mpsc::Receiver<String>,
    snapshot_tx: mpsc::Sender<Vec<ConcernRecord>>,
) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let reason = tokio::select! {
                _ = ticker.tick() => "interval".to_string(),
                maybe_reason = refresh_rx.recv() => match maybe_reason {
                    Some(reason) => reason,
                    None => break,
                },
            };
            match source.fetch_all().await {
                Ok(records) => {
                    if snapshot_tx.send(records).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!("snapshot fetch failed ({reason}): {err}"),
            }
        }
    });
}
