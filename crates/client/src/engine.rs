//! Reconciliation engine: the single owner of the canonical concern map.
//!
//! Three independent triggers mutate the same state: timer-driven snapshot
//! completion, asynchronous channel arrival, and synchronous local compose.
//! [`ConcernState`] is the pure merge logic; [`SyncEngine`] wraps it in one
//! spawned loop fed by a single command queue, so every mutation applies
//! one at a time in arrival order regardless of which trigger produced it.
//!
//! Merge policy, in one paragraph: a snapshot **replaces** the whole map
//! (reversed, newest first); a channel push **appends** to its concern
//! unless a comment with the same identifier already exists; an optimistic
//! compose appends immediately and emits the identical payload outbound, so
//! the relay echo arrives carrying a known identifier and deduplicates into
//! a no-op. Comments are never re-sorted by timestamp.

use concern_protocol::{ConcernRecord, InboundMessage, OutboundMessage};
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::channel::{ChannelClient, ChannelConfig, ChannelHealth, ChannelTransport};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::model::{normalize_concern, Comment, Concern};
use crate::snapshot::{spawn_snapshot_loop, SnapshotSource};
use crate::{ids, time};

/// Outcome of a selection change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionChange {
    /// Room to leave, when one was active.
    pub previous: Option<String>,
    /// Room to join.
    pub current: String,
}

/// Canonical client state. Pure and synchronous; the async layer serializes
/// access to it.
#[derive(Debug, Default)]
pub struct ConcernState {
    concerns: Vec<Concern>,
    selected: Option<String>,
}

impl ConcernState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Full replace. Incoming records are normalized and the whole list is
    /// swapped in, reversed so the most-recently-returned concern sorts
    /// first (the store returns oldest-first; clients present newest-first).
    ///
    /// A locally-optimistic comment the store has not echoed yet is
    /// transiently dropped here until the echo or a later snapshot restores
    /// it; the selection survives the swap either way.
    ///
    /// Returns the concern auto-selected by this snapshot, if nothing was
    /// selected before.
    pub fn apply_snapshot(&mut self, records: Vec<ConcernRecord>) -> Option<String> {
        let mut concerns: Vec<Concern> = records.into_iter().map(normalize_concern).collect();
        concerns.reverse();
        self.concerns = concerns;
        if self.selected.is_none() {
            self.selected = self.concerns.first().map(|c| c.id.clone());
            return self.selected.clone();
        }
        None
    }

    /// Append with dedup. Returns the appended comment, or `None` when the
    /// message targeted an unknown concern (ignored, per protocol-violation
    /// policy) or carried an identifier that is already present (idempotent
    /// delivery, which is what makes optimistic echoes and re-join replays
    /// harmless).
    pub fn apply_incoming(&mut self, message: InboundMessage) -> Option<Comment> {
        let Some(concern) = self
            .concerns
            .iter_mut()
            .find(|c| c.id == message.concern_id)
        else {
            debug!("ignoring message for unknown concern {}", message.concern_id);
            return None;
        };
        let id = message
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(ids::new_id);
        if concern.contains_comment(&id) {
            return None;
        }
        let comment = Comment {
            id,
            text: message.message,
            author: message.sender,
            timestamp: message
                .timestamp
                .filter(|ts| !ts.is_empty())
                .unwrap_or_else(time::now_iso8601),
        };
        concern.comments.push(comment.clone());
        Some(comment)
    }

    /// Optimistic insert: append now, confirm later. Returns the outbound
    /// payload carrying the same identifier and timestamp just applied
    /// locally, or `None` when the concern is unknown.
    pub fn apply_optimistic(
        &mut self,
        concern_id: &str,
        text: &str,
        author: &str,
    ) -> Option<OutboundMessage> {
        let concern = self.concerns.iter_mut().find(|c| c.id == concern_id)?;
        let comment = Comment {
            id: ids::new_id(),
            text: text.to_string(),
            author: author.to_string(),
            timestamp: time::now_iso8601(),
        };
        let outbound = OutboundMessage {
            concern_id: concern_id.to_string(),
            message: comment.text.clone(),
            sender: comment.author.clone(),
            id: comment.id.clone(),
            timestamp: comment.timestamp.clone(),
        };
        concern.comments.push(comment);
        Some(outbound)
    }

    /// Change the active subscription. Returns `None` when `id` is already
    /// selected (no membership churn); otherwise reports the room to leave
    /// and the room to join.
    pub fn select(&mut self, id: &str) -> Option<SelectionChange> {
        if self.selected.as_deref() == Some(id) {
            return None;
        }
        let previous = self.selected.replace(id.to_string());
        Some(SelectionChange {
            previous,
            current: id.to_string(),
        })
    }

    #[must_use]
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Read-only projection of one concern. Unknown identifiers yield an
    /// empty placeholder rather than an error.
    #[must_use]
    pub fn view(&self, id: &str) -> Concern {
        self.concerns
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn concerns(&self) -> &[Concern] {
        &self.concerns
    }
}

/// State-change notification for presentation layers.
#[derive(Debug, Clone)]
pub enum EngineUpdate {
    SnapshotApplied { concerns: usize },
    CommentAppended { concern_id: String, comment: Comment },
    SelectionChanged { concern_id: String },
}

enum EngineCommand {
    Snapshot(Vec<ConcernRecord>),
    Incoming(InboundMessage),
    Compose {
        concern_id: String,
        text: String,
        reply: oneshot::Sender<Option<Comment>>,
    },
    Select {
        concern_id: String,
        reply: oneshot::Sender<()>,
    },
    View {
        concern_id: String,
        reply: oneshot::Sender<Concern>,
    },
    List {
        reply: oneshot::Sender<Vec<Concern>>,
    },
    Selected {
        reply: oneshot::Sender<Option<String>>,
    },
    Shutdown,
}

/// Handle to a running sync session: snapshot loop, channel loop, and the
/// engine loop that owns the state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

struct SyncEngineInner {
    command_tx: mpsc::Sender<EngineCommand>,
    update_tx: broadcast::Sender<EngineUpdate>,
    refresh_tx: mpsc::Sender<String>,
    channel: ChannelClient,
}

impl SyncEngine {
    /// Start a session against the given snapshot source and relay
    /// transport. The first snapshot fetch happens immediately.
    #[must_use]
    pub fn start(
        config: SyncConfig,
        source: Arc<dyn SnapshotSource>,
        transport: Arc<dyn ChannelTransport>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (update_tx, _) = broadcast::channel(256);
        let (refresh_tx, refresh_rx) = mpsc::channel(8);
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundMessage>(256);
        let (snapshot_tx, mut snapshot_rx) = mpsc::channel::<Vec<ConcernRecord>>(8);

        let channel = ChannelClient::start(transport, ChannelConfig::from(&config), inbound_tx);
        spawn_snapshot_loop(source, config.snapshot_interval(), refresh_rx, snapshot_tx);

        // Both feeds funnel into the one mutation queue so state changes
        // apply strictly in arrival order.
        let forward_tx = command_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                if forward_tx
                    .send(EngineCommand::Incoming(message))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        let forward_tx = command_tx.clone();
        tokio::spawn(async move {
            while let Some(records) = snapshot_rx.recv().await {
                if forward_tx
                    .send(EngineCommand::Snapshot(records))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        spawn_engine_loop(
            config.user_id.clone(),
            command_rx,
            update_tx.clone(),
            channel.clone(),
        );

        Self {
            inner: Arc::new(SyncEngineInner {
                command_tx,
                update_tx,
                refresh_tx,
                channel,
            }),
        }
    }

    /// Select the active concern: leave the previous room (if any), join
    /// the new one. Resolves once the membership commands are queued.
    pub async fn select_concern(&self, concern_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Select {
            concern_id: concern_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Compose a comment as this session's user: optimistic local append
    /// plus the outbound emit. Returns the appended comment, or `None` when
    /// the concern is unknown.
    pub async fn compose(&self, concern_id: &str, text: &str) -> Result<Option<Comment>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Compose {
            concern_id: concern_id.to_string(),
            text: text.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Current projection of one concern (empty placeholder if unknown).
    pub async fn view(&self, concern_id: &str) -> Result<Concern> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::View {
            concern_id: concern_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// All concerns, newest first.
    pub async fn concerns(&self) -> Result<Vec<Concern>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::List { reply }).await?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Identifier of the currently selected concern, if any.
    pub async fn selected_concern(&self) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Selected { reply }).await?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Request an immediate snapshot fetch ahead of the next interval tick.
    pub async fn refresh_now(&self) -> Result<()> {
        self.inner
            .refresh_tx
            .send("manual".to_string())
            .await
            .map_err(|_| SyncError::EngineStopped)
    }

    #[must_use]
    pub fn subscribe_updates(&self) -> broadcast::Receiver<EngineUpdate> {
        self.inner.update_tx.subscribe()
    }

    #[must_use]
    pub fn channel_health(&self) -> ChannelHealth {
        self.inner.channel.health_snapshot()
    }

    #[must_use]
    pub fn channel_health_stream(&self) -> watch::Receiver<ChannelHealth> {
        self.inner.channel.health_stream()
    }

    /// Stop the engine and the channel loop. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.inner.command_tx.send(EngineCommand::Shutdown).await;
        self.inner.channel.shutdown().await;
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.inner
            .command_tx
            .send(command)
            .await
            .map_err(|_| SyncError::EngineStopped)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            let _ = self.inner.command_tx.try_send(EngineCommand::Shutdown);
        }
    }
}

fn spawn_engine_loop(
    user_id: String,
    mut command_rx: mpsc::Receiver<EngineCommand>,
    update_tx: broadcast::Sender<EngineUpdate>,
    channel: ChannelClient,
) {
    tokio::spawn(async move {
        let mut state = ConcernState::new();
        while let Some(command) = command_rx.recv().await {
            match command {
                EngineCommand::Snapshot(records) => {
                    let auto_selected = state.apply_snapshot(records);
                    let _ = update_tx.send(EngineUpdate::SnapshotApplied {
                        concerns: state.concerns().len(),
                    });
                    if let Some(concern_id) = auto_selected {
                        let _ = channel.join(&concern_id, &user_id).await;
                        let _ = update_tx.send(EngineUpdate::SelectionChanged { concern_id });
                    }
                }
                EngineCommand::Incoming(message) => {
                    let concern_id = message.concern_id.clone();
                    if let Some(comment) = state.apply_incoming(message) {
                        let _ = update_tx.send(EngineUpdate::CommentAppended {
                            concern_id,
                            comment,
                        });
                    }
                }
                EngineCommand::Compose {
                    concern_id,
                    text,
                    reply,
                } => match state.apply_optimistic(&concern_id, &text, &user_id) {
                    Some(outbound) => {
                        let comment = Comment {
                            id: outbound.id.clone(),
                            text: outbound.message.clone(),
                            author: outbound.sender.clone(),
                            timestamp: outbound.timestamp.clone(),
                        };
                        let _ = update_tx.send(EngineUpdate::CommentAppended {
                            concern_id: concern_id.clone(),
                            comment: comment.clone(),
                        });
                        if let Err(err) = channel.send(outbound).await {
                            debug!("outbound emit failed: {err}");
                        }
                        let _ = reply.send(Some(comment));
                    }
                    None => {
                        let _ = reply.send(None);
                    }
                },
                EngineCommand::Select { concern_id, reply } => {
                    if let Some(change) = state.select(&concern_id) {
                        if let Some(previous) = change.previous {
                            let _ = channel.leave(&previous, &user_id).await;
                        }
                        let _ = channel.join(&concern_id, &user_id).await;
                        let _ = update_tx.send(EngineUpdate::SelectionChanged { concern_id });
                    }
                    let _ = reply.send(());
                }
                EngineCommand::View { concern_id, reply } => {
                    let _ = reply.send(state.view(&concern_id));
                }
                EngineCommand::List { reply } => {
                    let _ = reply.send(state.concerns().to_vec());
                }
                EngineCommand::Selected { reply } => {
                    let _ = reply.send(state.selected().map(String::from));
                }
                EngineCommand::Shutdown => break,
            }
        }
        info!("sync engine stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(id: &str, title: &str) -> ConcernRecord {
        ConcernRecord {
            id: Some(id.to_string()),
            title: Some(title.to_string()),
            ..ConcernRecord::default()
        }
    }

    fn message(id: Option<&str>, concern_id: &str, text: &str, sender: &str) -> InboundMessage {
        InboundMessage {
            id: id.map(String::from),
            concern_id: concern_id.to_string(),
            message: text.to_string(),
            sender: sender.to_string(),
            timestamp: None,
        }
    }

    #[test]
    fn snapshot_replaces_and_presents_newest_first() {
        let mut state = ConcernState::new();
        state.apply_snapshot(vec![record("old", "Old"), record("new", "New")]);
        let ids: Vec<&str> = state.concerns().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn snapshot_replace_is_idempotent_for_unchanged_input() {
        let mut state = ConcernState::new();
        let records = vec![record("a", "A")];
        state.apply_snapshot(records.clone());
        let first = state.concerns().to_vec();
        state.apply_snapshot(records);
        assert_eq!(state.concerns(), first.as_slice());
    }

    #[test]
    fn first_snapshot_auto_selects_the_newest_concern() {
        let mut state = ConcernState::new();
        let auto = state.apply_snapshot(vec![record("old", "Old"), record("new", "New")]);
        assert_eq!(auto.as_deref(), Some("new"));
        assert_eq!(state.selected(), Some("new"));

        // Later snapshots never steal an existing selection.
        let auto = state.apply_snapshot(vec![record("newer", "Newer"), record("new", "New")]);
        assert_eq!(auto, None);
        assert_eq!(state.selected(), Some("new"));
    }

    #[test]
    fn idempotent_delivery_same_id_applies_once() {
        let mut state = ConcernState::new();
        state.apply_snapshot(vec![record("c", "C")]);
        assert!(state
            .apply_incoming(message(Some("m-1"), "c", "hi", "s"))
            .is_some());
        assert!(state
            .apply_incoming(message(Some("m-1"), "c", "hi", "s"))
            .is_none());
        assert_eq!(state.view("c").comment_count(), 1);
    }

    #[test]
    fn optimistic_round_trip_echo_is_a_duplicate() {
        let mut state = ConcernState::new();
        state.apply_snapshot(vec![record("c", "C")]);
        let outbound = state
            .apply_optimistic("c", "hi", "company")
            .expect("known concern");
        assert_eq!(state.view("c").comment_count(), 1);

        let echo = InboundMessage::from(outbound);
        assert!(state.apply_incoming(echo).is_none());
        assert_eq!(state.view("c").comment_count(), 1);
    }

    #[test]
    fn unknown_target_is_ignored_without_side_effects() {
        let mut state = ConcernState::new();
        state.apply_snapshot(vec![record("c", "C")]);
        let before = state.concerns().to_vec();
        assert!(state
            .apply_incoming(message(None, "missing", "m", "s"))
            .is_none());
        assert_eq!(state.concerns(), before.as_slice());
    }

    #[test]
    fn optimistic_insert_into_unknown_concern_is_rejected() {
        let mut state = ConcernState::new();
        assert!(state.apply_optimistic("missing", "hi", "company").is_none());
    }

    #[test]
    fn comments_keep_arrival_order_despite_timestamps() {
        let mut state = ConcernState::new();
        state.apply_snapshot(vec![record("c", "C")]);
        let mut late = message(Some("m-1"), "c", "first", "s");
        late.timestamp = Some("2030-01-01T00:00:00Z".to_string());
        let mut early = message(Some("m-2"), "c", "second", "s");
        early.timestamp = Some("2020-01-01T00:00:00Z".to_string());

        state.apply_incoming(late);
        state.apply_incoming(early);
        let view = state.view("c");
        assert_eq!(view.comments[0].id, "m-1");
        assert_eq!(view.comments[1].id, "m-2");

        // Position of m-1 is unchanged by the later append.
        state.apply_incoming(message(Some("m-3"), "c", "third", "s"));
        assert_eq!(state.view("c").comments[0].id, "m-1");
    }

    #[test]
    fn incoming_without_id_gets_one_generated() {
        let mut state = ConcernState::new();
        state.apply_snapshot(vec![record("c", "C")]);
        let comment = state
            .apply_incoming(message(None, "c", "hi", "s"))
            .expect("appended");
        assert!(!comment.id.is_empty());
        assert!(!comment.timestamp.is_empty());
    }

    #[test]
    fn select_reports_one_leave_and_one_join() {
        let mut state = ConcernState::new();
        let change = state.select("A").expect("first selection");
        assert_eq!(change.previous, None);
        assert_eq!(change.current, "A");

        let change = state.select("B").expect("switch");
        assert_eq!(change.previous.as_deref(), Some("A"));
        assert_eq!(change.current, "B");
        assert_eq!(state.selected(), Some("B"));

        // Re-selecting the active concern produces no membership churn.
        assert!(state.select("B").is_none());
    }

    #[test]
    fn view_of_unknown_concern_is_an_empty_placeholder() {
        let state = ConcernState::new();
        let view = state.view("missing");
        assert_eq!(view.id, "");
        assert!(view.comments.is_empty());
    }

    #[test]
    fn snapshot_replace_drops_unechoed_optimistic_comments() {
        let mut state = ConcernState::new();
        state.apply_snapshot(vec![record("c", "C")]);
        state.apply_optimistic("c", "pending", "company");
        assert_eq!(state.view("c").comment_count(), 1);

        // The store has not seen the comment yet: replace drops it.
        state.apply_snapshot(vec![record("c", "C")]);
        assert_eq!(state.view("c").comment_count(), 0);
    }

    #[test]
    fn end_to_end_merge_scenario() {
        let mut state = ConcernState::new();
        state.apply_snapshot(vec![ConcernRecord {
            id: Some("1".to_string()),
            title: Some("Leak".to_string()),
            ..ConcernRecord::default()
        }]);
        state.select("1");

        let outbound = state
            .apply_optimistic("1", "We have a leak", "submitter")
            .expect("known concern");
        assert_eq!(state.view("1").comment_count(), 1);

        // Reconnect replays the echo; the shared identifier dedups it.
        assert!(state.apply_incoming(InboundMessage::from(outbound)).is_none());
        assert_eq!(state.view("1").comment_count(), 1);

        state
            .apply_optimistic("1", "Sending a plumber", "company")
            .expect("known concern");
        let view = state.view("1");
        assert_eq!(view.comment_count(), 2);
        assert_eq!(view.comments[0].author, "submitter");
        assert_eq!(view.comments[1].author, "company");
    }
}
