//! # Concern Client
//!
//! Synchronization core for concern threads: keeps one client's view of
//! every concern's comment list consistent across three independent,
//! asynchronously-arriving sources.
//!
//! ## Pipeline
//!
//! ```text
//! Snapshot API (HTTP, every 5s) ──┐
//!                                 ├──> Reconciliation Engine ──> views,
//! Live channel (push)  ───────────┤        (single owner)        updates
//!                                 │
//! Local compose (optimistic) ─────┘──> outbound emit (shared id)
//! ```
//!
//! The snapshot path replaces the whole map; the live path appends with
//! identifier-based dedup; optimistic writes append immediately and emit
//! the same identifier outbound so the relay echo deduplicates. The engine
//! is the only component that mutates canonical state.
//!
//! ## Example
//!
//! ```no_run
//! use concern_client::{HttpSnapshotSource, SyncConfig, SyncEngine, TcpTransport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::default();
//!     let source = Arc::new(HttpSnapshotSource::new(&config.api_url));
//!     let transport = Arc::new(TcpTransport::new(
//!         config.channel_addr.clone(),
//!         config.max_frame_bytes,
//!     ));
//!     let engine = SyncEngine::start(config, source, transport);
//!
//!     engine.select_concern("concern-1").await?;
//!     engine.compose("concern-1", "We have a leak").await?;
//!     Ok(())
//! }
//! ```

mod channel;
mod config;
mod engine;
mod error;
pub mod ids;
mod model;
mod snapshot;
pub mod time;

pub use channel::{
    framed_pair, ChannelClient, ChannelConfig, ChannelHealth, ChannelSink, ChannelStream,
    ChannelTransport, TcpTransport,
};
pub use config::SyncConfig;
pub use engine::{ConcernState, EngineUpdate, SelectionChange, SyncEngine};
pub use error::{Result, SyncError};
pub use model::{normalize_concern, Comment, Concern, StatusKind};
pub use snapshot::{HttpSnapshotSource, SnapshotSource};
