//! Wire types for the concern-sync live channel and snapshot API.
//!
//! The live channel speaks newline-delimited JSON: one event object per
//! line, tagged by `event`. Payload field names follow the relay's
//! camelCase convention (`concernId`, `userId`), so these types are the
//! single place where naming is translated.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sender/author label used by the organization party. Any other label
/// denotes a submitter.
pub const COMPANY_SENDER: &str = "company";

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Room membership payload shared by `join_room` and `leave_room`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomMembership {
    pub concern_id: String,
    pub user_id: String,
}

/// Outbound `send_message` payload. The `id` and `timestamp` are assigned
/// by the sending client before emission, so the relay echo carries the
/// same identifier and can be recognized as a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub concern_id: String,
    pub message: String,
    pub sender: String,
    pub id: String,
    pub timestamp: String,
}

/// Inbound `receive_message` payload. `id` and `timestamp` are optional on
/// the wire; receivers fill in what is missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundMessage {
    pub id: Option<String>,
    pub concern_id: String,
    pub message: String,
    pub sender: String,
    pub timestamp: Option<String>,
}

impl From<OutboundMessage> for InboundMessage {
    fn from(outbound: OutboundMessage) -> Self {
        Self {
            id: Some(outbound.id),
            concern_id: outbound.concern_id,
            message: outbound.message,
            sender: outbound.sender,
            timestamp: Some(outbound.timestamp),
        }
    }
}

/// One live-channel event. Exactly four kinds exist; the first three are
/// emitted by clients, the last is delivered to them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChannelEvent {
    JoinRoom(RoomMembership),
    LeaveRoom(RoomMembership),
    SendMessage(OutboundMessage),
    ReceiveMessage(InboundMessage),
}

impl ChannelEvent {
    /// Event-kind name as it appears on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "join_room",
            Self::LeaveRoom(_) => "leave_room",
            Self::SendMessage(_) => "send_message",
            Self::ReceiveMessage(_) => "receive_message",
        }
    }
}

/// Encode an event as one newline-terminated JSON frame.
pub fn encode_frame(event: &ChannelEvent) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = serde_json::to_vec(event).map_err(ProtocolError::Encode)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decode one frame (without its trailing newline) into an event. Unknown
/// fields are tolerated for forward compatibility.
pub fn decode_frame(line: &[u8]) -> Result<ChannelEvent, ProtocolError> {
    serde_json::from_slice(line).map_err(ProtocolError::Decode)
}

/// One concern as returned by the snapshot API. Everything except the
/// comment list is optional on the wire; `comments` tolerates any malformed
/// shape by collapsing to an empty list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConcernRecord {
    pub id: Option<String>,
    pub title: Option<String>,
    pub organization: Option<String>,
    pub status: Option<String>,
    pub date: Option<String>,
    #[serde(deserialize_with = "lenient_comments")]
    pub comments: Vec<CommentRecord>,
}

/// One comment inside a snapshot concern record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommentRecord {
    pub id: Option<String>,
    pub text: String,
    pub author: String,
    pub timestamp: Option<String>,
}

fn lenient_comments<'de, D>(deserializer: D) -> Result<Vec<CommentRecord>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect()),
        _ => Ok(Vec::new()),
    }
}
