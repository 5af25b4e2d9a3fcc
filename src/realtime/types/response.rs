use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of change carried by an inbound event, also used as the handler key.
#[non_exhaustive]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
pub enum EventKind {
    /// A row was inserted
    #[serde(rename = "insert", alias = "INSERT")]
    #[strum(serialize = "insert")]
    Insert,
    /// A row was updated
    #[serde(rename = "update", alias = "UPDATE")]
    #[strum(serialize = "update")]
    Update,
    /// A row was deleted
    #[serde(rename = "delete", alias = "DELETE")]
    #[strum(serialize = "delete")]
    Delete,
    /// A chat room message
    #[serde(rename = "message")]
    #[strum(serialize = "message")]
    Message,
    /// Wildcard: handlers registered under this kind receive every event
    #[serde(rename = "*")]
    #[strum(serialize = "*")]
    All,
}

/// Event timestamp as sent by the server: either Unix milliseconds or RFC 3339.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    DateTime(DateTime<Utc>),
}

impl Timestamp {
    /// Convert to a UTC date-time, if representable.
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        match self {
            Self::Millis(millis) => DateTime::from_timestamp_millis(millis),
            Self::DateTime(datetime) => Some(datetime),
        }
    }
}

/// A change delivered to subscription handlers.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChangeEvent {
    /// Fully-qualified topic the event belongs to
    pub topic: String,
    /// What happened. Always set for events handed to handlers.
    #[serde(default)]
    pub operation: Option<EventKind>,
    /// New row contents, or the chat payload
    #[serde(default)]
    pub data: Value,
    /// Previous row contents for updates and deletes
    #[serde(default)]
    pub old: Option<Value>,
    /// When the change happened on the server
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

impl ChangeEvent {
    /// Kind used to select handlers. Chat messages are always [`EventKind::Message`].
    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        self.operation
    }
}

/// Frames sent from the server to the client.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Liveness acknowledgment for a `ping`
    Pong,
    /// Table change on a subscribed topic
    DbChange(ChangeEvent),
    /// Chat message on a subscribed room topic
    ChatMessage(ChangeEvent),
    /// Any other frame type; ignored
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// The event to route to subscriptions, if this frame carries one.
    #[must_use]
    pub fn into_event(self) -> Option<ChangeEvent> {
        match self {
            Self::DbChange(event) => Some(event),
            Self::ChatMessage(mut event) => {
                event.operation = Some(EventKind::Message);
                Some(event)
            }
            Self::Pong | Self::Unknown => None,
        }
    }
}

/// Deserialize frames from the byte slice.
///
/// Handles both single objects and arrays of frames.
/// Returns an empty vector for empty or whitespace-only input.
pub fn parse_messages(bytes: &[u8]) -> crate::Result<Vec<ServerMessage>> {
    let trimmed = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(&[][..], |start| &bytes[start..]);

    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.first() == Some(&b'[') {
        decode(trimmed)
    } else {
        let msg: ServerMessage = decode(trimmed)?;
        Ok(vec![msg])
    }
}

#[cfg(feature = "tracing")]
fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> crate::Result<T> {
    let deserializer = &mut serde_json::Deserializer::from_slice(bytes);
    serde_path_to_error::deserialize(deserializer).map_err(|e| {
        tracing::debug!(
            type_name = %std::any::type_name::<T>(),
            path = %e.path(),
            error = %e.inner(),
            "deserialization failed"
        );
        e.into_inner().into()
    })
}

#[cfg(not(feature = "tracing"))]
fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> crate::Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}
