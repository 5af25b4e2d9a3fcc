use secrecy::{ExposeSecret as _, SecretString};
use serde::{Serialize, Serializer};
use serde_json::Value;

/// Control and payload frames sent from the client to the server.
///
/// # Security
///
/// [`ClientMessage::Auth`] exposes its token in plaintext when serialized. Its `Debug`
/// output stays redacted.
#[non_exhaustive]
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving events for a topic
    Subscribe {
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<Value>,
    },
    /// Stop receiving events for a topic
    Unsubscribe { topic: String },
    /// Present a bearer token on an open connection
    Auth {
        #[serde(serialize_with = "expose_secret")]
        token: SecretString,
    },
    /// Liveness probe, answered with `pong`
    Ping,
    /// Post a message to a chat room
    Chat {
        #[serde(rename = "roomId")]
        room_id: String,
        text: String,
    },
}

impl ClientMessage {
    /// Create a subscribe frame.
    #[must_use]
    pub fn subscribe(topic: String, filter: Option<Value>) -> Self {
        Self::Subscribe { topic, filter }
    }

    /// Create an unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(topic: String) -> Self {
        Self::Unsubscribe { topic }
    }

    /// Create an auth frame.
    #[must_use]
    pub fn auth(token: SecretString) -> Self {
        Self::Auth { token }
    }

    /// Create a chat frame.
    #[must_use]
    pub fn chat(room_id: String, text: String) -> Self {
        Self::Chat { room_id, text }
    }

    /// Topic targeted by a subscribe or unsubscribe frame.
    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::Subscribe { topic, .. } | Self::Unsubscribe { topic } => Some(topic),
            Self::Auth { .. } | Self::Ping | Self::Chat { .. } => None,
        }
    }
}

// SECURITY: the token is intentionally revealed here for the auth frame only.
fn expose_secret<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// Entry of the outbound path: either a typed frame or an opaque JSON payload relayed
/// unchanged.
#[derive(Clone, Debug)]
pub(crate) enum Outbound {
    Message(ClientMessage),
    /// Subscribe frame issued by [`Subscription::subscribe`]. At most one goes out per
    /// topic and connection, counting the subscribe pass that follows each connect.
    ///
    /// [`Subscription::subscribe`]: crate::realtime::Subscription::subscribe
    Channel(ClientMessage),
    Json(Value),
}

impl Outbound {
    pub(crate) fn encode(&self) -> serde_json::Result<String> {
        match self {
            Self::Message(message) | Self::Channel(message) => serde_json::to_string(message),
            Self::Json(value) => serde_json::to_string(value),
        }
    }

    pub(crate) fn as_message(&self) -> Option<&ClientMessage> {
        match self {
            Self::Message(message) | Self::Channel(message) => Some(message),
            Self::Json(_) => None,
        }
    }
}

impl From<ClientMessage> for Outbound {
    fn from(message: ClientMessage) -> Self {
        Self::Message(message)
    }
}
