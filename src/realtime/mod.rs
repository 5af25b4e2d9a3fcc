//! Persistent publish/subscribe client.
//!
//! A [`ConnectionManager`] keeps one connection to a realtime server alive and
//! multiplexes topic [`Subscription`]s over it. Table changes (`db_change`) and chat
//! messages (`chat_message`) are routed by topic to the matching subscription, which
//! hands them to the handlers registered for the event's kind and to the wildcard
//! handlers.
//!
//! # Example
//!
//! ```no_run
//! use realtime_link::realtime::{ClientOptions, ConnectionManager, EventKind};
//! use realtime_link::ws::config::{Config, ReconnectConfig};
//! use std::time::Duration;
//! use url::Url;
//!
//! # async fn run() -> realtime_link::Result<()> {
//! let options = ClientOptions::builder()
//!     .base_url(Url::parse("https://realtime.example.com/ws")?)
//!     .project_id("proj1")
//!     .build();
//! let config = Config::default()
//!     .with_reconnect(ReconnectConfig::default().with_max_attempts(10));
//! let manager = ConnectionManager::new(options, config)?;
//!
//! manager.on_retries_exhausted(|exhausted| {
//!     eprintln!("giving up after {} attempts", exhausted.attempts);
//! });
//!
//! let lobby = manager.chat_channel("lobby");
//! lobby.on(EventKind::Message, |event| println!("{}", event.data));
//! lobby.subscribe()?;
//!
//! manager.connect().await?;
//! manager.send_chat("lobby", "hello")?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod options;
pub mod subscription;
pub mod topic;
pub mod types;

pub use connection::{ConnectionManager, ConnectionState, Diagnostics, RetriesExhausted};
pub use options::ClientOptions;
pub use subscription::{ChannelOptions, Handler, HandlerId, Subscription};
pub use types::request::ClientMessage;
pub use types::response::{ChangeEvent, EventKind, ServerMessage, Timestamp};
