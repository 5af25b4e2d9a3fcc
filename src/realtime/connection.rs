#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Interval, MissedTickBehavior, Sleep};
use url::Url;

use super::options::ClientOptions;
use super::subscription::{ChannelOptions, Subscription};
use super::types::request::{ClientMessage, Outbound};
use super::types::response::{ChangeEvent, ServerMessage, parse_messages};
use crate::Result;
use crate::ws::config::Config;
use crate::ws::error::WsError;
use crate::ws::listeners::{ListenerHandle, Listeners};
#[cfg(feature = "ws")]
use crate::ws::transport::WebSocketTransport;
use crate::ws::transport::{Transport, TransportEvent, TransportHandle};

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected
    Idle,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting to retry after the connection was lost
    Reconnecting {
        /// Current reconnection attempt number, starting at 1
        attempt: u32,
    },
    /// Stopped by request or after giving up; no automatic activity
    Disconnected,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Sent to `on_retries_exhausted` listeners when the reconnect policy gives up.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetriesExhausted {
    /// Retries scheduled before giving up
    pub attempts: u32,
}

/// Snapshot of the connection task's internal bookkeeping.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostics {
    /// State as seen by the connection task
    pub state: ConnectionState,
    /// Retries scheduled since the last successful connect
    pub reconnect_attempts: u32,
    /// Frames waiting for the next successful connect
    pub queued_frames: usize,
    /// A reconnect timer is armed
    pub reconnect_pending: bool,
    /// The heartbeat timer is running
    pub heartbeat_active: bool,
    /// A connection attempt is awaiting the transport
    pub connect_in_flight: bool,
}

#[derive(Debug)]
pub(crate) enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    Send(Outbound),
    Diagnostics(oneshot::Sender<Diagnostics>),
}

/// Weak route into the connection task, held by subscriptions so they do not keep the
/// task alive on their own.
#[derive(Clone, Debug)]
pub(crate) struct Outbox(mpsc::WeakUnboundedSender<Command>);

impl Outbox {
    pub(crate) fn new(commands: &mpsc::UnboundedSender<Command>) -> Self {
        Self(commands.downgrade())
    }

    pub(crate) fn send(&self, outbound: Outbound) -> Result<()> {
        let commands = self.0.upgrade().ok_or(WsError::ManagerStopped)?;
        commands
            .send(Command::Send(outbound))
            .map_err(|_e| WsError::ManagerStopped)?;
        Ok(())
    }
}

struct Shared {
    options: ClientOptions,
    channels: DashMap<String, Subscription>,
    state_rx: watch::Receiver<ConnectionState>,
    status: Arc<Listeners<ConnectionState>>,
    exhausted: Arc<Listeners<RetriesExhausted>>,
}

/// Persistent connection to a realtime server.
///
/// Owns one logical connection and multiplexes any number of [`Subscription`]s over it.
/// Lost connections are re-established with exponential backoff; frames sent while
/// disconnected are queued and flushed in order on the next connect, followed by one
/// subscribe frame per active subscription.
///
/// All connection state lives in a background task. Handles are cheap to clone; the
/// task stops and closes the socket once every handle is dropped.
///
/// # Example
///
/// ```no_run
/// use realtime_link::realtime::{ClientOptions, ConnectionManager, EventKind};
/// use realtime_link::ws::config::Config;
/// use url::Url;
///
/// # async fn run() -> realtime_link::Result<()> {
/// let options = ClientOptions::builder()
///     .base_url(Url::parse("wss://realtime.example.com/ws")?)
///     .project_id("proj1")
///     .build();
/// let manager = ConnectionManager::new(options, Config::default())?;
///
/// let orders = manager.channel("orders");
/// orders.on(EventKind::Insert, |event| println!("new order: {}", event.data));
/// orders.subscribe()?;
///
/// manager.connect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionManager {
    /// Create a manager that connects over WebSockets.
    ///
    /// No connection is opened until [`ConnectionManager::connect`] is called.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[cfg(feature = "ws")]
    pub fn new(options: ClientOptions, config: Config) -> Result<Self> {
        Self::with_transport(options, config, WebSocketTransport)
    }

    /// Create a manager that opens connections through `transport`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn with_transport<T: Transport>(
        options: ClientOptions,
        config: Config,
        transport: T,
    ) -> Result<Self> {
        config.validate()?;
        options.validate()?;
        let url = options.handshake_url()?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let shared = Arc::new(Shared {
            options,
            channels: DashMap::new(),
            state_rx,
            status: Arc::default(),
            exhausted: Arc::default(),
        });

        let driver = Driver {
            shared: Arc::clone(&shared),
            config,
            transport: Arc::new(transport),
            url,
            commands: commands_rx,
            state_tx,
            socket: None,
            opening: None,
            waiters: Vec::new(),
            reconnect: None,
            heartbeat: None,
            attempts: 0,
            queue: VecDeque::new(),
            last_ack: time::Instant::now(),
            announced: HashSet::new(),
        };
        tokio::spawn(driver.run());

        Ok(Self { shared, commands })
    }

    /// Open the connection.
    ///
    /// Returns immediately when already connected. Concurrent calls share the attempt in
    /// flight, so at most one connection is ever opened at a time.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be opened within the configured
    /// connect timeout, or if [`ConnectionManager::disconnect`] is called first.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Connect(tx))?;
        rx.await.map_err(|_e| WsError::ManagerStopped)?
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Frames still queued are discarded and no timer fires afterwards. Subscriptions
    /// keep their state and are re-sent on the next [`ConnectionManager::connect`].
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::Disconnect(tx)).is_ok() {
            _ = rx.await;
        }
    }

    /// Send a frame, or queue it until the next successful connect.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.command(Command::Send(message.into()))
    }

    /// Relay an arbitrary JSON frame on the same path as [`ConnectionManager::send`].
    pub fn send_json(&self, frame: Value) -> Result<()> {
        self.command(Command::Send(Outbound::Json(frame)))
    }

    /// Present a bearer token on the connection.
    pub fn authenticate(&self, token: SecretString) -> Result<()> {
        self.send(ClientMessage::auth(token))
    }

    /// Post `text` to a chat room.
    pub fn send_chat(&self, room_id: &str, text: &str) -> Result<()> {
        self.send(ClientMessage::chat(room_id.to_owned(), text.to_owned()))
    }

    /// Subscription for a table, created on first use.
    ///
    /// Calling this again with the same name returns the same subscription.
    #[must_use]
    pub fn channel(&self, name: &str) -> Subscription {
        self.channel_with(name, ChannelOptions::default())
    }

    /// Like [`ConnectionManager::channel`], applying `options` when the subscription is
    /// created. An existing subscription is returned unchanged.
    #[must_use]
    pub fn channel_with(&self, name: &str, options: ChannelOptions) -> Subscription {
        self.subscription_for(self.shared.options.table_topic(name), options)
    }

    /// Subscription for a chat room, created on first use.
    #[must_use]
    pub fn chat_channel(&self, room_id: &str) -> Subscription {
        self.subscription_for(self.shared.options.chat_topic(room_id), ChannelOptions::default())
    }

    /// Every subscription created so far.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_rx.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_rx.clone()
    }

    /// Call `callback` on every state change.
    pub fn on_status_change<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.shared.status.register(callback)
    }

    /// Call `callback` when the reconnect policy gives up.
    pub fn on_retries_exhausted<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&RetriesExhausted) + Send + Sync + 'static,
    {
        self.shared.exhausted.register(callback)
    }

    /// Snapshot of the connection task's bookkeeping.
    pub async fn diagnostics(&self) -> Result<Diagnostics> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Diagnostics(tx))?;
        Ok(rx.await.map_err(|_e| WsError::ManagerStopped)?)
    }

    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.shared.options
    }

    fn subscription_for(&self, topic: String, options: ChannelOptions) -> Subscription {
        self.shared
            .channels
            .entry(topic.clone())
            .or_insert_with(|| Subscription::new(topic, options, Outbox::new(&self.commands)))
            .clone()
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_e| WsError::ManagerStopped)?;
        Ok(())
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("project_id", &self.shared.options.project_id)
            .field("state", &self.state())
            .field("channels", &self.shared.channels.len())
            .finish_non_exhaustive()
    }
}

struct Opening {
    future: BoxFuture<'static, Result<TransportHandle>>,
    /// Started by the reconnect policy rather than by `connect()`
    retry: bool,
}

/// Background task owning every piece of mutable connection state.
struct Driver {
    shared: Arc<Shared>,
    config: Config,
    transport: Arc<dyn Transport>,
    url: Url,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    socket: Option<TransportHandle>,
    opening: Option<Opening>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    reconnect: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
    attempts: u32,
    queue: VecDeque<Outbound>,
    last_ack: time::Instant,
    /// Topics with a subscribe frame already sent on the current socket
    announced: HashSet<String>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                (result, retry) = opened(&mut self.opening) => {
                    self.opening = None;
                    match result {
                        Ok(socket) => self.on_connected(socket),
                        Err(e) => self.on_connect_failed(e, retry),
                    }
                }
                () = expired(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.start_attempt(true);
                }
                () = tick(&mut self.heartbeat) => self.on_heartbeat(),
                event = next_event(&mut self.socket) => self.on_event(event),
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("All connection handles dropped, stopping connection task");
        self.disconnect();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => self.connect(reply),
            Command::Disconnect(reply) => {
                self.disconnect();
                _ = reply.send(());
            }
            Command::Send(outbound) => self.send(outbound),
            Command::Diagnostics(reply) => {
                _ = reply.send(self.diagnostics());
            }
        }
    }

    fn connect(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.socket.is_some() {
            _ = reply.send(Ok(()));
            return;
        }

        self.waiters.push(reply);
        if self.opening.is_some() {
            return;
        }

        // Skipping a pending retry keeps the reconnect policy in charge if this attempt fails.
        let retry = self.reconnect.take().is_some();
        self.start_attempt(retry);
    }

    fn start_attempt(&mut self, retry: bool) {
        self.set_state(ConnectionState::Connecting);

        #[cfg(feature = "tracing")]
        tracing::debug!(url = %redacted(&self.url), retry, "Opening connection");

        let transport = Arc::clone(&self.transport);
        let url = self.url.clone();
        let connect_timeout = self.config.connect_timeout;
        let future = async move {
            match time::timeout(connect_timeout, transport.open(&url)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(WsError::Timeout(connect_timeout).into()),
            }
        }
        .boxed();

        self.opening = Some(Opening { future, retry });
    }

    fn on_connected(&mut self, socket: TransportHandle) {
        self.socket = Some(socket);
        self.attempts = 0;
        self.last_ack = time::Instant::now();
        self.announced.clear();
        self.set_state(ConnectionState::Connected {
            since: Instant::now(),
        });

        #[cfg(feature = "tracing")]
        tracing::info!(queued = self.queue.len(), "Connected");

        self.start_heartbeat();
        if self.flush_queue() {
            self.resubscribe();
        }

        for waiter in self.waiters.drain(..) {
            _ = waiter.send(Ok(()));
        }
    }

    fn on_connect_failed(&mut self, error: crate::error::Error, retry: bool) {
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %error, retry, "Unable to connect");

        if retry {
            self.schedule_reconnect();
        } else {
            self.set_state(ConnectionState::Disconnected);
        }

        let message = error.to_string();
        let mut waiters = self.waiters.drain(..);
        if let Some(first) = waiters.next() {
            _ = first.send(Err(error));
        }
        for waiter in waiters {
            _ = waiter.send(Err(WsError::ConnectFailed(message.clone()).into()));
        }
    }

    /// Lost connection: tear down and hand over to the reconnect policy.
    fn on_closed(&mut self) {
        self.stop_heartbeat();
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        self.announced.clear();
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect = None;

        let policy = &self.config.reconnect;
        if let Some(max) = policy.max_attempts
            && self.attempts >= max
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(attempts = self.attempts, "Reconnect attempts exhausted");

            self.set_state(ConnectionState::Disconnected);
            self.shared.exhausted.notify(&RetriesExhausted {
                attempts: self.attempts,
            });
            return;
        }

        let delay = policy.delay_for(self.attempts);
        self.attempts = self.attempts.saturating_add(1);

        #[cfg(feature = "tracing")]
        tracing::info!(attempt = self.attempts, ?delay, "Scheduling reconnect");

        self.reconnect = Some(Box::pin(time::sleep(delay)));
        self.set_state(ConnectionState::Reconnecting {
            attempt: self.attempts,
        });
    }

    fn disconnect(&mut self) {
        self.reconnect = None;
        self.stop_heartbeat();
        self.opening = None;
        for waiter in self.waiters.drain(..) {
            _ = waiter.send(Err(WsError::Disconnected.into()));
        }
        if let Some(socket) = self.socket.take() {
            socket.close();
        }

        #[cfg(feature = "tracing")]
        if !self.queue.is_empty() {
            tracing::debug!(dropped = self.queue.len(), "Discarding queued frames");
        }
        self.queue.clear();
        self.announced.clear();

        self.set_state(ConnectionState::Disconnected);
    }

    fn start_heartbeat(&mut self) {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = time::interval_at(time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);
    }

    fn stop_heartbeat(&mut self) {
        self.heartbeat = None;
    }

    fn on_heartbeat(&mut self) {
        let silence = self.last_ack.elapsed();
        if silence > self.config.heartbeat_timeout {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                ?silence,
                "Heartbeat timeout: no pong received within {:?}",
                self.config.heartbeat_timeout
            );
            self.on_closed();
            return;
        }

        // Pings are never queued.
        if !self.transmit(&ClientMessage::Ping.into()) {
            self.on_closed();
        }
    }

    fn on_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => self.on_frame(&text),
            TransportEvent::Error(message) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%message, "Connection error");
                #[cfg(not(feature = "tracing"))]
                let _ = &message;
            }
            TransportEvent::Closed => {
                #[cfg(feature = "tracing")]
                tracing::info!("Connection closed");
                self.on_closed();
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        #[cfg(feature = "tracing")]
        tracing::trace!(%text, "Received frame");

        let messages = match parse_messages(text.as_bytes()) {
            Ok(messages) => messages,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %e, "Failed to parse frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return;
            }
        };

        for message in messages {
            if matches!(message, ServerMessage::Pong) {
                self.last_ack = time::Instant::now();
                continue;
            }
            if let Some(event) = message.into_event() {
                self.route(&event);
            }
        }
    }

    fn route(&self, event: &ChangeEvent) {
        let Some(kind) = event.kind() else {
            #[cfg(feature = "tracing")]
            tracing::warn!(topic = %event.topic, "Dropping event without operation");
            return;
        };

        // Clone out of the map so handlers may look up or create channels.
        let subscription = self
            .shared
            .channels
            .get(&event.topic)
            .map(|entry| entry.value().clone());
        let Some(subscription) = subscription else {
            #[cfg(feature = "tracing")]
            tracing::trace!(topic = %event.topic, "No subscription for topic");
            return;
        };

        subscription.dispatch(kind, event);
    }

    fn send(&mut self, outbound: Outbound) {
        if self.socket.is_none() {
            self.queue.push_back(outbound);
            return;
        }

        if let Outbound::Channel(ClientMessage::Subscribe { topic, .. }) = &outbound
            && self.announced.contains(topic)
        {
            return;
        }

        if !self.transmit(&outbound) {
            self.queue.push_back(outbound);
            self.on_closed();
        }
    }

    /// Write queued frames in order. Returns `false` if the connection dropped.
    fn flush_queue(&mut self) -> bool {
        while let Some(outbound) = self.queue.pop_front() {
            // Re-sent by `resubscribe` right after the flush.
            if self.is_resubscribed(&outbound) {
                continue;
            }
            if !self.transmit(&outbound) {
                self.queue.push_front(outbound);
                self.on_closed();
                return false;
            }
        }
        true
    }

    /// Whether `resubscribe` will send the same frame for this queued entry.
    fn is_resubscribed(&self, outbound: &Outbound) -> bool {
        let (channel, topic, filter) = match outbound {
            Outbound::Channel(ClientMessage::Subscribe { topic, filter }) => (true, topic, filter),
            Outbound::Message(ClientMessage::Subscribe { topic, filter }) => (false, topic, filter),
            _ => return false,
        };

        self.shared.channels.get(topic).is_some_and(|subscription| {
            subscription.is_subscribed() && (channel || subscription.filter() == *filter)
        })
    }

    fn resubscribe(&mut self) {
        let subscribed: Vec<Subscription> = self
            .shared
            .channels
            .iter()
            .filter(|entry| entry.value().is_subscribed())
            .map(|entry| entry.value().clone())
            .collect();

        for subscription in subscribed {
            let message =
                ClientMessage::subscribe(subscription.topic().to_owned(), subscription.filter());
            if !self.transmit(&message.into()) {
                self.on_closed();
                return;
            }
        }
    }

    /// Encode and write one frame. Returns `false` when the connection refused it.
    fn transmit(&mut self, outbound: &Outbound) -> bool {
        let Some(socket) = &self.socket else {
            return false;
        };

        let text = match outbound.encode() {
            Ok(text) => text,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Dropping frame that failed to encode");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return true;
            }
        };

        if let Err(e) = socket.send_frame(text) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Unable to write frame");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            return false;
        }

        match outbound.as_message() {
            Some(ClientMessage::Subscribe { topic, .. }) => {
                self.announced.insert(topic.clone());
            }
            Some(ClientMessage::Unsubscribe { topic }) => {
                self.announced.remove(topic);
            }
            _ => {}
        }
        true
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            #[cfg(feature = "tracing")]
            tracing::debug!(?state, "Connection state changed");
            self.shared.status.notify(&state);
        }
    }

    fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            state: *self.state_tx.borrow(),
            reconnect_attempts: self.attempts,
            queued_frames: self.queue.len(),
            reconnect_pending: self.reconnect.is_some(),
            heartbeat_active: self.heartbeat.is_some(),
            connect_in_flight: self.opening.is_some(),
        }
    }
}

async fn opened(opening: &mut Option<Opening>) -> (Result<TransportHandle>, bool) {
    match opening {
        Some(opening) => ((&mut opening.future).await, opening.retry),
        None => pending().await,
    }
}

async fn expired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => pending().await,
    }
}

async fn next_event(socket: &mut Option<TransportHandle>) -> TransportEvent {
    match socket {
        Some(socket) => socket.next_event().await,
        None => pending().await,
    }
}

/// Handshake URL with credential parameters masked, for logging.
#[cfg(feature = "tracing")]
fn redacted(url: &Url) -> Url {
    let mut masked = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            let value = if key == "apiKey" || key == "token" {
                "***".to_owned()
            } else {
                value.into_owned()
            };
            (key.into_owned(), value)
        })
        .collect();
    masked.query_pairs_mut().clear().extend_pairs(pairs);
    masked
}
