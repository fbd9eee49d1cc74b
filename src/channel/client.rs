//! Reconnecting realtime channel client.
//!
//! The client handles role-specific connection targets, linear-backoff
//! reconnects and an in-memory queue of outbound frames. A background worker
//! owns the transport session; [`ChannelClient`] is a cloneable handle that
//! talks to it over a command queue.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info, warn};

use crate::channel::dispatch::{ChannelEvent, Dispatcher, HandlerResult, SubscriptionId};
use crate::channel::proto::{Frame, FrameError, Topic};
use crate::channel::queue::OutboundQueue;
use crate::channel::session::{ChannelTarget, ClientId, SessionIdentity};
use crate::channel::transport::{Connector, TransportSession, WsConnector};
use crate::retry::ReconnectPolicy;

/// Default websocket endpoint of the scheduling service.
pub const DEFAULT_CHANNEL_ENDPOINT: &str = "ws://localhost:8000";
/// Default upper bound for one websocket handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Channel configuration.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Websocket base URL; connection paths are appended to it.
    pub endpoint: String,
    /// Automatic reconnect policy.
    pub reconnect: ReconnectPolicy,
    /// Upper bound for one handshake with the default connector.
    pub handshake_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_CHANNEL_ENDPOINT.to_string(),
            reconnect: ReconnectPolicy::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl ChannelConfig {
    /// Sets the websocket base URL. Trailing whitespace and slashes are
    /// stripped.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = normalize_endpoint(&endpoint.into());
        self
    }

    /// Sets the delay unit between reconnect attempts.
    pub fn with_reconnect_base_delay(mut self, base_delay: Duration) -> Self {
        self.reconnect.base_delay = base_delay;
        self
    }

    /// Sets the maximum number of consecutive automatic reconnect attempts.
    pub fn with_max_reconnect_attempts(mut self, max_attempts: u32) -> Self {
        self.reconnect.max_attempts = max_attempts;
        self
    }

    /// Sets the handshake timeout used by the websocket connector.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot published by the worker after every state change.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    /// Consecutive automatic reconnect attempts since the last success.
    pub reconnect_attempts: u32,
    /// Path of the current logical connection, if any.
    pub path: Option<String>,
    /// Frames waiting for a live connection.
    pub queued: usize,
}

/// Errors produced by channel transport and lifecycle handling.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Value is not a valid outbound frame.
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),

    /// Handshake did not complete in time.
    #[error("websocket handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// User channel requested without a user id.
    #[error("user id must not be empty")]
    InvalidUserId,

    /// Transport session is closed or its socket is gone.
    #[error("transport session is closed")]
    TransportClosed,

    /// A newer connect request replaced this one before it completed.
    #[error("connect superseded by a newer connect request")]
    Superseded,

    /// `disconnect` was called before the handshake completed.
    #[error("connect cancelled by disconnect")]
    Cancelled,

    /// Channel worker has shut down.
    #[error("channel worker stopped")]
    WorkerStopped,

    /// No Tokio runtime was available to start the channel worker.
    #[error("no tokio runtime available to run the channel worker")]
    NoRuntime,
}

enum Command {
    Connect {
        target: ChannelTarget,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    Disconnect,
    Send(Frame),
}

/// Cloneable handle to the realtime channel.
///
/// The worker is started on the first command (connect, disconnect or send)
/// from inside a Tokio runtime. Dropping every handle stops the worker and
/// closes the socket. Handlers
/// registered through [`ChannelClient::subscribe`] that capture a clone of the
/// handle keep the worker alive until they are unsubscribed.
#[derive(Clone, Debug)]
pub struct ChannelClient {
    client_id: ClientId,
    commands: mpsc::UnboundedSender<Command>,
    dispatcher: Arc<Dispatcher>,
    status: watch::Receiver<ChannelStatus>,
    worker: Arc<WorkerSlot>,
}

/// Worker waiting for its first command.
struct WorkerSlot(Mutex<Option<(ChannelWorker, mpsc::UnboundedReceiver<Command>)>>);

impl WorkerSlot {
    fn start(&self) -> Result<(), ChannelError> {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            return Ok(());
        }
        let runtime = Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;
        if let Some((worker, commands)) = slot.take() {
            runtime.spawn(worker.run(commands));
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("WorkerSlot")
            .field("started", &!pending)
            .finish()
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect { target, .. } => {
                f.debug_struct("Connect").field("target", target).finish()
            }
            Self::Disconnect => f.write_str("Disconnect"),
            Self::Send(frame) => f.debug_tuple("Send").field(&frame.tag()).finish(),
        }
    }
}

impl ChannelClient {
    /// Creates a channel using the websocket connector.
    ///
    /// The channel starts `Disconnected`. Commands issued outside a Tokio
    /// runtime fail with [`ChannelError::NoRuntime`].
    pub fn new(config: ChannelConfig) -> Self {
        let connector = WsConnector::new(config.handshake_timeout);
        Self::with_connector(config, connector)
    }

    /// Creates a channel that opens sessions through `connector`.
    pub fn with_connector(config: ChannelConfig, connector: impl Connector) -> Self {
        Self::with_client_id(config, connector, ClientId::generate())
    }

    /// Creates a channel with an explicit client token.
    pub fn with_client_id(
        config: ChannelConfig,
        connector: impl Connector,
        client_id: ClientId,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new());
        let (status_tx, status_rx) = watch::channel(ChannelStatus {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            path: None,
            queued: 0,
        });

        let worker = ChannelWorker {
            endpoint: normalize_endpoint(&config.endpoint),
            client_id: client_id.clone(),
            policy: config.reconnect,
            connector: Arc::new(connector),
            dispatcher: Arc::clone(&dispatcher),
            status_tx,
            state: ConnectionState::Disconnected,
            path: None,
            attempts: 0,
            queue: OutboundQueue::new(),
            session: None,
            handshake: None,
            retry_timer: None,
        };

        Self {
            client_id,
            commands: commands_tx,
            dispatcher,
            status: status_rx,
            worker: Arc::new(WorkerSlot(Mutex::new(Some((worker, commands_rx))))),
        }
    }

    /// Per-client token used in connection paths.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Connects to the personal channel of `user_id`.
    ///
    /// Resolves once the handshake completed and queued frames were flushed.
    pub async fn connect_as_user(&self, user_id: &str) -> Result<(), ChannelError> {
        if user_id.trim().is_empty() {
            return Err(ChannelError::InvalidUserId);
        }
        self.connect(ChannelTarget::User {
            user_id: user_id.to_string(),
        })
        .await
    }

    /// Connects to the admin channel.
    pub async fn connect_as_admin(&self) -> Result<(), ChannelError> {
        self.connect(ChannelTarget::Admin).await
    }

    /// Connects to the channel matching the identity's role.
    pub async fn connect_identity(&self, identity: &SessionIdentity) -> Result<(), ChannelError> {
        match identity.target() {
            ChannelTarget::User { user_id } => self.connect_as_user(&user_id).await,
            ChannelTarget::Admin => self.connect_as_admin().await,
        }
    }

    /// Connects to `target`, replacing any current connection.
    pub async fn connect(&self, target: ChannelTarget) -> Result<(), ChannelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(Command::Connect {
            target,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| ChannelError::WorkerStopped)?
    }

    /// Closes the connection and cancels any scheduled reconnect.
    ///
    /// Queued frames are kept for a later connect. Calling this while already
    /// disconnected does nothing.
    pub fn disconnect(&self) {
        let _ = self.command(Command::Disconnect);
    }

    /// Submits a frame for delivery.
    ///
    /// Frames submitted while not connected are queued and flushed in order
    /// once the channel is live. Only fails when the worker has stopped or
    /// cannot be started.
    pub fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        self.command(Command::Send(frame))
    }

    /// Serializes `message` and submits it. The value must encode to an
    /// object with a string `type` field.
    pub fn send_json<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), ChannelError> {
        self.send(Frame::from_serialize(message)?)
    }

    /// Registers `handler` for `topic`.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, handler: F) -> SubscriptionId
    where
        F: Fn(&ChannelEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(topic, handler)
    }

    /// Removes one handler, or all handlers of `topic` when `id` is `None`.
    pub fn unsubscribe(&self, topic: impl Into<Topic>, id: Option<SubscriptionId>) -> usize {
        self.dispatcher.unsubscribe(&topic.into(), id)
    }

    /// Latest published status.
    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Automatic reconnect attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.status.borrow().reconnect_attempts
    }

    /// Returns a receiver that observes every status change.
    pub fn status_watch(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    fn command(&self, command: Command) -> Result<(), ChannelError> {
        self.worker.start()?;
        self.commands
            .send(command)
            .map_err(|_| ChannelError::WorkerStopped)
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    endpoint.trim().trim_end_matches('/').to_string()
}

struct Handshake {
    future: BoxFuture<'static, Result<TransportSession, ChannelError>>,
    /// `None` for automatic reattempts.
    reply: Option<oneshot::Sender<Result<(), ChannelError>>>,
}

enum Step {
    Command(Command),
    Handshake(Result<TransportSession, ChannelError>),
    Inbound(Option<String>),
    RetryDue,
}

struct ChannelWorker {
    endpoint: String,
    client_id: ClientId,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<Dispatcher>,
    status_tx: watch::Sender<ChannelStatus>,
    state: ConnectionState,
    path: Option<String>,
    attempts: u32,
    queue: OutboundQueue,
    session: Option<TransportSession>,
    handshake: Option<Handshake>,
    retry_timer: Option<Pin<Box<Sleep>>>,
}

impl ChannelWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let step = tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => break,
                },
                result = poll_handshake(&mut self.handshake) => Step::Handshake(result),
                inbound = poll_inbound(&mut self.session) => Step::Inbound(inbound),
                () = poll_timer(&mut self.retry_timer) => Step::RetryDue,
            };

            match step {
                Step::Command(command) => self.on_command(command),
                Step::Handshake(result) => self.on_handshake(result),
                Step::Inbound(Some(text)) => self.on_frame(&text),
                Step::Inbound(None) => self.on_connection_lost(),
                Step::RetryDue => self.on_retry_due(),
            }
        }

        debug!(event = "channel_worker_stopped", client_id = %self.client_id);
        self.teardown(|| ChannelError::WorkerStopped);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { target, reply } => {
                let path = target.path(&self.client_id);
                self.teardown(|| ChannelError::Superseded);
                self.attempts = 0;
                self.path = Some(path);
                self.begin_handshake(Some(reply));
            }
            Command::Disconnect => {
                let idle = self.state == ConnectionState::Disconnected
                    && self.retry_timer.is_none()
                    && self.handshake.is_none();
                self.teardown(|| ChannelError::Cancelled);
                self.attempts = 0;
                if !idle {
                    info!(event = "channel_disconnected", path = ?self.path);
                }
                self.path = None;
                self.publish_status();
            }
            Command::Send(frame) => self.submit(frame),
        }
    }

    fn begin_handshake(&mut self, reply: Option<oneshot::Sender<Result<(), ChannelError>>>) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let url = format!("{}{}", self.endpoint, path);
        debug!(event = "channel_connecting", url = %url, attempt = self.attempts);
        self.handshake = Some(Handshake {
            future: self.connector.open(&url),
            reply,
        });
        self.set_state(ConnectionState::Connecting);
    }

    fn on_handshake(&mut self, result: Result<TransportSession, ChannelError>) {
        let Some(handshake) = self.handshake.take() else {
            return;
        };
        let path = self.path.clone().unwrap_or_default();

        match result {
            Ok(session) => {
                self.session = Some(session);
                self.attempts = 0;
                self.set_state(ConnectionState::Connected);
                info!(event = "channel_connected", path = %path);

                self.flush();
                self.dispatcher.emit(&ChannelEvent::Connected { path });
                if let Some(reply) = handshake.reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                match handshake.reply {
                    Some(reply) => {
                        warn!(event = "channel_handshake_failed", path = %path, error = %err);
                        let _ = reply.send(Err(err));
                    }
                    None => {
                        warn!(
                            event = "channel_reconnect_failed",
                            path = %path,
                            attempt = self.attempts,
                            error = %err
                        );
                        self.schedule_reconnect();
                    }
                }
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        if let Err(err) = self.dispatcher.dispatch(text) {
            warn!(event = "channel_frame_discarded", error = %err);
        }
    }

    fn on_connection_lost(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.set_state(ConnectionState::Disconnected);

        let path = self.path.clone().unwrap_or_default();
        warn!(event = "channel_connection_lost", path = %path);
        self.dispatcher.emit(&ChannelEvent::Disconnected { path });
        self.schedule_reconnect();
    }

    fn on_retry_due(&mut self) {
        self.retry_timer = None;
        self.begin_handshake(None);
    }

    fn schedule_reconnect(&mut self) {
        let Some(path) = self.path.clone() else {
            return;
        };

        if !self.policy.allows_attempt(self.attempts) {
            warn!(
                event = "channel_reconnect_exhausted",
                path = %path,
                attempts = self.attempts
            );
            self.retry_timer = None;
            self.publish_status();
            self.dispatcher.emit(&ChannelEvent::ReconnectExhausted {
                path,
                attempts: self.attempts,
            });
            return;
        }

        self.attempts += 1;
        let delay = self.policy.delay_for_attempt(self.attempts);
        info!(
            event = "channel_reconnect_scheduled",
            path = %path,
            attempt = self.attempts,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        self.retry_timer = Some(Box::pin(tokio::time::sleep(delay)));
        self.publish_status();
    }

    fn submit(&mut self, frame: Frame) {
        if self.state == ConnectionState::Connected && self.queue.is_empty() {
            if let Some(session) = self.session.as_ref() {
                match send_frame(session, &frame) {
                    Ok(()) => return,
                    Err(err) => {
                        debug!(event = "channel_send_requeued", tag = frame.tag(), error = %err);
                        self.queue.push_front(frame);
                        self.publish_status();
                        return;
                    }
                }
            }
        }

        self.queue.push_back(frame);
        if self.state == ConnectionState::Connected {
            self.flush();
        }
        self.publish_status();
    }

    fn flush(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if self.queue.is_empty() {
            return;
        }

        let outcome = self.queue.flush(|frame| send_frame(session, frame));
        if outcome.is_complete() {
            debug!(event = "channel_queue_flushed", sent = outcome.sent);
        } else {
            warn!(
                event = "channel_queue_flush_interrupted",
                sent = outcome.sent,
                remaining = outcome.remaining
            );
        }
        self.publish_status();
    }

    /// Drops the scheduled reattempt, the pending handshake and the live
    /// session. Emits `Disconnected` only if a session was live.
    fn teardown(&mut self, reject: impl Fn() -> ChannelError) {
        self.retry_timer = None;

        if let Some(handshake) = self.handshake.take() {
            if let Some(reply) = handshake.reply {
                let _ = reply.send(Err(reject()));
            }
        }

        let was_live = match self.session.take() {
            Some(mut session) => {
                session.close();
                true
            }
            None => false,
        };
        self.set_state(ConnectionState::Disconnected);

        if was_live {
            let path = self.path.clone().unwrap_or_default();
            self.dispatcher.emit(&ChannelEvent::Disconnected { path });
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(ChannelStatus {
            state: self.state,
            reconnect_attempts: self.attempts,
            path: self.path.clone(),
            queued: self.queue.len(),
        });
    }
}

fn send_frame(session: &TransportSession, frame: &Frame) -> Result<(), ChannelError> {
    let text = frame.to_text()?;
    session.send(text)
}

async fn poll_handshake(
    handshake: &mut Option<Handshake>,
) -> Result<TransportSession, ChannelError> {
    match handshake {
        Some(handshake) => handshake.future.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn poll_inbound(session: &mut Option<TransportSession>) -> Option<String> {
    match session {
        Some(session) => session.recv().await,
        None => std::future::pending().await,
    }
}

async fn poll_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
