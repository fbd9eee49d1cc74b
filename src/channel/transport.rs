//! Websocket transport sessions.
//!
//! A [`TransportSession`] is one socket connection. The socket itself lives in
//! a small pump task; the session talks to it over two unbounded channels so
//! that `send` is synchronous and `close` is immediate.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::channel::client::ChannelError;
use crate::retry::with_timeout;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens transport sessions.
///
/// The returned future resolves once the handshake succeeded and fails if the
/// target is unreachable or rejects the upgrade.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<TransportSession, ChannelError>>;
}

/// One live socket connection.
///
/// After [`TransportSession::close`] no further inbound frames are surfaced,
/// even if the socket had already buffered some.
#[derive(Debug)]
pub struct TransportSession {
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: mpsc::UnboundedReceiver<String>,
    closed: bool,
}

impl TransportSession {
    /// Builds a session from the pump's channel ends.
    ///
    /// Frames sent on the session arrive on the receiver paired with
    /// `outbound`; frames pushed into the sender paired with `inbound` are
    /// surfaced by [`TransportSession::recv`]. Dropping that sender is seen as
    /// the socket closing.
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
            closed: false,
        }
    }

    /// Whether the session can still accept outbound frames.
    pub fn is_live(&self) -> bool {
        !self.closed
            && self
                .outbound
                .as_ref()
                .is_some_and(|outbound| !outbound.is_closed())
    }

    /// Hands a text frame to the socket.
    ///
    /// Fails with [`ChannelError::TransportClosed`] once the session or its
    /// socket is gone; the caller keeps ownership of retrying.
    pub fn send(&self, text: String) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::TransportClosed);
        }
        self.outbound
            .as_ref()
            .ok_or(ChannelError::TransportClosed)?
            .send(text)
            .map_err(|_| ChannelError::TransportClosed)
    }

    /// Waits for the next inbound text frame. `None` means the socket closed.
    pub async fn recv(&mut self) -> Option<String> {
        if self.closed {
            return None;
        }
        self.inbound.recv().await
    }

    /// Closes the session and discards anything still buffered.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.outbound = None;
        self.inbound.close();
    }
}

/// Default connector backed by `tokio-tungstenite`.
#[derive(Clone, Debug)]
pub struct WsConnector {
    handshake_timeout: Duration,
}

impl WsConnector {
    /// Creates a connector that gives up on handshakes after `handshake_timeout`.
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<TransportSession, ChannelError>> {
        let url = url.to_string();
        let handshake_timeout = self.handshake_timeout;

        Box::pin(async move {
            let (socket, _) = with_timeout(handshake_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| ChannelError::HandshakeTimeout(handshake_timeout))??;

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump_socket(socket, outbound_rx, inbound_tx));

            Ok(TransportSession::new(outbound_tx, inbound_rx))
        })
    }
}

async fn pump_socket(
    mut socket: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: mpsc::UnboundedSender<String>,
) {
    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(text) => {
                        if let Err(err) = socket.send(Message::Text(text.into())).await {
                            warn!(event = "channel_socket_write_failed", error = %err);
                            break;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        break;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(text.as_str().to_owned()).is_err() {
                            let _ = socket.close(None).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(payload))) => {
                        warn!(
                            event = "channel_binary_frame_discarded",
                            len = payload.len()
                        );
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(event = "channel_socket_close_frame", frame = ?frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(event = "channel_socket_read_failed", error = %err);
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}
