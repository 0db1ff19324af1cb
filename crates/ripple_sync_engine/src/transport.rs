//! Transport layer: connection seams and the channel state machine.
//!
//! The network is abstracted behind the [`Connector`] trait so tests can
//! swap the socket out for an in-memory pair. The real implementation is
//! [`WsConnector`] over `tokio-tungstenite`.

use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use ripple_sync_protocol::ClientMessage;
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

/// Connection lifecycle of a [`TransportChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection attempt has started.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The connection is established and the queue has been flushed.
    Open,
    /// The connection has ended; sends fail until the channel is reset.
    Closed,
}

impl ChannelState {
    /// Returns true if a connection attempt can start from this state.
    pub fn can_connect(&self) -> bool {
        matches!(self, ChannelState::Disconnected)
    }

    /// Returns true if messages are transmitted immediately.
    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }

    /// Returns true if the connection has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed)
    }
}

/// Write half of an established connection.
#[async_trait]
pub trait WireSink: Send {
    /// Transmits one text frame.
    async fn send(&mut self, frame: String) -> ClientResult<()>;
}

/// Read half of an established connection.
#[async_trait]
pub trait WireStream: Send {
    /// Waits for the next text frame. `None` means the peer closed the
    /// connection.
    async fn next(&mut self) -> Option<ClientResult<String>>;
}

/// Dials a connection and returns its two halves.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establishes a connection.
    async fn connect(&self) -> ClientResult<(Box<dyn WireSink>, Box<dyn WireStream>)>;
}

/// Connects to a sync endpoint over WebSocket.
pub struct WsConnector {
    endpoint: Url,
}

impl WsConnector {
    /// Creates a connector for the given endpoint.
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }

    /// The endpoint this connector dials.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> ClientResult<(Box<dyn WireSink>, Box<dyn WireStream>)> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| ClientError::transport_retryable(e.to_string()))?;
        debug!(endpoint = %self.endpoint, "websocket established");
        let (sink, stream) = stream.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsStream { stream })))
    }
}

type WsTransport = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsSink {
    sink: SplitSink<WsTransport, Message>,
}

#[async_trait]
impl WireSink for WsSink {
    async fn send(&mut self, frame: String) -> ClientResult<()> {
        self.sink
            .send(Message::Text(frame))
            .await
            .map_err(|e| ClientError::transport_fatal(e.to_string()))
    }
}

struct WsStream {
    stream: SplitStream<WsTransport>,
}

#[async_trait]
impl WireStream for WsStream {
    async fn next(&mut self) -> Option<ClientResult<String>> {
        loop {
            return match self.stream.next().await? {
                Ok(Message::Text(text)) => Some(Ok(text)),
                // Keepalive chatter; tungstenite answers pings internally.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => None,
                // The protocol is textual; anything else means the peer and
                // client no longer agree on the framing.
                Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => Some(Err(
                    ClientError::Protocol("expected a text frame".to_string()),
                )),
                Err(e) => Some(Err(ClientError::transport_fatal(e.to_string()))),
            };
        }
    }
}

/// An in-memory connector: frames cross a pair of channels instead of a
/// socket. The server side of the pair is handed out for tests to script.
pub struct LoopbackConnector {
    ends: Mutex<Option<LoopbackEnds>>,
}

struct LoopbackEnds {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
}

/// Server-side handle of a loopback pair.
pub struct LoopbackServerEnd {
    /// Frames the client transmitted, in wire order.
    pub incoming: mpsc::UnboundedReceiver<String>,
    /// Sends frames to the client.
    pub outgoing: mpsc::UnboundedSender<String>,
}

impl LoopbackConnector {
    /// Creates a connector and the matching server end.
    pub fn pair() -> (Self, LoopbackServerEnd) {
        let (to_server, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_server) = mpsc::unbounded_channel();
        (
            Self {
                ends: Mutex::new(Some(LoopbackEnds {
                    to_server,
                    from_server,
                })),
            },
            LoopbackServerEnd { incoming, outgoing },
        )
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> ClientResult<(Box<dyn WireSink>, Box<dyn WireStream>)> {
        let ends = self
            .ends
            .lock()
            .take()
            .ok_or_else(|| ClientError::transport_fatal("loopback connector already consumed"))?;
        Ok((
            Box::new(LoopbackSink {
                to_server: ends.to_server,
            }),
            Box::new(LoopbackStream {
                from_server: ends.from_server,
            }),
        ))
    }
}

struct LoopbackSink {
    to_server: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl WireSink for LoopbackSink {
    async fn send(&mut self, frame: String) -> ClientResult<()> {
        self.to_server
            .send(frame)
            .map_err(|_| ClientError::transport_fatal("loopback peer dropped"))
    }
}

struct LoopbackStream {
    from_server: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl WireStream for LoopbackStream {
    async fn next(&mut self) -> Option<ClientResult<String>> {
        self.from_server.recv().await.map(Ok)
    }
}

/// Client-side state of one persistent connection: the lifecycle state
/// machine, the pre-open outbound queue, and the handle feeding the writer
/// task.
///
/// The channel itself is synchronous and lives inside the engine's mutex;
/// actual socket writes happen on a writer task fed through an unbounded
/// queue, so no caller ever blocks on the network.
pub struct TransportChannel {
    state: ChannelState,
    pending: VecDeque<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

impl TransportChannel {
    /// Creates a disconnected channel.
    pub fn new() -> Self {
        Self {
            state: ChannelState::Disconnected,
            pending: VecDeque::new(),
            outbound: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Starts a connection attempt.
    pub fn begin_connect(&mut self) -> ClientResult<()> {
        if !self.state.can_connect() {
            return Err(ClientError::invalid_state(
                self.state,
                ChannelState::Connecting,
            ));
        }
        self.state = ChannelState::Connecting;
        Ok(())
    }

    /// Wires the outbound queue to an established connection's writer task.
    pub fn attach(&mut self, outbound: mpsc::UnboundedSender<String>) {
        self.outbound = Some(outbound);
    }

    /// Sends a message, queueing it if the channel is not open yet.
    ///
    /// Handshake-class messages are transmitted as soon as a connection is
    /// attached, even while still connecting, so the handshake itself never
    /// waits for the open flush.
    pub fn send(&mut self, message: &ClientMessage) -> ClientResult<()> {
        if self.state.is_terminal() {
            return Err(ClientError::Closed);
        }
        let frame = message
            .encode()
            .map_err(|e| ClientError::Protocol(e.to_string()))?;

        let transmit_now = self.state.is_open()
            || (self.state == ChannelState::Connecting
                && message.is_handshake()
                && self.outbound.is_some());

        if transmit_now {
            self.transmit(frame)
        } else {
            trace!(queued = self.pending.len() + 1, "queueing outbound frame");
            self.pending.push_back(frame);
            Ok(())
        }
    }

    /// Marks the channel open and flushes the queue, FIFO, exactly once.
    pub fn open(&mut self) -> ClientResult<()> {
        if self.state != ChannelState::Connecting {
            return Err(ClientError::invalid_state(self.state, ChannelState::Open));
        }
        self.state = ChannelState::Open;
        let pending: Vec<String> = self.pending.drain(..).collect();
        debug!(flushed = pending.len(), "transport open");
        for frame in pending {
            self.transmit(frame)?;
        }
        Ok(())
    }

    /// Reverts a failed connection attempt, keeping queued messages for the
    /// next attempt.
    pub fn abort_connect(&mut self) {
        self.state = ChannelState::Disconnected;
        self.outbound = None;
    }

    /// Ends the connection; further sends fail until [`Self::reset`].
    pub fn close(&mut self) {
        self.state = ChannelState::Closed;
        self.outbound = None;
    }

    /// Resets a closed channel so a fresh connection attempt can start.
    ///
    /// Messages queued before the close are dropped; replaying state onto a
    /// new connection is the client's responsibility.
    pub fn reset(&mut self) {
        self.state = ChannelState::Disconnected;
        self.outbound = None;
        self.pending.clear();
    }

    fn transmit(&mut self, frame: String) -> ClientResult<()> {
        let Some(outbound) = &self.outbound else {
            return Err(ClientError::NotConnected);
        };
        outbound
            .send(frame)
            .map_err(|_| ClientError::transport_fatal("writer task gone"))
    }
}

impl Default for TransportChannel {
    fn default() -> Self {
        Self::new()
    }
}
