//! The sync client: composition and orchestration.

use crate::cache::RemoteQueryCache;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::mutation::{MutationDispatcher, MutationOutcome, PendingMutation};
use crate::projector::{QuerySnapshot, ResultProjector};
use crate::registry::{QueryRegistry, QueryToken};
use crate::transport::{
    ChannelState, Connector, TransportChannel, WireSink, WireStream, WsConnector,
};
use parking_lot::Mutex;
use ripple_codec::Value;
use ripple_sync_protocol::{
    ClientMessage, MutationId, QueryId, QuerySetChange, ServerMessage, Transition,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle notifications surfaced to the owning collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The connection is open and the handshake has been sent.
    Connected,
    /// The engine detected an unrecoverable desynchronization and tore the
    /// connection down.
    FatalError(String),
    /// The connection ended without a fatal condition.
    Closed,
}

type Listener = Arc<dyn Fn(ClientResult<Option<Value>>) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    on_change: Listener,
}

/// A caller's registration on one query; hand it back to
/// [`SyncClient::unsubscribe`] to withdraw it.
pub struct Subscription {
    token: QueryToken,
    listener_id: u64,
}

impl Subscription {
    /// The deduplication token of the subscribed query.
    pub fn token(&self) -> &QueryToken {
        &self.token
    }
}

/// Whether a receive loop should keep reading.
enum Flow {
    Continue,
    /// A newer connection owns the engine; this loop ends silently.
    Stale,
}

struct EngineState {
    channel: TransportChannel,
    registry: QueryRegistry,
    cache: RemoteQueryCache,
    projector: ResultProjector,
    listeners: HashMap<QueryToken, Vec<ListenerEntry>>,
    pending_mutations: HashMap<MutationId, oneshot::Sender<MutationOutcome>>,
    next_mutation_id: MutationId,
    next_listener_id: u64,
    connection_count: u32,
    /// Bumped on reconnect and close; tasks from older connections detect
    /// the change and stand down.
    epoch: u64,
}

struct ClientInner {
    config: ClientConfig,
    session_id: Uuid,
    dispatcher: MutationDispatcher,
    state: Mutex<EngineState>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

/// Client half of the sync protocol.
///
/// Maintains a live view of subscribed server-computed query results over
/// one persistent connection and fires asynchronous mutations. All shared
/// state lives behind a single mutex; `subscribe` and `mutate` enqueue or
/// send and return without blocking on the network.
///
/// The handle is cheap to clone. Construct it explicitly and pass it to
/// collaborators; there is no process-wide instance.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Creates a client and the receiver for its lifecycle events.
    pub fn new(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let client = Self {
            inner: Arc::new(ClientInner {
                config,
                session_id: Uuid::new_v4(),
                dispatcher: MutationDispatcher::new(),
                state: Mutex::new(EngineState {
                    channel: TransportChannel::new(),
                    registry: QueryRegistry::new(),
                    cache: RemoteQueryCache::new(),
                    projector: ResultProjector::new(),
                    listeners: HashMap::new(),
                    pending_mutations: HashMap::new(),
                    next_mutation_id: 0,
                    next_listener_id: 0,
                    connection_count: 0,
                    epoch: 0,
                }),
                events,
            }),
        };
        (client, events_rx)
    }

    /// This client's session identifier, fresh per instance.
    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    /// Current transport state.
    pub fn connection_state(&self) -> ChannelState {
        self.inner.state.lock().channel.state()
    }

    /// Connects to the configured deployment endpoint.
    pub async fn connect(&self) -> ClientResult<()> {
        let connector = WsConnector::new(self.inner.config.sync_endpoint()?);
        self.connect_with(&connector).await
    }

    /// Connects through an explicit connector.
    ///
    /// On success the handshake has been transmitted, queued traffic has
    /// been flushed in order, and the writer and receive tasks are running.
    pub async fn connect_with(&self, connector: &dyn Connector) -> ClientResult<()> {
        self.inner.state.lock().channel.begin_connect()?;

        let dialed = tokio::time::timeout(self.inner.config.connect_timeout, connector.connect())
            .await
            .map_err(|_| ClientError::Timeout)
            .and_then(|result| result);
        let (sink, stream) = match dialed {
            Ok(pair) => pair,
            Err(e) => {
                self.inner.state.lock().channel.abort_connect();
                return Err(e);
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let epoch = {
            let mut state = self.inner.state.lock();
            state.channel.attach(outbound_tx);

            // The handshake goes out first, while still connecting, so the
            // open flush delivers any queued query-set traffic after it.
            let handshake = ClientMessage::Connect {
                session_id: self.inner.session_id,
                connection_count: state.connection_count,
            };
            state.connection_count += 1;
            state.channel.send(&handshake)?;
            state.channel.open()?;
            state.epoch
        };

        info!(session_id = %self.inner.session_id, "connected");
        let _ = self.inner.events.send(ClientEvent::Connected);

        tokio::spawn(write_loop(outbound_rx, sink));
        let inner = Arc::clone(&self.inner);
        tokio::spawn(read_loop(inner, stream, epoch));
        Ok(())
    }

    /// Connects with exponential backoff over transient failures.
    pub async fn connect_with_retry(&self, connector: &dyn Connector) -> ClientResult<()> {
        let retry = self.inner.config.retry.clone();
        let mut last_error = None;

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                let delay = retry.delay_for_attempt(attempt);
                debug!(attempt, ?delay, "retrying connect");
                tokio::time::sleep(delay).await;
            }

            match self.connect_with(connector).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    warn!(error = %e, attempt, "connect attempt failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ClientError::transport_fatal("no connection attempts made")))
    }

    /// Reconnects after the connection has ended and replays the query set.
    ///
    /// Starts a fresh connection epoch: the result cache restarts at the
    /// initial version and one query-set modification re-adding every live
    /// query is queued, so it is flushed right after the new handshake.
    /// Tokens, query ids and listeners all survive the reconnect.
    pub async fn reconnect_with(&self, connector: &dyn Connector) -> ClientResult<()> {
        {
            let mut state = self.inner.state.lock();
            if !state.channel.state().is_terminal() {
                return Err(ClientError::invalid_state(
                    state.channel.state(),
                    ChannelState::Connecting,
                ));
            }
            state.epoch += 1;
            state.channel.reset();
            state.cache.reset();
            if let Some(replay) = state.registry.rebase_for_reconnect() {
                state.channel.send(&ClientMessage::ModifyQuerySet(replay))?;
            }
        }
        self.connect_with(connector).await
    }

    /// Declares interest in a query and registers a change listener.
    ///
    /// The listener fires whenever the query's projected result changes:
    /// with the new value, `Ok(None)` while pending, or a typed error when
    /// the server reports the query failed. Identical definitions share one
    /// server-side subscription.
    pub fn subscribe<F>(
        &self,
        udf_path: &str,
        args: Vec<Value>,
        on_change: F,
    ) -> ClientResult<Subscription>
    where
        F: Fn(ClientResult<Option<Value>>) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        let (modification, token) = state.registry.subscribe(udf_path, &args)?;

        let listener_id = state.next_listener_id;
        state.next_listener_id += 1;
        state
            .listeners
            .entry(token.clone())
            .or_default()
            .push(ListenerEntry {
                id: listener_id,
                on_change: Arc::new(on_change),
            });

        if let Some(modification) = modification {
            send_or_defer(&mut state, &ClientMessage::ModifyQuerySet(modification))?;
        }

        Ok(Subscription { token, listener_id })
    }

    /// Withdraws a subscription.
    ///
    /// The listener stops firing immediately. When the last subscriber of a
    /// query leaves, a removal delta is sent and the cached result evicted.
    pub fn unsubscribe(&self, subscription: Subscription) -> ClientResult<()> {
        let mut state = self.inner.state.lock();

        if let Some(entries) = state.listeners.get_mut(&subscription.token) {
            entries.retain(|entry| entry.id != subscription.listener_id);
            if entries.is_empty() {
                state.listeners.remove(&subscription.token);
            }
        }

        if let Some(modification) = state.registry.unsubscribe(&subscription.token) {
            for change in &modification.modifications {
                if let QuerySetChange::Remove { query_id } = change {
                    state.cache.remove(*query_id);
                }
            }
            send_or_defer(&mut state, &ClientMessage::ModifyQuerySet(modification))?;
        }

        Ok(())
    }

    /// Fires a mutation.
    ///
    /// Returns a completion handle resolved by the server's response; drop
    /// it for fire-and-forget use.
    pub fn mutate(&self, udf_path: &str, args: Vec<Value>) -> ClientResult<PendingMutation> {
        let mut state = self.inner.state.lock();

        let mutation_id = state.next_mutation_id;
        state.next_mutation_id += 1;

        let message = self.inner.dispatcher.request(udf_path, args, mutation_id);
        let (sender, receiver) = oneshot::channel();
        state.pending_mutations.insert(mutation_id, sender);

        if let Err(e) = state.channel.send(&message) {
            state.pending_mutations.remove(&mutation_id);
            return Err(e);
        }

        debug!(mutation_id, udf_path, "mutation sent");
        Ok(PendingMutation::new(mutation_id, receiver))
    }

    /// The current projected value of a token.
    ///
    /// `Ok(None)` while the query is pending; a typed error if its latest
    /// result is a server-reported failure.
    pub fn result_for(&self, token: &QueryToken) -> ClientResult<Option<Value>> {
        self.inner.state.lock().projector.value_of(token)
    }

    /// Shuts the connection down explicitly.
    ///
    /// Pending mutations fail with [`ClientError::Closed`]; subscriptions
    /// stay registered and are replayed by [`Self::reconnect_with`].
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.channel.close();
            state.pending_mutations.clear();
        }
        let _ = self.inner.events.send(ClientEvent::Closed);
    }
}

/// Sends a query-set delta, deferring it when the connection has ended:
/// the reconnect replay re-derives the full set from the registry.
fn send_or_defer(state: &mut EngineState, message: &ClientMessage) -> ClientResult<()> {
    match state.channel.send(message) {
        Err(ClientError::Closed) => {
            debug!("connection closed; query-set delta deferred to reconnect replay");
            Ok(())
        }
        other => other,
    }
}

/// Drains the outbound queue onto the wire.
///
/// A write failure ends the loop; the receive side observes the broken
/// connection and runs the teardown path.
async fn write_loop(mut outbound: mpsc::UnboundedReceiver<String>, mut sink: Box<dyn WireSink>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "outbound write failed");
            break;
        }
    }
}

/// The explicit receive loop: one message is decoded and fully handled
/// before the next read is issued, so receives never overlap.
async fn read_loop(inner: Arc<ClientInner>, mut stream: Box<dyn WireStream>, epoch: u64) {
    loop {
        let Some(frame) = stream.next().await else {
            finish(&inner, epoch, None);
            return;
        };

        let outcome = frame
            .and_then(|text| {
                ServerMessage::decode(&text).map_err(|e| ClientError::Protocol(e.to_string()))
            })
            .and_then(|message| handle_server_message(&inner, epoch, message));

        match outcome {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stale) => return,
            Err(e) => {
                finish(&inner, epoch, Some(e));
                return;
            }
        }
    }
}

/// Tears the connection down and surfaces how it ended.
fn finish(inner: &Arc<ClientInner>, epoch: u64, fatal: Option<ClientError>) {
    {
        let mut state = inner.state.lock();
        if state.epoch != epoch {
            return;
        }
        state.channel.close();
        state.pending_mutations.clear();
    }
    match fatal {
        Some(e) => {
            error!(error = %e, "connection torn down");
            let _ = inner.events.send(ClientEvent::FatalError(e.to_string()));
        }
        None => {
            debug!("connection closed by peer");
            let _ = inner.events.send(ClientEvent::Closed);
        }
    }
}

fn handle_server_message(
    inner: &Arc<ClientInner>,
    epoch: u64,
    message: ServerMessage,
) -> ClientResult<Flow> {
    match message {
        ServerMessage::Transition(transition) => handle_transition(inner, epoch, transition),
        ServerMessage::MutationResponse(response) => {
            let mut state = inner.state.lock();
            if state.epoch != epoch {
                return Ok(Flow::Stale);
            }
            match state.pending_mutations.remove(&response.mutation_id) {
                Some(sender) => {
                    debug!(mutation_id = response.mutation_id, "mutation resolved");
                    let _ = sender.send(response.into());
                }
                None => warn!(
                    mutation_id = response.mutation_id,
                    "response for unknown mutation"
                ),
            }
            Ok(Flow::Continue)
        }
        ServerMessage::FatalError { error } => Err(ClientError::ServerError(error)),
    }
}

fn handle_transition(
    inner: &Arc<ClientInner>,
    epoch: u64,
    transition: Transition,
) -> ClientResult<Flow> {
    let notifications = {
        let mut state = inner.state.lock();
        if state.epoch != epoch {
            return Ok(Flow::Stale);
        }

        state.cache.transition(&transition)?;

        // Results for ids the registry no longer knows (removed locally
        // while the server still had updates in flight) are evicted, not
        // projected.
        let unknown: Vec<QueryId> = state
            .cache
            .ids()
            .filter(|id| !state.registry.contains_id(*id))
            .collect();
        for id in unknown {
            warn!(query_id = id, "evicting result for unregistered query");
            state.cache.remove(id);
        }

        let snapshot = build_snapshot(&state.registry, &state.cache);
        let changed = state.projector.ingest(snapshot);
        debug!(changed = changed.len(), "transition projected");

        let mut notifications: Vec<(Listener, ClientResult<Option<Value>>)> = Vec::new();
        for token in &changed {
            if let Some(entries) = state.listeners.get(token) {
                for entry in entries {
                    notifications.push((
                        Arc::clone(&entry.on_change),
                        state.projector.value_of(token),
                    ));
                }
            }
        }
        notifications
    };

    // Listeners run synchronously on this task, in registration order, but
    // outside the state lock so they may re-enter subscribe/mutate.
    for (listener, value) in notifications {
        listener(value);
    }
    Ok(Flow::Continue)
}

fn build_snapshot(
    registry: &QueryRegistry,
    cache: &RemoteQueryCache,
) -> HashMap<QueryToken, QuerySnapshot> {
    let mut snapshot = HashMap::new();
    for (id, result) in cache.entries() {
        let (Some(token), Some(path), Some(args)) = (
            registry.token_for(id),
            registry.path_for(id),
            registry.args_for(id),
        ) else {
            continue;
        };
        snapshot.insert(
            token.clone(),
            QuerySnapshot {
                result: Some(result.clone()),
                udf_path: path.to_string(),
                args: args.to_vec(),
            },
        );
    }
    snapshot
}
