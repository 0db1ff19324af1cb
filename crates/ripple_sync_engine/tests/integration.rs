//! Integration tests: the full client against a scripted in-memory server.

use ripple_codec::Value;
use ripple_sync_engine::{
    ChannelState, ClientConfig, ClientError, ClientEvent, ClientResult, Connector,
    LoopbackConnector, LoopbackServerEnd, RetryConfig, SyncClient, WireSink, WireStream,
};
use ripple_sync_protocol::{
    ClientMessage, MutationResponse, QueryChange, QuerySetChange, ServerMessage, StateVersion,
    Transition,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

fn trace_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn new_client() -> (SyncClient, mpsc::UnboundedReceiver<ClientEvent>) {
    let config = ClientConfig::new("https://guiltless-armadillo-773.example.cloud")
        .with_connect_timeout(Duration::from_secs(1));
    SyncClient::new(config)
}

async fn next_client_message(server: &mut LoopbackServerEnd) -> ClientMessage {
    let frame = tokio::time::timeout(Duration::from_secs(1), server.incoming.recv())
        .await
        .expect("timed out waiting for a client frame")
        .expect("client hung up");
    ClientMessage::decode(&frame).expect("client sent a malformed frame")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("timed out waiting for a client event")
        .expect("event channel closed")
}

fn send(server: &LoopbackServerEnd, message: &ServerMessage) {
    server
        .outgoing
        .send(message.encode().expect("encodable server message"))
        .expect("client gone");
}

fn updated(query_id: u64, value: i64) -> QueryChange {
    QueryChange::QueryUpdated {
        query_id,
        value: Value::Integer(value),
        log_lines: vec![],
    }
}

fn transition(
    start: (u64, &str),
    end: (u64, &str),
    modifications: Vec<QueryChange>,
) -> ServerMessage {
    ServerMessage::Transition(Transition {
        start_version: StateVersion::new(start.0, start.1, 0),
        end_version: StateVersion::new(end.0, end.1, 0),
        modifications,
    })
}

#[tokio::test]
async fn end_to_end_counter_scenario() {
    trace_init();
    let (client, mut events) = new_client();
    let (connector, mut server) = LoopbackConnector::pair();

    let (values_tx, mut values_rx) = mpsc::unbounded_channel::<ClientResult<Option<Value>>>();
    let subscription = client
        .subscribe("getCounter", vec![], move |value| {
            let _ = values_tx.send(value);
        })
        .unwrap();

    client.connect_with(&connector).await.unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);

    // The handshake leads, then the queued query-set delta.
    let handshake = next_client_message(&mut server).await;
    let ClientMessage::Connect {
        session_id,
        connection_count,
    } = handshake
    else {
        panic!("expected Connect, got {handshake:?}");
    };
    assert_eq!(session_id, client.session_id());
    assert_eq!(connection_count, 0);

    let modify = next_client_message(&mut server).await;
    let ClientMessage::ModifyQuerySet(modification) = modify else {
        panic!("expected ModifyQuerySet, got {modify:?}");
    };
    assert_eq!(modification.base_version, 0);
    assert_eq!(modification.new_version, 1);
    assert_eq!(
        modification.modifications,
        vec![QuerySetChange::Add {
            query_id: 0,
            udf_path: "getCounter".to_string(),
            args: vec![],
        }]
    );

    // Server acknowledges with the first result.
    send(&server, &transition((0, "0"), (1, "100"), vec![updated(0, 5)]));

    let notified = tokio::time::timeout(Duration::from_secs(1), values_rx.recv())
        .await
        .expect("listener did not fire")
        .unwrap();
    assert_eq!(notified.unwrap(), Some(Value::Integer(5)));
    assert_eq!(
        client.result_for(subscription.token()).unwrap(),
        Some(Value::Integer(5))
    );

    // Mutations go straight out on the open connection.
    let pending = client
        .mutate("incrementCounter", vec![Value::Integer(1)])
        .unwrap();
    let mutation = next_client_message(&mut server).await;
    let ClientMessage::Mutation(request) = mutation else {
        panic!("expected Mutation, got {mutation:?}");
    };
    assert_eq!(request.mutation_id, 0);
    assert_eq!(request.udf_path, "incrementCounter");
    assert_eq!(request.args, vec![Value::Integer(1)]);

    send(
        &server,
        &ServerMessage::MutationResponse(MutationResponse {
            mutation_id: 0,
            success: true,
            result: Some(Value::Integer(6)),
            log_lines: vec![],
        }),
    );
    let outcome = pending.outcome().await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.result, Some(Value::Integer(6)));
}

#[tokio::test]
async fn duplicate_subscription_produces_no_second_delta() {
    trace_init();
    let (client, _events) = new_client();
    let (connector, mut server) = LoopbackConnector::pair();
    client.connect_with(&connector).await.unwrap();
    next_client_message(&mut server).await; // Connect

    let first = client.subscribe("getCounter", vec![], |_| {}).unwrap();
    let message = next_client_message(&mut server).await;
    assert!(matches!(message, ClientMessage::ModifyQuerySet(_)));

    let second = client.subscribe("getCounter", vec![], |_| {}).unwrap();
    assert_eq!(first.token(), second.token());

    // The very next frame is the mutation: the duplicate subscription put
    // nothing on the wire.
    client.mutate("noop", vec![]).unwrap();
    let message = next_client_message(&mut server).await;
    assert!(matches!(message, ClientMessage::Mutation(_)));
}

#[tokio::test]
async fn listener_fires_only_when_the_result_changes() {
    trace_init();
    let (client, _events) = new_client();
    let (connector, mut server) = LoopbackConnector::pair();

    let (values_tx, mut values_rx) = mpsc::unbounded_channel();
    client
        .subscribe("getCounter", vec![], move |value| {
            let _ = values_tx.send(value);
        })
        .unwrap();
    client.connect_with(&connector).await.unwrap();
    next_client_message(&mut server).await; // Connect
    next_client_message(&mut server).await; // ModifyQuerySet

    send(&server, &transition((0, "0"), (1, "10"), vec![updated(0, 5)]));
    let first = values_rx.recv().await.unwrap();
    assert_eq!(first.unwrap(), Some(Value::Integer(5)));

    // Same value again: applied, but nobody is notified.
    send(&server, &transition((1, "10"), (2, "11"), vec![updated(0, 5)]));
    // A changed value afterwards produces exactly one more notification.
    send(&server, &transition((2, "11"), (3, "12"), vec![updated(0, 6)]));

    let second = tokio::time::timeout(Duration::from_secs(1), values_rx.recv())
        .await
        .expect("listener did not fire for the changed value")
        .unwrap();
    assert_eq!(second.unwrap(), Some(Value::Integer(6)));
    assert!(values_rx.try_recv().is_err());
}

#[tokio::test]
async fn query_failure_is_typed_data_not_a_crash() {
    trace_init();
    let (client, _events) = new_client();
    let (connector, mut server) = LoopbackConnector::pair();

    let (values_tx, mut values_rx) = mpsc::unbounded_channel();
    let subscription = client
        .subscribe("brokenQuery", vec![], move |value| {
            let _ = values_tx.send(value);
        })
        .unwrap();
    client.connect_with(&connector).await.unwrap();
    next_client_message(&mut server).await;
    next_client_message(&mut server).await;

    send(
        &server,
        &transition(
            (0, "0"),
            (1, "20"),
            vec![QueryChange::QueryFailed {
                query_id: 0,
                error_message: "division by zero".to_string(),
            }],
        ),
    );

    let notified = values_rx.recv().await.unwrap();
    assert!(matches!(
        notified,
        Err(ClientError::QueryFailed { ref message }) if message == "division by zero"
    ));
    assert!(matches!(
        client.result_for(subscription.token()),
        Err(ClientError::QueryFailed { .. })
    ));
}

#[tokio::test]
async fn server_fatal_error_tears_the_connection_down() {
    trace_init();
    let (client, mut events) = new_client();
    let (connector, server) = LoopbackConnector::pair();
    client.connect_with(&connector).await.unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);

    let pending = client.mutate("incrementCounter", vec![]).unwrap();

    send(
        &server,
        &ServerMessage::FatalError {
            error: "query set corrupted".to_string(),
        },
    );

    let event = next_event(&mut events).await;
    let ClientEvent::FatalError(message) = event else {
        panic!("expected FatalError, got {event:?}");
    };
    assert!(message.contains("query set corrupted"));
    assert_eq!(client.connection_state(), ChannelState::Closed);

    // Outstanding mutations resolve with a closed-connection error.
    assert!(matches!(pending.outcome().await, Err(ClientError::Closed)));
}

#[tokio::test]
async fn malformed_frame_is_fatal() {
    trace_init();
    let (client, mut events) = new_client();
    let (connector, server) = LoopbackConnector::pair();
    client.connect_with(&connector).await.unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);

    server.outgoing.send("{not json".to_string()).unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::FatalError(_)
    ));
    assert_eq!(client.connection_state(), ChannelState::Closed);
}

#[tokio::test]
async fn version_skew_is_fatal() {
    trace_init();
    let (client, mut events) = new_client();
    let (connector, mut server) = LoopbackConnector::pair();
    client.subscribe("getCounter", vec![], |_| {}).unwrap();
    client.connect_with(&connector).await.unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
    next_client_message(&mut server).await;
    next_client_message(&mut server).await;

    // Starts at version 5, but the client has applied nothing yet.
    send(&server, &transition((5, "50"), (6, "51"), vec![updated(0, 1)]));

    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::FatalError(_)
    ));
}

#[tokio::test]
async fn unsubscribe_sends_a_removal_delta() {
    trace_init();
    let (client, _events) = new_client();
    let (connector, mut server) = LoopbackConnector::pair();
    client.connect_with(&connector).await.unwrap();
    next_client_message(&mut server).await; // Connect

    let subscription = client.subscribe("getCounter", vec![], |_| {}).unwrap();
    next_client_message(&mut server).await; // Add delta

    client.unsubscribe(subscription).unwrap();
    let message = next_client_message(&mut server).await;
    let ClientMessage::ModifyQuerySet(modification) = message else {
        panic!("expected ModifyQuerySet, got {message:?}");
    };
    assert_eq!(modification.base_version, 1);
    assert_eq!(modification.new_version, 2);
    assert_eq!(
        modification.modifications,
        vec![QuerySetChange::Remove { query_id: 0 }]
    );
}

#[tokio::test]
async fn reconnect_replays_the_query_set() {
    trace_init();
    let (client, mut events) = new_client();
    let (connector, mut server) = LoopbackConnector::pair();

    let (values_tx, mut values_rx) = mpsc::unbounded_channel();
    client
        .subscribe("getCounter", vec![], move |value| {
            let _ = values_tx.send(value);
        })
        .unwrap();
    client
        .subscribe("listMessages", vec![Value::String("general".into())], |_| {})
        .unwrap();

    client.connect_with(&connector).await.unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
    next_client_message(&mut server).await; // Connect
    next_client_message(&mut server).await; // Add getCounter
    next_client_message(&mut server).await; // Add listMessages

    send(&server, &transition((0, "0"), (2, "30"), vec![updated(0, 5)]));
    assert_eq!(values_rx.recv().await.unwrap().unwrap(), Some(Value::Integer(5)));

    // The server goes away; the client observes the close.
    drop(server);
    assert_eq!(next_event(&mut events).await, ClientEvent::Closed);
    assert_eq!(client.connection_state(), ChannelState::Closed);

    // Reconnect on a fresh pair: handshake with a bumped connection count,
    // then one modification re-adding the full query set from version zero.
    let (connector, mut server) = LoopbackConnector::pair();
    client.reconnect_with(&connector).await.unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);

    let handshake = next_client_message(&mut server).await;
    let ClientMessage::Connect {
        connection_count, ..
    } = handshake
    else {
        panic!("expected Connect, got {handshake:?}");
    };
    assert_eq!(connection_count, 1);

    let replay = next_client_message(&mut server).await;
    let ClientMessage::ModifyQuerySet(modification) = replay else {
        panic!("expected ModifyQuerySet, got {replay:?}");
    };
    assert_eq!(modification.base_version, 0);
    assert_eq!(modification.new_version, 1);
    assert_eq!(modification.modifications.len(), 2);
    assert!(matches!(
        modification.modifications[0],
        QuerySetChange::Add { query_id: 0, .. }
    ));
    assert!(matches!(
        modification.modifications[1],
        QuerySetChange::Add { query_id: 1, .. }
    ));

    // The fresh epoch accepts transitions from the initial version again.
    send(&server, &transition((0, "0"), (1, "40"), vec![updated(0, 7)]));
    assert_eq!(values_rx.recv().await.unwrap().unwrap(), Some(Value::Integer(7)));
}

/// A connector that fails a set number of times before delegating to a
/// loopback pair.
struct FlakyConnector {
    failures_left: AtomicU32,
    inner: LoopbackConnector,
}

#[async_trait::async_trait]
impl Connector for FlakyConnector {
    async fn connect(&self) -> ClientResult<(Box<dyn WireSink>, Box<dyn WireStream>)> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ClientError::transport_retryable("connection refused"));
        }
        self.inner.connect().await
    }
}

#[tokio::test]
async fn connect_with_retry_survives_transient_failures() {
    trace_init();
    let config = ClientConfig::new("https://a.example.cloud").with_retry(
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5)),
    );
    let (client, mut events) = SyncClient::new(config);

    let (inner, mut server) = LoopbackConnector::pair();
    let connector = FlakyConnector {
        failures_left: AtomicU32::new(2),
        inner,
    };

    client.connect_with_retry(&connector).await.unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
    assert!(matches!(
        next_client_message(&mut server).await,
        ClientMessage::Connect { .. }
    ));
}
