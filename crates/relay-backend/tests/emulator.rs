use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_backend::{
    AckError, BackendConfig, DispatchError, HandlerError, Namespace, Next, VirtualSession,
};
use relay_bus::{publish_json, recv_message, Bus, BusMessage, LocalBus};
use relay_proto::{
    AdapterCommand, ClientAck, ClientEvent, NewConnection, ToBackend, ToWorker, Topics,
};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc};

const CHANNEL: &str = "/chat";
const WORKER: &str = "worker-a";

struct Harness {
    bus: Arc<LocalBus>,
    topics: Topics,
    namespace: Namespace,
    adapter: broadcast::Receiver<BusMessage>,
    worker: broadcast::Receiver<BusMessage>,
}

impl Harness {
    async fn new(config: BackendConfig) -> Self {
        let bus = Arc::new(LocalBus::new());
        let topics = config.topics.clone();
        let adapter = bus.subscribe(&topics.adapter()).await.expect("adapter sub");
        let worker = bus.subscribe(&topics.to_worker(WORKER)).await.expect("worker sub");
        let namespace = Namespace::new(config, bus.clone() as Arc<dyn Bus>);
        Self {
            bus,
            topics,
            namespace,
            adapter,
            worker,
        }
    }

    async fn listen(&self) {
        self.namespace.listen().await.expect("listen");
    }

    async fn send(&self, message: ToBackend) {
        publish_json(self.bus.as_ref(), &self.topics.to_backend(CHANNEL), &message)
            .await
            .expect("publish");
    }

    async fn connect(&self, socket_id: &str) {
        self.connect_with(socket_id, Map::new()).await;
    }

    async fn connect_with(&self, socket_id: &str, additional_info: Map<String, Value>) {
        self.send(ToBackend::NewConnection(NewConnection {
            socket_id: socket_id.to_string(),
            channel: CHANNEL.to_string(),
            additional_info,
        }))
        .await;
    }

    async fn event(&self, socket_id: &str, event: &str, args: Vec<Value>) {
        self.send(ToBackend::ClientEvent(ClientEvent::new(
            socket_id, CHANNEL, event, args, WORKER,
        )))
        .await;
    }

    async fn disconnect(&self, socket_id: &str) {
        self.send(ToBackend::ClientEvent(ClientEvent::disconnect(
            socket_id, CHANNEL, WORKER,
        )))
        .await;
    }

    async fn next_command(&mut self) -> AdapterCommand {
        let message = recv_message(&mut self.adapter).await.expect("adapter topic");
        AdapterCommand::decode(&message.payload).expect("adapter command")
    }

    async fn next_to_worker(&mut self) -> ToWorker {
        let message = recv_message(&mut self.worker).await.expect("worker topic");
        ToWorker::decode(&message.payload).expect("toWorker message")
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn counting_sink(config: BackendConfig) -> (BackendConfig, Arc<Mutex<Vec<DispatchError>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let config = config.with_error_sink(move |err| sink.lock().push(err));
    (config, errors)
}

#[test_timeout::tokio_timeout_test]
async fn middleware_runs_in_order_before_connection_handlers() {
    let harness = Harness::new(BackendConfig::new(CHANNEL)).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    for name in ["first", "second"] {
        let log = log.clone();
        harness.namespace.use_middleware(move |_session: VirtualSession| {
            let log = log.clone();
            async move {
                log.lock().push(name);
                Next::Continue
            }
        });
    }
    let handler_log = log.clone();
    harness.namespace.on_connection(move |session: VirtualSession| {
        let log = handler_log.clone();
        let done = done_tx.clone();
        async move {
            log.lock().push("connection");
            let _ = done.send(session.id().to_string());
            Ok(())
        }
    });
    harness.listen().await;

    harness.connect("s1").await;
    assert_eq!(done_rx.recv().await.as_deref(), Some("s1"));
    assert_eq!(*log.lock(), vec!["first", "second", "connection"]);
    assert_eq!(harness.namespace.session_count(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn halted_chain_keeps_session_but_skips_connection_handlers() {
    let (config, errors) = counting_sink(BackendConfig::new(CHANNEL));
    let harness = Harness::new(config).await;
    let later = Arc::new(AtomicUsize::new(0));
    let connected = Arc::new(AtomicUsize::new(0));
    let (halted_tx, mut halted_rx) = mpsc::unbounded_channel();

    harness.namespace.use_middleware(move |_session: VirtualSession| {
        let halted = halted_tx.clone();
        async move {
            let _ = halted.send(());
            Next::Halt
        }
    });
    let later_calls = later.clone();
    harness.namespace.use_middleware(move |_session: VirtualSession| {
        later_calls.fetch_add(1, Ordering::SeqCst);
        async { Next::Continue }
    });
    let connected_calls = connected.clone();
    harness.namespace.on_connection(move |_session: VirtualSession| {
        connected_calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    });
    harness.listen().await;

    harness.connect("s1").await;
    halted_rx.recv().await.expect("middleware ran");
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(later.load(Ordering::SeqCst), 0);
    assert_eq!(connected.load(Ordering::SeqCst), 0);
    assert_eq!(harness.namespace.session_count(), 1);
    assert!(errors.lock().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn rejected_connection_is_not_reported_as_handler_error() {
    let (config, errors) = counting_sink(BackendConfig::new(CHANNEL));
    let harness = Harness::new(config).await;
    let connected = Arc::new(AtomicUsize::new(0));
    let (rejected_tx, mut rejected_rx) = mpsc::unbounded_channel();

    harness.namespace.use_middleware(move |_session: VirtualSession| {
        let rejected = rejected_tx.clone();
        async move {
            let _ = rejected.send(());
            Next::Reject("banned".into())
        }
    });
    let connected_calls = connected.clone();
    harness.namespace.on_connection(move |_session: VirtualSession| {
        connected_calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    });
    harness.listen().await;

    harness.connect("s1").await;
    rejected_rx.recv().await.expect("middleware ran");
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(connected.load(Ordering::SeqCst), 0);
    assert!(errors.lock().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn acknowledgment_goes_to_the_relaying_worker() {
    let mut harness = Harness::new(BackendConfig::new(CHANNEL)).await;
    harness.namespace.on_connection(|session: VirtualSession| async move {
        session.on("ping", |_args: Vec<Value>, ack| async move {
            if let Some(ack) = ack {
                ack.send(vec![json!("pong")]).await?;
            }
            Ok::<_, HandlerError>(())
        });
        Ok(())
    });
    harness.listen().await;

    harness.connect("s1").await;
    harness
        .send(ToBackend::ClientEvent(
            ClientEvent::new("s1", CHANNEL, "ping", Vec::new(), WORKER).with_callback(7),
        ))
        .await;

    match harness.next_to_worker().await {
        ToWorker::Callback(callback) => {
            assert_eq!(callback.namespace, CHANNEL);
            assert_eq!(callback.socket_id, "s1");
            assert_eq!(callback.callback_id, 7);
            assert_eq!(callback.args, vec![json!("pong")]);
        }
        other => panic!("expected callback, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn listeners_run_in_registration_order_with_event_args() {
    let harness = Harness::new(BackendConfig::new(CHANNEL)).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let listener_seen = seen.clone();
    harness.namespace.on_connection(move |session: VirtualSession| {
        let seen = listener_seen.clone();
        let done = done_tx.clone();
        async move {
            for tag in ["a", "b"] {
                let seen = seen.clone();
                let done = done.clone();
                session.on("postMessage", move |args: Vec<Value>, _ack| {
                    let seen = seen.clone();
                    let done = done.clone();
                    async move {
                        seen.lock().push((tag, args));
                        if tag == "b" {
                            let _ = done.send(());
                        }
                        Ok(())
                    }
                });
            }
            Ok(())
        }
    });
    harness.listen().await;

    harness.connect("s1").await;
    harness.event("s1", "postMessage", vec![json!("hello")]).await;
    done_rx.recv().await.expect("listeners ran");

    assert_eq!(
        *seen.lock(),
        vec![("a", vec![json!("hello")]), ("b", vec![json!("hello")])]
    );
}

#[test_timeout::tokio_timeout_test]
async fn event_for_unknown_session_is_dropped() {
    let (config, errors) = counting_sink(BackendConfig::new(CHANNEL));
    let harness = Harness::new(config).await;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    harness.namespace.on_connection(move |session: VirtualSession| {
        let done = done_tx.clone();
        async move {
            session.on("hello", move |_args: Vec<Value>, _ack| {
                let done = done.clone();
                async move {
                    let _ = done.send(());
                    Ok(())
                }
            });
            Ok(())
        }
    });
    harness.listen().await;

    harness.event("ghost", "hello", Vec::new()).await;
    harness.connect("s1").await;
    harness.event("s1", "hello", Vec::new()).await;

    done_rx.recv().await.expect("live session handled its event");
    assert_eq!(harness.namespace.session_count(), 1);
    assert!(harness.namespace.session("ghost").is_none());
    assert!(errors.lock().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn disconnect_runs_listeners_and_removes_session() {
    let harness = Harness::new(BackendConfig::new(CHANNEL)).await;
    let (gone_tx, mut gone_rx) = mpsc::unbounded_channel();
    harness.namespace.on_connection(move |session: VirtualSession| {
        let gone = gone_tx.clone();
        let id = session.id().to_string();
        async move {
            session.on("disconnect", move |_args: Vec<Value>, _ack| {
                let gone = gone.clone();
                let id = id.clone();
                async move {
                    let _ = gone.send(id);
                    Ok(())
                }
            });
            Ok(())
        }
    });
    harness.listen().await;

    harness.connect("s1").await;
    wait_until(|| harness.namespace.session_count() == 1).await;
    let session = harness.namespace.session("s1").expect("registered");
    harness.disconnect("s1").await;

    assert_eq!(gone_rx.recv().await.as_deref(), Some("s1"));
    assert_eq!(harness.namespace.session_count(), 0);
    wait_until(|| session.listener_count("disconnect") == 0).await;
    assert!(session.is_closed());
}

#[test_timeout::tokio_timeout_test]
async fn disconnect_right_after_connect_still_reaches_handler_listeners() {
    const ROUNDS: usize = 50;
    let harness = Harness::new(BackendConfig::new(CHANNEL)).await;
    let connected = Arc::new(AtomicUsize::new(0));
    let departed = Arc::new(AtomicUsize::new(0));
    let (connected_count, departed_count) = (connected.clone(), departed.clone());
    harness.namespace.on_connection(move |session: VirtualSession| {
        let connected = connected_count.clone();
        let departed = departed_count.clone();
        async move {
            connected.fetch_add(1, Ordering::SeqCst);
            session.on("disconnect", move |_args: Vec<Value>, _ack| {
                let departed = departed.clone();
                async move {
                    departed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            Ok(())
        }
    });

    for round in 0..ROUNDS {
        let socket_id = format!("s{round}");
        harness.namespace.dispatch(ToBackend::NewConnection(NewConnection {
            socket_id: socket_id.clone(),
            channel: CHANNEL.to_string(),
            additional_info: Map::new(),
        }));
        harness.namespace.dispatch(ToBackend::ClientEvent(ClientEvent::disconnect(
            socket_id, CHANNEL, WORKER,
        )));
    }

    wait_until(|| departed.load(Ordering::SeqCst) == ROUNDS).await;
    assert_eq!(connected.load(Ordering::SeqCst), ROUNDS);
    assert_eq!(harness.namespace.session_count(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn close_for_channel_tears_down_every_session() {
    let harness = Harness::new(BackendConfig::new(CHANNEL)).await;
    harness.listen().await;
    for id in ["s1", "s2", "s3"] {
        harness.connect(id).await;
    }
    wait_until(|| harness.namespace.session_count() == 3).await;

    let report = harness.namespace.close().await.expect("close");
    assert!(report.delivered());
    wait_until(|| harness.namespace.session_count() == 0).await;
}

#[test_timeout::tokio_timeout_test]
async fn close_for_another_channel_is_ignored() {
    let harness = Harness::new(BackendConfig::new(CHANNEL)).await;
    harness.listen().await;
    harness.connect("s1").await;
    wait_until(|| harness.namespace.session_count() == 1).await;

    harness
        .namespace
        .handle_control(br#"{"type":"close","namespace":"/other"}"#);
    assert_eq!(harness.namespace.session_count(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn emit_with_ack_resolves_from_client_ack() {
    let mut harness = Harness::new(BackendConfig::new(CHANNEL)).await;
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    harness.namespace.on_connection(move |session: VirtualSession| {
        let reply = reply_tx.clone();
        async move {
            let args = session.emit_with_ack("confirm", vec![json!(1)]).await?;
            let _ = reply.send(args);
            Ok::<_, HandlerError>(())
        }
    });
    harness.listen().await;
    harness.connect("s1").await;

    let packet = match harness.next_command().await {
        AdapterCommand::Broadcast(packet) => packet,
        other => panic!("expected broadcast, got {other:?}"),
    };
    assert_eq!(packet.rooms, vec!["s1".to_string()]);
    assert_eq!(packet.event, "confirm");
    let callback_id = packet.ack_id.expect("ack id");

    harness
        .send(ToBackend::ClientAck(ClientAck {
            socket_id: "s1".into(),
            channel: CHANNEL.into(),
            callback_id,
            args: vec![json!("ok")],
        }))
        .await;
    assert_eq!(reply_rx.recv().await, Some(vec![json!("ok")]));
}

#[test_timeout::tokio_timeout_test]
async fn pending_emit_with_ack_fails_when_session_closes() {
    let mut harness = Harness::new(BackendConfig::new(CHANNEL)).await;
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    harness.namespace.on_connection(move |session: VirtualSession| {
        let result = result_tx.clone();
        async move {
            tokio::spawn(async move {
                let outcome = session.emit_with_ack("confirm", Vec::new()).await;
                let _ = result.send(outcome);
            });
            Ok(())
        }
    });
    harness.listen().await;
    harness.connect("s1").await;
    let _ = harness.next_command().await;

    harness.disconnect("s1").await;
    match result_rx.recv().await {
        Some(Err(AckError::SessionClosed)) => {}
        other => panic!("expected SessionClosed, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn handler_failures_reach_the_error_sink_and_session_survives() {
    let (config, errors) = counting_sink(BackendConfig::new(CHANNEL));
    let harness = Harness::new(config).await;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    harness.namespace.on_connection(move |session: VirtualSession| {
        let done = done_tx.clone();
        async move {
            session.on("fail", |_args: Vec<Value>, _ack| async { Err("boom".into()) });
            session.on("explode", |_args: Vec<Value>, _ack| async {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            });
            session.on("after", move |_args: Vec<Value>, _ack| {
                let done = done.clone();
                async move {
                    let _ = done.send(());
                    Ok(())
                }
            });
            Ok(())
        }
    });
    harness.listen().await;

    harness.connect("s1").await;
    harness.event("s1", "fail", Vec::new()).await;
    harness.event("s1", "explode", Vec::new()).await;
    harness.event("s1", "after", Vec::new()).await;
    done_rx.recv().await.expect("later event handled");

    let errors = errors.lock();
    assert_eq!(errors.len(), 2);
    assert!(matches!(&errors[0], DispatchError::Handler { event, .. } if event == "fail"));
    assert!(
        matches!(
            &errors[1],
            DispatchError::Panicked { event, message, .. }
                if event == "explode" && message == "kaboom"
        )
    );
}

#[test_timeout::tokio_timeout_test]
async fn stalled_middleware_is_abandoned_on_disconnect() {
    let harness = Harness::new(BackendConfig::new(CHANNEL)).await;
    harness
        .namespace
        .use_middleware(|_session: VirtualSession| futures::future::pending::<Next>());
    harness.listen().await;

    harness.connect("s1").await;
    wait_until(|| harness.namespace.session_count() == 1).await;
    let session = harness.namespace.session("s1").expect("registered");

    harness.disconnect("s1").await;
    wait_until(|| harness.namespace.session_count() == 0).await;
    wait_until(|| session.is_closed()).await;
}

#[test_timeout::tokio_timeout_test]
async fn connection_info_is_visible_to_middleware() {
    let harness = Harness::new(BackendConfig::new(CHANNEL)).await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    harness.namespace.use_middleware(move |session: VirtualSession| {
        let seen = seen_tx.clone();
        async move {
            let _ = seen.send(session.get("username").cloned());
            Next::Continue
        }
    });
    harness.listen().await;

    let mut info = Map::new();
    info.insert("username".into(), json!("ada"));
    harness.connect_with("s1", info).await;
    assert_eq!(seen_rx.recv().await, Some(Some(json!("ada"))));
}

#[test_timeout::tokio_timeout_test]
async fn duplicate_connection_replaces_the_session() {
    let harness = Harness::new(BackendConfig::new(CHANNEL)).await;
    harness.listen().await;

    harness.connect("s1").await;
    wait_until(|| harness.namespace.session_count() == 1).await;
    let first = harness.namespace.session("s1").expect("first");

    harness.connect("s1").await;
    wait_until(|| first.is_closed()).await;
    let second = harness.namespace.session("s1").expect("second");
    assert!(!second.is_closed());
    assert_eq!(harness.namespace.session_count(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn custom_messages_fan_out_to_all_workers() {
    let harness = Harness::new(BackendConfig::new(CHANNEL)).await;
    let mut all = harness
        .bus
        .subscribe(&harness.topics.to_all_workers())
        .await
        .expect("subscribe");

    let mut fields = Map::new();
    fields.insert("type".into(), json!("spoofed"));
    fields.insert("motd".into(), json!("maintenance at noon"));
    harness.namespace.publish_custom(fields).await.expect("publish");

    let message = recv_message(&mut all).await.expect("message");
    match ToWorker::decode(&message.payload).expect("decode") {
        ToWorker::Custom(custom) => {
            assert_eq!(custom.fields.get("motd"), Some(&json!("maintenance at noon")));
        }
        other => panic!("expected custom, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn namespace_emit_targets_the_whole_channel() {
    let mut harness = Harness::new(BackendConfig::new(CHANNEL)).await;
    harness
        .namespace
        .to("lobby")
        .except("s2")
        .emit("chatMessage", vec![json!("hi")])
        .await
        .expect("emit");

    match harness.next_command().await {
        AdapterCommand::Broadcast(packet) => {
            assert_eq!(packet.namespace, CHANNEL);
            assert_eq!(packet.rooms, vec!["lobby".to_string()]);
            assert_eq!(packet.except, vec!["s2".to_string()]);
            assert_eq!(packet.ack_id, None);
        }
        other => panic!("expected broadcast, got {other:?}"),
    }
}
