use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use relay_bus::{publish_json, recv_message, Bus, BusResult, DeliveryReport};
use relay_proto::{
    ClientAck, ClientEvent, CloseMessage, CustomMessage, NewConnection, ToBackend, ToWorker,
};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use crate::adapter::{BusRoomAdapter, RoomAdapter};
use crate::config::{BackendConfig, ErrorSink, Extensions};
use crate::error::{panic_message, AdapterError, DispatchError, HandlerResult};
use crate::middleware::{run_chain, ChainOutcome, Middleware, Next};
use crate::session::{Ack, BroadcastOperator, EventKey, Outlet, VirtualSession};

type ConnectionHandler =
    Arc<dyn Fn(VirtualSession) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// One channel's backend: the socket.io-style namespace a backend author
/// programs against.
#[derive(Clone)]
pub struct Namespace {
    shared: Arc<Shared>,
}

struct Shared {
    outlet: Arc<Outlet>,
    middlewares: RwLock<Vec<Middleware>>,
    connection_handlers: RwLock<Vec<ConnectionHandler>>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    error_sink: ErrorSink,
    extensions: Extensions,
}

struct SessionEntry {
    session: VirtualSession,
    work: mpsc::UnboundedSender<SessionWork>,
}

enum SessionWork {
    Event {
        event: String,
        args: Vec<Value>,
        ack: Option<Ack>,
    },
    Disconnect {
        args: Vec<Value>,
    },
}

impl Namespace {
    pub fn new(config: BackendConfig, bus: Arc<dyn Bus>) -> Self {
        let adapter = Arc::new(BusRoomAdapter::new(Arc::clone(&bus), &config.topics));
        Self::with_adapter(config, bus, adapter)
    }

    pub fn with_adapter(
        mut config: BackendConfig,
        bus: Arc<dyn Bus>,
        adapter: Arc<dyn RoomAdapter>,
    ) -> Self {
        let error_sink = config.error_sink();
        let BackendConfig {
            channel,
            topics,
            extensions,
            ..
        } = config;
        Self {
            shared: Arc::new(Shared {
                outlet: Arc::new(Outlet {
                    bus,
                    adapter,
                    topics,
                    channel,
                }),
                middlewares: RwLock::new(Vec::new()),
                connection_handlers: RwLock::new(Vec::new()),
                sessions: Mutex::new(HashMap::new()),
                error_sink,
                extensions,
            }),
        }
    }

    pub fn channel(&self) -> &str {
        &self.shared.outlet.channel
    }

    pub fn extension<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.shared.extensions.get::<T>()
    }

    /// Append a middleware. Only sessions that connect afterwards see it.
    pub fn use_middleware<F, Fut>(&self, middleware: F) -> &Self
    where
        F: Fn(VirtualSession) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Next> + Send + 'static,
    {
        let middleware: Middleware =
            Arc::new(move |session: VirtualSession| middleware(session).boxed());
        self.shared.middlewares.write().push(middleware);
        self
    }

    /// Called once per admitted session, after the middleware chain.
    pub fn on_connection<F, Fut>(&self, handler: F) -> &Self
    where
        F: Fn(VirtualSession) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: ConnectionHandler =
            Arc::new(move |session: VirtualSession| handler(session).boxed());
        self.shared.connection_handlers.write().push(handler);
        self
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    pub fn session(&self, socket_id: &str) -> Option<VirtualSession> {
        self.shared
            .sessions
            .lock()
            .get(socket_id)
            .map(|entry| entry.session.clone())
    }

    /// Emit to every client on the channel.
    pub async fn emit(
        &self,
        event: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<(), AdapterError> {
        self.broadcast_operator().emit(event, args).await
    }

    pub fn to(&self, room: impl Into<String>) -> BroadcastOperator {
        self.broadcast_operator().to(room)
    }

    pub fn except(&self, room: impl Into<String>) -> BroadcastOperator {
        self.broadcast_operator().except(room)
    }

    fn broadcast_operator(&self) -> BroadcastOperator {
        BroadcastOperator::new(Arc::clone(&self.shared.outlet))
    }

    /// Tell every edge worker to drop this channel's clients, e.g. before a
    /// planned backend shutdown.
    pub async fn close(&self) -> BusResult<DeliveryReport> {
        let outlet = &self.shared.outlet;
        let message = ToWorker::Close(CloseMessage {
            namespace: outlet.channel.clone(),
        });
        let report =
            publish_json(outlet.bus.as_ref(), &outlet.topics.to_all_workers(), &message).await?;
        info!(
            channel = %outlet.channel,
            subscribers = report.subscribers,
            "published close for channel"
        );
        Ok(report)
    }

    /// Fan a free-form message out to every edge worker's custom handler.
    pub async fn publish_custom(
        &self,
        mut fields: Map<String, Value>,
    ) -> BusResult<DeliveryReport> {
        if fields.remove("type").is_some() {
            warn!("custom message field `type` is reserved; dropped");
        }
        let outlet = &self.shared.outlet;
        let message = ToWorker::Custom(CustomMessage { fields });
        publish_json(outlet.bus.as_ref(), &outlet.topics.to_all_workers(), &message).await
    }

    /// Subscribe to the channel's inbound topic and the worker broadcast
    /// topic, then dispatch until the bus goes away.
    pub async fn listen(&self) -> BusResult<JoinHandle<()>> {
        let outlet = &self.shared.outlet;
        let mut inbound = outlet
            .bus
            .subscribe(&outlet.topics.to_backend(&outlet.channel))
            .await?;
        let mut control = outlet.bus.subscribe(&outlet.topics.to_all_workers()).await?;
        info!(channel = %outlet.channel, "backend listening");

        let namespace = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = recv_message(&mut inbound) => match message {
                        Some(message) => namespace.handle_payload(&message.payload),
                        None => break,
                    },
                    message = recv_message(&mut control) => match message {
                        Some(message) => namespace.handle_control(&message.payload),
                        None => break,
                    },
                }
            }
            warn!(channel = %namespace.channel(), "bus subscription closed; backend stopped");
        }))
    }

    pub fn handle_payload(&self, payload: &[u8]) {
        match ToBackend::decode(payload) {
            Ok(message) => self.dispatch(message),
            Err(err) => {
                warn!(channel = %self.channel(), error = %err, "discarding toBackend message")
            }
        }
    }

    pub fn handle_control(&self, payload: &[u8]) {
        match ToWorker::decode(payload) {
            Ok(ToWorker::Close(CloseMessage { namespace })) if namespace == self.channel() => {
                self.close_sessions();
            }
            Ok(_) => {}
            Err(err) => {
                warn!(channel = %self.channel(), error = %err, "discarding toWorker message")
            }
        }
    }

    /// Apply one inbound message. Must run inside a tokio runtime.
    #[instrument(
        level = "debug",
        skip_all,
        fields(channel = %self.channel(), kind = message.kind(), socket_id = %message.socket_id())
    )]
    pub fn dispatch(&self, message: ToBackend) {
        if message.channel() != self.channel() {
            debug!(
                channel = %self.channel(),
                addressed = %message.channel(),
                "message for another channel dropped"
            );
            return;
        }
        match message {
            ToBackend::NewConnection(msg) => self.open_session(msg),
            ToBackend::ClientEvent(msg) => self.relay_event(msg),
            ToBackend::ClientAck(msg) => self.resolve_client_ack(msg),
        }
    }

    /// Tear down every virtual session on the channel.
    pub fn close_sessions(&self) -> usize {
        let drained: Vec<SessionEntry> = self
            .shared
            .sessions
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let count = drained.len();
        for entry in drained {
            retire(entry, Vec::new());
        }
        info!(
            channel = %self.channel(),
            sessions = count,
            "channel closed; virtual sessions torn down"
        );
        count
    }

    fn open_session(&self, msg: NewConnection) {
        let NewConnection {
            socket_id,
            additional_info,
            ..
        } = msg;
        let session = VirtualSession::new(
            socket_id.clone(),
            additional_info,
            Arc::clone(&self.shared.outlet),
        );
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let previous = self.shared.sessions.lock().insert(
            socket_id.clone(),
            SessionEntry {
                session: session.clone(),
                work: work_tx,
            },
        );
        if let Some(previous) = previous {
            warn!(%socket_id, "newConnection for a live session; replacing it");
            retire(previous, Vec::new());
        }

        let chain = self.shared.middlewares.read().clone();
        let handlers = self.shared.connection_handlers.read().clone();
        let span = info_span!("virtual_session", channel = %self.channel(), %socket_id);
        tokio::spawn(
            drive(
                session,
                chain,
                handlers,
                work_rx,
                Arc::clone(&self.shared.error_sink),
            )
            .instrument(span),
        );
        debug!(channel = %self.channel(), %socket_id, "virtual session opened");
    }

    fn relay_event(&self, msg: ClientEvent) {
        let ack = msg
            .callback_id
            .map(|id| Ack::new(&self.shared.outlet, &msg.worker_id, msg.socket_id.clone(), id));

        if msg.is_disconnect() {
            let entry = self.shared.sessions.lock().remove(&msg.socket_id);
            match entry {
                Some(entry) => retire(entry, msg.args),
                None => debug!(socket_id = %msg.socket_id, "disconnect for unknown session"),
            }
            return;
        }

        let sessions = self.shared.sessions.lock();
        let Some(entry) = sessions.get(&msg.socket_id) else {
            // The session is already gone; a disconnect raced this event.
            debug!(
                socket_id = %msg.socket_id,
                event = %msg.event,
                "event for unknown session dropped"
            );
            return;
        };
        let work = SessionWork::Event {
            event: msg.event,
            args: msg.args,
            ack,
        };
        if entry.work.send(work).is_err() {
            debug!(socket_id = %msg.socket_id, "session driver already finished");
        }
    }

    fn resolve_client_ack(&self, msg: ClientAck) {
        let Some(session) = self.session(&msg.socket_id) else {
            debug!(socket_id = %msg.socket_id, "client ack for unknown session dropped");
            return;
        };
        if !session.resolve_ack(msg.callback_id, msg.args) {
            debug!(
                socket_id = %msg.socket_id,
                callback_id = msg.callback_id,
                "client ack without a pending emit"
            );
        }
    }
}

fn retire(entry: SessionEntry, args: Vec<Value>) {
    entry.session.abandon();
    // Dropping the entry closes the queue after the disconnect.
    let _ = entry.work.send(SessionWork::Disconnect { args });
}

/// Owns one session for its whole life: middleware, connection handlers,
/// then inbound events in arrival order until disconnect.
async fn drive(
    session: VirtualSession,
    chain: Vec<Middleware>,
    handlers: Vec<ConnectionHandler>,
    mut work: mpsc::UnboundedReceiver<SessionWork>,
    sink: ErrorSink,
) {
    let outcome = tokio::select! {
        biased;
        outcome = run_chain(&session, &chain) => outcome,
        _ = session.abandoned() => {
            debug!(socket_id = %session.id(), "session closed while middleware was pending");
            session.teardown();
            return;
        }
    };

    match outcome {
        ChainOutcome::Admitted => {
            for handler in handlers {
                let connected = session.clone();
                let connect = async move { handler(connected).await };
                guarded(&session, "connection", connect, &sink).await;
            }
        }
        ChainOutcome::Halted { index } => {
            debug!(socket_id = %session.id(), index, "middleware halted the chain");
        }
        ChainOutcome::Rejected { index, error } => {
            debug!(
                socket_id = %session.id(),
                index,
                error = %error,
                "middleware rejected the connection"
            );
        }
        ChainOutcome::Panicked { index, message } => {
            sink(DispatchError::Panicked {
                socket_id: session.id().to_string(),
                event: format!("middleware #{index}"),
                message,
            });
        }
    }

    while let Some(item) = work.recv().await {
        match item {
            SessionWork::Event { event, args, ack } => {
                dispatch_event(&session, EventKey::from(event), args, ack, &sink).await;
            }
            SessionWork::Disconnect { args } => {
                dispatch_event(&session, EventKey::Disconnect, args, None, &sink).await;
                break;
            }
        }
    }
    session.teardown();
    debug!(socket_id = %session.id(), "virtual session closed");
}

async fn dispatch_event(
    session: &VirtualSession,
    key: EventKey,
    args: Vec<Value>,
    ack: Option<Ack>,
    sink: &ErrorSink,
) {
    let listeners = session.listeners_for(&key);
    if listeners.is_empty() {
        debug!(socket_id = %session.id(), event = key.as_str(), "no listeners for event");
        return;
    }
    for listener in listeners {
        let args = args.clone();
        let ack = ack.clone();
        guarded(session, key.as_str(), async move { listener(args, ack).await }, sink).await;
    }
}

async fn guarded<F>(session: &VirtualSession, event: &str, handler: F, sink: &ErrorSink)
where
    F: Future<Output = HandlerResult>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(source)) => sink(DispatchError::Handler {
            socket_id: session.id().to_string(),
            event: event.to_string(),
            source,
        }),
        Err(payload) => sink(DispatchError::Panicked {
            socket_id: session.id().to_string(),
            event: event.to_string(),
            message: panic_message(payload.as_ref()),
        }),
    }
}
