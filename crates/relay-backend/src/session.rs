use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use relay_bus::{publish_json, Bus, BusResult, DeliveryReport};
use relay_proto::{BroadcastPacket, CallbackMessage, ToWorker, Topics, DISCONNECT_EVENT};
use serde_json::{Map, Value};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use crate::adapter::RoomAdapter;
use crate::error::{AckError, AdapterError, HandlerResult};

/// Everything a session or namespace needs to talk back to the edge.
pub(crate) struct Outlet {
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) adapter: Arc<dyn RoomAdapter>,
    pub(crate) topics: Topics,
    pub(crate) channel: String,
}

pub(crate) type EventHandler =
    Arc<dyn Fn(Vec<Value>, Option<Ack>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Listener key. `disconnect` is the one event the relay itself raises.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    Disconnect,
    Named(String),
}

impl EventKey {
    pub fn as_str(&self) -> &str {
        match self {
            EventKey::Disconnect => DISCONNECT_EVENT,
            EventKey::Named(name) => name,
        }
    }
}

impl From<&str> for EventKey {
    fn from(name: &str) -> Self {
        if name == DISCONNECT_EVENT {
            EventKey::Disconnect
        } else {
            EventKey::Named(name.to_string())
        }
    }
}

impl From<String> for EventKey {
    fn from(name: String) -> Self {
        if name == DISCONNECT_EVENT {
            EventKey::Disconnect
        } else {
            EventKey::Named(name)
        }
    }
}

/// Acknowledgment for a client event that asked for one.
///
/// Sending publishes a `callback` message to the edge worker that relayed
/// the event. Clones share the callback id; the edge resolves the first
/// delivery and drops the rest.
#[derive(Clone)]
pub struct Ack {
    bus: Arc<dyn Bus>,
    topic: String,
    namespace: String,
    socket_id: String,
    callback_id: u64,
}

impl Ack {
    pub(crate) fn new(
        outlet: &Outlet,
        worker_id: &str,
        socket_id: impl Into<String>,
        callback_id: u64,
    ) -> Self {
        Self {
            bus: Arc::clone(&outlet.bus),
            topic: outlet.topics.to_worker(worker_id),
            namespace: outlet.channel.clone(),
            socket_id: socket_id.into(),
            callback_id,
        }
    }

    pub fn callback_id(&self) -> u64 {
        self.callback_id
    }

    pub async fn send(self, args: Vec<Value>) -> BusResult<DeliveryReport> {
        let message = ToWorker::Callback(CallbackMessage {
            namespace: self.namespace,
            socket_id: self.socket_id,
            callback_id: self.callback_id,
            args,
        });
        let report = publish_json(self.bus.as_ref(), &self.topic, &message).await?;
        if !report.delivered() {
            debug!(topic = %self.topic, "acknowledgment reached no edge worker");
        }
        Ok(report)
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("topic", &self.topic)
            .field("socket_id", &self.socket_id)
            .field("callback_id", &self.callback_id)
            .finish()
    }
}

/// Backend-side stand-in for one client connection.
///
/// Cheap to clone; all clones refer to the same session. Lives until the
/// edge reports a disconnect or the channel is closed.
#[derive(Clone)]
pub struct VirtualSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: String,
    info: Map<String, Value>,
    outlet: Arc<Outlet>,
    listeners: Mutex<HashMap<EventKey, Vec<EventHandler>>>,
    callbacks: Mutex<HashMap<u64, oneshot::Sender<Vec<Value>>>>,
    next_callback_id: AtomicU64,
    closed: AtomicBool,
    abandon: Notify,
}

impl VirtualSession {
    pub(crate) fn new(id: String, info: Map<String, Value>, outlet: Arc<Outlet>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                info,
                outlet,
                listeners: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(HashMap::new()),
                next_callback_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                abandon: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn channel(&self) -> &str {
        &self.inner.outlet.channel
    }

    /// Properties the edge's connect hook attached.
    pub fn info(&self) -> &Map<String, Value> {
        &self.inner.info
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner.info.get(key)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register a listener. Listeners for the same event run in the order
    /// they were added.
    pub fn on<F, Fut>(&self, event: impl Into<EventKey>, handler: F) -> &Self
    where
        F: Fn(Vec<Value>, Option<Ack>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let key = event.into();
        if key.as_str().is_empty() {
            warn!(socket_id = %self.id(), "ignoring listener registered without an event name");
            return self;
        }
        if self.is_closed() {
            debug!(
                socket_id = %self.id(),
                event = key.as_str(),
                "listener added after close; ignored"
            );
            return self;
        }
        let handler: EventHandler =
            Arc::new(move |args: Vec<Value>, ack: Option<Ack>| handler(args, ack).boxed());
        self.inner
            .listeners
            .lock()
            .entry(key)
            .or_default()
            .push(handler);
        self
    }

    pub fn listener_count(&self, event: impl Into<EventKey>) -> usize {
        let key: EventKey = event.into();
        self.inner
            .listeners
            .lock()
            .get(&key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Send an event to this client only.
    pub async fn emit(
        &self,
        event: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<(), AdapterError> {
        self.inner.outlet.adapter.broadcast(self.own_room_packet(event, args)).await
    }

    /// Send an event and wait for the client to acknowledge it.
    pub async fn emit_with_ack(
        &self,
        event: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, AckError> {
        let (tx, rx) = oneshot::channel();
        let callback_id = {
            let mut callbacks = self.inner.callbacks.lock();
            // Checked under the lock so teardown cannot strand the sender.
            if self.is_closed() {
                return Err(AckError::SessionClosed);
            }
            let callback_id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
            callbacks.insert(callback_id, tx);
            callback_id
        };

        let mut packet = self.own_room_packet(event, args);
        packet.ack_id = Some(callback_id);
        if let Err(err) = self.inner.outlet.adapter.broadcast(packet).await {
            self.inner.callbacks.lock().remove(&callback_id);
            return Err(err.into());
        }
        rx.await.map_err(|_| AckError::SessionClosed)
    }

    pub fn pending_acks(&self) -> usize {
        self.inner.callbacks.lock().len()
    }

    pub async fn join(&self, room: &str) -> Result<(), AdapterError> {
        let outlet = &self.inner.outlet;
        outlet.adapter.remote_join(&outlet.channel, self.id(), room).await
    }

    pub async fn leave(&self, room: &str) -> Result<(), AdapterError> {
        let outlet = &self.inner.outlet;
        outlet.adapter.remote_leave(&outlet.channel, self.id(), room).await
    }

    /// Ask the edge to drop the client. The session itself goes away once
    /// the edge relays the resulting disconnect.
    pub async fn disconnect(&self, close: bool) -> Result<(), AdapterError> {
        let outlet = &self.inner.outlet;
        outlet.adapter.remote_disconnect(&outlet.channel, self.id(), close).await
    }

    /// Broadcast to `room`, skipping this client.
    pub fn to(&self, room: impl Into<String>) -> BroadcastOperator {
        self.broadcast().to(room)
    }

    /// Broadcast to the whole channel, this client included.
    pub fn to_channel(&self) -> BroadcastOperator {
        BroadcastOperator::new(Arc::clone(&self.inner.outlet))
    }

    /// Broadcast to the whole channel, skipping this client.
    pub fn broadcast(&self) -> BroadcastOperator {
        BroadcastOperator::new(Arc::clone(&self.inner.outlet)).except(self.id().to_string())
    }

    fn own_room_packet(&self, event: impl Into<String>, args: Vec<Value>) -> BroadcastPacket {
        let mut packet = BroadcastPacket::new(self.channel(), event, args);
        packet.rooms.push(self.id().to_string());
        packet
    }

    pub(crate) fn listeners_for(&self, key: &EventKey) -> Vec<EventHandler> {
        self.inner
            .listeners
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn resolve_ack(&self, callback_id: u64, args: Vec<Value>) -> bool {
        let pending = self.inner.callbacks.lock().remove(&callback_id);
        match pending {
            Some(tx) => tx.send(args).is_ok(),
            None => false,
        }
    }

    /// Wake a driver that is still stuck in middleware. The session stays
    /// open until its driver has dispatched the disconnect.
    pub(crate) fn abandon(&self) {
        self.inner.abandon.notify_one();
    }

    pub(crate) async fn abandoned(&self) {
        self.inner.abandon.notified().await
    }

    /// Drop listeners and fail every pending server-side ack.
    pub(crate) fn teardown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.listeners.lock().clear();
        self.inner.callbacks.lock().clear();
    }
}

impl fmt::Debug for VirtualSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualSession")
            .field("id", &self.inner.id)
            .field("channel", &self.inner.outlet.channel)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Room-addressed emit builder.
#[must_use = "a broadcast does nothing until `emit` is awaited"]
pub struct BroadcastOperator {
    outlet: Arc<Outlet>,
    rooms: Vec<String>,
    except: Vec<String>,
}

impl BroadcastOperator {
    pub(crate) fn new(outlet: Arc<Outlet>) -> Self {
        Self {
            outlet,
            rooms: Vec::new(),
            except: Vec::new(),
        }
    }

    pub fn to(mut self, room: impl Into<String>) -> Self {
        self.rooms.push(room.into());
        self
    }

    pub fn except(mut self, room: impl Into<String>) -> Self {
        self.except.push(room.into());
        self
    }

    pub async fn emit(
        self,
        event: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<(), AdapterError> {
        let mut packet = BroadcastPacket::new(self.outlet.channel.clone(), event, args);
        packet.rooms = self.rooms;
        packet.except = self.except;
        self.outlet.adapter.broadcast(packet).await
    }
}
