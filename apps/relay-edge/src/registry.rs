use std::collections::HashMap;

use metrics::{counter, gauge};
use relay_proto::{
    AdapterCommand, BroadcastPacket, CallbackMessage, ClientAck, ClientEvent, NewConnection,
    ServerFrame, ToBackend, DISCONNECT_EVENT,
};
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ConnectHook, ConnectInfo};
use crate::link::{AckFn, ClientLink};
use crate::outbox::Outbox;
use crate::rooms::Rooms;

struct Session {
    link: ClientLink,
    metadata: Map<String, Value>,
    pending: HashMap<u64, AckFn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Accepted optimistically; rolled back if no backend hears about it.
    Registered,
    /// The id was already live. Both connections were closed.
    Duplicate,
}

/// Live sessions of one channel on this worker.
///
/// Owned by the worker loop and mutated only from there.
/// What a `newConnection` delivery report meant for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Confirmed,
    /// No backend: the session was rolled back.
    Unreachable,
    /// Several backends received it; the session is kept.
    Contested,
    /// The connection was already replaced or removed.
    Stale,
}

pub(crate) struct Registry {
    channel: String,
    worker_id: String,
    sessions: HashMap<String, Session>,
    rooms: Rooms,
    next_callback_id: u64,
    outbox: Outbox,
    on_connect: Option<ConnectHook>,
}

impl Registry {
    pub(crate) fn new(
        channel: impl Into<String>,
        worker_id: impl Into<String>,
        outbox: Outbox,
        on_connect: Option<ConnectHook>,
    ) -> Self {
        Self {
            channel: channel.into(),
            worker_id: worker_id.into(),
            sessions: HashMap::new(),
            rooms: Rooms::default(),
            next_callback_id: 1,
            outbox,
            on_connect,
        }
    }

    pub(crate) fn channel(&self) -> &str {
        &self.channel
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    #[instrument(
        name = "registry_connect",
        skip_all,
        fields(channel = %self.channel, socket_id = %link.socket_id())
    )]
    pub(crate) fn connect(&mut self, link: ClientLink, info: &ConnectInfo) -> ConnectOutcome {
        let socket_id = link.socket_id().to_string();
        if let Some(existing) = self.sessions.remove(&socket_id) {
            // Rapid reconnects can surface one logical client twice.
            warn!(
                channel = %self.channel,
                %socket_id,
                "duplicate connect; dropping both connections"
            );
            self.rooms.forget(&socket_id);
            self.publish_disconnect(&socket_id);
            existing.link.close();
            link.close();
            self.record_size();
            return ConnectOutcome::Duplicate;
        }

        let metadata = self
            .on_connect
            .as_ref()
            .map(|hook| hook(info))
            .unwrap_or_default();
        let connection = link.connection();
        link.send(ServerFrame::Connected {
            socket_id: socket_id.clone(),
        });
        self.sessions.insert(
            socket_id.clone(),
            Session {
                link,
                metadata: metadata.clone(),
                pending: HashMap::new(),
            },
        );
        counter!("relay_edge_connections_total", 1, "channel" => self.channel.clone());
        self.record_size();

        self.outbox.new_connection(
            NewConnection {
                socket_id,
                channel: self.channel.clone(),
                additional_info: metadata,
            },
            connection,
        );
        ConnectOutcome::Registered
    }

    /// Roll back a session whose `newConnection` reached no backend.
    /// Act on how many backends received a session's `newConnection`.
    pub(crate) fn confirm_delivery(
        &mut self,
        socket_id: &str,
        connection: Uuid,
        subscribers: usize,
    ) -> Delivery {
        if !self.is_current(socket_id, connection) {
            return Delivery::Stale;
        }
        match subscribers {
            0 => {
                if let Some(session) = self.sessions.remove(socket_id) {
                    warn!(
                        channel = %self.channel,
                        %socket_id,
                        "backend unreachable; disconnecting new session"
                    );
                    let channel = self.channel.clone();
                    counter!("relay_edge_backend_unreachable_total", 1, "channel" => channel);
                    self.rooms.forget(socket_id);
                    session.link.close();
                    self.record_size();
                }
                Delivery::Unreachable
            }
            1 => Delivery::Confirmed,
            _ => {
                // Ownership is ambiguous; the session stays and the operator is told.
                error!(
                    channel = %self.channel,
                    %socket_id,
                    subscribers,
                    "more than one backend owns this channel"
                );
                let channel = self.channel.clone();
                counter!("relay_edge_backend_duplicate_total", 1, "channel" => channel);
                Delivery::Contested
            }
        }
    }

    pub(crate) fn client_event(
        &mut self,
        socket_id: &str,
        connection: Uuid,
        event: String,
        args: Vec<Value>,
        ack: Option<AckFn>,
    ) {
        if event == DISCONNECT_EVENT {
            warn!(
                channel = %self.channel,
                %socket_id,
                "client sent reserved event `disconnect`; ignored"
            );
            return;
        }
        if !self.is_current(socket_id, connection) {
            debug!(
                channel = %self.channel,
                %socket_id,
                %event,
                "event from unknown connection dropped"
            );
            return;
        }
        let mut message = ClientEvent::new(socket_id, &self.channel, event, args, &self.worker_id);
        if let Some(ack) = ack {
            let callback_id = self.next_callback_id;
            self.next_callback_id += 1;
            if let Some(session) = self.sessions.get_mut(socket_id) {
                session.pending.insert(callback_id, ack);
            }
            message = message.with_callback(callback_id);
        }
        self.outbox.send(ToBackend::ClientEvent(message));
    }

    /// A client's answer to an `emit_with_ack` from the backend.
    pub(crate) fn client_ack(
        &mut self,
        socket_id: &str,
        connection: Uuid,
        ack_id: u64,
        args: Vec<Value>,
    ) {
        if !self.is_current(socket_id, connection) {
            debug!(channel = %self.channel, %socket_id, "ack from unknown connection dropped");
            return;
        }
        self.outbox.send(ToBackend::ClientAck(ClientAck {
            socket_id: socket_id.to_string(),
            channel: self.channel.clone(),
            callback_id: ack_id,
            args,
        }));
    }

    /// Transport reported the connection gone. Returns false for a stale
    /// connection or a session that was already removed.
    pub(crate) fn disconnected(&mut self, socket_id: &str, connection: Uuid) -> bool {
        if !self.is_current(socket_id, connection) {
            return false;
        }
        if let Some(session) = self.sessions.remove(socket_id) {
            debug!(
                channel = %self.channel,
                %socket_id,
                metadata = ?session.metadata,
                orphaned_callbacks = session.pending.len(),
                "session removed"
            );
        }
        self.rooms.forget(socket_id);
        self.publish_disconnect(socket_id);
        self.record_size();
        true
    }

    pub(crate) fn resolve_callback(&mut self, message: CallbackMessage) -> bool {
        let callback = self
            .sessions
            .get_mut(&message.socket_id)
            .and_then(|session| session.pending.remove(&message.callback_id));
        match callback {
            Some(callback) => {
                counter!("relay_edge_callbacks_resolved_total", 1);
                callback(message.args);
                true
            }
            None => {
                counter!("relay_edge_callbacks_dropped_total", 1);
                debug!(
                    channel = %self.channel,
                    socket_id = %message.socket_id,
                    callback_id = message.callback_id,
                    "callback without a pending acknowledgment dropped"
                );
                false
            }
        }
    }

    /// The channel's backend is going away: drop every client without
    /// telling the backend.
    pub(crate) fn close_all(&mut self) -> usize {
        let count = self.sessions.len();
        for (_, session) in self.sessions.drain() {
            session.link.close();
        }
        self.rooms = Rooms::default();
        self.record_size();
        info!(channel = %self.channel, disconnected = count, "backend closed channel");
        count
    }

    /// Worker shutdown: disconnect every client and tell the backend.
    pub(crate) fn shutdown(&mut self) -> usize {
        let sessions: Vec<(String, Session)> = self.sessions.drain().collect();
        for (socket_id, session) in &sessions {
            self.publish_disconnect(socket_id);
            session.link.close();
        }
        self.rooms = Rooms::default();
        self.record_size();
        sessions.len()
    }

    /// Room commands for sockets held elsewhere are ignored.
    pub(crate) fn apply(&mut self, command: AdapterCommand) {
        match command {
            AdapterCommand::Broadcast(packet) => {
                self.deliver(packet);
            }
            AdapterCommand::Join { socket_id, room, .. } => {
                if self.sessions.contains_key(&socket_id) {
                    self.rooms.join(&room, &socket_id);
                }
            }
            AdapterCommand::Leave { socket_id, room, .. } => {
                self.rooms.leave(&room, &socket_id);
            }
            AdapterCommand::Disconnect { socket_id, close, .. } => {
                if let Some(session) = self.sessions.get(&socket_id) {
                    debug!(%socket_id, close, "remote disconnect");
                    // The transport reports the closed connection back,
                    // which publishes the backend disconnect.
                    session.link.close();
                }
            }
        }
    }

    /// Write a broadcast to every targeted local client; returns how many.
    pub(crate) fn deliver(&self, packet: BroadcastPacket) -> usize {
        let targets = self.rooms.targets(
            self.sessions.keys().map(String::as_str),
            &packet.rooms,
            &packet.except,
        );
        let mut delivered = 0;
        for socket_id in targets {
            if let Some(session) = self.sessions.get(socket_id) {
                let frame = ServerFrame::Event {
                    event: packet.event.clone(),
                    args: packet.args.clone(),
                    ack_id: packet.ack_id,
                };
                if session.link.send(frame) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    #[cfg(test)]
    pub(crate) fn metadata(&self, socket_id: &str) -> Option<&Map<String, Value>> {
        self.sessions.get(socket_id).map(|session| &session.metadata)
    }

    #[cfg(test)]
    pub(crate) fn pending_callbacks(&self, socket_id: &str) -> usize {
        self.sessions
            .get(socket_id)
            .map(|session| session.pending.len())
            .unwrap_or(0)
    }

    fn is_current(&self, socket_id: &str, connection: Uuid) -> bool {
        self.sessions
            .get(socket_id)
            .is_some_and(|session| session.link.connection() == connection)
    }

    fn publish_disconnect(&self, socket_id: &str) {
        self.outbox.send(ToBackend::ClientEvent(ClientEvent::disconnect(
            socket_id,
            &self.channel,
            &self.worker_id,
        )));
    }

    fn record_size(&self) {
        gauge!(
            "relay_edge_sessions_active",
            self.sessions.len() as f64,
            "channel" => self.channel.clone()
        );
    }
}
