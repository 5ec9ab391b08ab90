use std::sync::Arc;

use relay_bus::{recv_message, Bus, BusMessage};
use relay_proto::{AdapterCommand, CloseMessage, CustomMessage, ToWorker};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ConnectInfo, CustomHandler, WorkerConfig};
use crate::error::EdgeError;
use crate::link::{AckFn, ClientLink};
use crate::outbox::{DeliveryNotice, Outbox};
use crate::registry::Registry;

/// Notifications from the client transport, one per connection lifecycle
/// step or inbound frame.
pub enum TransportEvent {
    Connected {
        channel: String,
        link: ClientLink,
        info: ConnectInfo,
    },
    Event {
        channel: String,
        socket_id: String,
        connection: Uuid,
        event: String,
        args: Vec<Value>,
        ack: Option<AckFn>,
    },
    Ack {
        channel: String,
        socket_id: String,
        connection: Uuid,
        ack_id: u64,
        args: Vec<Value>,
    },
    Disconnected {
        channel: String,
        socket_id: String,
        connection: Uuid,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub channel: String,
    pub sessions: usize,
}

enum Command {
    Transport(TransportEvent),
    Stats(oneshot::Sender<Vec<ChannelStats>>),
    Shutdown(oneshot::Sender<usize>),
}

/// Cloneable way into a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    worker_id: Arc<str>,
    channels: Arc<[String]>,
    commands: mpsc::UnboundedSender<Command>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn serves(&self, channel: &str) -> bool {
        self.channels.iter().any(|served| served == channel)
    }

    /// False once the worker has stopped.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.commands.send(Command::Transport(event)).is_ok()
    }

    pub async fn stats(&self) -> Option<Vec<ChannelStats>> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Stats(reply)).ok()?;
        rx.await.ok()
    }

    /// Disconnect every client, notify the backends and stop. Resolves with
    /// the number of sessions dropped once the disconnects are published.
    pub async fn shutdown(&self) -> Option<usize> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Shutdown(reply)).ok()?;
        rx.await.ok()
    }
}

/// A running edge worker.
pub struct EdgeWorker {
    handle: WorkerHandle,
    task: JoinHandle<()>,
}

impl EdgeWorker {
    /// Subscribe to this worker's topics and start the event loop. The
    /// subscriptions are live when this returns.
    pub async fn start(config: WorkerConfig, bus: Arc<dyn Bus>) -> Result<Self, EdgeError> {
        config.validate()?;
        let WorkerConfig {
            worker_id,
            channels,
            topics,
            stats_interval,
            on_connect,
            on_custom,
            ..
        } = config;

        let directed = bus.subscribe(&topics.to_worker(&worker_id)).await?;
        let broadcast = bus.subscribe(&topics.to_all_workers()).await?;
        let adapter = bus.subscribe(&topics.adapter()).await?;

        let (notice_tx, notices) = mpsc::unbounded_channel();
        let (outbox, outbox_task) = Outbox::spawn(bus, topics, notice_tx);
        let registries = channels
            .iter()
            .map(|channel| {
                Registry::new(
                    channel.clone(),
                    worker_id.clone(),
                    outbox.clone(),
                    on_connect.clone(),
                )
            })
            .collect();
        let stats = stats_interval.map(|period| time::interval_at(Instant::now() + period, period));

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let handle = WorkerHandle {
            worker_id: Arc::from(worker_id.as_str()),
            channels: Arc::from(channels.clone()),
            commands: commands_tx,
        };
        info!(%worker_id, ?channels, "edge worker started");

        let worker = WorkerLoop {
            worker_id,
            registries,
            on_custom,
        };
        let task = tokio::spawn(worker.run(Inputs {
            commands,
            notices,
            directed,
            broadcast,
            adapter,
            stats,
            outbox_task,
        }));
        Ok(Self { handle, task })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Wait for the loop to finish, e.g. after [`WorkerHandle::shutdown`].
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(error = %err, "edge worker task failed");
        }
    }
}

struct Inputs {
    commands: mpsc::UnboundedReceiver<Command>,
    notices: mpsc::UnboundedReceiver<DeliveryNotice>,
    directed: broadcast::Receiver<BusMessage>,
    broadcast: broadcast::Receiver<BusMessage>,
    adapter: broadcast::Receiver<BusMessage>,
    stats: Option<Interval>,
    outbox_task: JoinHandle<()>,
}

struct WorkerLoop {
    worker_id: String,
    registries: Vec<Registry>,
    on_custom: Option<CustomHandler>,
}

impl WorkerLoop {
    async fn run(mut self, inputs: Inputs) {
        let Inputs {
            mut commands,
            mut notices,
            mut directed,
            mut broadcast,
            mut adapter,
            mut stats,
            outbox_task,
        } = inputs;

        let reply = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Transport(event)) => self.on_transport(event),
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(Command::Shutdown(reply)) => break Some(reply),
                    None => break None,
                },
                Some(notice) = notices.recv() => self.on_delivery(notice),
                message = recv_message(&mut directed) => match message {
                    Some(message) => self.on_to_worker(&message.payload),
                    None => {
                        warn!(worker_id = %self.worker_id, "directed subscription closed");
                        break None;
                    }
                },
                message = recv_message(&mut broadcast) => match message {
                    Some(message) => self.on_to_worker(&message.payload),
                    None => {
                        warn!(worker_id = %self.worker_id, "broadcast subscription closed");
                        break None;
                    }
                },
                message = recv_message(&mut adapter) => match message {
                    Some(message) => self.on_adapter(&message.payload),
                    None => {
                        warn!(worker_id = %self.worker_id, "adapter subscription closed");
                        break None;
                    }
                },
                _ = next_tick(&mut stats) => self.log_stats(),
            }
        };

        let disconnected = self.shutdown();
        // Dropping the registries releases the outbox so the publisher can drain.
        drop(self);
        if let Err(err) = outbox_task.await {
            warn!(error = %err, "publisher task failed");
        }
        if let Some(reply) = reply {
            let _ = reply.send(disconnected);
        }
    }

    fn registry(&mut self, channel: &str) -> Option<&mut Registry> {
        let registry = self
            .registries
            .iter_mut()
            .find(|registry| registry.channel() == channel);
        if registry.is_none() {
            debug!(%channel, "message for a channel this worker does not serve");
        }
        registry
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected {
                channel,
                link,
                info,
            } => match self.registry(&channel) {
                Some(registry) => {
                    registry.connect(link, &info);
                }
                None => link.close(),
            },
            TransportEvent::Event {
                channel,
                socket_id,
                connection,
                event,
                args,
                ack,
            } => {
                if let Some(registry) = self.registry(&channel) {
                    registry.client_event(&socket_id, connection, event, args, ack);
                }
            }
            TransportEvent::Ack {
                channel,
                socket_id,
                connection,
                ack_id,
                args,
            } => {
                if let Some(registry) = self.registry(&channel) {
                    registry.client_ack(&socket_id, connection, ack_id, args);
                }
            }
            TransportEvent::Disconnected {
                channel,
                socket_id,
                connection,
            } => {
                if let Some(registry) = self.registry(&channel) {
                    if !registry.disconnected(&socket_id, connection) {
                        debug!(%channel, %socket_id, "disconnect of an already removed connection");
                    }
                }
            }
        }
    }

    fn on_delivery(&mut self, notice: DeliveryNotice) {
        if let Some(registry) = self.registry(&notice.channel) {
            let delivery =
                registry.confirm_delivery(&notice.socket_id, notice.connection, notice.subscribers);
            debug!(socket_id = %notice.socket_id, ?delivery, "newConnection delivery confirmed");
        }
    }

    #[instrument(level = "debug", skip_all, fields(worker_id = %self.worker_id))]
    fn on_to_worker(&mut self, payload: &[u8]) {
        let message = match ToWorker::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "discarding toWorker message");
                return;
            }
        };
        match message {
            ToWorker::Callback(callback) => {
                if let Some(registry) = self.registry(&callback.namespace) {
                    registry.resolve_callback(callback);
                }
            }
            ToWorker::Close(CloseMessage { namespace }) => {
                if let Some(registry) = self.registry(&namespace) {
                    registry.close_all();
                }
            }
            ToWorker::Custom(CustomMessage { fields }) => match &self.on_custom {
                Some(handler) => handler(fields),
                None => debug!("custom message without a handler"),
            },
        }
    }

    fn on_adapter(&mut self, payload: &[u8]) {
        let command = match AdapterCommand::decode(payload) {
            Ok(command) => command,
            Err(err) => {
                warn!(error = %err, "discarding adapter command");
                return;
            }
        };
        let namespace = command.namespace().to_string();
        if let Some(registry) = self.registry(&namespace) {
            registry.apply(command);
        }
    }

    fn stats(&self) -> Vec<ChannelStats> {
        self.registries
            .iter()
            .map(|registry| ChannelStats {
                channel: registry.channel().to_string(),
                sessions: registry.len(),
            })
            .collect()
    }

    fn log_stats(&self) {
        let summary = self
            .registries
            .iter()
            .map(|registry| format!("{}: {}", registry.channel(), registry.len()))
            .collect::<Vec<_>>()
            .join("\t");
        info!(worker_id = %self.worker_id, "{summary}");
    }

    fn shutdown(&mut self) -> usize {
        let disconnected: usize = self
            .registries
            .iter_mut()
            .map(|registry| registry.shutdown())
            .sum();
        info!(
            worker_id = %self.worker_id,
            disconnected,
            "edge worker stopping; backends notified of disconnects"
        );
        disconnected
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
