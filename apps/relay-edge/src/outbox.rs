use std::sync::Arc;

use metrics::counter;
use relay_bus::{publish_json, Bus};
use relay_proto::{NewConnection, ToBackend, Topics};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Subscriber count observed for a `newConnection` publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeliveryNotice {
    pub(crate) channel: String,
    pub(crate) socket_id: String,
    pub(crate) connection: Uuid,
    pub(crate) subscribers: usize,
}

struct Outgoing {
    message: ToBackend,
    report_for: Option<Uuid>,
}

/// Handle to the worker's publisher task.
///
/// One task publishes everything in submission order, so messages for a
/// session reach the bus in the order the worker produced them.
#[derive(Clone)]
pub(crate) struct Outbox {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Outbox {
    pub(crate) fn spawn(
        bus: Arc<dyn Bus>,
        topics: Topics,
        notices: mpsc::UnboundedSender<DeliveryNotice>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(publish_loop(bus, topics, rx, notices));
        (Self { tx }, handle)
    }

    pub(crate) fn send(&self, message: ToBackend) {
        self.submit(Outgoing {
            message,
            report_for: None,
        });
    }

    /// Publish and report the subscriber count back to the worker.
    pub(crate) fn new_connection(&self, message: NewConnection, connection: Uuid) {
        self.submit(Outgoing {
            message: ToBackend::NewConnection(message),
            report_for: Some(connection),
        });
    }

    fn submit(&self, outgoing: Outgoing) {
        if self.tx.send(outgoing).is_err() {
            warn!("publisher task gone; toBackend message dropped");
        }
    }
}

async fn publish_loop(
    bus: Arc<dyn Bus>,
    topics: Topics,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    notices: mpsc::UnboundedSender<DeliveryNotice>,
) {
    while let Some(Outgoing {
        message,
        report_for,
    }) = rx.recv().await
    {
        let channel = message.channel().to_string();
        let kind = message.kind();
        let topic = topics.to_backend(&channel);
        counter!("relay_edge_publish_total", 1, "kind" => kind);

        let subscribers = match publish_json(bus.as_ref(), &topic, &message).await {
            Ok(report) => report.subscribers,
            Err(err) => {
                // Treated like an absent backend: a new session fails closed.
                warn!(%topic, kind, error = %err, "publish failed");
                0
            }
        };
        // New connections are judged by the registry once the notice lands.
        if subscribers > 1 && report_for.is_none() {
            error!(
                %channel,
                subscribers,
                "more than one backend subscribed to channel; ownership is ambiguous"
            );
        } else if subscribers == 0 {
            debug!(%channel, kind, "no backend received message");
        }

        if let Some(connection) = report_for {
            let notice = DeliveryNotice {
                channel,
                socket_id: message.socket_id().to_string(),
                connection,
                subscribers,
            };
            if notices.send(notice).is_err() {
                debug!("worker loop gone; delivery notice dropped");
            }
        }
    }
    debug!("publisher task drained");
}
