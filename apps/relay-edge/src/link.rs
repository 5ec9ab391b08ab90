use relay_proto::ServerFrame;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// What the worker asks a connection's writer to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerFrame),
    Close,
}

/// The trailing acknowledgment of a client event, ready to be invoked with
/// the backend's reply.
pub type AckFn = Box<dyn FnOnce(Vec<Value>) + Send>;

/// Worker-side handle to one low-level client connection.
///
/// `connection` distinguishes successive connections that reuse a socket
/// id, so events from a superseded connection can be told apart.
#[derive(Debug, Clone)]
pub struct ClientLink {
    socket_id: String,
    connection: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientLink {
    pub fn new(
        socket_id: impl Into<String>,
        connection: Uuid,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            socket_id: socket_id.into(),
            connection,
            tx,
        }
    }

    /// A link plus the receiving end its writer would own.
    pub fn pair(socket_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(socket_id, Uuid::new_v4(), tx), rx)
    }

    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    pub fn connection(&self) -> Uuid {
        self.connection
    }

    /// Queue a frame; false once the writer is gone.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    /// Force-disconnect the client.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    /// Acknowledgment that answers client ack `ack_id` on this link.
    pub fn ack_fn(&self, ack_id: u64) -> AckFn {
        let tx = self.tx.clone();
        Box::new(move |args: Vec<Value>| {
            let _ = tx.send(Outbound::Frame(ServerFrame::Ack { ack_id, args }));
        })
    }
}
