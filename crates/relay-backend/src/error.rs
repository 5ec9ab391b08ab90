use relay_bus::BusError;
use thiserror::Error;

/// Error type handlers and connection hooks return; anything `?`-able works.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

/// Failures reported to the async-error sink. None of them stop the backend.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("handler for `{event}` on session {socket_id} failed: {source}")]
    Handler {
        socket_id: String,
        event: String,
        #[source]
        source: HandlerError,
    },
    #[error("handler for `{event}` on session {socket_id} panicked: {message}")]
    Panicked {
        socket_id: String,
        event: String,
        message: String,
    },
}

impl DispatchError {
    pub fn socket_id(&self) -> &str {
        match self {
            DispatchError::Handler { socket_id, .. }
            | DispatchError::Panicked { socket_id, .. } => socket_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("no edge worker received the {command} command")]
    NoWorkers { command: &'static str },
}

#[derive(Debug, Error)]
pub enum AckError {
    #[error("session closed before the client acknowledged")]
    SessionClosed,
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
