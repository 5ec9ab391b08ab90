use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use relay_proto::Topics;
use tracing::error;

use crate::error::DispatchError;

/// Receives handler failures and panics instead of letting them escape.
pub type ErrorSink = Arc<dyn Fn(DispatchError) + Send + Sync>;

pub struct BackendConfig {
    pub channel: String,
    pub topics: Topics,
    pub on_async_error: Option<ErrorSink>,
    pub extensions: Extensions,
}

impl BackendConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            topics: Topics::default(),
            on_async_error: None,
            extensions: Extensions::default(),
        }
    }

    pub fn with_topics(mut self, topics: Topics) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_error_sink(mut self, sink: impl Fn(DispatchError) + Send + Sync + 'static) -> Self {
        self.on_async_error = Some(Arc::new(sink));
        self
    }

    /// Attach a namespace-level value handlers can fetch with
    /// [`Namespace::extension`](crate::Namespace::extension).
    pub fn with_extension<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }

    pub(crate) fn error_sink(&mut self) -> ErrorSink {
        self.on_async_error
            .take()
            .unwrap_or_else(|| Arc::new(log_dispatch_error))
    }
}

fn log_dispatch_error(err: DispatchError) {
    error!(socket_id = %err.socket_id(), error = %err, "unhandled backend handler error");
}

/// Type-keyed bag of namespace-level values.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast::<T>().ok().map(|boxed| *boxed))
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions").field("len", &self.map.len()).finish()
    }
}
