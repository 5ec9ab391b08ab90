pub const DEFAULT_PREFIX: &str = "relay";

/// Bus topic names, namespaced by a deployment prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Owned by exactly one backend; every edge worker publishes here.
    pub fn to_backend(&self, channel: &str) -> String {
        format!("{}:toBackend:{}", self.prefix, channel)
    }

    /// Directed at a single edge worker (callbacks).
    pub fn to_worker(&self, worker_id: &str) -> String {
        format!("{}:toWorker:{}", self.prefix, worker_id)
    }

    pub fn to_all_workers(&self) -> String {
        format!("{}:toWorker:all", self.prefix)
    }

    /// Room management and room broadcasts.
    pub fn adapter(&self) -> String {
        format!("{}:adapter", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn topics_are_prefixed() {
        let topics = Topics::new("siod");
        assert_eq!(topics.to_backend("/chat"), "siod:toBackend:/chat");
        assert_eq!(topics.to_worker("7"), "siod:toWorker:7");
        assert_eq!(topics.to_all_workers(), "siod:toWorker:all");
        assert_eq!(topics.adapter(), "siod:adapter");
    }

    #[test_timeout::timeout]
    fn directed_topic_never_collides_with_broadcast() {
        let topics = Topics::default();
        assert_ne!(topics.to_worker("worker-1"), topics.to_all_workers());
    }
}
