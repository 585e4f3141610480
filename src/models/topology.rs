/// Topic exchange every notification producer publishes to.
pub const EXCHANGE_NAME: &str = "events";

/// Broker-side routing: one durable queue bound to the `events` exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    queue_name: String,
    binding_keys: Vec<String>,
}

impl QueueTopology {
    /// An empty key list binds the queue under its own name.
    pub fn new(queue_name: impl Into<String>, binding_keys: Vec<String>) -> Self {
        let queue_name = queue_name.into();

        let mut keys: Vec<String> = Vec::with_capacity(binding_keys.len());
        for key in binding_keys {
            let key = key.trim();
            if !key.is_empty() && !keys.iter().any(|existing| existing == key) {
                keys.push(key.to_string());
            }
        }

        if keys.is_empty() {
            keys.push(queue_name.clone());
        }

        Self {
            queue_name,
            binding_keys: keys,
        }
    }

    /// Parses a comma-separated binding list such as `auction.*, bid.placed`.
    pub fn from_bindings(queue_name: &str, bindings: &str) -> Self {
        let keys = bindings.split(',').map(str::to_string).collect();
        Self::new(queue_name, keys)
    }

    pub fn exchange_name(&self) -> &str {
        EXCHANGE_NAME
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn binding_keys(&self) -> &[String] {
        &self.binding_keys
    }

    pub fn uses_default_binding(&self) -> bool {
        self.binding_keys.len() == 1 && self.binding_keys[0] == self.queue_name
    }
}
