//! # Client Notifier
//!
//! Best-effort fan-out of [`ClientMessage`]s to every connected client.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::{ClientMessage, ProgressEvent};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("client '{0}' disconnected")]
    Disconnected(String),
    #[error("delivery to client '{id}' failed: {reason}")]
    Delivery { id: String, reason: String },
}

/// A connected consumer of cache events
#[async_trait]
pub trait Client: Send + Sync {
    fn id(&self) -> &str;

    /// Whether the client is served by the current controller
    fn is_controlled(&self) -> bool {
        true
    }

    async fn post(&self, message: &ClientMessage) -> Result<(), NotifyError>;
}

/// Source of the current client set
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    async fn clients(&self, include_uncontrolled: bool) -> Vec<Arc<dyn Client>>;
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct ClientNotifier {
    registry: Arc<dyn ClientRegistry>,
}

impl ClientNotifier {
    pub fn new(registry: Arc<dyn ClientRegistry>) -> Self {
        Self { registry }
    }

    /// Post `message` to every client, uncontrolled ones included.
    ///
    /// Deliveries run concurrently; a failing client is logged and skipped.
    pub async fn broadcast(&self, message: ClientMessage) -> DeliveryReport {
        let clients = self.registry.clients(true).await;
        let results = join_all(clients.iter().map(|client| {
            let message = &message;
            async move { (client.id().to_string(), client.post(message).await) }
        }))
        .await;

        let mut report = DeliveryReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(client = %id, error = %e, "Failed to post message to client");
                }
            }
        }
        report
    }

    pub async fn progress(&self, event: ProgressEvent) -> DeliveryReport {
        self.broadcast(event.into()).await
    }
}

/// Client delivering messages into an unbounded channel
pub struct ChannelClient {
    id: String,
    controlled: bool,
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl ChannelClient {
    pub fn new(id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: id.into(),
                controlled: true,
                tx,
            },
            rx,
        )
    }

    pub fn uncontrolled(mut self) -> Self {
        self.controlled = false;
        self
    }
}

#[async_trait]
impl Client for ChannelClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_controlled(&self) -> bool {
        self.controlled
    }

    async fn post(&self, message: &ClientMessage) -> Result<(), NotifyError> {
        self.tx
            .send(message.clone())
            .map_err(|_| NotifyError::Disconnected(self.id.clone()))
    }
}

/// Registry whose client set changes as clients connect and leave
#[derive(Default)]
pub struct DynamicRegistry {
    clients: RwLock<Vec<Arc<dyn Client>>>,
}

impl DynamicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client: Arc<dyn Client>) {
        debug!(client = client.id(), "Client connected");
        self.clients.write().push(client);
    }

    pub fn unregister(&self, id: &str) -> bool {
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|c| c.id() != id);
        before != clients.len()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

#[async_trait]
impl ClientRegistry for DynamicRegistry {
    async fn clients(&self, include_uncontrolled: bool) -> Vec<Arc<dyn Client>> {
        self.clients
            .read()
            .iter()
            .filter(|c| include_uncontrolled || c.is_controlled())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProgressSource;

    struct BrokenClient;

    #[async_trait]
    impl Client for BrokenClient {
        fn id(&self) -> &str {
            "broken"
        }

        async fn post(&self, _message: &ClientMessage) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery {
                id: "broken".into(),
                reason: "port closed".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_failed_client_does_not_block_others() {
        let registry = Arc::new(DynamicRegistry::new());
        let (first, mut first_rx) = ChannelClient::new("first");
        let (second, mut second_rx) = ChannelClient::new("second");
        registry.register(Arc::new(first));
        registry.register(Arc::new(BrokenClient));
        registry.register(Arc::new(second.uncontrolled()));

        let notifier = ClientNotifier::new(registry);
        let report = notifier
            .progress(ProgressEvent::new("a", None, ProgressSource::Network, 50))
            .await;

        assert_eq!(report, DeliveryReport { delivered: 2, failed: 1 });
        assert!(first_rx.try_recv().is_ok());
        assert!(second_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_receiver_counts_as_failure() {
        let registry = Arc::new(DynamicRegistry::new());
        let (client, rx) = ChannelClient::new("gone");
        drop(rx);
        registry.register(Arc::new(client));

        let report = ClientNotifier::new(registry.clone())
            .progress(ProgressEvent::from_cache("a", None))
            .await;
        assert_eq!(report.failed, 1);

        assert!(registry.unregister("gone"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_controlled_filter() {
        let registry = DynamicRegistry::new();
        let (a, _rx_a) = ChannelClient::new("a");
        let (b, _rx_b) = ChannelClient::new("b");
        registry.register(Arc::new(a));
        registry.register(Arc::new(b.uncontrolled()));

        assert_eq!(registry.clients(false).await.len(), 1);
        assert_eq!(registry.clients(true).await.len(), 2);
    }
}
