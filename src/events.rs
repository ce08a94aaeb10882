use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    DataChanged { workspace_id: String },
}

impl EngineEvent {
    pub fn workspace_id(&self) -> &str {
        match self {
            Self::DataChanged { workspace_id } => workspace_id,
        }
    }
}

/// Fire-and-forget broadcast between views. Delivery is best effort.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("no subscribers for engine event");
        }
    }

    pub fn data_changed(&self, workspace_id: &str) {
        self.emit(EngineEvent::DataChanged {
            workspace_id: workspace_id.to_string(),
        });
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Dropping the subscription unsubscribes.
pub struct Subscription {
    receiver: broadcast::Receiver<EngineEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Event(EngineEvent),
    /// Some events were dropped because the subscriber fell behind.
    Lagged(u64),
    Closed,
}

impl Subscription {
    pub async fn next(&mut self) -> Delivery {
        match self.receiver.recv().await {
            Ok(event) => Delivery::Event(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => Delivery::Lagged(missed),
            Err(broadcast::error::RecvError::Closed) => Delivery::Closed,
        }
    }
}
