use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Events emitted by the checkout engine.
///
/// Consumers (notification fan-out, analytics) subscribe to the receiving end
/// of the channel; the engine itself never depends on a consumer being
/// present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartCreated(Uuid),
    CartItemAdded { cart_id: Uuid, variant_id: Uuid },
    CartUpdated(Uuid),
    CartCleared(Uuid),

    // Checkout events
    CheckoutStarted { cart_id: Uuid, intent_id: String },
    CheckoutCompleted { cart_id: Uuid, order_id: Uuid },

    // Order events
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderCancelled(Uuid),

    // Stock events
    StockReserved { variant_id: Uuid, quantity: i32 },
    StockReleased { variant_id: Uuid, quantity: i32 },
    LowStock { variant_id: Uuid, remaining: i32 },

    // Payment events
    PaymentIntentCreated { intent_id: String },
    RefundInitiated { intent_id: String, refund_id: String },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, returning an error if the channel is closed or full.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when no consumer is
    /// listening. Event delivery is best-effort; core invariants never depend
    /// on it.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("event dropped: {}", e);
        }
    }
}

/// Creates an event channel and spawns a consumer that logs every event.
/// Used by the binary; tests install their own drain.
pub fn spawn_logging_consumer(buffer: usize) -> (EventSender, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(buffer);
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            info!(?event, "event");
        }
    });
    (EventSender::new(tx), handle)
}
