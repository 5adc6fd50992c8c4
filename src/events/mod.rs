use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with the receiving end of a bounded channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when nobody is listening.
    ///
    /// Used after a transaction has committed; the committed state stands either way.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Dropping coupon event");
        }
    }
}

/// Domain events raised once coupon state has been committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    CouponApplied {
        order_id: Uuid,
        coupon_id: Uuid,
        /// Coupon the order held before this application, if it was swapped out
        replaced_coupon_id: Option<Uuid>,
        final_total: Decimal,
        timestamp: DateTime<Utc>,
    },
    CouponReleased {
        order_id: Uuid,
        coupon_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    CouponCreated(Uuid),
    CouponUpdated(Uuid),
    CouponDisabled(Uuid),
    CouponDeleted(Uuid),
}

impl Event {
    pub fn coupon_applied(
        order_id: Uuid,
        coupon_id: Uuid,
        replaced_coupon_id: Option<Uuid>,
        final_total: Decimal,
    ) -> Self {
        Event::CouponApplied {
            order_id,
            coupon_id,
            replaced_coupon_id,
            final_total,
            timestamp: Utc::now(),
        }
    }

    pub fn coupon_released(order_id: Uuid, coupon_id: Uuid) -> Self {
        Event::CouponReleased {
            order_id,
            coupon_id,
            timestamp: Utc::now(),
        }
    }

    /// Stable name used in logs and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            Event::CouponApplied { .. } => "coupon_applied",
            Event::CouponReleased { .. } => "coupon_released",
            Event::CouponCreated(_) => "coupon_created",
            Event::CouponUpdated(_) => "coupon_updated",
            Event::CouponDisabled(_) => "coupon_disabled",
            Event::CouponDeleted(_) => "coupon_deleted",
        }
    }
}

// Handlers implementing this trait process events asynchronously.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<(), String>;
}

/// Handler that writes every event to the log
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: Event) -> Result<(), String> {
        match &event {
            Event::CouponApplied {
                order_id,
                coupon_id,
                replaced_coupon_id,
                final_total,
                ..
            } => info!(
                order_id = %order_id,
                coupon_id = %coupon_id,
                replaced_coupon_id = ?replaced_coupon_id,
                final_total = %final_total,
                "Coupon applied"
            ),
            Event::CouponReleased {
                order_id,
                coupon_id,
                ..
            } => info!(order_id = %order_id, coupon_id = %coupon_id, "Coupon released"),
            other => info!(event = other.name(), "Coupon lifecycle event"),
        }
        Ok(())
    }
}

/// Receives events until every sender is dropped, fanning each one out to all handlers.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        let name = event.name();
        let results = join_all(
            handlers
                .iter()
                .map(|handler| handler.handle_event(event.clone())),
        )
        .await;

        for result in results {
            if let Err(e) = result {
                error!(event = name, error = %e, "Event handler failed");
            }
        }
    }

    warn!("Event processing loop has ended");
}
