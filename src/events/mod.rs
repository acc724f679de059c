//! Domain events and the audit sink that consumes them.
//!
//! Services publish an [`Event`] after a mutation commits. The consumer
//! ([`process_events`]) writes one structured record per event under the
//! `audit` tracing target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::exception::{ExceptionType, ResolutionAction};
use crate::models::order::OrderStatus;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, failing only when the consumer has gone away.
    pub async fn send(&self, event: Event) -> Result<(), ServiceError> {
        self.sender
            .send(event)
            .await
            .map_err(|e| ServiceError::EventError(format!("Failed to send event: {}", e)))
    }

    /// Sends an event after a committed write. A lost audit record never
    /// fails the mutation that produced it.
    pub async fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(error = %e, event = name, "Failed to publish event");
        }
    }
}

/// Creates a bounded event channel.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Which scan stage an item scan belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScanStage {
    Pick,
    Pack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        lines: usize,
    },
    OrderClaimed {
        order_id: Uuid,
        actor_id: Uuid,
    },
    OrderVoided {
        order_id: Uuid,
        actor_id: Uuid,
        previous_status: OrderStatus,
    },
    ItemScanned {
        order_id: Uuid,
        actor_id: Uuid,
        stage: ScanStage,
        barcode: String,
        serial_number: Option<String>,
        status: OrderStatus,
    },
    OrderChangeApplied {
        order_id: Uuid,
        exception_id: Option<Uuid>,
        actor_id: Uuid,
        previous_status: OrderStatus,
        items: usize,
        at: DateTime<Utc>,
    },
    ExceptionCreated {
        exception_id: Uuid,
        order_id: Uuid,
        exception_type: ExceptionType,
        actor_id: Uuid,
    },
    ProposalSubmitted {
        exception_id: Uuid,
        order_id: Uuid,
        actor_id: Uuid,
    },
    ExceptionAcknowledged {
        exception_id: Uuid,
        order_id: Uuid,
        actor_id: Uuid,
        self_approved: bool,
    },
    ExceptionResolved {
        exception_id: Uuid,
        order_id: Uuid,
        actor_id: Uuid,
        action: ResolutionAction,
    },
    StatusCorrected {
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderClaimed { .. } => "order_claimed",
            Event::OrderVoided { .. } => "order_voided",
            Event::ItemScanned { .. } => "item_scanned",
            Event::OrderChangeApplied { .. } => "order_change_applied",
            Event::ExceptionCreated { .. } => "exception_created",
            Event::ProposalSubmitted { .. } => "proposal_submitted",
            Event::ExceptionAcknowledged { .. } => "exception_acknowledged",
            Event::ExceptionResolved { .. } => "exception_resolved",
            Event::StatusCorrected { .. } => "status_corrected",
        }
    }

    pub fn order_id(&self) -> Uuid {
        match self {
            Event::OrderCreated { order_id, .. }
            | Event::OrderClaimed { order_id, .. }
            | Event::OrderVoided { order_id, .. }
            | Event::ItemScanned { order_id, .. }
            | Event::OrderChangeApplied { order_id, .. }
            | Event::ExceptionCreated { order_id, .. }
            | Event::ProposalSubmitted { order_id, .. }
            | Event::ExceptionAcknowledged { order_id, .. }
            | Event::ExceptionResolved { order_id, .. }
            | Event::StatusCorrected { order_id, .. } => *order_id,
        }
    }
}

/// Drains the channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting audit event loop");

    while let Some(event) = rx.recv().await {
        let payload = serde_json::to_string(&event)
            .unwrap_or_else(|e| format!("{{\"serialization_error\":\"{}\"}}", e));
        info!(
            target: "audit",
            event = event.name(),
            order_id = %event.order_id(),
            payload = %payload,
            "audit event"
        );
    }

    info!("Audit event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_fails_once_receiver_is_dropped() {
        let (sender, rx) = channel(4);
        drop(rx);
        let result = sender
            .send(Event::OrderClaimed {
                order_id: Uuid::new_v4(),
                actor_id: Uuid::new_v4(),
            })
            .await;
        assert!(matches!(result, Err(ServiceError::EventError(_))));
    }

    #[tokio::test]
    async fn processor_drains_until_senders_close() {
        let (sender, rx) = channel(4);
        let handle = tokio::spawn(process_events(rx));
        sender
            .send(Event::StatusCorrected {
                order_id: Uuid::new_v4(),
                from: OrderStatus::Completed,
                to: OrderStatus::Picking,
            })
            .await
            .unwrap();
        drop(sender);
        handle.await.unwrap();
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = Event::ExceptionResolved {
            exception_id: Uuid::nil(),
            order_id: Uuid::nil(),
            actor_id: Uuid::nil(),
            action: ResolutionAction::ShortShip,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "exception_resolved");
        assert_eq!(value["action"], "short_ship");
    }
}
