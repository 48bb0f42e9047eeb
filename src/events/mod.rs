//! Swap lifecycle events
//!
//! Every phase change is published on a broadcast channel. Subscribers that
//! fall behind lose the oldest events; the registry stays the source of truth.

use crate::swap::{Phase, Role, SwapId};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// A phase change of one swap
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwapEvent {
    pub swap_id: SwapId,
    pub role: Role,
    /// `None` when the swap was just created
    pub from: Option<Phase>,
    pub to: Phase,
    pub at: DateTime<Utc>,
}

impl SwapEvent {
    pub fn created(swap_id: SwapId, role: Role) -> Self {
        Self {
            swap_id,
            role,
            from: None,
            to: Phase::Negotiated,
            at: Utc::now(),
        }
    }

    pub fn transition(swap_id: SwapId, role: Role, from: Phase, to: Phase) -> Self {
        Self {
            swap_id,
            role,
            from: Some(from),
            to,
            at: Utc::now(),
        }
    }

    /// Event name used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self.from {
            None => "created",
            Some(_) => self.to.as_str(),
        }
    }
}

/// Fan-out channel for swap events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SwapEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: SwapEvent) {
        match event.from {
            None => crate::metrics::record_swap_created(event.role),
            Some(from) => crate::metrics::record_phase(event.role, from, event.to),
        }
        trace!(swap_id = %event.swap_id, event = event.name(), "Emitting swap event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwapEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
