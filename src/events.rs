//! Asynchronous event bus.
//!
//! Fire-and-forget fan-out over bounded per-subscriber channels. Emission
//! never blocks: a full subscriber queue drops the new event with a warning,
//! and a dead subscriber is pruned without affecting the others. Delivery is
//! at-most-once, best-effort by construction.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::AgentState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    BetSuccess {
        tx_id: String,
        teams: String,
        stake: f64,
        odds: f64,
    },
    BetFailed {
        tx_id: Option<String>,
        reason: String,
    },
    StateChanged {
        from: AgentState,
        to: AgentState,
    },
    BalanceReconciled {
        ledger: f64,
        real: f64,
    },
    SelectorHealed {
        key: String,
        tier: String,
        selector: String,
    },
    SessionRecovered {
        mode: String,
    },
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<AgentEvent>,
}

#[derive(Clone)]
pub struct EventBus {
    subscribers: std::sync::Arc<RwLock<Vec<Subscriber>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Default::default(),
            capacity: capacity.max(1),
        }
    }

    /// Register a named subscriber and get its bounded receiving end.
    pub fn subscribe(&self, name: impl Into<String>) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.write().push(Subscriber {
            name: name.into(),
            tx,
        });
        rx
    }

    /// Non-blocking broadcast. Returns the number of subscribers that
    /// received the event.
    pub fn emit(&self, event: AgentEvent) -> usize {
        let mut delivered = 0;
        let mut dropped_subscribers = false;

        {
            let subscribers = self.subscribers.read();
            for sub in subscribers.iter() {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscriber = %sub.name, "event queue full, dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dropped_subscribers = true;
                    }
                }
            }
        }

        if dropped_subscribers {
            self.subscribers.write().retain(|sub| {
                let alive = !sub.tx.is_closed();
                if !alive {
                    debug!(subscriber = %sub.name, "pruning closed event subscriber");
                }
                alive
            });
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
