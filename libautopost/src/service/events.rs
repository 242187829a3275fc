//! Progress events
//!
//! An in-process bus built on `tokio::sync::broadcast`. Emitting never blocks:
//! without subscribers the event is dropped, and a lagging subscriber loses
//! the oldest events instead of slowing down the pipeline.
//!
//! ```no_run
//! use libautopost::service::events::{Event, EventBus};
//!
//! # async fn example() {
//! let bus = EventBus::new(100);
//! let mut rx = bus.subscribe();
//! bus.emit(Event::SchedulerSuspended { reason: "login rejected".to_string() });
//! if let Ok(event) = rx.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::ErrorClass;

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before old events are dropped
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

/// What started a posting cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    CycleStarted {
        folder_id: String,
        folder_name: String,
        trigger: Trigger,
    },
    PublishRetry {
        folder_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    CycleCompleted {
        folder_id: String,
        folder_name: String,
        post_id: Option<String>,
    },
    CycleFailed {
        folder_id: String,
        folder_name: String,
        class: ErrorClass,
        error: String,
    },
    SyncCompleted {
        downloaded: usize,
        skipped: usize,
        failed: usize,
    },
    SchedulerFired {
        at: i64,
    },
    SchedulerSuspended {
        reason: String,
    },
}
