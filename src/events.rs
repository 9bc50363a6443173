//! Topic-keyed event broker.
//!
//! Push-style delivery to external subscribers (server-sent events,
//! displays, logs). The core publishes typed payloads; each subscriber
//! registers against a single topic and receives only that topic's
//! events. Publishing with no subscribers is a no-op.

use parking_lot::Mutex;

/// Push topics exposed to external subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    TanksChanged,
    Weight,
    StatusChanged,
    FeedingProgress,
    FeedingComplete,
    Error,
}

impl Topic {
    /// Wire name of the topic.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TanksChanged => "tanks_changed",
            Self::Weight => "weight",
            Self::StatusChanged => "status_changed",
            Self::FeedingProgress => "feeding_progress",
            Self::FeedingComplete => "feeding_complete",
            Self::Error => "error",
        }
    }
}

/// Typed payloads, one shape per topic.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    TanksChanged,
    Weight { grams: f32, raw: i32 },
    StatusChanged { state: &'static str },
    FeedingProgress { weight: f32, target: f32 },
    FeedingComplete { success: bool, dispensed: f32 },
    Error { code: &'static str, message: String },
}

impl EventPayload {
    pub fn topic(&self) -> Topic {
        match self {
            Self::TanksChanged => Topic::TanksChanged,
            Self::Weight { .. } => Topic::Weight,
            Self::StatusChanged { .. } => Topic::StatusChanged,
            Self::FeedingProgress { .. } => Topic::FeedingProgress,
            Self::FeedingComplete { .. } => Topic::FeedingComplete,
            Self::Error { .. } => Topic::Error,
        }
    }
}

type Subscriber = Box<dyn Fn(&EventPayload) + Send + Sync>;

/// The broker. Subscription order is delivery order within a topic.
#[derive(Default)]
pub struct EventBroker {
    subscribers: Mutex<Vec<(Topic, Subscriber)>>,
}

impl EventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one topic.
    pub fn subscribe(&self, topic: Topic, callback: impl Fn(&EventPayload) + Send + Sync + 'static) {
        self.subscribers.lock().push((topic, Box::new(callback)));
    }

    /// Deliver `payload` to every subscriber of its topic.
    pub fn publish(&self, payload: EventPayload) {
        let topic = payload.topic();
        let subscribers = self.subscribers.lock();
        for (t, callback) in subscribers.iter() {
            if *t == topic {
                callback(&payload);
            }
        }
    }
}
