//! Event bus connecting modules with the rest of the agent.
//!
//! Modules receive an [`EventBus`] at construction instead of reaching for a
//! process wide singleton. Topic interest is expressed with a [`Subscription`]
//! bound to a single `dev_id`; dropping it tears the interest down.

use crate::{protocol as proto, value::Values};
use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;
use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Event data, keyed by `dev_id`.
pub type EventData = BTreeMap<String, Values>;

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    pub data: EventData,
    pub timestamp: SystemTime,
}

impl Event {
    /// Values for one device, if the event carries any.
    pub fn values_for(&self, dev_id: &str) -> Option<&Values> {
        self.data.get(dev_id)
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publishes an event. Returns `true` if at least one receiver exists.
    pub fn publish(&self, topic: impl Into<String>, data: EventData, timestamp: SystemTime) -> bool {
        let event = Event {
            topic: topic.into(),
            data,
            timestamp,
        };
        log::trace!("Publishing {}", event.topic);
        self.tx.send(event).is_ok()
    }

    /// Publishes values of one device on the module data topic.
    pub fn publish_module_data(&self, dev_id: &str, values: Values, timestamp: SystemTime) -> bool {
        let mut data = EventData::new();
        data.insert(dev_id.to_string(), values);
        self.publish(proto::MODULE_DATA_TOPIC, data, timestamp)
    }

    /// Receives every event published from now on.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: broadcast::Receiver<Event>,
}

impl EventReceiver {
    /// Next event, or `None` once the bus is gone. Lagged events are skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Event receiver lagged, {skipped} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    log::warn!("Event receiver lagged, {skipped} events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

/// Interest of one module in a set of topics.
#[derive(Debug)]
pub struct Subscription {
    dev_id: String,
    topics: BTreeSet<String>,
    rx: EventReceiver,
}

impl Subscription {
    /// Subscribes to the module data topic and the trigger topics of `fields`.
    pub fn new<'a, I>(bus: &EventBus, dev_id: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut topics: BTreeSet<String> = fields
            .into_iter()
            .map(|field| proto::parameter_trigger_topic(dev_id, field))
            .collect();
        topics.insert(proto::MODULE_DATA_TOPIC.to_string());
        log::debug!("Subscribing {dev_id} to {} topics", topics.len());
        Self {
            dev_id: dev_id.to_string(),
            topics,
            rx: bus.subscribe(),
        }
    }

    pub fn dev_id(&self) -> &str {
        &self.dev_id
    }

    pub fn topics(&self) -> &BTreeSet<String> {
        &self.topics
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.topics.contains(&event.topic)
    }

    /// Next matching event.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let event = self.rx.recv().await?;
            if self.matches(&event) {
                return Some(event);
            }
        }
    }

    /// Matching events already queued.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.try_recv() {
            if self.matches(&event) {
                events.push(event);
            }
        }
        events
    }
}
