//! Shared read schedule.
//!
//! Entries are keyed by `dev_id` first and parameter second, so a module can
//! touch its own entries without scanning anybody else's.

use crate::protocol as proto;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub device: String,
    pub param: String,
    pub deadline: SystemTime,
    pub time_delta: Duration,
}

impl ScheduleEntry {
    /// The `"<dev_id>::<param>"` key of the entry.
    pub fn key(&self) -> String {
        proto::schedule_key(&self.device, &self.param)
    }
}

type Entries = HashMap<String, HashMap<String, ScheduleEntry>>;

/// Read schedule shared by all modules of a master.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    entries: Arc<Mutex<Entries>>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an entry. New entries are due immediately.
    pub async fn register(&self, device: &str, param: &str, time_delta: Duration) {
        let entry = ScheduleEntry {
            device: device.to_string(),
            param: param.to_string(),
            deadline: SystemTime::now(),
            time_delta,
        };
        log::trace!("Scheduling {} every {:?}", entry.key(), time_delta);
        self.entries
            .lock()
            .await
            .entry(device.to_string())
            .or_default()
            .insert(param.to_string(), entry);
    }

    pub async fn get(&self, device: &str, param: &str) -> Option<ScheduleEntry> {
        self.entries
            .lock()
            .await
            .get(device)
            .and_then(|params| params.get(param))
            .cloned()
    }

    /// Looks an entry up by its `"<dev_id>::<param>"` key.
    pub async fn get_by_key(&self, key: &str) -> Option<ScheduleEntry> {
        let (device, param) = key.split_once("::")?;
        self.get(device, param).await
    }

    /// Moves each existing entry to `now` plus its own period. Unknown names are ignored.
    pub async fn reschedule_by_period<'a, I>(&self, device: &str, params: I, now: SystemTime)
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut entries = self.entries.lock().await;
        let Some(own) = entries.get_mut(device) else {
            return;
        };
        for param in params {
            if let Some(entry) = own.get_mut(param) {
                entry.deadline = now + entry.time_delta;
            }
        }
    }

    /// Moves each existing entry to `now + delay`, ignoring its period.
    pub async fn reschedule_after<'a, I>(
        &self,
        device: &str,
        params: I,
        now: SystemTime,
        delay: Duration,
    ) where
        I: IntoIterator<Item = &'a String>,
    {
        let mut entries = self.entries.lock().await;
        let Some(own) = entries.get_mut(device) else {
            return;
        };
        for param in params {
            if let Some(entry) = own.get_mut(param) {
                entry.deadline = now + delay;
            }
        }
    }

    /// Drops every entry of a device, returning how many there were.
    pub async fn remove_device(&self, device: &str) -> usize {
        let removed = self
            .entries
            .lock()
            .await
            .remove(device)
            .map_or(0, |params| params.len());
        log::debug!("Removed {removed} schedule entries of {device}");
        removed
    }

    /// Entries whose deadline has passed, earliest first.
    pub async fn due(&self, now: SystemTime) -> Vec<ScheduleEntry> {
        let entries = self.entries.lock().await;
        let mut due: Vec<ScheduleEntry> = entries
            .values()
            .flat_map(|params| params.values())
            .filter(|entry| entry.deadline <= now)
            .cloned()
            .collect();
        due.sort_by_key(|entry| entry.deadline);
        due
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
