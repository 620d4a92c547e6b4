//! Per-module state tracks.

use crate::value::{Value, Values};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Mutable record of one module.
///
/// `current` is the source of truth and is only changed by successful reads
/// and roll calls. The other tracks mirror what was relayed downstream and are
/// used for diffing only.
#[derive(Debug, Clone, Default)]
pub struct ModuleState {
    current: Values,
    read: BTreeMap<String, SystemTime>,
    send: Values,
    store: Values,
    event: Values,
}

impl ModuleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &Values {
        &self.current
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.current.get(name)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.current.get(name).and_then(Value::as_i64)
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.current.get(name).and_then(Value::as_bool)
    }

    /// Values that differ from the current state.
    pub fn diff(&self, parameters: &Values) -> Values {
        parameters
            .iter()
            .filter(|(k, v)| self.current.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn update_current(&mut self, parameters: &Values) {
        self.current
            .extend(parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Current values for the requested names.
    pub fn subset<'a, I>(&self, names: I) -> Values
    where
        I: IntoIterator<Item = &'a String>,
    {
        names
            .into_iter()
            .filter_map(|name| self.current.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    pub fn update_read<'a, I>(&mut self, names: I, timestamp: SystemTime)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for name in names {
            self.read.insert(name.clone(), timestamp);
        }
    }

    /// When a parameter was last read successfully.
    pub fn last_read(&self, name: &str) -> Option<SystemTime> {
        self.read.get(name).copied()
    }

    pub fn update_send(&mut self, parameters: &Values) {
        self.send.extend(parameters.clone());
    }

    pub fn update_store(&mut self, parameters: &Values) {
        self.store.extend(parameters.clone());
    }

    pub fn update_event(&mut self, parameters: &Values) {
        self.event.extend(parameters.clone());
    }

    pub fn send(&self) -> &Values {
        &self.send
    }

    pub fn store(&self) -> &Values {
        &self.store
    }

    pub fn event(&self) -> &Values {
        &self.event
    }

    /// Forgets everything. Used when a module takes on a new identity.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
