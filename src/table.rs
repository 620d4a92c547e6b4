//! Parameter tables of a module.
//!
//! Every parameter name belongs to exactly one access pattern, see
//! [`ParameterKind`]. The module engine dispatches a read by matching on the
//! kind of each requested name.

use crate::param::ParamSpec;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// How a parameter is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParameterKind {
    /// Read and written through the master's block handshake.
    Block,
    /// Kept current by the continuous poll; reading returns the cached state.
    Poll,
    /// Selected through the postbox register and read back indirectly.
    Postbox,
}

#[derive(Debug, Clone)]
struct BlockEntry {
    block: u16,
    spec: Arc<dyn ParamSpec>,
}

/// The active parameter specs of a module, by access pattern.
#[derive(Debug, Clone, Default)]
pub struct ParameterTable {
    block: Vec<BlockEntry>,
    poll: Vec<Arc<dyn ParamSpec>>,
    postbox: BTreeMap<String, u16>,
}

/// Requested names grouped by the handler that serves them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub blocks: BTreeSet<u16>,
    pub poll: BTreeSet<String>,
    pub postbox: Vec<(String, u16)>,
    pub unknown: BTreeSet<String>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a block spec, replacing any spec that produces one of the same names.
    pub fn insert_block(&mut self, block: u16, spec: impl ParamSpec + 'static) -> &mut Self {
        let spec: Arc<dyn ParamSpec> = Arc::new(spec);
        self.remove_keys(&spec);
        self.block.push(BlockEntry { block, spec });
        self
    }

    /// Adds a poll spec, replacing any spec that produces one of the same names.
    pub fn insert_poll(&mut self, spec: impl ParamSpec + 'static) -> &mut Self {
        let spec: Arc<dyn ParamSpec> = Arc::new(spec);
        self.remove_keys(&spec);
        self.poll.push(spec);
        self
    }

    pub fn insert_postbox(&mut self, name: impl Into<String>, code: u16) -> &mut Self {
        self.postbox.insert(name.into(), code);
        self
    }

    fn remove_keys(&mut self, spec: &Arc<dyn ParamSpec>) {
        let keys = spec.keys();
        let clashes = |other: &Arc<dyn ParamSpec>| keys.iter().any(|k| other.has_key(k));
        self.block.retain(|entry| !clashes(&entry.spec));
        self.poll.retain(|other| !clashes(other));
        for key in &keys {
            self.postbox.remove(*key);
        }
    }

    /// Table kind a name belongs to, if any.
    pub fn kind(&self, name: &str) -> Option<ParameterKind> {
        if self.block_of(name).is_some() {
            Some(ParameterKind::Block)
        } else if self.poll.iter().any(|spec| spec.has_key(name)) {
            Some(ParameterKind::Poll)
        } else if self.postbox.contains_key(name) {
            Some(ParameterKind::Postbox)
        } else {
            None
        }
    }

    /// Block holding a block parameter.
    pub fn block_of(&self, name: &str) -> Option<u16> {
        self.block
            .iter()
            .find(|entry| entry.spec.has_key(name))
            .map(|entry| entry.block)
    }

    /// Specs stored in `block`.
    pub fn block_specs(&self, block: u16) -> impl Iterator<Item = &Arc<dyn ParamSpec>> + '_ {
        self.block
            .iter()
            .filter(move |entry| entry.block == block)
            .map(|entry| &entry.spec)
    }

    /// All blocks that hold at least one spec.
    pub fn blocks(&self) -> BTreeSet<u16> {
        self.block.iter().map(|entry| entry.block).collect()
    }

    pub fn poll_specs(&self) -> impl Iterator<Item = &Arc<dyn ParamSpec>> + '_ {
        self.poll.iter()
    }

    pub fn postbox_code(&self, name: &str) -> Option<u16> {
        self.postbox.get(name).copied()
    }

    /// Every name the table can serve.
    pub fn names(&self) -> BTreeSet<String> {
        let block = self.block.iter().flat_map(|entry| entry.spec.keys());
        let poll = self.poll.iter().flat_map(|spec| spec.keys());
        block
            .chain(poll)
            .map(str::to_string)
            .chain(self.postbox.keys().cloned())
            .collect()
    }

    /// Groups requested names by handler. Block names collapse into their blocks.
    pub fn dispatch<'a, I>(&self, names: I) -> Dispatch
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut dispatch = Dispatch::default();
        for name in names {
            match self.kind(name) {
                Some(ParameterKind::Block) => {
                    if let Some(block) = self.block_of(name) {
                        dispatch.blocks.insert(block);
                    }
                }
                Some(ParameterKind::Poll) => {
                    dispatch.poll.insert(name.clone());
                }
                Some(ParameterKind::Postbox) => {
                    if let Some(code) = self.postbox_code(name) {
                        dispatch.postbox.push((name.clone(), code));
                    }
                }
                None => {
                    dispatch.unknown.insert(name.clone());
                }
            }
        }
        dispatch.postbox.sort();
        dispatch.postbox.dedup();
        dispatch
    }

    /// Comparable description of the table: each name with its kind and registers.
    pub fn fingerprint(&self) -> Vec<(String, ParameterKind, Vec<u16>)> {
        let mut out = Vec::new();
        for entry in &self.block {
            for key in entry.spec.keys() {
                out.push((key.to_string(), ParameterKind::Block, vec![entry.block]));
            }
        }
        for spec in &self.poll {
            for key in spec.keys() {
                out.push((key.to_string(), ParameterKind::Poll, spec.addresses()));
            }
        }
        for (name, code) in &self.postbox {
            out.push((name.clone(), ParameterKind::Postbox, vec![*code]));
        }
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{param, ParamBits, ParamMask};

    fn table() -> ParameterTable {
        let mut table = ParameterTable::new();
        table
            .insert_block(0, param(0x40E, "address-flags"))
            .insert_block(1, param(0x40F, "set-point-1"))
            .insert_block(5, ParamMask::new(0x40E, "postbox-selection", 0b111, 0))
            .insert_poll(ParamBits::new(0x10, [("set-point-alarm-1", 0), ("set-point-alarm-2", 1)]))
            .insert_postbox("rtc-time", 0b11)
            .insert_postbox("t90-test-time", 0b10);
        table
    }

    #[test]
    fn kinds() {
        let table = table();
        assert_eq!(table.kind("address-flags"), Some(ParameterKind::Block));
        assert_eq!(table.kind("set-point-alarm-2"), Some(ParameterKind::Poll));
        assert_eq!(table.kind("rtc-time"), Some(ParameterKind::Postbox));
        assert_eq!(table.kind("nope"), None);
        assert_eq!(table.block_of("postbox-selection"), Some(5));
        assert_eq!(table.blocks(), BTreeSet::from([0, 1, 5]));
    }

    #[test]
    fn dispatch_groups_by_handler() {
        let names: BTreeSet<String> = ["address-flags", "set-point-1", "set-point-alarm-1", "t90-test-time", "rtc-time", "nope"]
            .into_iter()
            .map(String::from)
            .collect();
        let dispatch = table().dispatch(&names);
        assert_eq!(dispatch.blocks, BTreeSet::from([0, 1]));
        assert_eq!(dispatch.poll, BTreeSet::from(["set-point-alarm-1".to_string()]));
        assert_eq!(
            dispatch.postbox,
            vec![("rtc-time".to_string(), 0b11), ("t90-test-time".to_string(), 0b10)]
        );
        assert_eq!(dispatch.unknown, BTreeSet::from(["nope".to_string()]));
    }

    #[test]
    fn insert_replaces_same_name() {
        let mut table = table();
        table.insert_poll(param(0x20, "set-point-1"));
        assert_eq!(table.kind("set-point-1"), Some(ParameterKind::Poll));
        assert_eq!(table.blocks(), BTreeSet::from([0, 5]));
        let before = table.names().len();
        table.insert_poll(param(0x21, "set-point-1"));
        assert_eq!(table.names().len(), before);
        assert!(table
            .fingerprint()
            .contains(&("set-point-1".to_string(), ParameterKind::Poll, vec![0x21])));
    }
}
