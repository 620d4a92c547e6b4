//! Address indexed register store.
//!
//! An [`AddressMap`] is the payload of every block and poll read or write.
//! Registers that were never written are absent rather than zero, so a
//! decode can tell "not read yet" from a real value.

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::ops::Range;

/// Mapping from register address to its 16 bit value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressMap {
    registers: BTreeMap<u16, u16>,
}

impl AddressMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map holding `values` at consecutive addresses from `start`.
    pub fn from_registers(start: u16, values: &[u16]) -> Self {
        let mut map = Self::new();
        map.set_range(start, values);
        map
    }

    /// Value of a single register, failing if it was never populated.
    pub fn get(&self, address: u16) -> Result<u16> {
        self.registers
            .get(&address)
            .copied()
            .ok_or(Error::MissingRegister(address))
    }

    pub fn contains(&self, address: u16) -> bool {
        self.registers.contains_key(&address)
    }

    pub fn set(&mut self, address: u16, value: u16) {
        self.registers.insert(address, value);
    }

    /// Writes a contiguous run of registers starting at `start`.
    pub fn set_range(&mut self, start: u16, values: &[u16]) {
        for (offset, value) in values.iter().enumerate() {
            self.registers.insert(start.wrapping_add(offset as u16), *value);
        }
    }

    /// Values of a contiguous run of registers, failing on the first gap.
    pub fn get_range(&self, range: Range<u16>) -> Result<Vec<u16>> {
        range.map(|address| self.get(address)).collect()
    }

    /// Layers `other` over this map; on collision `other` wins.
    pub fn merge(&mut self, other: &AddressMap) -> &mut Self {
        self.registers
            .extend(other.registers.iter().map(|(k, v)| (*k, *v)));
        self
    }

    /// Consuming variant of [`AddressMap::merge`].
    pub fn merged(mut self, other: &AddressMap) -> Self {
        self.merge(other);
        self
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.registers.iter().map(|(k, v)| (*k, *v))
    }
}
