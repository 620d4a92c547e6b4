//! Parameter codecs.
//!
//! A [`ParamSpec`] knows which registers a parameter occupies and how to turn
//! them into named [`Value`]s and back. Codecs never touch the bus; the module
//! engine hands them an [`AddressMap`] image.

use crate::{address_map::AddressMap, value::Value, value::Values, Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Decode/encode contract of a parameter against a register image.
pub trait ParamSpec: fmt::Debug + Send + Sync {
    /// Names this spec produces on decode and accepts on encode.
    fn keys(&self) -> Vec<&str>;

    /// Registers this spec reads.
    fn addresses(&self) -> Vec<u16>;

    /// Decodes the spec's values; registers that are absent yield no values.
    fn decode(&self, map: &AddressMap) -> Values;

    /// Encodes the values for this spec's keys onto `map`, keeping unrelated bits.
    ///
    /// Keys that are not in `values` leave the image untouched.
    fn encode(&self, values: &Values, map: &mut AddressMap) -> Result<()>;

    fn has_key(&self, key: &str) -> bool {
        self.keys().iter().any(|k| *k == key)
    }
}

fn encode_error(name: &str, reason: impl Into<String>) -> Error {
    Error::Encode {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn round_significant(value: f64, figures: u32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let factor = 10f64.powi(figures as i32 - 1 - magnitude);
    (value * factor).round() / factor
}

fn scaled(raw: i64, scale: Option<f64>, figures: Option<u32>) -> Value {
    match scale {
        Some(scale) => {
            let value = raw as f64 * scale;
            Value::Float(match figures {
                Some(figures) => round_significant(value, figures),
                None => value,
            })
        }
        None => Value::Int(raw),
    }
}

fn unscaled(name: &str, value: &Value, scale: Option<f64>) -> Result<i64> {
    match scale {
        Some(scale) => value
            .as_f64()
            .map(|v| (v / scale).round() as i64)
            .ok_or_else(|| encode_error(name, format!("{value} is not a number"))),
        None => value
            .as_i64()
            .ok_or_else(|| encode_error(name, format!("{value} is not an integer"))),
    }
}

/// Masked integer field of one register, optionally scaled.
///
/// A plain register is a mask of `0xFFFF`.
#[derive(Debug, Clone)]
pub struct ParamMask {
    address: u16,
    name: String,
    mask: u16,
    rshift: u8,
    scale: Option<f64>,
    significant_figures: Option<u32>,
}

impl ParamMask {
    pub fn new(address: u16, name: impl Into<String>, mask: u16, rshift: u8) -> Self {
        Self {
            address,
            name: name.into(),
            mask,
            rshift,
            scale: None,
            significant_figures: None,
        }
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn significant_figures(mut self, figures: u32) -> Self {
        self.significant_figures = Some(figures);
        self
    }
}

/// A whole register.
pub fn param(address: u16, name: impl Into<String>) -> ParamMask {
    ParamMask::new(address, name, 0xFFFF, 0)
}

impl ParamSpec for ParamMask {
    fn keys(&self) -> Vec<&str> {
        vec![self.name.as_str()]
    }

    fn addresses(&self) -> Vec<u16> {
        vec![self.address]
    }

    fn decode(&self, map: &AddressMap) -> Values {
        let mut values = Values::new();
        if let Ok(raw) = map.get(self.address) {
            let field = i64::from((raw & self.mask) >> self.rshift);
            values.insert(
                self.name.clone(),
                scaled(field, self.scale, self.significant_figures),
            );
        }
        values
    }

    fn encode(&self, values: &Values, map: &mut AddressMap) -> Result<()> {
        let Some(value) = values.get(&self.name) else {
            return Ok(());
        };
        let field = unscaled(&self.name, value, self.scale)?;
        let limit = i64::from(self.mask >> self.rshift);
        if !(0..=limit).contains(&field) {
            return Err(encode_error(
                &self.name,
                format!("{value} does not fit mask {:#06x}", self.mask),
            ));
        }
        let current = map.get(self.address).unwrap_or(0);
        let field = ((field as u16) << self.rshift) & self.mask;
        map.set(self.address, (current & !self.mask) | field);
        Ok(())
    }
}

/// Boolean that is true when any bit of the mask is set.
#[derive(Debug, Clone)]
pub struct ParamMaskBool {
    address: u16,
    name: String,
    mask: u16,
}

impl ParamMaskBool {
    pub fn new(address: u16, name: impl Into<String>, mask: u16) -> Self {
        Self {
            address,
            name: name.into(),
            mask,
        }
    }
}

impl ParamSpec for ParamMaskBool {
    fn keys(&self) -> Vec<&str> {
        vec![self.name.as_str()]
    }

    fn addresses(&self) -> Vec<u16> {
        vec![self.address]
    }

    fn decode(&self, map: &AddressMap) -> Values {
        let mut values = Values::new();
        if let Ok(raw) = map.get(self.address) {
            values.insert(self.name.clone(), Value::Bool(raw & self.mask != 0));
        }
        values
    }

    fn encode(&self, values: &Values, map: &mut AddressMap) -> Result<()> {
        let Some(value) = values.get(&self.name) else {
            return Ok(());
        };
        let set = value
            .as_bool()
            .ok_or_else(|| encode_error(&self.name, format!("{value} is not a bool")))?;
        let current = map.get(self.address).unwrap_or(0);
        map.set(
            self.address,
            if set {
                current | self.mask
            } else {
                current & !self.mask
            },
        );
        Ok(())
    }
}

/// Named single bit flags of one register.
#[derive(Debug, Clone)]
pub struct ParamBits {
    address: u16,
    bits: BTreeMap<String, u8>,
}

impl ParamBits {
    pub fn new<I, S>(address: u16, bits: I) -> Self
    where
        I: IntoIterator<Item = (S, u8)>,
        S: Into<String>,
    {
        Self {
            address,
            bits: bits.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl ParamSpec for ParamBits {
    fn keys(&self) -> Vec<&str> {
        self.bits.keys().map(String::as_str).collect()
    }

    fn addresses(&self) -> Vec<u16> {
        vec![self.address]
    }

    fn decode(&self, map: &AddressMap) -> Values {
        let Ok(raw) = map.get(self.address) else {
            return Values::new();
        };
        self.bits
            .iter()
            .map(|(name, bit)| (name.clone(), Value::Bool(raw >> bit & 1 == 1)))
            .collect()
    }

    fn encode(&self, values: &Values, map: &mut AddressMap) -> Result<()> {
        let mut word = map.get(self.address).unwrap_or(0);
        let mut touched = false;
        for (name, bit) in &self.bits {
            if let Some(value) = values.get(name) {
                let set = value
                    .as_bool()
                    .ok_or_else(|| encode_error(name, format!("{value} is not a bool")))?;
                if set {
                    word |= 1 << bit;
                } else {
                    word &= !(1 << bit);
                }
                touched = true;
            }
        }
        if touched {
            map.set(self.address, word);
        }
        Ok(())
    }
}

/// Masked field translated through a lookup table.
#[derive(Debug, Clone)]
pub struct ParamLookup {
    address: u16,
    name: String,
    mask: u16,
    rshift: u8,
    table: Vec<(u16, Value)>,
    reverse: Vec<(Value, u16)>,
}

impl ParamLookup {
    pub fn new<I>(address: u16, name: impl Into<String>, mask: u16, rshift: u8, table: I) -> Self
    where
        I: IntoIterator<Item = (u16, Value)>,
    {
        let table: Vec<(u16, Value)> = table.into_iter().collect();
        let mut reverse: Vec<(Value, u16)> = Vec::new();
        for (raw, value) in &table {
            if !reverse.iter().any(|(v, _)| v == value) {
                reverse.push((value.clone(), *raw));
            }
        }
        Self {
            address,
            name: name.into(),
            mask,
            rshift,
            table,
            reverse,
        }
    }

    /// Overrides the raw code written for a value.
    pub fn encode_as(mut self, value: impl Into<Value>, raw: u16) -> Self {
        let value = value.into();
        self.reverse.retain(|(v, _)| *v != value);
        self.reverse.push((value, raw));
        self
    }
}

impl ParamSpec for ParamLookup {
    fn keys(&self) -> Vec<&str> {
        vec![self.name.as_str()]
    }

    fn addresses(&self) -> Vec<u16> {
        vec![self.address]
    }

    fn decode(&self, map: &AddressMap) -> Values {
        let mut values = Values::new();
        if let Ok(raw) = map.get(self.address) {
            let code = (raw & self.mask) >> self.rshift;
            if let Some((_, value)) = self.table.iter().find(|(raw, _)| *raw == code) {
                values.insert(self.name.clone(), value.clone());
            } else {
                log::debug!("{}: no lookup entry for {code}", self.name);
            }
        }
        values
    }

    fn encode(&self, values: &Values, map: &mut AddressMap) -> Result<()> {
        let Some(value) = values.get(&self.name) else {
            return Ok(());
        };
        let (_, code) = self
            .reverse
            .iter()
            .find(|(v, _)| v == value)
            .ok_or_else(|| encode_error(&self.name, format!("{value} has no table entry")))?;
        let current = map.get(self.address).unwrap_or(0);
        map.set(
            self.address,
            (current & !self.mask) | ((code << self.rshift) & self.mask),
        );
        Ok(())
    }
}

/// Machine integer types spanning one or two registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CType {
    Short,
    UShort,
    /// 32 bit unsigned, high word at the lower address.
    UInt,
}

#[derive(Debug, Clone)]
pub struct ParamCType {
    address: u16,
    name: String,
    ctype: CType,
}

impl ParamCType {
    pub fn new(address: u16, name: impl Into<String>, ctype: CType) -> Self {
        Self {
            address,
            name: name.into(),
            ctype,
        }
    }
}

impl ParamSpec for ParamCType {
    fn keys(&self) -> Vec<&str> {
        vec![self.name.as_str()]
    }

    fn addresses(&self) -> Vec<u16> {
        match self.ctype {
            CType::Short | CType::UShort => vec![self.address],
            CType::UInt => std::iter::once(self.address)
                .chain(self.address.checked_add(1))
                .collect(),
        }
    }

    fn decode(&self, map: &AddressMap) -> Values {
        let mut values = Values::new();
        let value = match self.ctype {
            CType::Short => map.get(self.address).map(|raw| Value::Int(i64::from(raw as i16))),
            CType::UShort => map.get(self.address).map(Value::from),
            CType::UInt => match self.address.checked_add(1) {
                Some(low) => map
                    .get(self.address)
                    .and_then(|high| Ok(Value::from(u32::from(high) << 16 | u32::from(map.get(low)?)))),
                None => Err(Error::MissingRegister(self.address)),
            },
        };
        if let Ok(value) = value {
            values.insert(self.name.clone(), value);
        }
        values
    }

    fn encode(&self, values: &Values, map: &mut AddressMap) -> Result<()> {
        let Some(value) = values.get(&self.name) else {
            return Ok(());
        };
        let raw = value
            .as_i64()
            .ok_or_else(|| encode_error(&self.name, format!("{value} is not an integer")))?;
        let out_of_range = || encode_error(&self.name, format!("{raw} out of range for {:?}", self.ctype));
        match self.ctype {
            CType::Short => {
                let raw = i16::try_from(raw).map_err(|_| out_of_range())?;
                map.set(self.address, raw as u16);
            }
            CType::UShort => {
                let raw = u16::try_from(raw).map_err(|_| out_of_range())?;
                map.set(self.address, raw);
            }
            CType::UInt => {
                let raw = u32::try_from(raw).map_err(|_| out_of_range())?;
                if self.address == u16::MAX {
                    return Err(encode_error(&self.name, "u32 does not fit above the last register"));
                }
                map.set_range(self.address, &[(raw >> 16) as u16, raw as u16]);
            }
        }
        Ok(())
    }
}
