//! Module identities as announced by a roll call.

use crate::{address_map::AddressMap, protocol as proto, Error, Result};

/// Serial number and generation: everything needed to address a module's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleIdentity {
    pub serial_number: u16,
    /// Zero based generation. Generation 2 on the label is `1` here.
    pub generation_id: u8,
}

impl ModuleIdentity {
    pub fn new(serial_number: u16, generation_id: u8) -> Self {
        Self {
            serial_number,
            generation_id,
        }
    }

    pub fn dev_id(&self) -> String {
        proto::dev_id(self.serial_number, self.generation_id)
    }
}

/// One module announcement read from the master's roll-call registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollCall {
    pub serial_number: u16,
    pub generation_id: u8,
    /// Bus address of the role that answered.
    pub address: u16,
    pub version: u16,
    pub module_type: u16,
}

impl RollCall {
    /// Decodes the 0x409..=0x411 register image of a roll-call response.
    pub fn decode(map: &AddressMap) -> Result<Self> {
        let control = map.get(proto::ROLL_CALL_REG_ADDR)?;
        let address = map.get(proto::ROLL_CALL_REG_ADDR + 1)?;
        let serial_number = map.get(proto::ROLL_CALL_SERIAL_REG_ADDR)?;
        let type_version = map.get(proto::ROLL_CALL_SERIAL_REG_ADDR + 1)?;
        Ok(Self {
            serial_number,
            generation_id: ((control & proto::GENERATION_MASK) >> 8) as u8,
            address: address & 0xFF,
            version: type_version >> 8,
            module_type: type_version & 0xFF,
        })
    }

    pub fn identity(&self) -> ModuleIdentity {
        ModuleIdentity::new(self.serial_number, self.generation_id)
    }

    pub fn dev_id(&self) -> String {
        self.identity().dev_id()
    }
}

/// Announcement of a remote tripping station.
///
/// The controller has no serial number; its `dev_id` is `rts-<fieldbus>-<logical>`
/// and `schema` names the address range (`rts-config-0..2`) the address falls in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtsRollCall {
    pub address: u16,
    pub dev_id: String,
    pub schema: String,
}

pub const RTS_SCHEMAS: [&str; 3] = ["rts-config-0", "rts-config-1", "rts-config-2"];

impl RtsRollCall {
    /// Fieldbus address and logical number encoded in the `dev_id`.
    pub fn location(&self) -> Result<(u16, u16)> {
        let invalid = || Error::Config(format!("Invalid RTS dev_id {}", self.dev_id));
        let mut parts = self.dev_id.split('-');
        let (Some(_), Some(fieldbus), Some(logical), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let fieldbus = fieldbus.parse().map_err(|_| invalid())?;
        let logical: u16 = logical.parse().map_err(|_| invalid())?;
        if logical == 0 {
            return Err(invalid());
        }
        Ok((fieldbus, logical))
    }

    pub fn schema_is_known(&self) -> bool {
        RTS_SCHEMAS.contains(&self.schema.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn roll_call_decode() {
        let map = AddressMap::from_registers(
            proto::ROLL_CALL_REG_ADDR,
            &[0x0100, 0x0042, 1000, 0x3D3D, 0, 0, 0, 0, 0],
        );
        let roll = RollCall::decode(&map).unwrap();
        assert_eq!(
            roll,
            RollCall {
                serial_number: 1000,
                generation_id: 1,
                address: 0x42,
                version: 0x3D,
                module_type: 61,
            }
        );
        assert_eq!(roll.dev_id(), "1000-G2");
        assert_matches!(
            RollCall::decode(&AddressMap::new()),
            Err(Error::MissingRegister(proto::ROLL_CALL_REG_ADDR))
        );
    }

    #[test]
    fn rts_location() {
        let roll = RtsRollCall {
            address: 216,
            dev_id: "rts-3-1".into(),
            schema: "rts-config-0".into(),
        };
        assert_eq!(roll.location().unwrap(), (3, 1));
        assert!(roll.schema_is_known());
        for bad in ["rts-3", "rts-x-1", "rts-3-0", "rts-3-1-2"] {
            let roll = RtsRollCall {
                dev_id: bad.into(),
                ..roll.clone()
            };
            assert_matches!(roll.location(), Err(Error::Config(_)), "{bad}");
        }
    }
}
