//! Register map, bit positions and bit-exact helpers of the iMAC2 bus.
//!
//! Everything in here is a pure function of register values. The async
//! engines in [`crate::module`], [`crate::block_io`] and [`crate::rts`] build
//! on these definitions.

use std::fmt;

/// Modbus unit id of the iMAC master and of RTS controllers.
pub const DEFAULT_UNIT: u8 = 1;

/// Largest number of holding registers fetched in one request.
pub const MAX_BLOCK: u16 = 125;

/// Roll-call control register (generation bits 8..9, handshake bits).
pub const ROLL_CALL_REG_ADDR: u16 = 0x409;
/// Serial number of the module addressed by a block transaction.
pub const ROLL_CALL_SERIAL_REG_ADDR: u16 = 0x40B;
/// Block number addressed by a block transaction.
pub const ROLL_CALL_BLOCK_REG_ADDR: u16 = 0x40D;
/// First of the four module parameter registers.
pub const BLOCK_PARAM_REG_ADDR: u16 = 0x40E;
/// Number of module parameter registers per block.
pub const BLOCK_PARAM_REG_QUAN: u16 = 4;
/// Registers returned by a block read (0x409..=0x411).
pub const BLOCK_READ_REG_QUAN: u16 = BLOCK_PARAM_REG_ADDR + BLOCK_PARAM_REG_QUAN - ROLL_CALL_REG_ADDR;

pub const READ_SERIAL_NUMBER_BIT: u8 = 3;
pub const WRITE_SERIAL_NUMBER_BIT: u8 = 4;
pub const READ_SERIAL_NUMBER_FAIL_BIT: u8 = 6;
pub const WRITE_SERIAL_NUMBER_FAIL_BIT: u8 = 7;
pub const GENERATION_MASK: u16 = 0b11 << 8;

/// Offset from a module address to its status register.
pub const STATUS_OFFSET: u16 = 0x100;
/// Highest iMAC bus address; the status, resistance and error registers of an
/// address sit at fixed offsets above it.
pub const MAX_BUS_ADDRESS: u16 = 0xFF;
/// Offset from a module address to its line resistance register.
pub const RESISTANCE_OFFSET: u16 = 0x200;
/// Offset from a module address to its error counters.
pub const ERROR_COUNT_OFFSET: u16 = 0x300;

/// Field-bus address of the master the controller listens on.
pub const FIELDBUS_ADDRESS_REG_ADDR: u16 = 254;
/// Rotary switch of an RTS controller, zero based logical number in the low nibble.
pub const ROTARY_SWITCH_REG_ADDR: u16 = 0x401;
pub const ROTARY_SWITCH_MASK: u16 = 0xF;

pub const REMOTE_BYPASS_REG_ADDR: u16 = 0x52A;
pub const REMOTE_TRIP_REG_ADDR: u16 = 0x52B;
pub const BOUNDARY_ENABLE_REG_ADDR: u16 = 0x520;
pub const BOUNDARY_ENABLE_REG_QUAN: u16 = 3;
pub const BOUNDARY_DETECTORS: usize = 40;

/// Register windows sampled by an RTS poll, as `(start, stop)` half open ranges.
pub const RTS_POLL_WINDOWS: [(u16, u16); 3] = [(0, 0x47F), (0x500, 0x580), (0x600, 0x6A2)];

/// Topic carrying module state updates.
pub const MODULE_DATA_TOPIC: &str = "imac_module_data";
/// Prefix of the per field fan-out topics.
pub const PARAMETER_TRIGGER_TOPIC: &str = "parameter_trigger";

/// The external stable key of a module.
pub fn dev_id(serial_number: u16, generation_id: u8) -> String {
    format!("{}-G{}", serial_number, u16::from(generation_id) + 1)
}

/// Topic for the fan-out of a single field of a module.
pub fn parameter_trigger_topic(dev_id: &str, field: &str) -> String {
    format!("{PARAMETER_TRIGGER_TOPIC}/{dev_id}/{field}")
}

/// Schedule key of a parameter of a module.
pub fn schedule_key(dev_id: &str, param: &str) -> String {
    format!("{dev_id}::{param}")
}

/// Software version nibble of the packed version word.
pub fn software_version(version: u16) -> u16 {
    (version & 0xF00) >> 8
}

/// Hardware version nibble of the packed version word.
pub fn hardware_version(version: u16) -> u16 {
    (version & 0xF000) >> 12
}

/// Replaces the generation bits of the roll-call register.
pub fn with_generation(roll_call: u16, generation_id: u8) -> u16 {
    (roll_call & !GENERATION_MASK) | ((u16::from(generation_id) << 8) & GENERATION_MASK)
}

/// Coil address of a single bit of a holding register.
pub fn coil_address(register: u16, bit: u8) -> u16 {
    register * 16 + u16::from(bit)
}

/// Splits `(start, stop)` windows into `(address, count)` requests of at most `max_block` registers.
pub fn modbus_ranges(windows: &[(u16, u16)], max_block: u16) -> Vec<(u16, u16)> {
    let max_block = max_block.max(1);
    let mut ranges = Vec::new();
    for &(start, stop) in windows {
        let mut address = start;
        while address < stop {
            let count = max_block.min(stop - address);
            ranges.push((address, count));
            address += count;
        }
    }
    ranges
}

/// Packs booleans into consecutive registers, least significant bit first.
pub fn pack_bits(bits: &[bool], registers: usize) -> Vec<u16> {
    let mut words = vec![0u16; registers];
    for (index, bit) in bits.iter().enumerate() {
        if *bit {
            words[index / 16] |= 1 << (index % 16);
        }
    }
    words
}

/// Status of a module as reported by its status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Clash,
    System,
    L1Owned,
    L2Owned,
    Online,
    Offline,
    NeverOnline,
}

const STATUS_ON_SCAN: u16 = 1 << 0;
const STATUS_L1_CLASH: u16 = 1 << 1;
const STATUS_GLOBAL_SELECT: u16 = 1 << 2;
const STATUS_L1_OWNED: u16 = 1 << 3;
const STATUS_L2_OWNED: u16 = 1 << 4;
const STATUS_SYSTEM_OWNED: u16 = 1 << 5;
const STATUS_L2_CLASH: u16 = 1 << 6;

impl ModuleStatus {
    pub fn decode(value: u16) -> Self {
        let status = value & 0x7F;
        let has = |bits: u16| status & bits == bits;
        if status & (STATUS_L1_CLASH | STATUS_L2_CLASH) != 0 {
            ModuleStatus::Clash
        } else if has(STATUS_SYSTEM_OWNED) {
            ModuleStatus::System
        } else if has(STATUS_GLOBAL_SELECT | STATUS_L1_OWNED) {
            ModuleStatus::L1Owned
        } else if has(STATUS_GLOBAL_SELECT | STATUS_L2_OWNED) {
            ModuleStatus::L2Owned
        } else if has(STATUS_ON_SCAN | STATUS_L1_OWNED) {
            ModuleStatus::Online
        } else if has(STATUS_ON_SCAN) {
            ModuleStatus::Offline
        } else {
            ModuleStatus::NeverOnline
        }
    }

    /// Whether poll data at an address with this status is trustworthy.
    pub fn is_live(&self) -> bool {
        matches!(self, ModuleStatus::Online | ModuleStatus::System)
    }
}

/// Failure kind a vendor exception code stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    DeviceBusy,
    NegativeAcknowledge,
    MemoryParity,
    GatewayPathUnavailable,
    GatewayNoResponse,
    Connection,
    Unknown,
}

impl ExceptionKind {
    pub fn decode(code: u8) -> Self {
        match code {
            1 => ExceptionKind::IllegalFunction,
            2 => ExceptionKind::IllegalDataAddress,
            3 => ExceptionKind::IllegalDataValue,
            4 => ExceptionKind::SlaveDeviceFailure,
            5 => ExceptionKind::Acknowledge,
            6 => ExceptionKind::DeviceBusy,
            7 => ExceptionKind::NegativeAcknowledge,
            8 => ExceptionKind::MemoryParity,
            10 => ExceptionKind::GatewayPathUnavailable,
            11 => ExceptionKind::GatewayNoResponse,
            12 => ExceptionKind::Connection,
            _ => ExceptionKind::Unknown,
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExceptionKind::IllegalFunction => "illegal function",
            ExceptionKind::IllegalDataAddress => "illegal data address",
            ExceptionKind::IllegalDataValue => "illegal data value",
            ExceptionKind::SlaveDeviceFailure => "slave device failure",
            ExceptionKind::Acknowledge => "acknowledge",
            ExceptionKind::DeviceBusy => "device busy",
            ExceptionKind::NegativeAcknowledge => "negative acknowledge",
            ExceptionKind::MemoryParity => "memory parity error",
            ExceptionKind::GatewayPathUnavailable => "gateway path unavailable",
            ExceptionKind::GatewayNoResponse => "gateway target failed to respond",
            ExceptionKind::Connection => "connection error",
            ExceptionKind::Unknown => "unknown exception",
        };
        write!(f, "{text}")
    }
}
