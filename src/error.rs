//! Error type shared by the protocol engines.
//!
//! Transport faults (unreachable, timeout, vendor exception) are a single
//! class as far as callers are concerned: [`Error::is_transport`] tells them
//! apart from wiring faults ([`Error::InterfaceMismatch`]) and programming
//! errors.
use crate::protocol::ExceptionKind;

/// Represents all possible errors of the iMAC2 protocol layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The transport is unreachable, closed or timed out.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The device answered with a vendor exception code.
    #[error("Modbus exception {code}: {kind}")]
    Exception { code: u8, kind: ExceptionKind },

    /// No client is configured for the interface.
    #[error("No {0} client connected")]
    NotConnected(&'static str),

    /// The device on the other end is not the one the identity expects.
    #[error("{interface} interface mismatch: {detail}")]
    InterfaceMismatch {
        interface: &'static str,
        detail: String,
    },

    /// A handshake bit of the master did not hold the expected value.
    #[error("Bit {bit} of register {register:#06x} is not {expected}")]
    BitCheck {
        register: u16,
        bit: u8,
        expected: bool,
    },

    /// A handshake bit of the master never reached the expected value.
    #[error("Timeout waiting for bit {bit} of register {register:#06x}")]
    BitTimeout { register: u16, bit: u8 },

    /// Read back after a write did not match what was written.
    #[error("Read back of {0} did not match the written value")]
    WriteVerification(String),

    /// A register required by a decode was never populated.
    #[error("Register {0:#06x} not populated")]
    MissingRegister(u16),

    #[error("Cannot encode {name}: {reason}")]
    Encode { name: String, reason: String },

    /// The module has not been announced by a roll call yet.
    #[error("Module has no identity yet")]
    Unidentified,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Builds the error for a vendor exception code.
    pub fn exception(code: u8) -> Self {
        Error::Exception {
            code,
            kind: ExceptionKind::decode(code),
        }
    }

    /// Builds an I/O error of the given kind.
    pub fn io(kind: std::io::ErrorKind, msg: impl Into<String>) -> Self {
        Error::Io(std::io::Error::new(kind, msg.into()))
    }

    /// Whether this is a failure of the transport rather than of the data or the wiring.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Exception { .. } | Error::NotConnected(_) | Error::BitTimeout { .. }
        )
    }

    /// Whether a block read or write that failed this way should only drop the block.
    pub fn is_block_failure(&self) -> bool {
        self.is_transport()
            || matches!(
                self,
                Error::BitCheck { .. } | Error::MissingRegister(_) | Error::WriteVerification(_)
            )
    }
}

#[cfg(any(feature = "tokio-rtu", feature = "tokio-tcp"))]
impl From<tokio_modbus::Error> for Error {
    fn from(err: tokio_modbus::Error) -> Error {
        match err {
            tokio_modbus::Error::Transport(err) => Error::Io(err),
            err => Error::io(std::io::ErrorKind::InvalidData, err.to_string()),
        }
    }
}

#[cfg(any(feature = "tokio-rtu", feature = "tokio-tcp"))]
impl From<tokio_modbus::ExceptionCode> for Error {
    fn from(code: tokio_modbus::ExceptionCode) -> Error {
        Error::exception(u8::from(code))
    }
}

/// The result type of the protocol layer.
pub type Result<T> = std::result::Result<T, Error>;
