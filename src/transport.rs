//! Register level transport consumed by the protocol engines.
//!
//! Implementations map every failure onto [`Error`]: an unreachable peer, a
//! closed connection and a timed out request are all [`Error::Io`], a vendor
//! exception is [`Error::Exception`].

use crate::{address_map::AddressMap, Error, Result};
use async_trait::async_trait;
use std::fmt;

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn read_holding_registers(&self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>>;

    async fn write_registers(&self, unit: u8, address: u16, values: &[u16]) -> Result<()>;

    async fn write_coil(&self, unit: u8, address: u16, value: bool) -> Result<()>;

    /// Whether the underlying connection is believed to be up.
    fn is_connected(&self) -> bool;
}

/// Reads `count` registers into an [`AddressMap`].
pub async fn read_map(transport: &dyn Transport, unit: u8, address: u16, count: u16) -> Result<AddressMap> {
    let registers = transport.read_holding_registers(unit, address, count).await?;
    if registers.len() != usize::from(count) {
        return Err(Error::io(
            std::io::ErrorKind::InvalidData,
            format!(
                "Expected {count} registers from {address:#06x}, got {}",
                registers.len()
            ),
        ));
    }
    Ok(AddressMap::from_registers(address, &registers))
}

/// Reads a single register.
pub async fn read_single(transport: &dyn Transport, unit: u8, address: u16) -> Result<u16> {
    read_map(transport, unit, address, 1).await?.get(address)
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transport for tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// A flat register file. Coil writes set or clear the matching register bit.
    #[derive(Debug)]
    pub struct MockTransport {
        pub registers: Mutex<AddressMap>,
        pub writes: Mutex<Vec<(u16, Vec<u16>)>>,
        pub coils: Mutex<Vec<(u16, bool)>>,
        pub fail: AtomicBool,
        pub connected: AtomicBool,
        pub reads: AtomicUsize,
        pub delay: Option<Duration>,
    }

    impl MockTransport {
        pub fn new(registers: AddressMap) -> Self {
            Self {
                registers: Mutex::new(registers),
                writes: Mutex::new(Vec::new()),
                coils: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                connected: AtomicBool::new(true),
                reads: AtomicUsize::new(0),
                delay: None,
            }
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn read_count(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }

        pub fn register(&self, address: u16) -> Option<u16> {
            self.registers.lock().unwrap().get(address).ok()
        }

        fn check(&self) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::io(std::io::ErrorKind::TimedOut, "mock timeout"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn read_holding_registers(&self, _unit: u8, address: u16, count: u16) -> Result<Vec<u16>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            let registers = self.registers.lock().unwrap();
            (address..address + count)
                .map(|a| registers.get(a).map_err(|_| Error::exception(2)))
                .collect()
        }

        async fn write_registers(&self, _unit: u8, address: u16, values: &[u16]) -> Result<()> {
            self.check()?;
            self.registers.lock().unwrap().set_range(address, values);
            self.writes.lock().unwrap().push((address, values.to_vec()));
            Ok(())
        }

        async fn write_coil(&self, _unit: u8, address: u16, value: bool) -> Result<()> {
            self.check()?;
            let (register, bit) = (address / 16, address % 16);
            let mut registers = self.registers.lock().unwrap();
            let word = registers.get(register).unwrap_or(0);
            registers.set(
                register,
                if value { word | 1 << bit } else { word & !(1 << bit) },
            );
            self.coils.lock().unwrap().push((address, value));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }
}
