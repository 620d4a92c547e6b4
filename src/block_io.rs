//! Block access "by serial number" through the iMAC master.
//!
//! A module's parameter blocks are not directly addressable. The master
//! exposes a small handshake window at 0x409..=0x411: select the module by
//! serial number, generation and block, raise a request bit, wait for the
//! master to drop it again and check the matching fail bit.

use crate::{
    address_map::AddressMap,
    identity::ModuleIdentity,
    protocol as proto,
    transport::{read_map, read_single, Transport},
    Error, Result,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// How long the master gets to drop a request bit.
pub const BIT_TIMEOUT: Duration = Duration::from_secs(3);
/// Pause between two polls of a request bit.
pub const BIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Atomic access to the parameter blocks of a module.
#[async_trait]
pub trait BlockAccess: Send + Sync + fmt::Debug {
    /// Reads a full block. The result holds 0x409..=0x411.
    async fn read_block(&self, identity: ModuleIdentity, block: u16) -> Result<AddressMap>;

    /// Writes the parameter registers of `image` to a block and waits for the master to confirm.
    async fn write_block(&self, identity: ModuleIdentity, block: u16, image: &AddressMap) -> Result<()>;

    /// Like [`BlockAccess::write_block`] but returns as soon as the request is raised.
    async fn write_block_no_check(&self, identity: ModuleIdentity, block: u16, image: &AddressMap) -> Result<()>;
}

/// [`BlockAccess`] over the master's serial interface.
#[derive(Debug)]
pub struct MasterBlockAccess {
    transport: Arc<dyn Transport>,
    unit: u8,
    // One handshake window serves every module and generation on the master.
    lock: Mutex<()>,
    bit_timeout: Duration,
}

impl MasterBlockAccess {
    pub fn new(transport: Arc<dyn Transport>, unit: u8) -> Self {
        Self {
            transport,
            unit,
            lock: Mutex::new(()),
            bit_timeout: BIT_TIMEOUT,
        }
    }

    pub fn with_bit_timeout(mut self, timeout: Duration) -> Self {
        self.bit_timeout = timeout;
        self
    }

    async fn read_register(&self, address: u16) -> Result<u16> {
        read_single(self.transport.as_ref(), self.unit, address).await
    }

    async fn write(&self, address: u16, values: &[u16]) -> Result<()> {
        self.transport.write_registers(self.unit, address, values).await
    }

    /// Points the handshake window at a module block. Returns the window as it now stands.
    async fn select(&self, identity: ModuleIdentity, block: u16) -> Result<AddressMap> {
        let mut window = read_map(
            self.transport.as_ref(),
            self.unit,
            proto::ROLL_CALL_REG_ADDR,
            proto::BLOCK_READ_REG_QUAN,
        )
        .await?;
        let control = proto::with_generation(window.get(proto::ROLL_CALL_REG_ADDR)?, identity.generation_id);
        self.write(proto::ROLL_CALL_SERIAL_REG_ADDR, &[identity.serial_number]).await?;
        self.write(proto::ROLL_CALL_REG_ADDR, &[control]).await?;
        self.write(proto::ROLL_CALL_BLOCK_REG_ADDR, &[block]).await?;
        window.set(proto::ROLL_CALL_REG_ADDR, control);
        window.set(proto::ROLL_CALL_SERIAL_REG_ADDR, identity.serial_number);
        window.set(proto::ROLL_CALL_BLOCK_REG_ADDR, block);
        Ok(window)
    }

    async fn set_bit(&self, register: u16, bit: u8) -> Result<()> {
        self.transport
            .write_coil(self.unit, proto::coil_address(register, bit), true)
            .await?;
        if self.read_register(register).await? & (1 << bit) == 0 {
            return Err(Error::BitCheck {
                register,
                bit,
                expected: true,
            });
        }
        Ok(())
    }

    async fn check_bit(&self, register: u16, bit: u8, expected: bool) -> Result<()> {
        let set = self.read_register(register).await? >> bit & 1 == 1;
        if set != expected {
            return Err(Error::BitCheck {
                register,
                bit,
                expected,
            });
        }
        Ok(())
    }

    /// Polls a bit until it holds `expected`. One more attempt is made after the timeout elapsed.
    async fn wait_on_bit(&self, register: u16, bit: u8, expected: bool) -> Result<()> {
        let start = Instant::now();
        let mut last_attempt = false;
        loop {
            match self.check_bit(register, bit, expected).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_block_failure() => {
                    log::trace!("Bit {bit} of {register:#06x} not yet {expected}: {err}");
                    if start.elapsed() > self.bit_timeout {
                        if last_attempt {
                            return Err(Error::BitTimeout { register, bit });
                        }
                        last_attempt = true;
                    }
                }
                Err(err) => return Err(err),
            }
            tokio::time::sleep(BIT_POLL_INTERVAL).await;
        }
    }

    async fn stage_write(&self, identity: ModuleIdentity, block: u16, image: &AddressMap) -> Result<()> {
        let mut window = self.select(identity, block).await?;
        let params = image.get_range(proto::BLOCK_PARAM_REG_ADDR..proto::BLOCK_PARAM_REG_ADDR + proto::BLOCK_PARAM_REG_QUAN)?;
        window.set_range(proto::BLOCK_PARAM_REG_ADDR, &params);
        let staged = window.get_range(proto::ROLL_CALL_REG_ADDR..proto::ROLL_CALL_REG_ADDR + proto::BLOCK_READ_REG_QUAN)?;
        self.write(proto::ROLL_CALL_REG_ADDR, &staged).await?;
        self.set_bit(proto::ROLL_CALL_REG_ADDR, proto::WRITE_SERIAL_NUMBER_BIT).await
    }
}

#[async_trait]
impl BlockAccess for MasterBlockAccess {
    async fn read_block(&self, identity: ModuleIdentity, block: u16) -> Result<AddressMap> {
        let _guard = self.lock.lock().await;
        log::debug!("Reading block {block} of {}", identity.dev_id());
        self.select(identity, block).await?;
        self.set_bit(proto::ROLL_CALL_REG_ADDR, proto::READ_SERIAL_NUMBER_BIT).await?;
        self.wait_on_bit(proto::ROLL_CALL_REG_ADDR, proto::READ_SERIAL_NUMBER_BIT, false)
            .await?;
        self.check_bit(proto::ROLL_CALL_REG_ADDR, proto::READ_SERIAL_NUMBER_FAIL_BIT, false)
            .await?;
        read_map(
            self.transport.as_ref(),
            self.unit,
            proto::ROLL_CALL_REG_ADDR,
            proto::BLOCK_READ_REG_QUAN,
        )
        .await
    }

    async fn write_block(&self, identity: ModuleIdentity, block: u16, image: &AddressMap) -> Result<()> {
        let _guard = self.lock.lock().await;
        log::debug!("Writing block {block} of {}", identity.dev_id());
        self.stage_write(identity, block, image).await?;
        self.wait_on_bit(proto::ROLL_CALL_REG_ADDR, proto::WRITE_SERIAL_NUMBER_BIT, false)
            .await?;
        self.check_bit(proto::ROLL_CALL_REG_ADDR, proto::WRITE_SERIAL_NUMBER_FAIL_BIT, false)
            .await
    }

    async fn write_block_no_check(&self, identity: ModuleIdentity, block: u16, image: &AddressMap) -> Result<()> {
        let _guard = self.lock.lock().await;
        log::debug!("Writing block {block} of {} without confirmation", identity.dev_id());
        self.stage_write(identity, block, image).await
    }
}
