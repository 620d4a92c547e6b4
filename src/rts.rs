//! Remote tripping station.
//!
//! The RTS is a controller with its own serial and ethernet interfaces next to
//! its iMAC bus presence. Every access over one of those interfaces is gated
//! by a [`ConnectionValidator`], and a background loop samples the controller's
//! register windows on a fixed interval.

use crate::{
    address_map::AddressMap,
    config::{Communication, CommunicationConfig, ModuleSettings, PollSettings},
    events::EventBus,
    identity::{RtsRollCall, RTS_SCHEMAS},
    module::{address_of, diagnostic_specs, Family, Module, DEV_ID_KEY},
    param::{param, ParamBits, ParamLookup, ParamMask, ParamMaskBool},
    protocol as proto,
    schedule::Schedule,
    state::ModuleState,
    table::ParameterTable,
    transport::{read_map, read_single, Transport},
    validator::{ConnectionValidator, ExpectedLocation, Interface, ValidationState},
    value::{Value, Values},
    Error, Result,
};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Non volatile settings of the controller.
const NVM_REG_ADDR: u16 = 0x520;
const NVM_REG_QUAN: u16 = 11;

const RTS_STATUS_BITS: [(&str, u8); 6] = [
    ("mcb-nc", 10),
    ("mcb-no", 11),
    ("mcb-bypass", 12),
    ("tmr-trip", 13),
    ("ar-state", 14),
    ("gas-trip", 15),
];

/// How a poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollExit {
    /// The stop signal was raised.
    Stopped,
    /// The loop was cancelled while the stop signal was not set.
    Unexpected,
}

#[derive(Debug, Clone)]
struct Client {
    transport: Arc<dyn Transport>,
    unit: u8,
}

#[derive(Debug)]
struct Link {
    client: RwLock<Option<Client>>,
    validator: ConnectionValidator,
}

impl Link {
    fn new(interface: Interface) -> Self {
        Self {
            client: RwLock::new(None),
            validator: ConnectionValidator::new(interface),
        }
    }
}

#[derive(Debug)]
pub struct Rts {
    module: Module,
    serial: Link,
    ethernet: Link,
    controller: ParameterTable,
    ranges: Vec<(u16, u16)>,
    interval: Duration,
}

impl Rts {
    pub fn new(events: EventBus, schedule: Schedule, poll: &PollSettings) -> Self {
        Self {
            module: Module::controller(Family::Rts, events, schedule),
            serial: Link::new(Interface::Serial),
            ethernet: Link::new(Interface::Ethernet),
            controller: controller_specs(),
            ranges: proto::modbus_ranges(&proto::RTS_POLL_WINDOWS, poll.max_block),
            interval: poll.interval.max(Duration::from_millis(1)),
        }
    }

    pub fn with_settings(mut self, settings: ModuleSettings) -> Self {
        self.module = self.module.with_settings(settings);
        self
    }

    pub fn with_collect(mut self, collect: BTreeMap<String, Duration>) -> Self {
        self.module = self.module.with_collect(collect);
        self
    }

    /// The bus side of the controller: identity, state and poll specs.
    pub fn module(&self) -> &Module {
        &self.module
    }

    fn link(&self, interface: Interface) -> &Link {
        match interface {
            Interface::Serial => &self.serial,
            Interface::Ethernet => &self.ethernet,
        }
    }

    pub fn validation_state(&self, interface: Interface) -> ValidationState {
        self.link(interface).validator.state()
    }

    /// Uses `transport` for `interface` from now on. The interface validates again.
    pub async fn attach(&self, interface: Interface, transport: Arc<dyn Transport>, unit: u8) {
        let link = self.link(interface);
        *link.client.write().await = Some(Client { transport, unit });
        link.validator.invalidate();
    }

    pub async fn detach(&self, interface: Interface) {
        let link = self.link(interface);
        *link.client.write().await = None;
        link.validator.invalidate();
    }

    pub async fn is_attached(&self, interface: Interface) -> bool {
        self.link(interface).client.read().await.is_some()
    }

    /// Applies a communication change. Changed interfaces are reconnected
    /// through `connect` and validate again; a failed connect leaves the
    /// interface detached. Returns the interfaces that changed.
    pub async fn reconfigure<F, Fut>(
        &self,
        old: &CommunicationConfig,
        new: &CommunicationConfig,
        connect: F,
    ) -> BTreeSet<Interface>
    where
        F: Fn(Communication) -> Fut,
        Fut: Future<Output = Result<Arc<dyn Transport>>>,
    {
        let dev_id = self.module.dev_id().await.unwrap_or_default();
        let changes = old.changes(new);
        for interface in &changes {
            let Some(comm) = new.get(*interface) else {
                log::info!("Removing {} interface of {dev_id}", interface.name());
                self.detach(*interface).await;
                continue;
            };
            log::info!("Attempting to connect to {} for {dev_id}", interface.name());
            match connect(comm.clone()).await {
                Ok(transport) => self.attach(*interface, transport, comm.unit).await,
                Err(err) => {
                    log::error!("Cannot connect {} interface of {dev_id}: {err}", interface.name());
                    self.detach(*interface).await;
                }
            }
        }
        changes
    }

    /// Takes on the identity announced for the controller.
    pub async fn apply_roll_call(&self, roll_call: &RtsRollCall) -> Result<()> {
        if !roll_call.schema_is_known() {
            log::info!(
                "Schema violation: RTS address {} not in schema ({})",
                roll_call.address,
                roll_call.schema
            );
        }
        let (fieldbus_address, logical_number) = roll_call.location()?;
        let previous = self.module.dev_id().await;
        let mut params = Values::new();
        params.insert(format!("address-{}", roll_call.schema), roll_call.address.into());
        params.insert(DEV_ID_KEY.into(), roll_call.dev_id.as_str().into());
        params.insert("fieldbus-address".into(), fieldbus_address.into());
        params.insert("logical-number".into(), logical_number.into());
        self.module.apply_identity(params).await?;
        if previous.as_deref() != Some(roll_call.dev_id.as_str()) {
            self.serial.validator.invalidate();
            self.ethernet.validator.invalidate();
        }
        Ok(())
    }

    async fn location(&self) -> Result<(String, ExpectedLocation)> {
        let state = self.module.state().await;
        let dev_id = state.get(DEV_ID_KEY).and_then(Value::as_str).map(str::to_string);
        let fieldbus_address = state.int("fieldbus-address").and_then(|v| u16::try_from(v).ok());
        let logical_number = state.int("logical-number").and_then(|v| u16::try_from(v).ok());
        match (dev_id, fieldbus_address, logical_number) {
            (Some(dev_id), Some(fieldbus_address), Some(logical_number)) => Ok((
                dev_id,
                ExpectedLocation {
                    fieldbus_address,
                    logical_number,
                },
            )),
            _ => Err(Error::Unidentified),
        }
    }

    fn publish_comms_status(&self, dev_id: &str, interface: Interface, ok: bool) {
        let mut values = Values::new();
        values.insert(interface.comms_status_key(), Value::Bool(ok));
        self.module
            .events()
            .publish_module_data(dev_id, values, SystemTime::now());
    }

    /// Validates `interface`, runs `op` on it and reports the outcome as comms status.
    async fn io<T, F, Fut>(&self, interface: Interface, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Transport>, u8) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let link = self.link(interface);
        let client = link.client.read().await.clone();
        let (dev_id, expected) = self.location().await?;
        let unit = client.as_ref().map_or(proto::DEFAULT_UNIT, |c| c.unit);
        link.validator
            .ensure_valid(
                client.as_ref().map(|c| c.transport.as_ref()),
                unit,
                expected,
                self.module.events(),
                &dev_id,
            )
            .await?;
        let Some(client) = client else {
            return Err(Error::NotConnected(interface.name()));
        };
        let result = op(client.transport.clone(), client.unit).await;
        link.validator.record_io(result.is_ok());
        if let Err(err) = &result {
            if client.transport.is_connected() {
                log::error!("{dev_id} {} I/O failed: {err}", interface.name());
            }
        }
        self.publish_comms_status(&dev_id, interface, result.is_ok());
        result
    }

    pub async fn read_eth(&self, address: u16, count: u16) -> Result<AddressMap> {
        self.io(Interface::Ethernet, |transport, unit| async move {
            read_map(transport.as_ref(), unit, address, count).await
        })
        .await
    }

    pub async fn read_ser(&self, address: u16, count: u16) -> Result<AddressMap> {
        self.io(Interface::Serial, |transport, unit| async move {
            read_map(transport.as_ref(), unit, address, count).await
        })
        .await
    }

    pub async fn read_ser_single(&self, address: u16) -> Result<u16> {
        self.io(Interface::Serial, |transport, unit| async move {
            read_single(transport.as_ref(), unit, address).await
        })
        .await
    }

    pub async fn write_ser(&self, address: u16, values: &[u16]) -> Result<()> {
        let values = values.to_vec();
        self.io(Interface::Serial, |transport, unit| async move {
            transport.write_registers(unit, address, &values).await
        })
        .await
    }

    /// Sets a single bit of a holding register through its coil over serial.
    pub async fn write_bit(&self, register: u16, bit: u8, value: bool) -> Result<()> {
        let coil = proto::coil_address(register, bit);
        self.io(Interface::Serial, |transport, unit| async move {
            transport.write_coil(unit, coil, value).await
        })
        .await
    }

    async fn logical_bit(&self) -> Result<u8> {
        let (dev_id, expected) = self.location().await?;
        expected
            .logical_number
            .checked_sub(1)
            .and_then(|bit| u8::try_from(bit).ok())
            .filter(|bit| *bit < 16)
            .ok_or_else(|| Error::Config(format!("{dev_id} has no remote control bit")))
    }

    pub async fn remote_bypass(&self, value: bool) -> Result<()> {
        let bit = self.logical_bit().await?;
        self.write_bit(proto::REMOTE_BYPASS_REG_ADDR, bit, value).await
    }

    pub async fn remote_trip(&self, value: bool) -> Result<()> {
        let bit = self.logical_bit().await?;
        self.write_bit(proto::REMOTE_TRIP_REG_ADDR, bit, value).await
    }

    /// Enables boundary detectors 1..=40 and verifies the controller took them.
    pub async fn boundary_enable(&self, detectors: &[bool]) -> Result<()> {
        if detectors.len() != proto::BOUNDARY_DETECTORS {
            return Err(Error::Encode {
                name: "boundary-enable".into(),
                reason: format!(
                    "expected {} detectors, got {}",
                    proto::BOUNDARY_DETECTORS,
                    detectors.len()
                ),
            });
        }
        let words = proto::pack_bits(detectors, usize::from(proto::BOUNDARY_ENABLE_REG_QUAN));
        self.write_ser(proto::BOUNDARY_ENABLE_REG_ADDR, &words).await?;
        let readback = self
            .read_ser(proto::BOUNDARY_ENABLE_REG_ADDR, proto::BOUNDARY_ENABLE_REG_QUAN)
            .await?;
        let range = proto::BOUNDARY_ENABLE_REG_ADDR..proto::BOUNDARY_ENABLE_REG_ADDR + proto::BOUNDARY_ENABLE_REG_QUAN;
        if readback.get_range(range)? != words {
            return Err(Error::WriteVerification("boundary-enable".into()));
        }
        Ok(())
    }

    /// Reads the non volatile settings, over ethernet when it is attached.
    pub async fn read_nvm(&self) -> Result<AddressMap> {
        if self.is_attached(Interface::Ethernet).await {
            self.read_eth(NVM_REG_ADDR, NVM_REG_QUAN).await
        } else {
            self.read_ser(NVM_REG_ADDR, NVM_REG_QUAN).await
        }
    }

    /// Reads the non volatile settings and decodes the poll specs they hold.
    pub async fn process_nvm(&self) -> Result<Values> {
        let map = self.read_nvm().await?;
        let timestamp = SystemTime::now();
        let values = self.module.process_module_data(map).await;
        self.module.apply_poll(values.clone(), timestamp).await?;
        Ok(values)
    }

    /// Fills in the bus addresses of the schemas the controller was not announced under.
    pub async fn find_missing_starting_data(&self, address_schema: &BTreeMap<String, u16>) -> Values {
        let (dev_id, expected) = match self.location().await {
            Ok(location) => location,
            Err(err) => {
                log::warn!("Cannot complete RTS addresses: {err}");
                return Values::new();
            }
        };
        let missing: Vec<&str> = {
            let state = self.module.state().await;
            RTS_SCHEMAS
                .into_iter()
                .filter(|schema| state.get(&format!("address-{schema}")).is_none())
                .collect()
        };
        let mut found = Values::new();
        for schema in missing {
            let Some(start) = address_schema.get(schema) else {
                log::warn!("Failed to match RTS schema {schema} for {dev_id}");
                continue;
            };
            match start
                .checked_add(expected.logical_number - 1)
                .filter(|address| *address <= proto::MAX_BUS_ADDRESS)
            {
                Some(address) => {
                    found.insert(format!("address-{schema}"), address.into());
                }
                None => log::warn!(
                    "RTS schema {schema} starting at {start} has no bus address for logical {} of {dev_id}",
                    expected.logical_number
                ),
            }
        }
        if !found.is_empty() {
            if let Err(err) = self.module.apply_poll(found.clone(), SystemTime::now()).await {
                log::warn!("Cannot store RTS addresses of {dev_id}: {err}");
            }
        }
        self.module.update_specs().await;
        found
    }

    async fn poll_ethernet(&self, dev_id: &str) -> AddressMap {
        if !self.is_attached(Interface::Ethernet).await {
            self.publish_comms_status(dev_id, Interface::Ethernet, false);
            return AddressMap::new();
        }
        let mut map = AddressMap::new();
        for &(address, count) in &self.ranges {
            match self.read_eth(address, count).await {
                Ok(chunk) => {
                    map.merge(&chunk);
                }
                Err(err) => {
                    log::debug!("{dev_id} ethernet poll abandoned at {address:#06x}: {err}");
                    return AddressMap::new();
                }
            }
        }
        map
    }

    async fn probe_serial(&self, dev_id: &str) {
        if !self.is_attached(Interface::Serial).await {
            self.publish_comms_status(dev_id, Interface::Serial, false);
            return;
        }
        if let Err(err) = self.read_ser_single(0).await {
            log::debug!("{dev_id} serial probe failed: {err}");
        }
    }

    /// One complete sample of the controller windows.
    ///
    /// Ethernet and serial run side by side. The ethernet snapshot is all or
    /// nothing: one failed chunk discards the others.
    pub async fn poll_once(&self) -> Result<(AddressMap, SystemTime)> {
        let dev_id = self.module.dev_id().await.ok_or(Error::Unidentified)?;
        let (map, ()) = tokio::join!(self.poll_ethernet(&dev_id), self.probe_serial(&dev_id));
        Ok((map, SystemTime::now()))
    }

    /// Polls, decodes the controller data and publishes it.
    pub async fn poll_pipeline(&self) -> Result<Values> {
        let (map, timestamp) = self.poll_once().await?;
        if map.is_empty() {
            return Ok(Values::new());
        }
        let table = self.controller.clone();
        let values = match tokio::task::spawn_blocking(move || decode_controller(&table, &map)).await {
            Ok(values) => values,
            Err(err) => {
                log::error!("Controller decode failed: {err}");
                return Ok(Values::new());
            }
        };
        self.module.apply_poll(values.clone(), timestamp).await?;
        Ok(values)
    }

    /// Runs [`Rts::poll_pipeline`] every poll interval until cancelled.
    ///
    /// `stop` is the process wide stop signal. Firing `cancel` while `stop` is
    /// not set ends the loop as [`PollExit::Unexpected`].
    pub async fn run_poll(&self, stop: CancellationToken, cancel: CancellationToken) -> PollExit {
        let dev_id = self
            .module
            .dev_id()
            .await
            .unwrap_or_else(|| self.module.family().name().to_string());
        log::info!("Starting {dev_id} bus polling");
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            let result = tokio::select! {
                biased;
                () = stop.cancelled() => None,
                () = cancel.cancelled() => None,
                result = async {
                    ticker.tick().await;
                    self.poll_pipeline().await
                } => Some(result),
            };
            match result {
                Some(Ok(values)) => log::trace!("{dev_id} polled {} values", values.len()),
                Some(Err(err)) => {
                    if !stop.is_cancelled() {
                        log::error!("{dev_id} poll failed: {err}");
                    }
                }
                None if stop.is_cancelled() => {
                    log::info!("Closing {dev_id} polling");
                    return PollExit::Stopped;
                }
                None => {
                    log::warn!("{dev_id} polling cancelled without stop signal");
                    return PollExit::Unexpected;
                }
            }
        }
    }
}

/// Bus poll specs of the controller for a given state.
pub(crate) fn poll_specs(table: &mut ParameterTable, state: &ModuleState) {
    let bit = state
        .int("logical-number")
        .and_then(|logical| u8::try_from(logical - 1).ok())
        .filter(|bit| *bit < 16);
    if let Some(bit) = bit {
        table
            .insert_poll(ParamBits::new(proto::REMOTE_BYPASS_REG_ADDR, [("remote-bypass-status", bit)]))
            .insert_poll(ParamBits::new(proto::REMOTE_TRIP_REG_ADDR, [("remote-trip-status", bit)]));
    }
    let mut last = None;
    for schema in RTS_SCHEMAS {
        if let Some(address) = address_of(state, &format!("address-{schema}")) {
            diagnostic_specs(table, schema, address);
            last = Some(address);
        }
    }
    if let Some(address) = last {
        table.insert_poll(ParamBits::new(address, RTS_STATUS_BITS));
    }
}

fn lookup<V: Into<Value>>(
    address: u16,
    name: &str,
    mask: u16,
    rshift: u8,
    table: impl IntoIterator<Item = (u16, V)>,
) -> ParamLookup {
    ParamLookup::new(
        address,
        name,
        mask,
        rshift,
        table.into_iter().map(|(raw, value)| (raw, value.into())),
    )
}

/// Specs of the controller's own register windows.
fn controller_specs() -> ParameterTable {
    let mut table = ParameterTable::new();
    table
        .insert_poll(ParamMask::new(
            proto::ROTARY_SWITCH_REG_ADDR,
            "rotary-sw",
            proto::ROTARY_SWITCH_MASK,
            0,
        ))
        .insert_poll(ParamBits::new(
            0x100,
            [
                ("control-relay-state", 8),
                ("auxiliary-relay-state", 9),
                ("l1-short-circuit-status", 12),
            ],
        ))
        .insert_poll(lookup(
            0x500,
            "serial-protocol",
            0xFF,
            0,
            [
                (0u16, "not-configured"),
                (1, "modbus-master"),
                (2, "modbus-slave"),
                (3, "ip2-protocol"),
                (4, "l1-maintenance"),
                (5, "l2-maintenance"),
            ],
        ))
        .insert_poll(
            lookup(
                0x500,
                "serial-baud-rate",
                0xFF00,
                8,
                [
                    (0u16, 9600i64),
                    (1, 0),
                    (2, 600),
                    (3, 1200),
                    (4, 2400),
                    (5, 4800),
                    (6, 9600),
                    (7, 19200),
                ],
            )
            .encode_as(9600i64, 6),
        )
        .insert_poll(
            lookup(
                0x501,
                "serial-parity",
                0xFF,
                0,
                [(0u16, "even"), (1, "none"), (2, "even"), (3, "odd")],
            )
            .encode_as("even", 2),
        )
        .insert_poll(
            lookup(0x501, "serial-stop-bits", 0xFF00, 8, [(0u16, 1i64), (1, 1), (2, 2)])
                .encode_as(1i64, 1),
        )
        .insert_poll(lookup(
            0x502,
            "serial-mode",
            0xFF,
            0,
            [(0u16, "RS232"), (1, "RS485/RS422")],
        ))
        .insert_poll(ParamMask::new(0x502, "serial-slave-address", 0xFF00, 8))
        .insert_poll(ParamBits::new(
            0x600,
            [("rtc-fault", 0), ("i2c-fault", 1), ("sc-card-fault", 2)],
        ))
        .insert_poll(param(0x601, "controller-temperature").scale(0.01))
        .insert_poll(param(0x523, "master-fieldbus-number"))
        .insert_poll(param(0x524, "plc-activity-word"))
        .insert_poll(ParamMaskBool::new(0x527, "gas-trip", 0x01))
        .insert_poll(ParamBits::new(
            0x52A,
            [
                ("last-trip-clash-boundary", 10),
                ("last-trip-offline-boundary", 11),
                ("last-trip-l2-timeout", 13),
                ("last-trip-no-boundary-enabled", 14),
                ("last-trip-no-boundary-online", 15),
            ],
        ));
    table
}

fn decode_controller(table: &ParameterTable, map: &AddressMap) -> Values {
    table.poll_specs().flat_map(|spec| spec.decode(map)).collect()
}
