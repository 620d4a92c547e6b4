//! Connection validation for dual interface controllers.
//!
//! A controller reachable over serial and ethernet can be wired to the wrong
//! field bus or logical slot. Before an interface is trusted its diagnostic
//! registers are compared against the identity of the module, and the outcome
//! is cached until an I/O failure or a reconfiguration clears it.

use crate::{
    events::EventBus,
    protocol as proto,
    transport::{read_map, Transport},
    value::{Value, Values},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::SystemTime;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Interface {
    Serial,
    Ethernet,
}

impl Interface {
    pub fn name(&self) -> &'static str {
        match self {
            Interface::Serial => "serial",
            Interface::Ethernet => "ethernet",
        }
    }

    pub fn comms_status_key(&self) -> String {
        format!("{}-comms-status", self.name())
    }

    pub fn mismatch_key(&self) -> String {
        format!("interface-mismatch-{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    Unvalidated,
    Validating,
    Valid,
}

impl ValidationState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ValidationState::Validating,
            2 => ValidationState::Valid,
            _ => ValidationState::Unvalidated,
        }
    }
}

/// Where the controller must be, as derived from its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedLocation {
    pub fieldbus_address: u16,
    /// One based; the rotary switch reads this minus one.
    pub logical_number: u16,
}

#[derive(Debug)]
pub struct ConnectionValidator {
    interface: Interface,
    state: AtomicU8,
    comms_status: AtomicBool,
    // Serializes round trips so concurrent users validate once.
    gate: Mutex<()>,
}

impl ConnectionValidator {
    pub fn new(interface: Interface) -> Self {
        Self {
            interface,
            state: AtomicU8::new(ValidationState::Unvalidated as u8),
            comms_status: AtomicBool::new(false),
            gate: Mutex::new(()),
        }
    }

    pub fn interface(&self) -> Interface {
        self.interface
    }

    pub fn state(&self) -> ValidationState {
        ValidationState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ValidationState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Last observed comms status of the interface.
    pub fn comms_status(&self) -> bool {
        self.comms_status.load(Ordering::SeqCst)
    }

    /// Records the outcome of an I/O attempt. A failure clears the cached validation.
    pub fn record_io(&self, ok: bool) {
        self.comms_status.store(ok, Ordering::SeqCst);
        if !ok {
            self.invalidate();
        }
    }

    /// Forces the next access to validate again.
    pub fn invalidate(&self) {
        self.set_state(ValidationState::Unvalidated);
    }

    fn fast_path(&self, transport: &dyn Transport) -> bool {
        transport.is_connected() && self.comms_status() && self.state() == ValidationState::Valid
    }

    /// Makes sure the interface is wired to the expected controller.
    ///
    /// A mismatch publishes `interface-mismatch-<if>` and fails with
    /// [`Error::InterfaceMismatch`]. An unreachable interface publishes
    /// `<if>-comms-status = false` and fails with the transport error.
    pub async fn ensure_valid(
        &self,
        transport: Option<&dyn Transport>,
        unit: u8,
        expected: ExpectedLocation,
        events: &EventBus,
        dev_id: &str,
    ) -> Result<()> {
        if let Some(transport) = transport {
            if self.fast_path(transport) {
                return Ok(());
            }
        }
        let _gate = self.gate.lock().await;
        let result = match transport {
            Some(transport) => {
                if self.fast_path(transport) {
                    return Ok(());
                }
                self.set_state(ValidationState::Validating);
                self.check(transport, unit, expected).await
            }
            None => Err(Error::NotConnected(self.interface.name())),
        };

        let mut values = Values::new();
        match &result {
            Ok(()) => {
                self.set_state(ValidationState::Valid);
                self.comms_status.store(true, Ordering::SeqCst);
                log::debug!("{dev_id} {} interface validated", self.interface.name());
                values.insert(self.interface.mismatch_key(), Value::Bool(false));
            }
            Err(Error::InterfaceMismatch { detail, .. }) => {
                self.set_state(ValidationState::Unvalidated);
                self.comms_status.store(true, Ordering::SeqCst);
                log::info!("{dev_id} {} interface mismatch: {detail}", self.interface.name());
                values.insert(self.interface.comms_status_key(), Value::Bool(true));
                values.insert(self.interface.mismatch_key(), Value::Bool(true));
            }
            Err(err) => {
                self.record_io(false);
                log::debug!("{dev_id} {} interface unreachable: {err}", self.interface.name());
                values.insert(self.interface.comms_status_key(), Value::Bool(false));
            }
        }
        events.publish_module_data(dev_id, values, SystemTime::now());
        result
    }

    async fn check(&self, transport: &dyn Transport, unit: u8, expected: ExpectedLocation) -> Result<()> {
        let mut map = read_map(transport, unit, proto::FIELDBUS_ADDRESS_REG_ADDR, 1).await?;
        map.merge(&read_map(transport, unit, proto::ROTARY_SWITCH_REG_ADDR, 1).await?);
        let fieldbus_address = map.get(proto::FIELDBUS_ADDRESS_REG_ADDR)?;
        if fieldbus_address != expected.fieldbus_address {
            return Err(Error::InterfaceMismatch {
                interface: self.interface.name(),
                detail: format!(
                    "fieldbus read {fieldbus_address} expected {}",
                    expected.fieldbus_address
                ),
            });
        }
        let rotary = map.get(proto::ROTARY_SWITCH_REG_ADDR)? & proto::ROTARY_SWITCH_MASK;
        if rotary + 1 != expected.logical_number {
            return Err(Error::InterfaceMismatch {
                interface: self.interface.name(),
                detail: format!(
                    "logical read {} expected {}",
                    rotary + 1,
                    expected.logical_number
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_map::AddressMap;
    use crate::transport::mock::MockTransport;
    use assert_matches::assert_matches;

    const EXPECTED: ExpectedLocation = ExpectedLocation {
        fieldbus_address: 3,
        logical_number: 2,
    };

    fn controller(fieldbus: u16, rotary: u16) -> MockTransport {
        let mut map = AddressMap::from_registers(proto::FIELDBUS_ADDRESS_REG_ADDR, &[fieldbus]);
        map.set(proto::ROTARY_SWITCH_REG_ADDR, 0xA0 | rotary);
        MockTransport::new(map)
    }

    #[tokio::test]
    async fn valid_result_is_cached() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let transport = controller(3, 1);
        let validator = ConnectionValidator::new(Interface::Ethernet);
        validator
            .ensure_valid(Some(&transport), 1, EXPECTED, &bus, "rts-3-2")
            .await
            .unwrap();
        assert_eq!(validator.state(), ValidationState::Valid);
        let reads = transport.read_count();
        validator
            .ensure_valid(Some(&transport), 1, EXPECTED, &bus, "rts-3-2")
            .await
            .unwrap();
        assert_eq!(transport.read_count(), reads);

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event.values_for("rts-3-2").unwrap()["interface-mismatch-ethernet"],
            Value::Bool(false)
        );
    }

    #[tokio::test]
    async fn io_failure_invalidates_cache() {
        let bus = EventBus::new();
        let transport = controller(3, 1);
        let validator = ConnectionValidator::new(Interface::Serial);
        validator
            .ensure_valid(Some(&transport), 1, EXPECTED, &bus, "rts-3-2")
            .await
            .unwrap();
        validator.record_io(false);
        assert_eq!(validator.state(), ValidationState::Unvalidated);

        let reads = transport.read_count();
        transport.set_failing(true);
        let mut rx = bus.subscribe();
        let err = validator
            .ensure_valid(Some(&transport), 1, EXPECTED, &bus, "rts-3-2")
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(transport.read_count() > reads);
        let values = rx.try_recv().unwrap().data.remove("rts-3-2").unwrap();
        assert_eq!(values["serial-comms-status"], Value::Bool(false));
        assert!(!values.contains_key("interface-mismatch-serial"));

        transport.set_failing(false);
        validator
            .ensure_valid(Some(&transport), 1, EXPECTED, &bus, "rts-3-2")
            .await
            .unwrap();
        assert!(validator.comms_status());
    }

    #[tokio::test]
    async fn mismatch_is_distinct_from_io_error() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let validator = ConnectionValidator::new(Interface::Ethernet);

        let wrong_fieldbus = controller(4, 1);
        assert_matches!(
            validator
                .ensure_valid(Some(&wrong_fieldbus), 1, EXPECTED, &bus, "rts-3-2")
                .await,
            Err(Error::InterfaceMismatch { interface: "ethernet", .. })
        );
        let values = rx.try_recv().unwrap().data.remove("rts-3-2").unwrap();
        assert_eq!(values["ethernet-comms-status"], Value::Bool(true));
        assert_eq!(values["interface-mismatch-ethernet"], Value::Bool(true));
        assert_eq!(validator.state(), ValidationState::Unvalidated);

        // Rotary switch is zero based
        let wrong_slot = controller(3, 2);
        assert_matches!(
            validator
                .ensure_valid(Some(&wrong_slot), 1, EXPECTED, &bus, "rts-3-2")
                .await,
            Err(Error::InterfaceMismatch { .. })
        );
        assert!(!validator.fast_path(&wrong_slot));
    }

    #[tokio::test]
    async fn missing_client_reports_comms_down() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let validator = ConnectionValidator::new(Interface::Serial);
        assert_matches!(
            validator.ensure_valid(None, 1, EXPECTED, &bus, "rts-3-2").await,
            Err(Error::NotConnected("serial"))
        );
        let values = rx.try_recv().unwrap().data.remove("rts-3-2").unwrap();
        assert_eq!(values["serial-comms-status"], Value::Bool(false));
    }

    #[tokio::test]
    async fn disconnected_transport_revalidates() {
        let bus = EventBus::new();
        let transport = controller(3, 1);
        let validator = ConnectionValidator::new(Interface::Ethernet);
        validator
            .ensure_valid(Some(&transport), 1, EXPECTED, &bus, "rts-3-2")
            .await
            .unwrap();
        transport
            .connected
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let reads = transport.read_count();
        validator
            .ensure_valid(Some(&transport), 1, EXPECTED, &bus, "rts-3-2")
            .await
            .unwrap();
        assert_eq!(transport.read_count(), reads + 2);
    }
}
