//! YAML configuration.
//!
//! Durations are written the humantime way (`"2s"`, `"10min"`). Every field
//! has a default matching the behaviour of the field installation.

use crate::{identity::RtsRollCall, validator::Interface, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::Path;
use std::time::Duration;

/// Timing of the module engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModuleSettings {
    /// Delay between selecting a postbox and reading it.
    #[serde(default = "default_postbox_settle", with = "humantime_serde")]
    pub postbox_settle: Duration,
    /// How long a parameter that failed to read is left alone.
    #[serde(default = "default_failed_read_cooldown", with = "humantime_serde")]
    pub failed_read_cooldown: Duration,
    #[serde(default = "default_starting_data_attempts")]
    pub starting_data_attempts: u32,
}

fn default_postbox_settle() -> Duration {
    Duration::from_secs(2)
}

fn default_failed_read_cooldown() -> Duration {
    Duration::from_secs(600)
}

fn default_starting_data_attempts() -> u32 {
    2
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            postbox_settle: default_postbox_settle(),
            failed_read_cooldown: default_failed_read_cooldown(),
            starting_data_attempts: default_starting_data_attempts(),
        }
    }
}

/// Timing of the continuous poll.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PollSettings {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Largest number of registers per request.
    #[serde(default = "default_max_block")]
    pub max_block: u16,
    /// Timeout of a single request; an expired request counts as an I/O failure.
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub io_timeout: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_block() -> u16 {
    crate::protocol::MAX_BLOCK
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(3)
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            max_block: default_max_block(),
            io_timeout: default_io_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Physical link of an interface.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Connection {
    ModbusTcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    ModbusRtu {
        port: String,
        #[serde(default = "default_baudrate")]
        baudrate: u32,
        #[serde(default)]
        parity: Parity,
        #[serde(default = "default_stopbits")]
        stopbits: u8,
    },
}

fn default_tcp_port() -> u16 {
    502
}

fn default_baudrate() -> u32 {
    9600
}

fn default_stopbits() -> u8 {
    1
}

fn default_unit() -> u8 {
    crate::protocol::DEFAULT_UNIT
}

/// One configured interface of a controller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Communication {
    pub name: Interface,
    #[serde(flatten)]
    pub connection: Connection,
    #[serde(default = "default_unit")]
    pub unit: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommunicationConfig {
    #[serde(default)]
    pub communication: Vec<Communication>,
}

impl CommunicationConfig {
    /// Entry of an interface. The first entry wins if it is listed twice.
    pub fn get(&self, interface: Interface) -> Option<&Communication> {
        self.communication.iter().find(|c| c.name == interface)
    }

    /// Interfaces that were added, removed or changed going from `self` to `new`.
    pub fn changes(&self, new: &CommunicationConfig) -> BTreeSet<Interface> {
        [Interface::Serial, Interface::Ethernet]
            .into_iter()
            .filter(|interface| self.get(*interface) != new.get(*interface))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        for comm in &self.communication {
            if let Connection::ModbusRtu { stopbits, .. } = comm.connection {
                if !(1..=2).contains(&stopbits) {
                    return Err(Error::Config(format!(
                        "{} interface: invalid stop bits {stopbits}",
                        comm.name.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Identity of the controller the daemon watches.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RtsConfig {
    /// Bus address of the controller on the master.
    pub address: u16,
    /// `rts-<fieldbus>-<logical>`
    pub dev_id: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    /// First bus address of each address schema. Logical RTS `n` sits at start + n - 1.
    #[serde(default)]
    pub address_schema: BTreeMap<String, u16>,
}

impl RtsConfig {
    /// Roll call announcing the configured controller.
    pub fn roll_call(&self) -> RtsRollCall {
        RtsRollCall {
            address: self.address,
            dev_id: self.dev_id.clone(),
            schema: self.schema.clone(),
        }
    }
}

fn default_schema() -> String {
    String::from("rts-config-0")
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DaemonConfig {
    pub rts: RtsConfig,
    #[serde(flatten)]
    pub communication: CommunicationConfig,
    #[serde(default)]
    pub module: ModuleSettings,
    #[serde(default)]
    pub poll: PollSettings,
    /// Read period per parameter.
    #[serde(default)]
    pub collect: BTreeMap<String, humantime_serde::Serde<Duration>>,
}

impl DaemonConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading config file from {path:?}");
        let file = File::open(path)?;
        let config: DaemonConfig = serde_yaml::from_reader(file)?;
        config.communication.validate()?;
        Ok(config)
    }

    pub fn collect_periods(&self) -> BTreeMap<String, Duration> {
        self.collect
            .iter()
            .map(|(name, period)| (name.clone(), period.into_inner()))
            .collect()
    }
}

impl std::str::FromStr for DaemonConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: DaemonConfig = serde_yaml::from_str(s)?;
        config.communication.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const CONFIG: &str = r#"
rts:
  address: 216
  dev_id: rts-3-1
  address_schema:
    rts-config-0: 216
communication:
  - name: serial
    type: modbus_rtu
    port: /dev/ttyUSB0
    baudrate: 19200
    parity: even
  - name: ethernet
    type: modbus_tcp
    host: 10.0.0.5
module:
  postbox_settle: 500ms
poll:
  interval: 1s
collect:
  remote-bypass-status: 30s
"#;

    #[test]
    fn parse_daemon_config() {
        let config: DaemonConfig = CONFIG.parse().unwrap();
        assert_eq!(config.rts.schema, "rts-config-0");
        assert_eq!(config.rts.address_schema["rts-config-0"], 216);
        assert_eq!(config.rts.roll_call().location().unwrap(), (3, 1));
        assert_eq!(config.module.postbox_settle, Duration::from_millis(500));
        assert_eq!(config.module.failed_read_cooldown, Duration::from_secs(600));
        assert_eq!(config.module.starting_data_attempts, 2);
        assert_eq!(config.poll.interval, Duration::from_secs(1));
        assert_eq!(config.poll.max_block, 125);
        assert_eq!(config.poll.io_timeout, Duration::from_secs(3));
        assert_eq!(
            config.collect_periods()["remote-bypass-status"],
            Duration::from_secs(30)
        );

        let serial = config.communication.get(Interface::Serial).unwrap();
        assert_eq!(serial.unit, 1);
        assert_eq!(
            serial.connection,
            Connection::ModbusRtu {
                port: "/dev/ttyUSB0".into(),
                baudrate: 19200,
                parity: Parity::Even,
                stopbits: 1,
            }
        );
        assert_matches!(
            &config.communication.get(Interface::Ethernet).unwrap().connection,
            Connection::ModbusTcp { port: 502, .. }
        );
    }

    #[test]
    fn communication_changes() {
        let old: DaemonConfig = CONFIG.parse().unwrap();
        let mut new = old.communication.clone();
        assert!(old.communication.changes(&new).is_empty());

        new.communication[1].connection = Connection::ModbusTcp {
            host: "10.0.0.6".into(),
            port: 502,
        };
        assert_eq!(
            old.communication.changes(&new),
            BTreeSet::from([Interface::Ethernet])
        );

        new.communication.remove(0);
        assert_eq!(
            old.communication.changes(&new),
            BTreeSet::from([Interface::Serial, Interface::Ethernet])
        );
    }

    #[test]
    fn invalid_config() {
        let bad = CONFIG.replace("parity: even", "stopbits: 3");
        assert_matches!(bad.parse::<DaemonConfig>(), Err(Error::Config(_)));
        assert_matches!("rts: {}".parse::<DaemonConfig>(), Err(Error::Yaml(_)));
        assert_matches!(
            DaemonConfig::from_file("/nonexistent/imacmon.yaml"),
            Err(Error::Io(_))
        );
    }
}
