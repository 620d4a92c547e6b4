//! A library for talking to iMAC2 field bus modules through an iMAC master
//! and to remote tripping stations (RTS) over Modbus.
//!
//! The crate is split along the seams of the protocol:
//!
//! 1.  **Protocol engine**: [`module::Module`] keeps the state of one module,
//!     reads and writes its parameters by block, by poll or through the
//!     postbox of the master, and publishes what changed on an
//!     [`events::EventBus`].
//!
//! 2.  **Dual interface controllers**: [`rts::Rts`] reaches a controller over
//!     serial and ethernet, checks every interface with a
//!     [`validator::ConnectionValidator`] before trusting it and runs the
//!     continuous polling pipeline.
//!
//! 3.  **Transports**: everything above talks to a [`transport::Transport`].
//!     The `tokio-rtu` and `tokio-tcp` features provide one over
//!     `tokio-modbus` in the [`modbus`] module.
//!
//! ## Quick Start
//!
//! ```no_run
//! use imac2_lib::{config::DaemonConfig, events::EventBus, rts::Rts, schedule::Schedule};
//!
//! # async fn run() -> imac2_lib::Result<()> {
//! let config = DaemonConfig::from_file("imacmon.yaml")?;
//! let rts = Rts::new(EventBus::new(), Schedule::new(), &config.poll);
//! rts.apply_roll_call(&config.rts.roll_call()).await?;
//!
//! let values = rts.poll_pipeline().await?;
//! println!("Controller data: {values:?}");
//! # Ok(())
//! # }
//! ```

pub mod address_map;
pub mod block_io;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod module;
pub mod param;
pub mod protocol;
pub mod rts;
pub mod schedule;
pub mod state;
pub mod table;
pub mod transport;
pub mod validator;
pub mod value;

#[cfg_attr(docsrs, doc(cfg(any(feature = "tokio-rtu", feature = "tokio-tcp"))))]
#[cfg(any(feature = "tokio-rtu", feature = "tokio-tcp"))]
pub mod modbus;

pub use address_map::AddressMap;
pub use error::{Error, Result};
pub use value::{Value, Values};
