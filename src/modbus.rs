//! [`Transport`] over `tokio-modbus`, RTU or TCP.
//!
//! Every request runs under a timeout. An expired request is reported as
//! [`std::io::ErrorKind::TimedOut`], the same class as a lost connection.

use crate::{
    config::{Communication, Connection},
    transport::Transport,
    Error, Result,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::{Reader, SlaveContext, Writer};
use tokio_modbus::Slave;

#[cfg(feature = "tokio-rtu")]
use crate::config::Parity;

/// Creates a `tokio_serial::SerialPortBuilder` for an RTU interface.
#[cfg(feature = "tokio-rtu")]
pub fn serial_port_builder(device: &str, baudrate: u32, parity: Parity, stopbits: u8) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, baudrate)
        .parity(match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        })
        .stop_bits(if stopbits == 2 {
            tokio_serial::StopBits::Two
        } else {
            tokio_serial::StopBits::One
        })
        .data_bits(tokio_serial::DataBits::Eight)
        .flow_control(tokio_serial::FlowControl::None)
}

pub struct ModbusTransport {
    ctx: Arc<Mutex<Context>>,
    name: String,
    timeout: Duration,
    connected: AtomicBool,
}

impl fmt::Debug for ModbusTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusTransport")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl ModbusTransport {
    pub fn new(ctx: Context, name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ctx: Arc::new(Mutex::new(ctx)),
            name: name.into(),
            timeout,
            connected: AtomicBool::new(true),
        }
    }

    /// Opens the link described by `comm`.
    pub async fn connect(comm: &Communication, timeout: Duration) -> Result<Self> {
        let slave = Slave(comm.unit);
        let ctx = match &comm.connection {
            #[cfg(feature = "tokio-tcp")]
            Connection::ModbusTcp { host, port } => {
                let socket_addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await?
                    .next()
                    .ok_or_else(|| Error::io(std::io::ErrorKind::NotFound, format!("Cannot resolve {host}")))?;
                log::info!("Connecting to Modbus TCP device at {socket_addr}");
                tokio::time::timeout(timeout, tokio_modbus::client::tcp::connect_slave(socket_addr, slave))
                    .await
                    .map_err(|_| {
                        Error::io(
                            std::io::ErrorKind::TimedOut,
                            format!("Connecting to {socket_addr} timed out"),
                        )
                    })??
            }
            #[cfg(feature = "tokio-rtu")]
            Connection::ModbusRtu {
                port,
                baudrate,
                parity,
                stopbits,
            } => {
                log::info!("Opening Modbus RTU port {port} at {baudrate} baud");
                let builder = serial_port_builder(port, *baudrate, *parity, *stopbits);
                let stream = tokio_serial::SerialStream::open(&builder).map_err(std::io::Error::from)?;
                tokio_modbus::client::rtu::attach_slave(stream, slave)
            }
            #[allow(unreachable_patterns)]
            _ => {
                return Err(Error::Config(format!(
                    "{} interface: transport not built into this binary",
                    comm.name.name()
                )))
            }
        };
        Ok(Self::new(ctx, comm.name.name(), timeout))
    }

    fn settle<T>(&self, result: Option<tokio_modbus::Result<T>>) -> Result<T> {
        settle(&self.name, &self.connected, result)
    }
}

/// Maps the outcome of a request. `None` is a request that timed out.
fn settle<T>(name: &str, connected: &AtomicBool, result: Option<tokio_modbus::Result<T>>) -> Result<T> {
    match result {
        Some(Ok(Ok(value))) => {
            connected.store(true, Ordering::SeqCst);
            Ok(value)
        }
        // The device answered, so the link is fine.
        Some(Ok(Err(code))) => {
            connected.store(true, Ordering::SeqCst);
            Err(code.into())
        }
        Some(Err(err)) => {
            connected.store(false, Ordering::SeqCst);
            Err(err.into())
        }
        None => Err(Error::io(
            std::io::ErrorKind::TimedOut,
            format!("{name} request timed out"),
        )),
    }
}

#[async_trait]
impl Transport for ModbusTransport {
    async fn read_holding_registers(&self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>> {
        let mut ctx = self.ctx.lock().await;
        ctx.set_slave(Slave(unit));
        let result = tokio::time::timeout(self.timeout, ctx.read_holding_registers(address, count)).await;
        self.settle(result.ok())
    }

    async fn write_registers(&self, unit: u8, address: u16, values: &[u16]) -> Result<()> {
        let mut ctx = self.ctx.lock().await;
        ctx.set_slave(Slave(unit));
        let result = tokio::time::timeout(self.timeout, ctx.write_multiple_registers(address, values)).await;
        self.settle(result.ok())
    }

    async fn write_coil(&self, unit: u8, address: u16, value: bool) -> Result<()> {
        let mut ctx = self.ctx.lock().await;
        ctx.set_slave(Slave(unit));
        let result = tokio::time::timeout(self.timeout, ctx.write_single_coil(address, value)).await;
        self.settle(result.ok())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio_modbus::ExceptionCode;

    #[test]
    fn outcome_mapping() {
        let connected = AtomicBool::new(false);
        assert_eq!(settle("serial", &connected, Some(Ok(Ok(vec![1, 2])))).unwrap(), vec![1, 2]);
        assert!(connected.load(Ordering::SeqCst));

        let exception: Option<tokio_modbus::Result<()>> = Some(Ok(Err(ExceptionCode::IllegalDataAddress)));
        assert_matches!(settle("serial", &connected, exception), Err(Error::Exception { code: 2, .. }));
        assert!(connected.load(Ordering::SeqCst));

        let lost: Option<tokio_modbus::Result<()>> = Some(Err(tokio_modbus::Error::Transport(
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"),
        )));
        let err = settle("serial", &connected, lost).unwrap_err();
        assert!(err.is_transport());
        assert!(!connected.load(Ordering::SeqCst));

        let timed_out = settle::<()>("ethernet", &connected, None).unwrap_err();
        assert_matches!(&timed_out, Error::Io(err) if err.kind() == std::io::ErrorKind::TimedOut);
    }

    #[cfg(feature = "tokio-tcp")]
    #[tokio::test]
    async fn debug_output_names_the_link() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let comm = Communication {
            name: crate::validator::Interface::Ethernet,
            connection: Connection::ModbusTcp {
                host: "127.0.0.1".into(),
                port,
            },
            unit: 1,
        };
        let (transport, accepted) = tokio::join!(
            ModbusTransport::connect(&comm, Duration::from_secs(1)),
            listener.accept()
        );
        accepted.unwrap();
        let transport: Arc<dyn Transport> = Arc::new(transport.unwrap());
        let text = format!("{transport:?}");
        assert!(text.starts_with("ModbusTransport"));
        assert!(text.contains("\"ethernet\""));
        assert!(text.contains("connected: true"));
    }

    #[cfg(feature = "tokio-rtu")]
    #[tokio::test]
    async fn missing_serial_port_is_io_error() {
        let comm = Communication {
            name: crate::validator::Interface::Serial,
            connection: Connection::ModbusRtu {
                port: "/dev/imac2-does-not-exist".into(),
                baudrate: 9600,
                parity: Parity::None,
                stopbits: 1,
            },
            unit: 1,
        };
        assert_matches!(
            ModbusTransport::connect(&comm, Duration::from_secs(1)).await,
            Err(Error::Io(_))
        );
    }
}
