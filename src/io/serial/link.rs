// src/io/serial/link.rs
//
// Device access seam for the serial worker.
// The worker only ever sees a `SerialLink` (Read + Write + Send); how it was
// opened is up to the `PortOpener`.

use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::io::{Read, Write};
use std::time::Duration;

use crate::io::SerialError;

/// Read timeout for the worker's poll loop. Bounds how long `close()` waits
/// for the read thread to notice the stop flag.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An open, exclusively-owned serial connection
pub trait SerialLink: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> SerialLink for T {}

/// Opens serial devices by identifier
pub trait PortOpener: Send + Sync {
    fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, SerialError>;
}

/// Opens real devices through the `serialport` crate (8N1, no flow control).
///
/// On Unix the port is opened with exclusive access, so a device held by
/// another process fails with a connection error.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, SerialError> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_POLL_INTERVAL)
            .open()
            .map_err(|e| SerialError::connection(port_name, e.to_string()))?;

        Ok(Box::new(port))
    }
}
