// src/io/serial/mod.rs
//
// Serial port access for the console.
//
// Features:
// - Port enumeration (never fails, degrades to an empty list)
// - Worker with a dedicated read thread and a bounded transmit queue
// - Line-ending conversion and baud rate options

pub mod link;
pub mod ports;
pub mod utils;
pub mod worker;

#[cfg(test)]
pub(crate) mod mock;

pub use link::{PortOpener, SerialLink, SystemPorts, READ_POLL_INTERVAL};
pub use ports::{list_ports, PortInfo};
pub use utils::{LineEnding, BAUD_RATES, DEFAULT_BAUD_RATE};
pub use worker::{
    ActivityGauge, ConnectionInfo, ConnectionState, DisconnectReason, EventSender, SerialWorker,
    Transmitter, WorkerEvent,
};
