// src/io/error.rs
//
// Typed errors for the serial layer.
// Tauri commands convert these to `String` at the boundary.

use thiserror::Error;

/// Errors raised by the port enumerator and the serial worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerialError {
    /// The OS port query failed. Callers degrade to an empty list.
    #[error("Failed to enumerate ports: {0}")]
    PortList(String),

    /// Opening the device failed (missing, busy, or baud rate rejected).
    #[error("Failed to open {port}: {reason}")]
    Connection { port: String, reason: String },

    /// `open` was called while a connection is already up.
    #[error("Already connected to {port}")]
    AlreadyConnected { port: String },

    /// A send was attempted with no open connection.
    #[error("Serial port is not connected")]
    NotConnected,

    /// Writing to the device failed.
    #[error("Failed to send data: {0}")]
    Write(String),

    /// The device vanished while connected.
    #[error("Device {port} disconnected: {reason}")]
    UnexpectedDisconnect { port: String, reason: String },
}

impl SerialError {
    pub fn connection(port: &str, reason: impl Into<String>) -> Self {
        SerialError::Connection {
            port: port.to_string(),
            reason: reason.into(),
        }
    }

    pub fn write(reason: impl Into<String>) -> Self {
        SerialError::Write(reason.into())
    }

    pub fn unexpected_disconnect(port: &str, reason: impl Into<String>) -> Self {
        SerialError::UnexpectedDisconnect {
            port: port.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<SerialError> for String {
    fn from(e: SerialError) -> Self {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = SerialError::connection("/dev/ttyUSB0", "Device or resource busy");
        assert_eq!(e.to_string(), "Failed to open /dev/ttyUSB0: Device or resource busy");

        let e = SerialError::write("Broken pipe");
        assert_eq!(String::from(e), "Failed to send data: Broken pipe");

        assert_eq!(
            SerialError::NotConnected.to_string(),
            "Serial port is not connected"
        );
    }
}
