// src/io/serial/ports.rs
//
// Serial port enumeration.
// Never fails: an OS query error is logged and reported as "no ports".

use serde::Serialize;
use serialport::{SerialPortInfo, SerialPortType};

use crate::io::SerialError;

/// Information about an available serial port
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// Device identifier passed to `open` (e.g. "COM4", "/dev/ttyUSB0")
    pub port_name: String,
    /// Human-readable label for the port selector
    pub description: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// List available serial ports in OS order.
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices.
/// The cu (calling unit) devices are non-blocking and preferred for outgoing connections.
/// The tty (terminal) devices block on open waiting for carrier detect.
pub fn list_ports() -> Vec<PortInfo> {
    ports_from_query(
        serialport::available_ports().map_err(|e| SerialError::PortList(e.to_string())),
    )
}

/// Convert the result of an OS port query. Errors degrade to an empty list.
pub(crate) fn ports_from_query(query: Result<Vec<SerialPortInfo>, SerialError>) -> Vec<PortInfo> {
    let ports = match query {
        Ok(ports) => ports,
        Err(e) => {
            tlog!("[serial] {}", e);
            return Vec::new();
        }
    };

    ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(port_info)
        .collect()
}

fn port_info(p: SerialPortInfo) -> PortInfo {
    let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
        SerialPortType::UsbPort(info) => (
            "USB".to_string(),
            info.manufacturer,
            info.product,
            info.serial_number,
            Some(info.vid),
            Some(info.pid),
        ),
        SerialPortType::BluetoothPort => ("Bluetooth".to_string(), None, None, None, None, None),
        SerialPortType::PciPort => ("PCI".to_string(), None, None, None, None, None),
        SerialPortType::Unknown => ("Unknown".to_string(), None, None, None, None, None),
    };

    let description = match product.as_deref() {
        Some(product) if !product.is_empty() => format!("{} ({})", product, p.port_name),
        _ => p.port_name.clone(),
    };

    PortInfo {
        port_name: p.port_name,
        description,
        port_type,
        manufacturer,
        product,
        serial_number,
        vid,
        pid,
    }
}
