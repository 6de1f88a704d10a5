//! Serial port enumeration
//!
//! Devices are reached over serial links. Listing the ports helps pick the
//! value for the `real_hardware_port` setting.

use serde::Serialize;
use serialport::SerialPortType;
use thiserror::Error;

/// Serial enumeration errors
#[derive(Error, Debug)]
pub enum SerialError {
    /// The OS refused to enumerate ports
    #[error("Failed to enumerate serial ports: {0}")]
    Enumerate(#[from] serialport::Error),
}

/// A serial port that may host a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerialPortEntry {
    /// Port name (e.g., COM3, /dev/ttyACM0)
    pub port: String,
    /// `usb`, `pci`, `bluetooth` or `unknown`
    pub kind: &'static str,
    /// USB vendor id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    /// USB product id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    /// USB product string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    /// USB serial number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

impl From<serialport::SerialPortInfo> for SerialPortEntry {
    fn from(info: serialport::SerialPortInfo) -> Self {
        let mut entry = Self {
            port: info.port_name,
            kind: "unknown",
            vid: None,
            pid: None,
            product: None,
            serial_number: None,
        };
        match info.port_type {
            SerialPortType::UsbPort(usb) => {
                entry.kind = "usb";
                entry.vid = Some(usb.vid);
                entry.pid = Some(usb.pid);
                entry.product = usb.product;
                entry.serial_number = usb.serial_number;
            }
            SerialPortType::PciPort => entry.kind = "pci",
            SerialPortType::BluetoothPort => entry.kind = "bluetooth",
            SerialPortType::Unknown => {}
        }
        entry
    }
}

/// List available serial ports, sorted by name
pub fn list_ports() -> Result<Vec<SerialPortEntry>, SerialError> {
    let mut ports: Vec<SerialPortEntry> = serialport::available_ports()?
        .into_iter()
        .map(SerialPortEntry::from)
        .collect();
    ports.sort_by(|a, b| a.port.cmp(&b.port));
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::{SerialPortInfo, UsbPortInfo};

    #[test]
    fn test_usb_entry() {
        let info = SerialPortInfo {
            port_name: "/dev/ttyACM0".to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x0483,
                pid: 0x5740,
                serial_number: Some("123".to_string()),
                manufacturer: None,
                product: Some("ST-Link".to_string()),
            }),
        };
        let entry = SerialPortEntry::from(info);
        assert_eq!(entry.kind, "usb");
        assert_eq!(entry.vid, Some(0x0483));
        assert_eq!(entry.product.as_deref(), Some("ST-Link"));
    }
}
