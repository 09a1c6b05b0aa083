//! Serial port enumeration

use serde::Serialize;
use serialport::SerialPortType;

use crate::constants::MOCK_TARGET;

/// A connectable target as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// Name passed back to `connect`
    pub name: String,
    /// Human-readable description
    pub description: String,
    pub is_mock: bool,
}

impl PortInfo {
    fn from_serialport(port: serialport::SerialPortInfo) -> Self {
        let description = match port.port_type {
            SerialPortType::UsbPort(usb) => {
                let product = usb.product.unwrap_or_else(|| "USB serial".to_string());
                match usb.manufacturer {
                    Some(maker) => format!("{} ({}) [{:04x}:{:04x}]", product, maker, usb.vid, usb.pid),
                    None => format!("{} [{:04x}:{:04x}]", product, usb.vid, usb.pid),
                }
            }
            SerialPortType::BluetoothPort => "Bluetooth serial".to_string(),
            SerialPortType::PciPort => "PCI serial".to_string(),
            SerialPortType::Unknown => "Serial port".to_string(),
        };

        Self {
            name: port.port_name,
            description,
            is_mock: false,
        }
    }

    /// The synthetic device entry
    pub fn mock() -> Self {
        Self {
            name: MOCK_TARGET.to_string(),
            description: "Synthetic counter device".to_string(),
            is_mock: true,
        }
    }
}

/// List serial ports plus the mock device, sorted by name with the mock last
///
/// Enumeration failures are logged and yield only the mock entry.
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = match serialport::available_ports() {
        Ok(found) => found.into_iter().map(PortInfo::from_serialport).collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate serial ports: {}", e);
            Vec::new()
        }
    };

    ports.sort_by(|a, b| a.name.cmp(&b.name));
    ports.dedup_by(|a, b| a.name == b.name);
    ports.push(PortInfo::mock());
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_is_always_listed_last() {
        let ports = list_ports();
        let last = ports.last().unwrap();
        assert!(last.is_mock);
        assert_eq!(last.name, MOCK_TARGET);
        assert_eq!(ports.iter().filter(|p| p.is_mock).count(), 1);
    }

    #[test]
    fn test_usb_description() {
        let info = serialport::SerialPortInfo {
            port_name: "/dev/ttyUSB0".to_string(),
            port_type: SerialPortType::UsbPort(serialport::UsbPortInfo {
                vid: 0x1a86,
                pid: 0x7523,
                serial_number: None,
                manufacturer: Some("QinHeng".to_string()),
                product: Some("CH340".to_string()),
            }),
        };
        let port = PortInfo::from_serialport(info);
        assert_eq!(port.description, "CH340 (QinHeng) [1a86:7523]");
        assert!(!port.is_mock);
    }
}
