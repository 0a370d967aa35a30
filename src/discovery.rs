//! CDC-ACM device discovery by USB vendor/product ID.

use serialport::SerialPortType;

const SPECTRANEXT_VID: u16 = 0x1337;
const SPECTRANEXT_PID: u16 = 0x0001;

/// A discovered Spectranext CDC-ACM serial device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub path: String,
    pub serial_number: Option<String>,
}

/// Enumerates available serial ports and returns the first one whose USB
/// vendor/product ID matches the Spectranext peripheral.
pub fn find_device() -> Option<DiscoveredDevice> {
    let ports = serialport::available_ports().ok()?;
    for port in ports {
        if let SerialPortType::UsbPort(info) = &port.port_type {
            if info.vid == SPECTRANEXT_VID && info.pid == SPECTRANEXT_PID {
                return Some(DiscoveredDevice {
                    path: port.port_name,
                    serial_number: info.serial_number.clone(),
                });
            }
        }
    }
    None
}
