//! Device discovery and classification utilities.
//!
//! ESP boards reach the host either through a USB-to-UART bridge or through
//! the chip's own USB-Serial/JTAG or USB-CDC interface. The fixed filter table
//! below is what the device-selection prompt offers by default.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

use log::debug;
#[cfg(feature = "native")]
use log::{info, trace};

/// Transport type for discovered endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Serial transport (UART bridge, USB CDC, PCI or Bluetooth serial).
    Serial,
    /// The OS could not say what backs the port.
    Unknown,
}

/// Known USB bridge/device kinds commonly found on ESP boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Silicon Labs CP2102/CP2102N.
    Cp210x,
    /// FTDI FT232R.
    Ft232r,
    /// FTDI FT2232H.
    Ft2232h,
    /// WCH CH9102F.
    Ch9102,
    /// WCH CH340.
    Ch340,
    /// Espressif built-in USB_SERIAL_JTAG.
    EspUsbJtag,
    /// Espressif esp-usb-bridge firmware.
    EspUsbBridge,
    /// ESP32-S2 native USB CDC.
    Esp32S2Cdc,
    /// ESP32-S3 native USB CDC.
    Esp32S3Cdc,
    /// Unknown device.
    Unknown,
}

/// A USB vendor/product pair offered to the device-selection prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbFilter {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbFilter {
    /// Create a filter.
    #[must_use]
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }

    /// Check if this filter matches the given USB ids.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Known USB VID/PID pairs for ESP boards.
const KNOWN_USB_DEVICES: &[(UsbFilter, DeviceKind)] = &[
    (UsbFilter::new(0x10C4, 0xEA60), DeviceKind::Cp210x),
    (UsbFilter::new(0x0403, 0x6010), DeviceKind::Ft2232h),
    (UsbFilter::new(0x303A, 0x1001), DeviceKind::EspUsbJtag),
    (UsbFilter::new(0x303A, 0x1002), DeviceKind::EspUsbBridge),
    (UsbFilter::new(0x303A, 0x0002), DeviceKind::Esp32S2Cdc),
    (UsbFilter::new(0x303A, 0x0009), DeviceKind::Esp32S3Cdc),
    (UsbFilter::new(0x1A86, 0x55D4), DeviceKind::Ch9102),
    (UsbFilter::new(0x1A86, 0x7523), DeviceKind::Ch340),
    (UsbFilter::new(0x0403, 0x6001), DeviceKind::Ft232r),
];

/// The default filter set for device selection.
pub fn default_filters() -> Vec<UsbFilter> {
    KNOWN_USB_DEVICES.iter().map(|(filter, _)| *filter).collect()
}

impl DeviceKind {
    /// Classify a VID/PID combination.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(filter, _)| filter.matches(vid, pid))
            .map_or(Self::Unknown, |(_, kind)| *kind)
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cp210x => "CP2102/CP2102N",
            Self::Ft232r => "FT232R",
            Self::Ft2232h => "FT2232H",
            Self::Ch9102 => "CH9102F",
            Self::Ch340 => "CH340",
            Self::EspUsbJtag => "USB-Serial/JTAG",
            Self::EspUsbBridge => "esp-usb-bridge",
            Self::Esp32S2Cdc => "ESP32-S2 USB-CDC",
            Self::Esp32S3Cdc => "ESP32-S3 USB-CDC",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Whether the device is the chip's own USB interface rather than a bridge.
    pub fn is_native_usb(&self) -> bool {
        matches!(
            self,
            Self::EspUsbJtag | Self::EspUsbBridge | Self::Esp32S2Cdc | Self::Esp32S3Cdc
        )
    }
}

/// Discovered device endpoint information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Transport type.
    pub transport: TransportKind,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// A bare serial endpoint known only by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Serial,
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Check if this endpoint passes any of the given filters.
    pub fn matches_any(&self, filters: &[UsbFilter]) -> bool {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => filters.iter().any(|f| f.matches(vid, pid)),
            _ => false,
        }
    }

    /// Check if this endpoint is likely an ESP board.
    pub fn is_likely_esp(&self) -> bool {
        self.device.is_known()
    }
}

/// Build a [`DetectedPort`] from an enumerated port.
#[cfg(feature = "native")]
fn classify_port(port_info: serialport::SerialPortInfo) -> DetectedPort {
    let mut detected = DetectedPort::named(port_info.port_name.clone());
    match port_info.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            detected.vid = Some(usb_info.vid);
            detected.pid = Some(usb_info.pid);
            detected.manufacturer = usb_info.manufacturer;
            detected.product = usb_info.product;
            detected.serial = usb_info.serial_number;
            detected.device = DeviceKind::from_vid_pid(usb_info.vid, usb_info.pid);

            trace!(
                "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                port_info.port_name, usb_info.vid, usb_info.pid, detected.device
            );
        },
        serialport::SerialPortType::Unknown => detected.transport = TransportKind::Unknown,
        serialport::SerialPortType::PciPort | serialport::SerialPortType::BluetoothPort => {},
    }
    detected
}

/// Enumerate endpoints, reporting enumeration failures.
#[cfg(feature = "native")]
pub fn try_detect_ports() -> Result<Vec<DetectedPort>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(classify_port).collect())
}

/// Enumerate endpoints (always empty without native support).
#[cfg(not(feature = "native"))]
pub fn try_detect_ports() -> Result<Vec<DetectedPort>> {
    Ok(Vec::new())
}

/// Detect all available endpoints with metadata.
///
/// Enumeration failures are logged and yield an empty list.
pub fn detect_ports() -> Vec<DetectedPort> {
    try_detect_ports().unwrap_or_else(|e| {
        debug!("Failed to enumerate serial ports: {e}");
        Vec::new()
    })
}

/// Detect endpoints that pass the given filters.
pub fn detect_matching_ports(filters: &[UsbFilter]) -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(|p| p.matches_any(filters))
        .collect()
}

/// Pick the best candidate among detected endpoints.
///
/// Native USB interfaces win over bridges, known bridges over anything else
/// that passes the filters.
pub fn pick_port(ports: &[DetectedPort], filters: &[UsbFilter]) -> Option<DetectedPort> {
    ports
        .iter()
        .filter(|p| p.matches_any(filters))
        .find(|p| p.device.is_native_usb())
        .or_else(|| {
            ports
                .iter()
                .filter(|p| p.matches_any(filters))
                .find(|p| p.device.is_known())
        })
        .or_else(|| ports.iter().find(|p| p.matches_any(filters)))
        .cloned()
}

/// Auto-detect a single ESP endpoint.
#[cfg(feature = "native")]
pub fn auto_detect_port(filters: &[UsbFilter]) -> Result<DetectedPort> {
    let ports = try_detect_ports()?;
    match pick_port(&ports, filters) {
        Some(port) => {
            info!("Auto-detected {} on {}", port.device.name(), port.name);
            Ok(port)
        },
        None => Err(Error::NoDevice),
    }
}

/// Auto-detect a single ESP endpoint (unsupported without native support).
#[cfg(not(feature = "native"))]
pub fn auto_detect_port(_filters: &[UsbFilter]) -> Result<DetectedPort> {
    Err(Error::Unsupported(
        "Port enumeration requires the `native` feature".to_string(),
    ))
}

/// Format a list of detected endpoints for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.device.is_known() {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };

            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();

            format!("{}{}{}", port.name, device_info, product_info)
        })
        .collect()
}
