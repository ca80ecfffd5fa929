//! Flasher abstraction.
//!
//! The ESP programming protocol (stub upload, SLIP framing, compressed
//! writes) is not implemented here. It belongs to an external flasher that
//! this crate drives through three seams:
//!
//! ```text
//! +------------------+   open()    +-------------+
//! |  LoaderBackend   | ----------> |  Transport  |
//! |                  |             +------+------+
//! |                  | create_loader()    | owned by
//! |                  | ----------> +------v------+
//! +------------------+             |   Loader    |
//!                                  +-------------+
//! ```
//!
//! [`esptool`] is the backend shipped with the crate. It drives the external
//! `esptool` program.

pub mod esptool;

use crate::device::{DetectedPort, TransportKind};
use crate::error::{Error, Result};
use std::fmt;

/// Baud rate of the ROM bootloader handshake.
pub const ROM_BAUD: u32 = 115_200;

/// Default baud rate for bulk transfer.
pub const DEFAULT_FLASH_BAUD: u32 = 921_600;

/// How bytes are framed on the link to the device.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Serial line (UART bridge or USB CDC).
    Serial,
}

impl Framing {
    /// Framing that suits a discovered endpoint.
    ///
    /// Ports the OS cannot classify are still driven as serial lines.
    pub fn for_port(port: &DetectedPort) -> Self {
        match port.transport {
            TransportKind::Serial | TransportKind::Unknown => Self::Serial,
        }
    }
}

/// Optional operations a connected chip supports.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Factory MAC address can be read.
    pub read_mac: bool,
    /// Run the application without toggling the reset line.
    pub soft_reset: bool,
    /// Reset through the EN line.
    pub hard_reset: bool,
}

impl Capabilities {
    /// Everything supported.
    pub const ALL: Self = Self {
        read_mac: true,
        soft_reset: true,
        hard_reset: true,
    };

    /// Nothing optional supported.
    pub const NONE: Self = Self {
        read_mac: false,
        soft_reset: false,
        hard_reset: false,
    };
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::ALL
    }
}

/// What autodetection found on the other end of the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipIdentity {
    /// Chip description, e.g. "ESP32-S3 (QFN56) (revision v0.2)".
    pub description: String,
    /// Feature list, e.g. `["WiFi", "BLE"]`.
    pub features: Vec<String>,
    /// Optional operations supported by this chip and backend.
    pub capabilities: Capabilities,
}

impl ChipIdentity {
    /// Create an identity with every optional operation supported.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            features: Vec::new(),
            capabilities: Capabilities::ALL,
        }
    }

    /// Attach a feature list.
    #[must_use]
    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the capability set.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Features joined for display.
    pub fn features_display(&self) -> String {
        self.features.join(", ")
    }
}

impl fmt::Display for ChipIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// Factory MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Parse `aa:bb:cc:dd:ee:ff` (also accepts `-` separators).
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(Error::Device(format!("malformed MAC address '{s}'")));
        }
        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(Error::Device(format!("malformed MAC address '{s}'")));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| Error::Device(format!("malformed MAC address '{s}'")))?;
        }
        Ok(Self(bytes))
    }

    /// Shortened form used in compact status lines.
    pub fn short(&self) -> String {
        format!("{:02x}:{:02x}:{:02x}...", self.0[0], self.0[1], self.0[2])
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Byte-level link to a device.
pub trait Transport {
    /// The device this transport talks to.
    fn device(&self) -> &DetectedPort;

    /// Framing in use.
    fn framing(&self) -> Framing;

    /// Release the link.
    ///
    /// Safe to call more than once.
    fn close(&mut self) -> Result<()>;
}

/// Progress callback for a single image: `(written, total)` in bytes.
pub type WriteProgress<'a> = dyn FnMut(usize, usize) + 'a;

/// Device-specific programming operations.
///
/// A loader owns its transport for its whole lifetime.
pub trait Loader {
    /// Handshake with the ROM bootloader and identify the chip.
    fn detect(&mut self) -> Result<ChipIdentity>;

    /// Read the factory MAC address.
    fn read_mac_address(&mut self) -> Result<MacAddress>;

    /// Erase the entire flash.
    fn erase_all(&mut self) -> Result<()>;

    /// Write one image at `address`.
    fn write_image(
        &mut self,
        data: &[u8],
        address: u32,
        compress: bool,
        progress: &mut WriteProgress<'_>,
    ) -> Result<()>;

    /// Leave the bootloader and run the application.
    fn soft_reset(&mut self) -> Result<()>;

    /// Reset the chip through its reset line.
    fn hard_reset(&mut self) -> Result<()>;

    /// The transport this loader drives.
    fn transport_mut(&mut self) -> &mut dyn Transport;

    /// Baud rate used for bulk transfer.
    fn baud_rate(&self) -> u32;
}

/// Creates transports and loaders for a session.
pub trait LoaderBackend {
    /// Open a transport to `device`.
    fn open(&self, device: &DetectedPort, framing: Framing) -> Result<Box<dyn Transport>>;

    /// Bind a loader to `transport`.
    fn create_loader(
        &self,
        transport: Box<dyn Transport>,
        baud: u32,
        rom_baud: u32,
    ) -> Result<Box<dyn Loader>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_roundtrip_display() {
        let mac = MacAddress::parse("24:0A:C4:12:34:56").unwrap();
        assert_eq!(mac.0, [0x24, 0x0A, 0xC4, 0x12, 0x34, 0x56]);
        assert_eq!(mac.to_string(), "24:0a:c4:12:34:56");
        assert_eq!(mac.short(), "24:0a:c4...");
        assert_eq!(MacAddress::parse("24-0a-c4-12-34-56").unwrap(), mac);
    }

    #[test]
    fn test_mac_rejects_garbage() {
        assert!(MacAddress::parse("24:0a:c4:12:34").is_err());
        assert!(MacAddress::parse("24:0a:c4:12:34:zz").is_err());
        assert!(MacAddress::parse("240:a:c4:12:34:56").is_err());
    }

    #[test]
    fn test_framing_for_port() {
        let mut port = DetectedPort::named("/dev/ttyUSB0");
        assert_eq!(port.transport, TransportKind::Serial);
        assert_eq!(Framing::for_port(&port), Framing::Serial);
        port.transport = TransportKind::Unknown;
        assert_eq!(Framing::for_port(&port), Framing::Serial);
    }

    #[test]
    fn test_chip_identity_builders() {
        let chip = ChipIdentity::new("ESP32-C3")
            .with_features(["WiFi", "BLE"])
            .with_capabilities(Capabilities::NONE);
        assert_eq!(chip.to_string(), "ESP32-C3");
        assert_eq!(chip.features_display(), "WiFi, BLE");
        assert!(!chip.capabilities.read_mac);
    }
}
