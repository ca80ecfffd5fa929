//! Host-side device acquisition.
//!
//! The session controller never enumerates ports itself. It asks a
//! [`DeviceSelector`] for a device handle given a set of USB filters, the way
//! a browser shows its port-picker dialog. Front ends plug in their own
//! selector (an interactive prompt, a fixed port, a test double).

use crate::device::{self, DetectedPort, UsbFilter};
use crate::error::{Error, Result};
use log::debug;

/// Acquires a device handle for a new session.
pub trait DeviceSelector {
    /// Request a device passing one of `filters`.
    ///
    /// Returns [`Error::UserCancelled`] when the user dismisses the prompt.
    fn request_device(&mut self, filters: &[UsbFilter]) -> Result<DetectedPort>;
}

impl<F> DeviceSelector for F
where
    F: FnMut(&[UsbFilter]) -> Result<DetectedPort>,
{
    fn request_device(&mut self, filters: &[UsbFilter]) -> Result<DetectedPort> {
        self(filters)
    }
}

/// Picks the best matching port without prompting.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoSelector;

impl DeviceSelector for AutoSelector {
    fn request_device(&mut self, filters: &[UsbFilter]) -> Result<DetectedPort> {
        device::auto_detect_port(filters)
    }
}

/// Always hands out the same named port.
///
/// Port metadata is filled in from enumeration when the port is present.
#[derive(Debug, Clone)]
pub struct FixedPortSelector {
    name: String,
}

impl FixedPortSelector {
    /// Create a selector for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl DeviceSelector for FixedPortSelector {
    fn request_device(&mut self, _filters: &[UsbFilter]) -> Result<DetectedPort> {
        let port = find_port_by_name(&self.name);
        debug!("Using explicitly selected port {}", port.name);
        Ok(port)
    }
}

/// Discover all available serial ports.
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    device::detect_ports()
}

/// Discover serial ports that pass the default ESP filters.
#[must_use]
pub fn discover_esp_ports() -> Vec<DetectedPort> {
    device::detect_matching_ports(&device::default_filters())
}

/// Look a port up by name, falling back to a bare entry when not enumerated.
pub fn find_port_by_name(name: &str) -> DetectedPort {
    let ports = discover_ports();
    ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)))
        .cloned()
        .unwrap_or_else(|| DetectedPort::named(name))
}

/// Convenience for selectors that must report a dismissed prompt.
pub fn cancelled() -> Error {
    Error::UserCancelled
}
