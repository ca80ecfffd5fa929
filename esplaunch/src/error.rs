//! Error types for esplaunch.

use std::io;
use thiserror::Error;

/// Result type for esplaunch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for esplaunch operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The device-selection prompt was dismissed.
    ///
    /// This is informational rather than a failure.
    #[error("Device selection cancelled by user")]
    UserCancelled,

    /// Operation attempted in the wrong session state.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// Nothing to write after filtering placeholders and empty sources.
    #[error("Firmware plan is empty: nothing to write")]
    EmptyPlan,

    /// A file's flash address failed validation.
    #[error("Invalid flash address for {file}: {message}")]
    Validation {
        /// Name of the offending file.
        file: String,
        /// What was wrong with the address.
        message: String,
    },

    /// A standalone address string failed validation.
    #[error("Invalid flash address '{0}'")]
    InvalidAddress(String),

    /// Quick-start flashing requested without an application.
    #[error("No application selected")]
    NoApplicationSelected,

    /// Quick-start descriptor is missing its URL or flash address.
    #[error("Invalid application descriptor '{name}': {reason}")]
    InvalidDescriptor {
        /// Descriptor name.
        name: String,
        /// Missing or malformed field.
        reason: String,
    },

    /// Failure reported by the flasher or transport.
    #[error("Device I/O error: {0}")]
    Device(String),

    /// Auto-detection found no port matching the USB filters.
    #[error("No matching USB serial device found")]
    NoDevice,

    /// Quick-start image download failed.
    #[error("Network error: {0}")]
    Network(String),

    /// I/O error (files, subprocess pipes).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port enumeration error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Quick-start catalog could not be loaded.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Unsupported operation or platform.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Whether this error only reports a dismissed device prompt.
    #[must_use]
    pub fn is_user_cancelled(&self) -> bool {
        matches!(self, Self::UserCancelled)
    }

    /// Whether this error came from the flasher or transport.
    #[must_use]
    pub fn is_device_error(&self) -> bool {
        matches!(self, Self::Device(_) | Self::NoDevice)
    }

    /// Whether this error was raised while building a plan, before device I/O.
    #[must_use]
    pub fn is_plan_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyPlan
                | Self::Validation { .. }
                | Self::InvalidAddress(_)
                | Self::NoApplicationSelected
                | Self::InvalidDescriptor { .. }
                | Self::Network(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_names_file() {
        let err = Error::Validation {
            file: "app.bin".into(),
            message: "not hexadecimal".into(),
        };
        assert!(err.to_string().contains("app.bin"));
        assert!(err.is_plan_error());
        assert!(!err.is_device_error());
    }

    #[test]
    fn test_classification() {
        assert!(Error::UserCancelled.is_user_cancelled());
        assert!(Error::Device("boom".into()).is_device_error());
        assert!(Error::Network("404".into()).is_plan_error());
        assert!(!Error::Precondition("busy".into()).is_plan_error());
        assert!(Error::NoDevice.is_device_error());
        assert!(!Error::NoDevice.is_plan_error());
    }

    #[cfg(feature = "native")]
    #[test]
    fn test_enumeration_failure_is_serial_error() {
        let err: Error =
            serialport::Error::new(serialport::ErrorKind::NoDevice, "udev unavailable").into();
        assert!(matches!(err, Error::Serial(_)));
        assert!(!err.is_device_error());
        assert!(err.to_string().contains("udev unavailable"));
    }
}
