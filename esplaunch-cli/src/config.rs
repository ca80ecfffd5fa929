//! Configuration file support for esplaunch.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ESPLAUNCH_*)
//! 3. Local config file (./esplaunch.toml)
//! 4. Global config file (~/.config/esplaunch/config.toml)
//!
//! ```toml
//! [connection]
//! port = "/dev/ttyUSB0"
//! baud = 460800
//!
//! [retry]
//! max_attempts = 3
//! delay_ms = 1000
//!
//! [flash]
//! erase_all = false
//! compress = true
//!
//! [catalog]
//! path = "apps.toml"
//!
//! [esptool]
//! program = "/opt/esp/esptool"
//!
//! [[usb_device]]
//! vid = 0x1A86
//! pid = 0x55D3
//! ```

use directories::ProjectDirs;
use esplaunch::{FlashOptions, RetryPolicy, SessionConfig, UsbFilter};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the per-directory config.
pub const LOCAL_CONFIG_FILE: &str = "esplaunch.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Bulk transfer baud rate.
    pub baud: Option<u32>,
    /// ROM handshake baud rate.
    pub rom_baud: Option<u32>,
}

/// Connect retry configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total connect attempts.
    pub max_attempts: Option<u32>,
    /// Pause between attempts in milliseconds.
    pub delay_ms: Option<u64>,
}

/// Flash defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Erase the whole chip before writing.
    #[serde(default)]
    pub erase_all: bool,
    /// Compressed writes; `None` keeps the default.
    pub compress: Option<bool>,
}

/// Quick-start catalog location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// TOML or JSON catalog file.
    pub path: Option<PathBuf>,
}

/// External flasher program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EsptoolConfig {
    /// Program to run instead of searching `PATH`.
    pub program: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Retry settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Flash settings.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Catalog settings.
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Flasher program settings.
    #[serde(default)]
    pub esptool: EsptoolConfig,
    /// Extra USB ids offered during device selection.
    #[serde(default)]
    pub usb_device: Vec<UsbFilter>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "esplaunch").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.connection.rom_baud.is_some() {
            self.connection.rom_baud = other.connection.rom_baud;
        }

        if other.retry.max_attempts.is_some() {
            self.retry.max_attempts = other.retry.max_attempts;
        }
        if other.retry.delay_ms.is_some() {
            self.retry.delay_ms = other.retry.delay_ms;
        }

        if other.flash.erase_all {
            self.flash.erase_all = true;
        }
        if other.flash.compress.is_some() {
            self.flash.compress = other.flash.compress;
        }

        if other.catalog.path.is_some() {
            self.catalog.path = other.catalog.path;
        }
        if other.esptool.program.is_some() {
            self.esptool.program = other.esptool.program;
        }

        for device in other.usb_device {
            if !self.usb_device.contains(&device) {
                self.usb_device.push(device);
            }
        }
    }

    /// Link parameters, with `baud` from the command line taking precedence.
    pub fn session_config(&self, baud: Option<u32>) -> SessionConfig {
        let mut session =
            SessionConfig::default().with_extra_filters(self.usb_device.iter().copied());
        if let Some(baud) = baud.or(self.connection.baud) {
            session = session.with_baud(baud);
        }
        if let Some(rom_baud) = self.connection.rom_baud {
            session.rom_baud = rom_baud;
        }
        session
    }

    /// Connect retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        let default = RetryPolicy::default();
        RetryPolicy::new(
            self.retry.max_attempts.unwrap_or(default.max_attempts),
            self.retry
                .delay_ms
                .map_or(default.delay, Duration::from_millis),
        )
    }

    /// Flash options, before command-line flags are applied.
    pub fn flash_options(&self) -> FlashOptions {
        let default = FlashOptions::default();
        FlashOptions {
            erase_all: self.flash.erase_all,
            compress: self.flash.compress.unwrap_or(default.compress),
        }
    }

    /// Whether `vid:pid` is one of the configured extra devices.
    pub fn is_configured_device(&self, vid: u16, pid: u16) -> bool {
        self.usb_device.iter().any(|d| d.matches(vid, pid))
    }

    /// Save a USB device for future auto-detection.
    ///
    /// Writes to the local config when one exists, otherwise the global one.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbFilter::new(vid, pid);
        if self.usb_device.contains(&device) {
            return Ok(());
        }

        let path = if Path::new(LOCAL_CONFIG_FILE).exists() {
            PathBuf::from(LOCAL_CONFIG_FILE)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("config.toml")
        } else {
            PathBuf::from(LOCAL_CONFIG_FILE)
        };

        // Re-read the target so unrelated settings from other layers are not copied into it.
        let mut on_disk = Self::load_from_file(&path).unwrap_or_default();
        on_disk.usb_device.push(device);
        fs::write(&path, toml::to_string_pretty(&on_disk)?)?;
        self.usb_device.push(device);
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.port.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.usb_device.is_empty());
        assert!(!config.flash.erase_all);
        assert!(config.flash.compress.is_none());
        assert!(config.catalog.path.is_none());
    }

    #[test]
    fn test_config_from_toml() {
        let config: Config = toml::from_str(
            r#"
[connection]
port = "/dev/ttyUSB1"
baud = 460800
rom_baud = 74880

[retry]
max_attempts = 5
delay_ms = 250

[flash]
erase_all = true
compress = false

[catalog]
path = "apps.json"

[esptool]
program = "esptool.py"

[[usb_device]]
vid = 0x1A86
pid = 0x55D3
"#,
        )
        .unwrap();

        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.connection.rom_baud, Some(74880));
        assert_eq!(config.retry.max_attempts, Some(5));
        assert!(config.flash.erase_all);
        assert_eq!(config.flash.compress, Some(false));
        assert_eq!(config.catalog.path, Some(PathBuf::from("apps.json")));
        assert_eq!(config.esptool.program.as_deref(), Some("esptool.py"));
        assert_eq!(config.usb_device, vec![UsbFilter::new(0x1A86, 0x55D3)]);
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.port.is_none());
        assert!(config.usb_device.is_empty());
    }

    #[test]
    fn test_merge_prefers_other_and_dedups_devices() {
        let mut base = Config::default();
        base.connection.port = Some("COM3".into());
        base.connection.baud = Some(115_200);
        base.usb_device.push(UsbFilter::new(1, 2));

        let mut other = Config::default();
        other.connection.baud = Some(460_800);
        other.flash.compress = Some(false);
        other.usb_device = vec![UsbFilter::new(1, 2), UsbFilter::new(3, 4)];

        base.merge(other);
        assert_eq!(base.connection.port.as_deref(), Some("COM3"));
        assert_eq!(base.connection.baud, Some(460_800));
        assert_eq!(base.flash.compress, Some(false));
        assert_eq!(base.usb_device.len(), 2);
    }

    #[test]
    fn test_session_config_layering() {
        let mut config = Config::default();
        config.connection.baud = Some(460_800);
        config.connection.rom_baud = Some(74_880);
        config.usb_device.push(UsbFilter::new(0xCAFE, 0x0001));

        let session = config.session_config(None);
        assert_eq!(session.baud, 460_800);
        assert_eq!(session.rom_baud, 74_880);
        assert!(session.filters.contains(&UsbFilter::new(0xCAFE, 0x0001)));

        assert_eq!(config.session_config(Some(921_600)).baud, 921_600);
    }

    #[test]
    fn test_retry_policy_and_flash_options() {
        let config = Config::default();
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.flash_options(), FlashOptions::default());

        let mut config = Config::default();
        config.retry.max_attempts = Some(4);
        config.retry.delay_ms = Some(10);
        config.flash.compress = Some(false);
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay, Duration::from_millis(10));
        assert!(!config.flash_options().compress);
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[connection]\nport = \"/dev/ttyACM0\"\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn test_load_from_path_invalid_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[connection\nport = ").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.connection.port.is_none());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.connection.port.is_none());
    }

    #[test]
    fn test_configured_device() {
        let mut config = Config::default();
        config.usb_device.push(UsbFilter::new(0x1A86, 0x55D3));
        assert!(config.is_configured_device(0x1A86, 0x55D3));
        assert!(!config.is_configured_device(0x1A86, 0x7523));
    }

    #[test]
    fn test_global_config_path_mentions_app() {
        if let Some(p) = Config::global_config_path() {
            let text = p.to_string_lossy();
            assert!(text.contains("esplaunch"));
            assert!(text.ends_with("config.toml"));
        }
    }
}
