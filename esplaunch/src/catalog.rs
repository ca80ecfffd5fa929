//! Quick-start application catalog.
//!
//! A catalog is a list of named firmware images, each fetched from a URL and
//! written to a fixed flash address. Catalogs are loaded from TOML
//! (`[[application]]` tables) or JSON (an array of objects). When no catalog
//! is configured, [`Catalog::builtin`] is used.
//!
//! ```toml
//! [[application]]
//! name = "blink"
//! url = "https://example.com/blink.bin"
//! flash_address = "0x10000"
//! version = "1.0.0"
//! type = "demo"
//! description = "Toggles the on-board LED"
//! ```

use crate::address::parse_flash_address;
use crate::error::{Error, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One named quick-start firmware image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickStartDescriptor {
    /// Display name, also the lookup key.
    pub name: String,
    /// Where the image is downloaded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Target flash address as a hex string.
    #[serde(
        default,
        alias = "flashAddress",
        skip_serializing_if = "Option::is_none"
    )]
    pub flash_address: Option<String>,
    /// Image version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Free-form category such as "demo" or "at-firmware".
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// One-line description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl QuickStartDescriptor {
    /// Descriptor with a name, URL and address and nothing else.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        flash_address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: Some(url.into()),
            flash_address: Some(flash_address.into()),
            version: None,
            kind: None,
            description: None,
        }
    }

    /// URL, or [`Error::InvalidDescriptor`] when it is missing or blank.
    pub fn require_url(&self) -> Result<&str> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| self.invalid("missing url"))
    }

    /// Parsed flash address, or [`Error::InvalidDescriptor`].
    pub fn require_address(&self) -> Result<u32> {
        let raw = self
            .flash_address
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| self.invalid("missing flash address"))?;
        parse_flash_address(raw).map_err(|_| self.invalid(&format!("bad flash address '{raw}'")))
    }

    /// File name used for the downloaded image in plans and logs.
    pub fn image_name(&self) -> String {
        self.url
            .as_deref()
            .and_then(|url| url.rsplit('/').next())
            .filter(|tail| !tail.is_empty())
            .map_or_else(|| format!("{}.bin", self.name), str::to_string)
    }

    fn invalid(&self, reason: &str) -> Error {
        Error::InvalidDescriptor {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct CatalogFile {
    #[serde(default)]
    application: Vec<QuickStartDescriptor>,
}

/// A set of quick-start descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    entries: Vec<QuickStartDescriptor>,
}

impl Catalog {
    /// Create a catalog from descriptors.
    pub fn new(entries: Vec<QuickStartDescriptor>) -> Self {
        Self { entries }
    }

    /// Catalog used when none is configured.
    pub fn builtin() -> Self {
        let mut blink = QuickStartDescriptor::new(
            "blink",
            "https://github.com/esplaunch/esplaunch/releases/latest/download/blink-esp32.bin",
            "0x10000",
        );
        blink.version = Some("1.0.0".into());
        blink.kind = Some("demo".into());
        blink.description = Some("Blinks the on-board LED once per second".into());
        Self::new(vec![blink])
    }

    /// Parse a TOML catalog.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: CatalogFile =
            toml::from_str(content).map_err(|e| Error::Catalog(e.to_string()))?;
        Ok(Self::new(file.application))
    }

    /// Parse a JSON catalog.
    ///
    /// Accepts either a bare array or an object with an `application` array.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(content).map_err(|e| Error::Catalog(e.to_string()))?;
        let entries = if value.is_array() {
            serde_json::from_value(value)
        } else {
            serde_json::from_value::<CatalogFile>(value).map(|f| f.application)
        }
        .map_err(|e| Error::Catalog(e.to_string()))?;
        Ok(Self::new(entries))
    }

    /// Load a catalog file; `.json` files are parsed as JSON, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Catalog(format!("{}: {e}", path.display())))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let catalog = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };
        debug!(
            "Loaded {} quick-start application(s) from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Load `path` when given, otherwise the built-in catalog.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::builtin()),
        }
    }

    /// Find a descriptor by name, ignoring ASCII case.
    pub fn find(&self, name: &str) -> Option<&QuickStartDescriptor> {
        let name = name.trim();
        self.entries
            .iter()
            .find(|d| d.name == name)
            .or_else(|| self.entries.iter().find(|d| d.name.eq_ignore_ascii_case(name)))
    }

    /// All descriptors in catalog order.
    pub fn entries(&self) -> &[QuickStartDescriptor] {
        &self.entries
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        let file = CatalogFile {
            application: self.entries.clone(),
        };
        toml::to_string_pretty(&file).map_err(|e| Error::Catalog(e.to_string()))
    }
}
