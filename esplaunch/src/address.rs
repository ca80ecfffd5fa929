//! Flash address parsing and well-known image offsets.
//!
//! User-entered addresses are hexadecimal with an optional `0x`/`0X` prefix
//! and no separators. They are kept as strings until a plan is built.

use crate::error::{Error, Result};

/// Offset of the second-stage bootloader on most ESP targets.
pub const BOOTLOADER_ADDRESS: u32 = 0x0;

/// Offset of the partition table.
pub const PARTITION_TABLE_ADDRESS: u32 = 0x8000;

/// Offset of the factory application partition.
pub const APPLICATION_ADDRESS: u32 = 0x10000;

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// Check whether `s` is an acceptable flash address string.
///
/// After trimming and stripping one optional `0x`/`0X`, the remainder must be
/// non-empty and consist only of hex digits.
#[must_use]
pub fn is_valid_address(s: &str) -> bool {
    let digits = strip_hex_prefix(s.trim());
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse a flash address string into its integer value.
///
/// Values that do not fit in 32 bits are rejected.
pub fn parse_flash_address(s: &str) -> Result<u32> {
    if !is_valid_address(s) {
        return Err(Error::InvalidAddress(s.to_string()));
    }
    let digits = strip_hex_prefix(s.trim());
    u32::from_str_radix(digits, 16).map_err(|_| Error::InvalidAddress(s.to_string()))
}

/// Format an address the way it is echoed back to the user.
#[must_use]
pub fn format_address(addr: u32) -> String {
    format!("0x{addr:X}")
}

/// Guess a sensible flash address from an image file name.
#[must_use]
pub fn default_address_for(file_name: &str) -> u32 {
    let name = file_name.to_lowercase();
    if name.contains("bootloader") {
        BOOTLOADER_ADDRESS
    } else if name.contains("partition") {
        PARTITION_TABLE_ADDRESS
    } else {
        APPLICATION_ADDRESS
    }
}
