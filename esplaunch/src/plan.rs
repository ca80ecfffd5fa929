//! Firmware write plans.
//!
//! A plan is the ordered list of images a flashing run writes. It is built
//! fresh from the user's current selections on every run and never stored.
//!
//! ## Example
//!
//! ```rust
//! use esplaunch::plan::{FileSelection, build_diy_plan};
//!
//! let selections = vec![
//!     FileSelection::new("app.bin", vec![0u8; 300], "10000"),
//!     FileSelection::new("bootloader.bin", vec![0u8; 100], "0x0"),
//! ];
//! let plan = build_diy_plan(&selections).unwrap();
//! assert_eq!(plan.entries()[0].address, 0);
//! assert_eq!(plan.total_bytes(), 400);
//! ```

use crate::address::{
    APPLICATION_ADDRESS, BOOTLOADER_ADDRESS, PARTITION_TABLE_ADDRESS, format_address,
    parse_flash_address,
};
use crate::error::{Error, Result};
use log::debug;
use std::fmt;

/// One user-selected image in DIY mode.
///
/// The address is kept exactly as typed until a plan is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSelection {
    /// Display name (usually the file name).
    pub name: String,
    /// Image contents; `None` for an empty slot.
    pub data: Option<Vec<u8>>,
    /// Flash address as entered, e.g. `"0x8000"` or `"10000"`.
    pub address: String,
    /// Slot added from a quick-add button and not yet filled.
    pub is_placeholder: bool,
}

impl FileSelection {
    /// Create a selection for a loaded image.
    pub fn new(name: impl Into<String>, data: Vec<u8>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Some(data),
            address: address.into(),
            is_placeholder: false,
        }
    }

    /// Create an empty slot for a well-known image.
    #[must_use]
    pub fn placeholder(slot: QuickSlot) -> Self {
        Self {
            name: slot.file_name().to_string(),
            data: None,
            address: format!("{:x}", slot.address()),
            is_placeholder: true,
        }
    }

    /// Size of the selected image in bytes (0 for empty slots).
    pub fn size(&self) -> usize {
        self.data.as_ref().map_or(0, Vec::len)
    }

    /// Fill a placeholder slot with image contents.
    pub fn fill(&mut self, data: Vec<u8>) {
        self.data = Some(data);
        self.is_placeholder = false;
    }
}

/// Well-known image slots offered as quick-add shortcuts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickSlot {
    /// Second-stage bootloader.
    Bootloader,
    /// Partition table.
    PartitionTable,
    /// Application image.
    Application,
}

impl QuickSlot {
    /// Default file name of the slot.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Bootloader => "bootloader.bin",
            Self::PartitionTable => "partition-table.bin",
            Self::Application => "app.bin",
        }
    }

    /// Fixed flash address of the slot.
    pub fn address(self) -> u32 {
        match self {
            Self::Bootloader => BOOTLOADER_ADDRESS,
            Self::PartitionTable => PARTITION_TABLE_ADDRESS,
            Self::Application => APPLICATION_ADDRESS,
        }
    }
}

/// One image to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareEntry {
    /// Display name.
    pub name: String,
    /// Image contents, absent for placeholder slots.
    pub data: Option<Vec<u8>>,
    /// Size in bytes.
    pub size: usize,
    /// Flash address.
    pub address: u32,
    /// Placeholder slot that is never written.
    pub is_placeholder: bool,
}

impl FirmwareEntry {
    /// Create an entry for a loaded image.
    pub fn new(name: impl Into<String>, data: Vec<u8>, address: u32) -> Self {
        Self {
            name: name.into(),
            size: data.len(),
            data: Some(data),
            address,
            is_placeholder: false,
        }
    }

    /// Image bytes, if there is anything to write.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.data.as_deref().filter(|d| !d.is_empty())
    }

    /// Whether the entry takes part in a write.
    pub fn is_writable(&self) -> bool {
        !self.is_placeholder && self.bytes().is_some()
    }

    /// First address past the end of the image.
    pub fn end_address(&self) -> u64 {
        u64::from(self.address) + self.size as u64
    }
}

/// Two entries whose address ranges intersect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlap {
    /// Entry with the lower start address.
    pub first: String,
    /// Entry that starts inside `first`.
    pub second: String,
    /// Start of the shared range.
    pub start: u32,
    /// End (exclusive) of the shared range.
    pub end: u64,
}

impl fmt::Display for Overlap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} and {} overlap at {}..0x{:X}",
            self.first,
            self.second,
            format_address(self.start),
            self.end
        )
    }
}

/// Ordered, filtered list of images to write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwarePlan {
    entries: Vec<FirmwareEntry>,
}

impl FirmwarePlan {
    /// Build a plan from arbitrary entries.
    ///
    /// Placeholders and entries without bytes are dropped and the rest are
    /// sorted by address. The sort is stable, so equal addresses keep their
    /// input order.
    pub fn new(entries: impl IntoIterator<Item = FirmwareEntry>) -> Self {
        let mut entries: Vec<FirmwareEntry> = entries
            .into_iter()
            .filter(FirmwareEntry::is_writable)
            .collect();
        entries.sort_by_key(|e| e.address);
        Self { entries }
    }

    /// Entries in write order.
    pub fn entries(&self) -> &[FirmwareEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes across all entries.
    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Iterate over entries in write order.
    pub fn iter(&self) -> std::slice::Iter<'_, FirmwareEntry> {
        self.entries.iter()
    }

    /// Find entries whose address ranges intersect.
    ///
    /// Overlaps are reported, not rejected: the device resolves them by
    /// write order.
    pub fn overlaps(&self) -> Vec<Overlap> {
        let mut found = Vec::new();
        for (i, a) in self.entries.iter().enumerate() {
            for b in &self.entries[i + 1..] {
                if u64::from(b.address) < a.end_address() {
                    found.push(Overlap {
                        first: a.name.clone(),
                        second: b.name.clone(),
                        start: b.address,
                        end: a.end_address().min(b.end_address()),
                    });
                }
            }
        }
        found
    }
}

impl<'a> IntoIterator for &'a FirmwarePlan {
    type Item = &'a FirmwareEntry;
    type IntoIter = std::slice::Iter<'a, FirmwareEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Build a plan from DIY selections.
///
/// Every address is validated first, placeholders included, so a single bad
/// address rejects the whole plan before anything is written.
pub fn build_diy_plan(selections: &[FileSelection]) -> Result<FirmwarePlan> {
    if selections.is_empty() {
        return Err(Error::EmptyPlan);
    }

    let mut entries = Vec::with_capacity(selections.len());
    for selection in selections {
        let address = parse_flash_address(&selection.address).map_err(|_| Error::Validation {
            file: selection.name.clone(),
            message: format!(
                "'{}' is not a hexadecimal address",
                selection.address.trim()
            ),
        })?;
        entries.push(FirmwareEntry {
            name: selection.name.clone(),
            size: selection.size(),
            data: selection.data.clone(),
            address,
            is_placeholder: selection.is_placeholder,
        });
    }

    let plan = FirmwarePlan::new(entries);
    debug!(
        "Built DIY plan: {} of {} selections, {} bytes",
        plan.len(),
        selections.len(),
        plan.total_bytes()
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sel(name: &str, size: usize, addr: &str) -> FileSelection {
        FileSelection::new(name, vec![0xAA; size], addr)
    }

    fn addresses(plan: &FirmwarePlan) -> Vec<u32> {
        plan.iter().map(|e| e.address).collect()
    }

    #[test]
    fn test_two_files_sorted_by_address() {
        let plan = build_diy_plan(&[sel("app.bin", 300, "8000"), sel("boot.bin", 100, "0x0")])
            .unwrap();
        assert_eq!(addresses(&plan), vec![0, 0x8000]);
        assert_eq!(plan.entries()[0].size, 100);
        assert_eq!(plan.entries()[1].size, 300);
        assert_eq!(plan.total_bytes(), 400);
    }

    #[test]
    fn test_sorted_for_every_permutation() {
        let base = [
            sel("a", 1, "10000"),
            sel("b", 1, "0"),
            sel("c", 1, "0x8000"),
            sel("d", 1, "1000"),
        ];
        let perms = [
            [0, 1, 2, 3],
            [3, 2, 1, 0],
            [1, 3, 0, 2],
            [2, 0, 3, 1],
            [0, 2, 1, 3],
        ];
        for perm in perms {
            let input: Vec<FileSelection> = perm.iter().map(|&i| base[i].clone()).collect();
            let plan = build_diy_plan(&input).unwrap();
            assert_eq!(addresses(&plan), vec![0, 0x1000, 0x8000, 0x10000]);
        }
    }

    #[test]
    fn test_equal_addresses_keep_input_order() {
        let plan = build_diy_plan(&[
            sel("first", 4, "0x1000"),
            sel("low", 4, "0"),
            sel("second", 4, "1000"),
            sel("third", 4, "0X1000"),
        ])
        .unwrap();
        let names: Vec<&str> = plan.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["low", "first", "second", "third"]);
    }

    #[test]
    fn test_invalid_address_names_file() {
        let err = build_diy_plan(&[sel("good.bin", 4, "0"), sel("bad.bin", 4, "zz")]).unwrap_err();
        match err {
            Error::Validation { file, message } => {
                assert_eq!(file, "bad.bin");
                assert!(message.contains("zz"));
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_placeholders_filtered_but_validated() {
        let mut boot = FileSelection::placeholder(QuickSlot::Bootloader);
        assert_eq!(boot.address, "0");
        let app = FileSelection::placeholder(QuickSlot::Application);
        let plan = build_diy_plan(&[boot.clone(), app, sel("pt.bin", 8, "8000")]).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.entries()[0].name, "pt.bin");

        boot.fill(vec![1, 2, 3]);
        assert!(!boot.is_placeholder);
        let plan = build_diy_plan(&[boot]).unwrap();
        assert_eq!(plan.len(), 1);

        let mut broken = FileSelection::placeholder(QuickSlot::PartitionTable);
        broken.address = "xyz".into();
        assert!(build_diy_plan(&[broken, sel("a", 1, "0")]).is_err());
    }

    #[test]
    fn test_empty_sources_dropped() {
        let plan = build_diy_plan(&[sel("empty.bin", 0, "0"), sel("app.bin", 10, "10000")]).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.total_bytes(), 10);
    }

    #[test]
    fn test_no_selections_is_empty_plan() {
        assert!(matches!(build_diy_plan(&[]), Err(Error::EmptyPlan)));
    }

    #[test]
    fn test_overlaps_reported() {
        let plan = build_diy_plan(&[
            sel("boot.bin", 0x9000, "0"),
            sel("pt.bin", 0x1000, "8000"),
            sel("app.bin", 0x100, "10000"),
        ])
        .unwrap();
        let overlaps = plan.overlaps();
        assert_eq!(overlaps.len(), 1);
        assert_eq!(overlaps[0].first, "boot.bin");
        assert_eq!(overlaps[0].second, "pt.bin");
        assert_eq!(overlaps[0].start, 0x8000);
        assert_eq!(overlaps[0].end, 0x9000);
        assert!(overlaps[0].to_string().contains("0x8000"));

        let clean = build_diy_plan(&[sel("a", 0x8000, "0"), sel("b", 1, "8000")]).unwrap();
        assert!(clean.overlaps().is_empty());
    }

    #[test]
    fn test_quick_slots() {
        assert_eq!(QuickSlot::Bootloader.address(), 0);
        assert_eq!(QuickSlot::PartitionTable.file_name(), "partition-table.bin");
        let pt = FileSelection::placeholder(QuickSlot::PartitionTable);
        assert_eq!(pt.address, "8000");
        assert_eq!(pt.size(), 0);
        assert_eq!(FileSelection::placeholder(QuickSlot::Application).address, "10000");
    }
}
