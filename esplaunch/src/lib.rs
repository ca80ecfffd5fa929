//! # esplaunch
//!
//! Flash-session orchestration for ESP-series microcontrollers.
//!
//! This crate sequences a flashing session on top of an external flasher:
//!
//! - connect with a bounded retry policy and chip autodetection
//! - firmware plans from user files (validated hex addresses, sorted by
//!   address) or from a quick-start catalog entry downloaded by URL
//! - optional full erase, per-image writes and post-write reset
//! - one size-weighted, non-decreasing progress percentage per run
//!
//! The flashing protocol itself lives behind the [`Loader`] and
//! [`Transport`] traits. [`EsptoolBackend`] drives the `esptool` program.
//!
//! ## Features
//!
//! - `native` (default): serial port enumeration via the `serialport` crate
//! - `http` (default): quick-start downloads via `reqwest`
//!
//! ## Example
//!
//! ```rust,no_run
//! use esplaunch::{
//!     AutoSelector, ConsoleLog, EsptoolBackend, FileSelection, FlashOptions, FlashRequest,
//!     LocalFetcher, RetryPolicy, SessionController,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut console = ConsoleLog::new();
//!     let mut session = SessionController::new(Box::new(EsptoolBackend::new()));
//!     session.connect(&mut AutoSelector, &RetryPolicy::default(), &mut console)?;
//!
//!     let files = vec![
//!         FileSelection::new("bootloader.bin", std::fs::read("bootloader.bin")?, "0x0"),
//!         FileSelection::new("app.bin", std::fs::read("app.bin")?, "10000"),
//!     ];
//!     session.start_flashing(
//!         FlashRequest::Diy(files),
//!         &LocalFetcher,
//!         FlashOptions::default(),
//!         &mut console,
//!     )?;
//!
//!     session.disconnect(&mut console);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod address;
pub mod catalog;
pub mod console;
pub mod device;
pub mod error;
pub mod fetch;
pub mod host;
pub mod loader;
pub mod plan;
pub mod progress;
pub mod session;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Connect retries
/// consult it between attempts.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

#[cfg(feature = "http")]
pub use fetch::HttpFetcher;
pub use {
    address::{default_address_for, format_address, is_valid_address, parse_flash_address},
    catalog::{Catalog, QuickStartDescriptor},
    console::{ConsoleLevel, ConsoleLine, ConsoleLog, NullObserver, SessionObserver},
    device::{DetectedPort, DeviceKind, TransportKind, UsbFilter},
    error::{Error, Result},
    fetch::{Fetcher, LocalFetcher, build_quick_start_plan},
    host::{AutoSelector, DeviceSelector, FixedPortSelector, discover_esp_ports, discover_ports},
    loader::{
        Capabilities, ChipIdentity, Framing, Loader, LoaderBackend, MacAddress, Transport,
        esptool::EsptoolBackend,
    },
    plan::{FileSelection, FirmwareEntry, FirmwarePlan, QuickSlot, build_diy_plan},
    progress::{ProgressAggregator, SessionProgress},
    session::{
        ConnectionState, FlashOptions, FlashRequest, RetryPolicy, SessionConfig, SessionController,
    },
};
