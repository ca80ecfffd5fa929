//! Session controller.
//!
//! A [`SessionController`] owns one device session: the connection state,
//! the loader bound to the device and what autodetection reported. Every
//! operation checks and transitions the state before any device I/O, so an
//! operation started in the wrong state fails without touching the device.
//!
//! ```text
//!                connect()                 flash()/erase
//! Disconnected ----------> Connecting ---> Connected <------> Flashing
//!      ^                        |              |
//!      +------ failure ---------+              |
//!      +------------------ disconnect() -------+
//! ```

use crate::catalog::QuickStartDescriptor;
use crate::console::{ConsoleLevel, SessionObserver};
use crate::device::{self, DetectedPort, UsbFilter};
use crate::error::{Error, Result};
use crate::fetch::{self, Fetcher};
use crate::host::DeviceSelector;
use crate::loader::{
    Capabilities, ChipIdentity, DEFAULT_FLASH_BAUD, Framing, Loader, LoaderBackend, MacAddress,
    ROM_BAUD,
};
use crate::plan::{self, FileSelection, FirmwarePlan};
use crate::progress::{ProgressAggregator, SessionProgress};
use log::{debug, error, info, warn};
use std::fmt;
use std::thread;
use std::time::Duration;

/// Lifecycle of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No device bound.
    #[default]
    Disconnected,
    /// Device acquisition and chip detection in progress.
    Connecting,
    /// Chip detected and idle.
    Connected,
    /// Erase or write in progress.
    Flashing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Flashing => "flashing",
        })
    }
}

/// How often `connect` retries and how long it waits in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Attempts actually made; at least one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(2))
    }
}

/// Options for a flashing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashOptions {
    /// Erase the whole flash before writing.
    pub erase_all: bool,
    /// Ask the flasher to compress image data on the wire.
    pub compress: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            erase_all: false,
            compress: true,
        }
    }
}

/// What to flash, before the plan is built.
#[derive(Debug, Clone)]
pub enum FlashRequest {
    /// User-selected files with their address strings.
    Diy(Vec<FileSelection>),
    /// A catalog application, if one was chosen.
    QuickStart(Option<QuickStartDescriptor>),
}

/// Link parameters for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Baud rate for bulk transfer.
    pub baud: u32,
    /// Baud rate of the ROM handshake.
    pub rom_baud: u32,
    /// USB ids offered to the device selector.
    pub filters: Vec<UsbFilter>,
}

impl SessionConfig {
    /// Use a different bulk baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Offer extra USB ids to the device selector.
    #[must_use]
    pub fn with_extra_filters(mut self, extra: impl IntoIterator<Item = UsbFilter>) -> Self {
        for filter in extra {
            if !self.filters.contains(&filter) {
                self.filters.push(filter);
            }
        }
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud: DEFAULT_FLASH_BAUD,
            rom_baud: ROM_BAUD,
            filters: device::default_filters(),
        }
    }
}

fn note(observer: &mut dyn SessionObserver, level: ConsoleLevel, text: &str) {
    match level {
        ConsoleLevel::Info | ConsoleLevel::Success => info!("{text}"),
        ConsoleLevel::Warning => warn!("{text}"),
        ConsoleLevel::Error => error!("{text}"),
    }
    observer.on_message(level, text);
}

fn progress(observer: &mut dyn SessionObserver, label: &str, percent: f64) {
    observer.on_progress(&SessionProgress::new(label, percent));
}

/// Drives one device session.
pub struct SessionController {
    backend: Box<dyn LoaderBackend>,
    config: SessionConfig,
    state: ConnectionState,
    loader: Option<Box<dyn Loader>>,
    device: Option<DetectedPort>,
    chip: Option<ChipIdentity>,
    mac: Option<MacAddress>,
}

impl SessionController {
    /// Create a disconnected controller with default link parameters.
    pub fn new(backend: Box<dyn LoaderBackend>) -> Self {
        Self::with_config(backend, SessionConfig::default())
    }

    /// Create a disconnected controller.
    pub fn with_config(backend: Box<dyn LoaderBackend>, config: SessionConfig) -> Self {
        Self {
            backend,
            config,
            state: ConnectionState::Disconnected,
            loader: None,
            device: None,
            chip: None,
            mac: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a chip is bound (idle or flashing).
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Flashing
        )
    }

    /// Whether an erase or write is running.
    pub fn is_flashing(&self) -> bool {
        self.state == ConnectionState::Flashing
    }

    /// What autodetection reported.
    pub fn chip(&self) -> Option<&ChipIdentity> {
        self.chip.as_ref()
    }

    /// Factory MAC, when it could be read.
    pub fn mac_address(&self) -> Option<MacAddress> {
        self.mac
    }

    /// The bound device.
    pub fn device(&self) -> Option<&DetectedPort> {
        self.device.as_ref()
    }

    /// Link parameters.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Bulk baud rate of the bound loader.
    pub fn baud_rate(&self) -> Option<u32> {
        self.loader.as_ref().map(|l| l.baud_rate())
    }

    fn set_state(&mut self, state: ConnectionState, observer: &mut dyn SessionObserver) {
        if self.state != state {
            debug!("Session state {} -> {}", self.state, state);
            self.state = state;
            observer.on_state(state);
        }
    }

    fn capabilities(&self) -> Capabilities {
        self.chip
            .as_ref()
            .map_or(Capabilities::NONE, |c| c.capabilities)
    }

    fn require_connected(&self) -> Result<()> {
        match self.state {
            ConnectionState::Connected if self.loader.is_some() => Ok(()),
            ConnectionState::Flashing => Err(Error::Precondition(
                "an operation is already in progress".into(),
            )),
            _ => Err(Error::Precondition("no device connected".into())),
        }
    }

    /// Acquire a device and detect the chip.
    ///
    /// The selector is asked once. Opening the transport and detecting the
    /// chip are retried per `policy` against the same device; the previous
    /// transport is closed before every retry.
    pub fn connect(
        &mut self,
        selector: &mut dyn DeviceSelector,
        policy: &RetryPolicy,
        observer: &mut dyn SessionObserver,
    ) -> Result<()> {
        match self.state {
            ConnectionState::Disconnected => {},
            ConnectionState::Connecting => {
                return Err(Error::Precondition("already connecting".into()));
            },
            ConnectionState::Connected => {
                return Err(Error::Precondition("already connected".into()));
            },
            ConnectionState::Flashing => {
                return Err(Error::Precondition(
                    "cannot connect while flashing".into(),
                ));
            },
        }
        self.set_state(ConnectionState::Connecting, observer);
        note(observer, ConsoleLevel::Info, "Connecting to device...");

        let device = match selector.request_device(&self.config.filters) {
            Ok(device) => device,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected, observer);
                if e.is_user_cancelled() {
                    note(observer, ConsoleLevel::Info, "Device selection cancelled");
                } else {
                    note(observer, ConsoleLevel::Error, &format!("Connection failed: {e}"));
                }
                return Err(e);
            },
        };
        let framing = Framing::for_port(&device);
        note(
            observer,
            ConsoleLevel::Info,
            &format!("Using {} ({})", device.name, device.device.name()),
        );

        let attempts = policy.attempts();
        let mut attempt = 1;
        let (loader, chip) = loop {
            match self.try_connect(&device, framing) {
                Ok(bound) => break bound,
                Err(e) if attempt < attempts => {
                    note(
                        observer,
                        ConsoleLevel::Warning,
                        &format!("Attempt {attempt}/{attempts} failed: {e}"),
                    );
                    attempt += 1;
                    if !policy.delay.is_zero() {
                        thread::sleep(policy.delay);
                        if crate::is_interrupted_requested() {
                            self.set_state(ConnectionState::Disconnected, observer);
                            note(observer, ConsoleLevel::Info, "Connection interrupted");
                            return Err(Error::UserCancelled);
                        }
                    }
                },
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected, observer);
                    note(observer, ConsoleLevel::Error, &format!("Connection failed: {e}"));
                    return Err(e);
                },
            }
        };

        note(
            observer,
            ConsoleLevel::Success,
            &format!("Connected: {}", chip.description),
        );
        if !chip.features.is_empty() {
            note(
                observer,
                ConsoleLevel::Info,
                &format!("Features: {}", chip.features_display()),
            );
        }

        self.loader = Some(loader);
        self.device = Some(device);
        self.mac = None;
        if chip.capabilities.read_mac {
            if let Some(loader) = self.loader.as_mut() {
                match loader.read_mac_address() {
                    Ok(mac) => {
                        note(observer, ConsoleLevel::Info, &format!("MAC: {mac}"));
                        self.mac = Some(mac);
                    },
                    Err(e) => {
                        debug!("MAC read failed: {e}");
                        note(observer, ConsoleLevel::Warning, "Could not read MAC address");
                    },
                }
            }
        }
        self.chip = Some(chip);
        self.set_state(ConnectionState::Connected, observer);
        Ok(())
    }

    fn try_connect(
        &self,
        device: &DetectedPort,
        framing: Framing,
    ) -> Result<(Box<dyn Loader>, ChipIdentity)> {
        let transport = self.backend.open(device, framing)?;
        let mut loader = self
            .backend
            .create_loader(transport, self.config.baud, self.config.rom_baud)?;
        match loader.detect() {
            Ok(chip) => Ok((loader, chip)),
            Err(e) => {
                if let Err(close_err) = loader.transport_mut().close() {
                    debug!("Closing transport after failed attempt: {close_err}");
                }
                Err(e)
            },
        }
    }

    /// Release the device.
    ///
    /// Hard-resets the chip when supported and closes the transport. Failures
    /// of either step are logged; the session always ends disconnected.
    pub fn disconnect(&mut self, observer: &mut dyn SessionObserver) {
        let capabilities = self.capabilities();
        if let Some(mut loader) = self.loader.take() {
            note(observer, ConsoleLevel::Info, "Disconnecting...");
            if capabilities.hard_reset {
                if let Err(e) = loader.hard_reset() {
                    note(observer, ConsoleLevel::Warning, &format!("Reset failed: {e}"));
                }
            }
            if let Err(e) = loader.transport_mut().close() {
                note(
                    observer,
                    ConsoleLevel::Warning,
                    &format!("Closing transport failed: {e}"),
                );
            }
            note(observer, ConsoleLevel::Info, "Device disconnected");
        }
        self.device = None;
        self.chip = None;
        self.mac = None;
        self.set_state(ConnectionState::Disconnected, observer);
    }

    /// Write a prepared plan.
    ///
    /// Requires [`ConnectionState::Connected`]. The session is `Flashing` for
    /// the duration and returns to `Connected` whatever the outcome.
    pub fn flash(
        &mut self,
        plan: &FirmwarePlan,
        options: FlashOptions,
        observer: &mut dyn SessionObserver,
    ) -> Result<()> {
        self.require_connected()?;
        self.set_state(ConnectionState::Flashing, observer);
        let result = self.run_plan(plan, options, observer);
        self.finish_flashing(result, observer)
    }

    /// Build a plan from `request` and write it.
    ///
    /// The session enters `Flashing` before the plan is built, so address
    /// validation and quick-start downloads happen inside the run and their
    /// errors surface before any device I/O.
    pub fn start_flashing(
        &mut self,
        request: FlashRequest,
        fetcher: &dyn Fetcher,
        options: FlashOptions,
        observer: &mut dyn SessionObserver,
    ) -> Result<()> {
        self.require_connected()?;
        self.set_state(ConnectionState::Flashing, observer);
        note(observer, ConsoleLevel::Info, "Starting flash...");
        progress(observer, "Preparing", 0.0);

        let result = Self::build_plan(request, fetcher, observer)
            .and_then(|plan| self.run_plan(&plan, options, observer));
        self.finish_flashing(result, observer)
    }

    fn build_plan(
        request: FlashRequest,
        fetcher: &dyn Fetcher,
        observer: &mut dyn SessionObserver,
    ) -> Result<FirmwarePlan> {
        match request {
            FlashRequest::Diy(selections) => plan::build_diy_plan(&selections),
            FlashRequest::QuickStart(descriptor) => {
                if let Some(d) = &descriptor {
                    note(observer, ConsoleLevel::Info, &format!("Application: {}", d.name));
                }
                fetch::build_quick_start_plan(
                    descriptor.as_ref(),
                    fetcher,
                    &mut |received, total| observer.on_download(received, total),
                )
            },
        }
    }

    fn finish_flashing(
        &mut self,
        result: Result<()>,
        observer: &mut dyn SessionObserver,
    ) -> Result<()> {
        self.set_state(ConnectionState::Connected, observer);
        match &result {
            Ok(()) => note(observer, ConsoleLevel::Success, "Flashing complete"),
            Err(e) => note(observer, ConsoleLevel::Error, &format!("Flashing failed: {e}")),
        }
        result
    }

    fn run_plan(
        &mut self,
        plan: &FirmwarePlan,
        options: FlashOptions,
        observer: &mut dyn SessionObserver,
    ) -> Result<()> {
        if plan.is_empty() {
            return Err(Error::EmptyPlan);
        }
        for overlap in plan.overlaps() {
            note(observer, ConsoleLevel::Warning, &format!("Images overlap: {overlap}"));
        }

        let capabilities = self.capabilities();
        let loader = self
            .loader
            .as_mut()
            .ok_or_else(|| Error::Precondition("no device connected".into()))?;
        let mut aggregator = ProgressAggregator::for_plan(plan);
        progress(observer, "Preparing", 0.0);

        if options.erase_all {
            note(observer, ConsoleLevel::Info, "Erasing flash...");
            progress(observer, "Erasing flash", 0.0);
            loader.erase_all()?;
            note(observer, ConsoleLevel::Success, "Flash erased");
        }

        for (index, entry) in plan.iter().enumerate() {
            let Some(data) = entry.bytes() else {
                continue;
            };
            let label = format!("Writing {}", entry.name);
            note(
                observer,
                ConsoleLevel::Info,
                &format!(
                    "Writing {} ({} bytes) at {}",
                    entry.name,
                    entry.size,
                    crate::address::format_address(entry.address)
                ),
            );
            let base = aggregator.begin_entry(index);
            progress(observer, &label, base);

            loader
                .write_image(data, entry.address, options.compress, &mut |written, total| {
                    let percent = aggregator.report(index, written, total);
                    observer.on_progress(&SessionProgress::new(label.as_str(), percent));
                })
                .map_err(|e| match e {
                    Error::Device(msg) => Error::Device(format!("{}: {msg}", entry.name)),
                    other => other,
                })?;
            note(observer, ConsoleLevel::Success, &format!("{} written", entry.name));
        }

        progress(observer, "Resetting device", aggregator.finish_writes());
        if capabilities.soft_reset {
            if let Err(e) = loader.soft_reset() {
                note(observer, ConsoleLevel::Warning, &format!("Soft reset failed: {e}"));
            }
        }
        if capabilities.hard_reset {
            if let Err(e) = loader.hard_reset() {
                note(observer, ConsoleLevel::Warning, &format!("Hard reset failed: {e}"));
            }
        }
        progress(observer, "Complete", aggregator.complete());
        Ok(())
    }

    /// Erase the whole flash of the connected chip.
    pub fn erase_flash(&mut self, observer: &mut dyn SessionObserver) -> Result<()> {
        self.require_connected()?;
        self.set_state(ConnectionState::Flashing, observer);
        note(observer, ConsoleLevel::Info, "Erasing flash...");
        let result = match self.loader.as_mut() {
            Some(loader) => loader.erase_all(),
            None => Err(Error::Precondition("no device connected".into())),
        };
        self.set_state(ConnectionState::Connected, observer);
        match &result {
            Ok(()) => note(observer, ConsoleLevel::Success, "Flash erased"),
            Err(e) => note(observer, ConsoleLevel::Error, &format!("Erase failed: {e}")),
        }
        result
    }

    /// Hard-reset the connected chip.
    pub fn reset_device(&mut self, observer: &mut dyn SessionObserver) -> Result<()> {
        self.require_connected()?;
        if !self.capabilities().hard_reset {
            return Err(Error::Unsupported(
                "this chip does not support hard reset".into(),
            ));
        }
        note(observer, ConsoleLevel::Info, "Resetting device...");
        let result = match self.loader.as_mut() {
            Some(loader) => loader.hard_reset(),
            None => Err(Error::Precondition("no device connected".into())),
        };
        match &result {
            Ok(()) => note(observer, ConsoleLevel::Success, "Device reset"),
            Err(e) => note(observer, ConsoleLevel::Error, &format!("Reset failed: {e}")),
        }
        result
    }
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state)
            .field("device", &self.device)
            .field("chip", &self.chip)
            .field("mac", &self.mac)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::ConsoleLog;
    use crate::fetch::DownloadProgress;
    use crate::loader::{Transport, WriteProgress};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Script {
        detect_failures: usize,
        fail_write_at: Option<u32>,
        fail_mac: bool,
        fail_reset: bool,
        fail_close: bool,
        capabilities: Option<Capabilities>,
        events: Vec<String>,
    }

    type Shared = Rc<RefCell<Script>>;

    fn record(script: &Shared, event: impl Into<String>) {
        script.borrow_mut().events.push(event.into());
    }

    struct MockBackend(Shared);

    struct MockTransport {
        device: DetectedPort,
        script: Shared,
    }

    struct MockLoader {
        transport: Box<dyn Transport>,
        script: Shared,
        baud: u32,
    }

    impl LoaderBackend for MockBackend {
        fn open(&self, device: &DetectedPort, _framing: Framing) -> Result<Box<dyn Transport>> {
            record(&self.0, "open");
            Ok(Box::new(MockTransport {
                device: device.clone(),
                script: Rc::clone(&self.0),
            }))
        }

        fn create_loader(
            &self,
            transport: Box<dyn Transport>,
            baud: u32,
            _rom_baud: u32,
        ) -> Result<Box<dyn Loader>> {
            Ok(Box::new(MockLoader {
                transport,
                script: Rc::clone(&self.0),
                baud,
            }))
        }
    }

    impl Transport for MockTransport {
        fn device(&self) -> &DetectedPort {
            &self.device
        }

        fn framing(&self) -> Framing {
            Framing::Serial
        }

        fn close(&mut self) -> Result<()> {
            record(&self.script, "close");
            if self.script.borrow().fail_close {
                return Err(Error::Device("close failed".into()));
            }
            Ok(())
        }
    }

    impl Loader for MockLoader {
        fn detect(&mut self) -> Result<ChipIdentity> {
            record(&self.script, "detect");
            let mut script = self.script.borrow_mut();
            if script.detect_failures > 0 {
                script.detect_failures -= 1;
                return Err(Error::Device("no sync".into()));
            }
            Ok(ChipIdentity::new("ESP32-C3 (revision v0.4)")
                .with_features(["WiFi", "BLE"])
                .with_capabilities(script.capabilities.unwrap_or(Capabilities::ALL)))
        }

        fn read_mac_address(&mut self) -> Result<MacAddress> {
            record(&self.script, "read_mac");
            if self.script.borrow().fail_mac {
                return Err(Error::Device("mac".into()));
            }
            Ok(MacAddress([0x24, 0x0a, 0xc4, 1, 2, 3]))
        }

        fn erase_all(&mut self) -> Result<()> {
            record(&self.script, "erase");
            Ok(())
        }

        fn write_image(
            &mut self,
            data: &[u8],
            address: u32,
            _compress: bool,
            progress: &mut WriteProgress<'_>,
        ) -> Result<()> {
            record(&self.script, format!("write:{address:#x}"));
            if self.script.borrow().fail_write_at == Some(address) {
                return Err(Error::Device("write timeout".into()));
            }
            let total = data.len();
            for step in 0..=4 {
                progress(total * step / 4, total);
            }
            Ok(())
        }

        fn soft_reset(&mut self) -> Result<()> {
            record(&self.script, "soft_reset");
            if self.script.borrow().fail_reset {
                return Err(Error::Device("reset".into()));
            }
            Ok(())
        }

        fn hard_reset(&mut self) -> Result<()> {
            record(&self.script, "hard_reset");
            if self.script.borrow().fail_reset {
                return Err(Error::Device("reset".into()));
            }
            Ok(())
        }

        fn transport_mut(&mut self) -> &mut dyn Transport {
            self.transport.as_mut()
        }

        fn baud_rate(&self) -> u32 {
            self.baud
        }
    }

    /// Records progress into the shared event list next to device calls.
    struct Recorder {
        script: Shared,
        percents: Vec<f64>,
        console: ConsoleLog,
    }

    impl Recorder {
        fn new(script: &Shared) -> Self {
            Self {
                script: Rc::clone(script),
                percents: Vec::new(),
                console: ConsoleLog::new(),
            }
        }
    }

    impl SessionObserver for Recorder {
        fn on_message(&mut self, level: ConsoleLevel, text: &str) {
            self.console.on_message(level, text);
        }

        fn on_progress(&mut self, progress: &SessionProgress) {
            self.percents.push(progress.percent);
            record(&self.script, format!("progress:{}", progress.percent));
        }

        fn on_state(&mut self, state: ConnectionState) {
            self.console.on_state(state);
        }
    }

    struct FailingFetcher;

    impl Fetcher for FailingFetcher {
        fn fetch(&self, url: &str, _progress: &mut DownloadProgress<'_>) -> Result<Vec<u8>> {
            Err(Error::Network(format!("{url}: connection refused")))
        }
    }

    struct BytesFetcher(Vec<u8>);

    impl Fetcher for BytesFetcher {
        fn fetch(&self, _url: &str, progress: &mut DownloadProgress<'_>) -> Result<Vec<u8>> {
            progress(self.0.len() as u64, Some(self.0.len() as u64));
            Ok(self.0.clone())
        }
    }

    fn no_retry_delay() -> RetryPolicy {
        RetryPolicy::new(2, Duration::ZERO)
    }

    fn selector() -> impl FnMut(&[UsbFilter]) -> Result<DetectedPort> {
        |_: &[UsbFilter]| -> Result<DetectedPort> { Ok(DetectedPort::named("/dev/ttyUSB0")) }
    }

    fn setup(script: Script) -> (SessionController, Shared, Recorder) {
        let shared = Rc::new(RefCell::new(script));
        let controller = SessionController::new(Box::new(MockBackend(Rc::clone(&shared))));
        let recorder = Recorder::new(&shared);
        (controller, shared, recorder)
    }

    fn connected(script: Script) -> (SessionController, Shared, Recorder) {
        let (mut controller, shared, mut recorder) = setup(script);
        controller
            .connect(&mut selector(), &no_retry_delay(), &mut recorder)
            .unwrap();
        shared.borrow_mut().events.clear();
        (controller, shared, recorder)
    }

    fn count(shared: &Shared, event: &str) -> usize {
        shared.borrow().events.iter().filter(|e| *e == event).count()
    }

    fn device_events(shared: &Shared) -> Vec<String> {
        shared
            .borrow()
            .events
            .iter()
            .filter(|e| !e.starts_with("progress:"))
            .cloned()
            .collect()
    }

    #[test]
    fn test_defaults() {
        assert_eq!(RetryPolicy::default().max_attempts, 2);
        assert_eq!(RetryPolicy::default().delay, Duration::from_secs(2));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts(), 1);
        assert!(FlashOptions::default().compress);
        assert!(!FlashOptions::default().erase_all);
        assert_eq!(SessionConfig::default().rom_baud, 115_200);
    }

    #[test]
    fn test_connect_records_chip_and_mac() {
        let (mut controller, shared, mut recorder) = setup(Script::default());
        controller
            .connect(&mut selector(), &no_retry_delay(), &mut recorder)
            .unwrap();

        assert_eq!(controller.state(), ConnectionState::Connected);
        assert!(controller.is_connected());
        assert_eq!(
            controller.chip().unwrap().description,
            "ESP32-C3 (revision v0.4)"
        );
        assert_eq!(
            controller.mac_address().unwrap().to_string(),
            "24:0a:c4:01:02:03"
        );
        assert_eq!(controller.device().unwrap().name, "/dev/ttyUSB0");
        assert_eq!(controller.baud_rate(), Some(DEFAULT_FLASH_BAUD));
        assert_eq!(
            recorder.console.states(),
            &[ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert!(recorder.console.contains("WiFi, BLE"));
        assert_eq!(device_events(&shared), vec!["open", "detect", "read_mac"]);
    }

    #[test]
    fn test_connect_gives_up_after_policy_attempts() {
        let (mut controller, shared, mut recorder) = setup(Script {
            detect_failures: 3,
            ..Script::default()
        });
        let err = controller
            .connect(&mut selector(), &no_retry_delay(), &mut recorder)
            .unwrap_err();

        assert!(err.is_device_error());
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert!(controller.chip().is_none());
        assert_eq!(count(&shared, "detect"), 2);
        assert_eq!(count(&shared, "open"), 2);
        assert_eq!(count(&shared, "close"), 2);
        assert_eq!(shared.borrow().detect_failures, 1);
    }

    #[test]
    fn test_connect_succeeds_on_retry() {
        let (mut controller, shared, mut recorder) = setup(Script {
            detect_failures: 1,
            ..Script::default()
        });
        controller
            .connect(&mut selector(), &no_retry_delay(), &mut recorder)
            .unwrap();
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(count(&shared, "detect"), 2);
        assert_eq!(recorder.console.lines_at(ConsoleLevel::Warning).count(), 1);
    }

    #[test]
    fn test_connect_cancelled_by_user() {
        let (mut controller, shared, mut recorder) = setup(Script::default());
        let mut dismiss = |_: &[UsbFilter]| -> Result<DetectedPort> { Err(Error::UserCancelled) };
        let err = controller
            .connect(&mut dismiss, &no_retry_delay(), &mut recorder)
            .unwrap_err();

        assert!(err.is_user_cancelled());
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert!(shared.borrow().events.is_empty());
        assert_eq!(recorder.console.lines_at(ConsoleLevel::Error).count(), 0);
        assert!(recorder.console.contains("cancelled"));
    }

    #[test]
    fn test_connect_offers_configured_filters() {
        let shared = Rc::new(RefCell::new(Script::default()));
        let config = SessionConfig::default().with_extra_filters([UsbFilter::new(0x067B, 0x2303)]);
        let mut controller =
            SessionController::with_config(Box::new(MockBackend(Rc::clone(&shared))), config);
        let mut offered = Vec::new();
        let mut capture = |filters: &[UsbFilter]| -> Result<DetectedPort> {
            offered = filters.to_vec();
            Ok(DetectedPort::named("/dev/ttyUSB0"))
        };
        controller
            .connect(&mut capture, &no_retry_delay(), &mut ConsoleLog::new())
            .unwrap();
        assert_eq!(offered.len(), 10);
        assert!(offered.contains(&UsbFilter::new(0x303A, 0x1001)));
    }

    #[test]
    fn test_connect_rejected_while_connected() {
        let (mut controller, shared, mut recorder) = connected(Script::default());
        let err = controller
            .connect(&mut selector(), &no_retry_delay(), &mut recorder)
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert!(shared.borrow().events.is_empty());
    }

    #[test]
    fn test_mac_skipped_without_capability() {
        let (mut controller, shared, mut recorder) = setup(Script {
            capabilities: Some(Capabilities {
                read_mac: false,
                ..Capabilities::ALL
            }),
            ..Script::default()
        });
        controller
            .connect(&mut selector(), &no_retry_delay(), &mut recorder)
            .unwrap();
        assert_eq!(count(&shared, "read_mac"), 0);
        assert!(controller.mac_address().is_none());
    }

    #[test]
    fn test_mac_failure_is_warning_only() {
        let (mut controller, _shared, mut recorder) = setup(Script {
            fail_mac: true,
            ..Script::default()
        });
        controller
            .connect(&mut selector(), &no_retry_delay(), &mut recorder)
            .unwrap();
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert!(controller.mac_address().is_none());
        assert_eq!(recorder.console.lines_at(ConsoleLevel::Warning).count(), 1);
    }

    #[test]
    fn test_flash_rejected_when_disconnected() {
        let (mut controller, shared, mut recorder) = setup(Script::default());
        let plan = FirmwarePlan::new([crate::plan::FirmwareEntry::new("app.bin", vec![1; 4], 0)]);
        let err = controller
            .flash(&plan, FlashOptions::default(), &mut recorder)
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(shared.borrow().events.is_empty());
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_flash_two_files_weighted_progress() {
        let (mut controller, shared, mut recorder) = connected(Script::default());
        let plan = plan::build_diy_plan(&[
            FileSelection::new("app.bin", vec![0; 300], "8000"),
            FileSelection::new("boot.bin", vec![0; 100], "0x0"),
        ])
        .unwrap();
        assert_eq!(plan.total_bytes(), 400);

        controller
            .flash(&plan, FlashOptions::default(), &mut recorder)
            .unwrap();

        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(
            device_events(&shared),
            vec!["write:0x0", "write:0x8000", "soft_reset", "hard_reset"]
        );
        assert!(recorder.percents.iter().any(|p| (p - 22.5).abs() < 1e-9));
        assert!(recorder.percents.windows(2).all(|w| w[0] <= w[1]));
        assert!((recorder.percents.last().unwrap() - 100.0).abs() < 1e-9);

        let events = shared.borrow().events.clone();
        let first_full = events.iter().position(|e| e == "progress:100").unwrap();
        let reset = events.iter().position(|e| e == "hard_reset").unwrap();
        assert!(first_full > reset);
        assert_eq!(
            recorder.console.states(),
            &[
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Flashing,
                ConnectionState::Connected
            ]
        );
    }

    #[test]
    fn test_flash_erases_first_when_asked() {
        let (mut controller, shared, mut recorder) = connected(Script::default());
        let plan = FirmwarePlan::new([crate::plan::FirmwareEntry::new("app.bin", vec![1; 8], 0x10000)]);
        let options = FlashOptions {
            erase_all: true,
            compress: false,
        };
        controller.flash(&plan, options, &mut recorder).unwrap();
        assert_eq!(device_events(&shared)[..2], ["erase", "write:0x10000"]);
    }

    #[test]
    fn test_write_failure_aborts_remaining_entries() {
        let (mut controller, shared, mut recorder) = connected(Script {
            fail_write_at: Some(0x8000),
            ..Script::default()
        });
        let plan = plan::build_diy_plan(&[
            FileSelection::new("boot.bin", vec![0; 10], "0"),
            FileSelection::new("parts.bin", vec![0; 10], "8000"),
            FileSelection::new("app.bin", vec![0; 10], "10000"),
        ])
        .unwrap();

        let err = controller
            .flash(&plan, FlashOptions::default(), &mut recorder)
            .unwrap_err();
        assert!(err.is_device_error());
        assert!(err.to_string().contains("parts.bin"));
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert!(!controller.is_flashing());
        assert_eq!(device_events(&shared), vec!["write:0x0", "write:0x8000"]);
    }

    #[test]
    fn test_reset_failures_after_write_are_not_fatal() {
        let (mut controller, _shared, mut recorder) = connected(Script {
            fail_reset: true,
            ..Script::default()
        });
        let plan = FirmwarePlan::new([crate::plan::FirmwareEntry::new("app.bin", vec![1; 8], 0x10000)]);
        controller
            .flash(&plan, FlashOptions::default(), &mut recorder)
            .unwrap();
        assert_eq!(recorder.console.lines_at(ConsoleLevel::Warning).count(), 2);
        assert!((recorder.percents.last().unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_plan_rejected() {
        let (mut controller, shared, mut recorder) = connected(Script::default());
        let err = controller
            .flash(&FirmwarePlan::default(), FlashOptions::default(), &mut recorder)
            .unwrap_err();
        assert!(matches!(err, Error::EmptyPlan));
        assert!(shared.borrow().events.is_empty());
        assert_eq!(controller.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_invalid_address_rejected_before_io() {
        let (mut controller, shared, mut recorder) = connected(Script::default());
        let request = FlashRequest::Diy(vec![
            FileSelection::new("boot.bin", vec![0; 10], "0"),
            FileSelection::new("app.bin", vec![0; 10], "zz"),
        ]);
        let err = controller
            .start_flashing(request, &FailingFetcher, FlashOptions::default(), &mut recorder)
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref file, .. } if file == "app.bin"));
        assert!(device_events(&shared).is_empty());
        assert_eq!(controller.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_quick_start_unreachable_url() {
        let (mut controller, shared, mut recorder) = connected(Script::default());
        let descriptor =
            QuickStartDescriptor::new("blink", "https://unreachable.invalid/blink.bin", "0x10000");
        let err = controller
            .start_flashing(
                FlashRequest::QuickStart(Some(descriptor)),
                &FailingFetcher,
                FlashOptions::default(),
                &mut recorder,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert!(!controller.is_flashing());
        assert!(device_events(&shared).is_empty());
    }

    #[test]
    fn test_quick_start_without_application() {
        let (mut controller, _shared, mut recorder) = connected(Script::default());
        let err = controller
            .start_flashing(
                FlashRequest::QuickStart(None),
                &FailingFetcher,
                FlashOptions::default(),
                &mut recorder,
            )
            .unwrap_err();
        assert!(matches!(err, Error::NoApplicationSelected));
    }

    #[test]
    fn test_quick_start_writes_single_image() {
        let (mut controller, shared, mut recorder) = connected(Script::default());
        let descriptor = QuickStartDescriptor::new("blink", "https://example.invalid/b.bin", "10000");
        controller
            .start_flashing(
                FlashRequest::QuickStart(Some(descriptor)),
                &BytesFetcher(vec![7; 64]),
                FlashOptions::default(),
                &mut recorder,
            )
            .unwrap();
        assert_eq!(device_events(&shared)[0], "write:0x10000");
        assert!(recorder.console.contains("Flashing complete"));
    }

    #[test]
    fn test_disconnect_always_reaches_disconnected() {
        let (mut controller, shared, mut recorder) = connected(Script {
            fail_reset: true,
            fail_close: true,
            ..Script::default()
        });
        controller.disconnect(&mut recorder);
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert!(controller.chip().is_none());
        assert!(controller.device().is_none());
        assert_eq!(device_events(&shared), vec!["hard_reset", "close"]);

        controller.disconnect(&mut recorder);
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_erase_and_reset_require_connection() {
        let (mut controller, _shared, mut recorder) = setup(Script::default());
        assert!(matches!(
            controller.erase_flash(&mut recorder),
            Err(Error::Precondition(_))
        ));
        assert!(matches!(
            controller.reset_device(&mut recorder),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn test_erase_and_reset_when_connected() {
        let (mut controller, shared, mut recorder) = connected(Script::default());
        controller.erase_flash(&mut recorder).unwrap();
        controller.reset_device(&mut recorder).unwrap();
        assert_eq!(device_events(&shared), vec!["erase", "hard_reset"]);
        assert_eq!(controller.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_reset_unsupported_without_capability() {
        let (mut controller, shared, mut recorder) = connected(Script {
            capabilities: Some(Capabilities::NONE),
            ..Script::default()
        });
        assert!(matches!(
            controller.reset_device(&mut recorder),
            Err(Error::Unsupported(_))
        ));
        assert!(shared.borrow().events.is_empty());
    }
}
