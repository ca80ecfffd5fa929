//! Interactive serial port selection.
//!
//! [`CliSelector`] plugs the terminal into the session controller's device
//! request:
//! - an explicit `--port` or configured port wins
//! - ports passing the USB filters are preferred over unknown ones
//! - several candidates open a `dialoguer` picker
//! - non-interactive mode never prompts and needs exactly one candidate

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    esplaunch::{DetectedPort, DeviceSelector, UsbFilter, discover_ports, host::find_port_by_name},
    log::{debug, error, info},
    rust_i18n::t,
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// List all ports (including unknown types).
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
    /// Force confirmation even for single recognized port.
    pub confirm_port: bool,
}

/// Result of port selection including whether it was a known device.
#[derive(Debug)]
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port passed the USB filters.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled_err() -> anyhow::Error {
    CliError::Cancelled(t!("serial.selection_cancelled").to_string()).into()
}

fn is_known_device(port: &DetectedPort, filters: &[UsbFilter]) -> bool {
    port.device.is_known() || port.matches_any(filters)
}

/// Narrow `ports` to the candidates worth offering.
///
/// Ports passing the filters win unless `--list-all-ports` is given or none
/// of them do.
fn candidates(
    ports: Vec<DetectedPort>,
    options: &SerialOptions,
    filters: &[UsbFilter],
) -> Vec<DetectedPort> {
    if options.list_all_ports {
        return ports;
    }
    let (known, unknown): (Vec<_>, Vec<_>) = ports
        .into_iter()
        .partition(|p| is_known_device(p, filters));
    if known.is_empty() { unknown } else { known }
}

/// Choose among already-enumerated ports.
fn select_from_ports(
    ports: Vec<DetectedPort>,
    options: &SerialOptions,
    filters: &[UsbFilter],
) -> Result<SelectedPort> {
    if ports.is_empty() {
        return Err(usage_err(t!("serial.no_ports_found").as_ref()));
    }

    let mut offered = candidates(ports, options, filters);
    match (offered.len(), options.non_interactive) {
        (0, _) => Err(usage_err(t!("serial.no_ports_available").as_ref())),
        (1, non_interactive) => {
            let port = offered.remove(0);
            let is_known = is_known_device(&port, filters);
            if non_interactive || (is_known && !options.confirm_port) {
                info!("Auto-selected port: {} [{}]", port.name, port.device.name());
                return Ok(SelectedPort { port, is_known });
            }
            ensure_interactive_terminal()?;
            confirm_single_port(port, is_known)
        },
        (_, true) => Err(usage_err(t!("serial.multiple_ports").as_ref())),
        (_, false) => {
            ensure_interactive_terminal()?;
            select_port_interactive(offered, filters)
        },
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(
    options: &SerialOptions,
    config: &Config,
    filters: &[UsbFilter],
) -> Result<SelectedPort> {
    let explicit = options
        .port
        .as_deref()
        .or(config.connection.port.as_deref());
    if let Some(port_name) = explicit {
        debug!("Using explicitly selected port {port_name}");
        let port = find_port_by_name(port_name);
        return Ok(SelectedPort {
            is_known: is_known_device(&port, filters),
            port,
        });
    }

    select_from_ports(discover_ports(), options, filters)
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(CliError::Usage(t!("serial.interactive_requires_tty").to_string()).into())
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                cancelled_err()
            } else {
                CliError::Usage(t!("serial.prompt_failed").to_string()).into()
            }
        },
    }
}

/// One picker line: name, device kind or raw ids, product.
fn port_label(port: &DetectedPort, is_known: bool) -> String {
    let name = if is_known {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let device_info = if port.device.is_known() {
        format!(" [{}]", style(port.device.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{device_info}{product}")
}

fn select_port_interactive(
    mut ports: Vec<DetectedPort>,
    filters: &[UsbFilter],
) -> Result<SelectedPort> {
    eprintln!(
        "{} {}",
        style("ℹ").blue(),
        t!("serial.detected_ports", count = ports.len())
    );
    eprintln!("{}", style(t!("serial.known_devices_hint")).dim());

    ports.sort_by_key(|p| !is_known_device(p, filters));

    // Labels wider than the terminal would wrap and break the picker.
    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| port_label(p, is_known_device(p, filters)))
        .map(|l| console::truncate_str(&l, max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(t!("serial.select_prompt").to_string())
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            let is_known = is_known_device(&port, filters);
            Ok(SelectedPort { port, is_known })
        },
        None => Err(cancelled_err()),
    }
}

fn confirm_single_port(port: DetectedPort, is_known: bool) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(
            t!(
                "serial.confirm_use",
                port = port.name.clone(),
                info = product_info
            )
            .to_string(),
        )
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort { port, is_known })
    } else {
        Err(cancelled_err())
    }
}

/// Ask whether an unrecognized USB device should be remembered.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        if config.is_configured_device(vid, pid) {
            return Ok(());
        }

        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(t!("serial.remember_prompt").to_string())
            .default(false)
            .interact_opt()
            .map_err(map_prompt_error)?
            .unwrap_or(false);

        if confirmed {
            if let Err(e) = config.remember_usb_device(vid, pid) {
                error!("Failed to save port configuration: {e}");
            }
        }
    }

    Ok(())
}

/// Device selector backed by the terminal.
///
/// The controller only understands [`esplaunch::Error`], so CLI-level
/// failures (usage errors, a missing TTY) are kept aside and handed back
/// through [`CliSelector::take_failure`] to preserve their exit codes.
pub struct CliSelector<'a> {
    options: SerialOptions,
    config: &'a mut Config,
    failure: Option<anyhow::Error>,
}

impl<'a> CliSelector<'a> {
    /// Create a selector.
    pub fn new(options: SerialOptions, config: &'a mut Config) -> Self {
        Self {
            options,
            config,
            failure: None,
        }
    }

    /// The CLI error behind the last failed request, if any.
    pub fn take_failure(&mut self) -> Option<anyhow::Error> {
        self.failure.take()
    }
}

impl DeviceSelector for CliSelector<'_> {
    fn request_device(&mut self, filters: &[UsbFilter]) -> esplaunch::Result<DetectedPort> {
        match select_serial_port(&self.options, self.config, filters) {
            Ok(selected) => {
                let explicit = self.options.port.is_some() || self.config.connection.port.is_some();
                if !selected.is_known && !self.options.non_interactive && !explicit {
                    if let Err(e) = ask_remember_port(&selected.port, self.config) {
                        debug!("Remember prompt failed: {e}");
                    }
                }
                Ok(selected.port)
            },
            Err(e) => {
                if matches!(e.downcast_ref::<CliError>(), Some(CliError::Cancelled(_))) {
                    return Err(esplaunch::host::cancelled());
                }
                let message = e.to_string();
                self.failure = Some(e);
                Err(esplaunch::Error::Device(message))
            },
        }
    }
}
