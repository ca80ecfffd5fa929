//! Command implementations.
//!
//! Each subcommand is implemented in its own module; the session plumbing
//! they share lives here.

pub(crate) mod board;
pub(crate) mod catalog;
pub(crate) mod completions;
pub(crate) mod flash;

use anyhow::Result;
use esplaunch::{EsptoolBackend, SessionController, discover_ports};
use log::debug;
use rust_i18n::t;

use crate::config::Config;
use crate::output::TerminalObserver;
use crate::serial::{CliSelector, SerialOptions};
use crate::{Cli, CliError, was_interrupted};

pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled(t!("error.interrupted").to_string()).into())
    } else {
        Ok(())
    }
}

fn serial_options(cli: &Cli) -> SerialOptions {
    SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    }
}

fn port_attached(name: &str) -> bool {
    discover_ports().iter().any(|p| p.name == name)
}

/// Controller wired to the configured `esptool` program.
pub(crate) fn new_session(cli: &Cli, config: &Config) -> SessionController {
    let backend = match &config.esptool.program {
        Some(program) => EsptoolBackend::new().with_program(program.clone()),
        None => EsptoolBackend::new(),
    };
    SessionController::with_config(Box::new(backend), config.session_config(cli.baud))
}

/// Create a session and connect it to a device.
///
/// Selection failures keep their CLI exit codes; everything else comes back
/// as the controller reported it.
pub(crate) fn connect(
    cli: &Cli,
    config: &mut Config,
    observer: &mut TerminalObserver,
) -> Result<SessionController> {
    ensure_not_interrupted()?;
    let mut session = new_session(cli, config);
    let policy = config.retry_policy();
    debug!(
        "Connecting with {} attempt(s), {:?} apart",
        policy.attempts(),
        policy.delay
    );

    let requested = cli.port.clone().or_else(|| config.connection.port.clone());
    let mut selector = CliSelector::new(serial_options(cli), config);
    if let Err(err) = session.connect(&mut selector, &policy, observer) {
        if let Some(failure) = selector.take_failure() {
            return Err(failure);
        }
        if let Some(port) = requested.filter(|p| !port_attached(p)) {
            let message = t!("error.port_not_found", port = port).to_string();
            return Err(CliError::DeviceNotFound(message).into());
        }
        return Err(err.into());
    }

    if let Err(err) = ensure_not_interrupted() {
        session.disconnect(observer);
        return Err(err);
    }
    Ok(session)
}

/// Run `op` on a connected session, then release the device whatever happened.
pub(crate) fn with_session<F>(cli: &Cli, config: &mut Config, op: F) -> Result<()>
where
    F: FnOnce(&mut SessionController, &mut TerminalObserver) -> Result<()>,
{
    let mut observer = TerminalObserver::new(cli.quiet);
    let mut session = connect(cli, config, &mut observer)?;
    let result = op(&mut session, &mut observer);
    session.disconnect(&mut observer);
    observer.finish();
    result
}
