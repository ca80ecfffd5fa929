//! Board info and port listing command implementations.

use {
    crate::{Cli, commands::with_session, config::Config},
    anyhow::Result,
    console::style,
    esplaunch::{DetectedPort, SessionController, device::pick_port, discover_ports},
    rust_i18n::t,
};

fn port_json(p: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": p.name,
        "device": p.device.name(),
        "known": p.is_likely_esp(),
        "vid": p.vid,
        "pid": p.pid,
        "manufacturer": p.manufacturer,
        "product": p.product,
        "serial": p.serial,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(config: &Config, json: bool) -> Result<()> {
    let detected = discover_ports();
    let filters = config.session_config(None).filters;

    if json {
        let ports: Vec<serde_json::Value> = detected.iter().map(port_json).collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style(t!("list_ports.header")).bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style(t!("list_ports.no_ports")).dim());
        return Ok(());
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{device_type}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }

    if let Some(auto_port) = pick_port(&detected, &filters) {
        eprintln!(
            "\n{} {}",
            style("→").green().bold(),
            t!(
                "list_ports.auto_detected",
                port = style(&auto_port.name).cyan().bold().to_string()
            )
        );
    }

    Ok(())
}

fn board_json(session: &SessionController) -> serde_json::Value {
    let chip = session.chip();
    serde_json::json!({
        "ok": true,
        "data": {
            "port": session.device().map(|d| d.name.clone()),
            "bridge": session.device().map(|d| d.device.name()),
            "chip": chip.map(|c| c.description.clone()),
            "features": chip.map(|c| c.features.clone()).unwrap_or_default(),
            "mac": session.mac_address().map(|m| m.to_string()),
            "baud": session.baud_rate(),
        }
    })
}

fn print_board(session: &SessionController) {
    let unknown = t!("board.unknown").to_string();
    let row = |label: &str, value: String| {
        eprintln!("  {:<10} {}", style(label).bold(), value);
    };
    eprintln!("{}", style(t!("board.header")).bold().underlined());
    row(
        "Port",
        session
            .device()
            .map_or_else(|| unknown.clone(), |d| format!("{} [{}]", d.name, d.device.name())),
    );
    row(
        "Chip",
        session
            .chip()
            .map_or_else(|| unknown.clone(), |c| c.description.clone()),
    );
    if let Some(chip) = session.chip().filter(|c| !c.features.is_empty()) {
        row("Features", chip.features_display());
    }
    row(
        "MAC",
        session
            .mac_address()
            .map_or_else(|| unknown.clone(), |m| m.to_string()),
    );
    if let Some(baud) = session.baud_rate() {
        row("Baud", baud.to_string());
    }
}

/// Board info command implementation.
pub(crate) fn cmd_board_info(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    with_session(cli, config, |session, _observer| {
        if json {
            println!("{}", serde_json::to_string_pretty(&board_json(session))?);
        } else {
            print_board(session);
        }
        Ok(())
    })
}
