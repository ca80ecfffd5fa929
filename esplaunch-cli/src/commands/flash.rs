//! Flash, plan, quick-start, erase and reset command implementations.

use anyhow::{Context, Result};
use console::style;
use esplaunch::{
    FileSelection, FirmwarePlan, FlashOptions, FlashRequest, HttpFetcher, LocalFetcher,
    QuickStartDescriptor, build_diy_plan, default_address_for, format_address,
};
use rust_i18n::t;
use std::fs;
use std::path::{Path, PathBuf};

use crate::commands::catalog::{choose_application, load_catalog};
use crate::commands::with_session;
use crate::config::Config;
use crate::{Cli, CliError};

/// Parse a `--bin` argument in `FILE:ADDRESS` form.
///
/// The address is kept as typed; it is validated together with the rest of
/// the plan. Splitting on the last `:` keeps Windows drive letters intact.
pub(crate) fn parse_bin_arg(s: &str) -> Result<(PathBuf, String), String> {
    match s.rsplit_once(':') {
        Some((path, address)) if !path.is_empty() && !address.is_empty() => {
            Ok((PathBuf::from(path), address.to_string()))
        },
        _ => Err(format!(
            "Invalid format: '{s}'. Expected 'file:address' (e.g., 'app.bin:0x10000')"
        )),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

fn read_selection(path: &Path, address: String) -> Result<FileSelection> {
    let data = fs::read(path)
        .with_context(|| t!("error.read_image", path = path.display().to_string()).to_string())?;
    Ok(FileSelection::new(display_name(path), data, address))
}

/// Turn `--bin` pairs and bare files into selections.
///
/// Bare files get an address guessed from their name.
pub(crate) fn collect_selections(
    bins: &[(PathBuf, String)],
    files: &[PathBuf],
) -> Result<Vec<FileSelection>> {
    if bins.is_empty() && files.is_empty() {
        return Err(CliError::Usage(t!("error.no_firmware").to_string()).into());
    }

    let mut selections = Vec::with_capacity(bins.len() + files.len());
    for (path, address) in bins {
        selections.push(read_selection(path, address.clone())?);
    }
    for path in files {
        let address = format!("{:x}", default_address_for(&display_name(path)));
        selections.push(read_selection(path, address)?);
    }
    Ok(selections)
}

fn print_plan(plan: &FirmwarePlan) {
    eprintln!(
        "{} {}",
        style("ℹ").blue(),
        t!("plan.summary", count = plan.len(), bytes = plan.total_bytes())
    );
    for entry in plan {
        eprintln!(
            "    {} {} @ {} ({} bytes)",
            style("•").dim(),
            entry.name,
            style(format_address(entry.address)).cyan(),
            entry.size
        );
    }
    for overlap in plan.overlaps() {
        eprintln!("{} {overlap}", style("⚠").yellow());
    }
}

#[allow(clippy::cast_precision_loss)]
fn plan_json(plan: &FirmwarePlan) -> serde_json::Value {
    let total = plan.total_bytes();
    let entries: Vec<serde_json::Value> = plan
        .iter()
        .map(|e| {
            let share = if total == 0 {
                0.0
            } else {
                e.size as f64 / total as f64
            };
            serde_json::json!({
                "name": e.name,
                "address": format_address(e.address),
                "size": e.size,
                "share": share,
            })
        })
        .collect();
    let overlaps: Vec<String> = plan.overlaps().iter().map(ToString::to_string).collect();
    serde_json::json!({
        "ok": true,
        "data": {
            "total_bytes": total,
            "entries": entries,
            "overlaps": overlaps,
        }
    })
}

/// Dry run: build and show the plan without touching a device.
pub(crate) fn cmd_plan(
    cli: &Cli,
    bins: &[(PathBuf, String)],
    files: &[PathBuf],
    json: bool,
) -> Result<()> {
    let selections = collect_selections(bins, files)?;
    let plan = build_diy_plan(&selections)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan_json(&plan))?);
    } else if !cli.quiet {
        print_plan(&plan);
    }
    Ok(())
}

/// Flash options from config, then command-line flags.
pub(crate) fn flash_options(config: &Config, erase_all: bool, no_compress: bool) -> FlashOptions {
    let mut options = config.flash_options();
    if erase_all {
        options.erase_all = true;
    }
    if no_compress {
        options.compress = false;
    }
    options
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &mut Config,
    bins: &[(PathBuf, String)],
    files: &[PathBuf],
    options: FlashOptions,
) -> Result<()> {
    let selections = collect_selections(bins, files)?;

    // Reject bad addresses before a device is even opened.
    let plan = build_diy_plan(&selections)?;
    if !cli.quiet {
        print_plan(&plan);
    }

    with_session(cli, config, |session, observer| {
        session.start_flashing(FlashRequest::Diy(selections), &LocalFetcher, options, observer)?;
        Ok(())
    })
}

/// Check a catalog entry before connecting.
fn check_descriptor(descriptor: &QuickStartDescriptor) -> Result<()> {
    descriptor.require_url()?;
    descriptor.require_address()?;
    Ok(())
}

/// Quick-start command implementation.
pub(crate) fn cmd_quick_start(
    cli: &Cli,
    config: &mut Config,
    name: Option<&str>,
    catalog_path: Option<&Path>,
    options: FlashOptions,
) -> Result<()> {
    let catalog = load_catalog(catalog_path, config)?;
    let descriptor = choose_application(cli, &catalog, name)?
        .ok_or(esplaunch::Error::NoApplicationSelected)?;
    check_descriptor(&descriptor)?;

    if !cli.quiet {
        eprintln!(
            "{} {}",
            style("📦").cyan(),
            t!(
                "quick_start.selected",
                name = descriptor.name.clone(),
                address = descriptor.flash_address.clone().unwrap_or_default()
            )
        );
    }

    let fetcher = HttpFetcher::new()?;
    with_session(cli, config, move |session, observer| {
        session.start_flashing(
            FlashRequest::QuickStart(Some(descriptor)),
            &fetcher,
            options,
            observer,
        )?;
        Ok(())
    })
}

/// Erase command implementation.
pub(crate) fn cmd_erase(cli: &Cli, config: &mut Config, all: bool) -> Result<()> {
    if !all {
        return Err(CliError::Usage(t!("erase.requires_all").to_string()).into());
    }
    with_session(cli, config, |session, observer| {
        session.erase_flash(observer)?;
        Ok(())
    })
}

/// Reset command implementation.
pub(crate) fn cmd_reset(cli: &Cli, config: &mut Config) -> Result<()> {
    with_session(cli, config, |session, observer| {
        session.reset_device(observer)?;
        Ok(())
    })
}
