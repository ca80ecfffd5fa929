//! Quick-start catalog listing and application choice.

use anyhow::Result;
use console::style;
use dialoguer::{Select, theme::ColorfulTheme};
use esplaunch::{Catalog, QuickStartDescriptor};
use log::debug;
use rust_i18n::t;
use std::io::IsTerminal;
use std::path::Path;

use crate::config::Config;
use crate::{Cli, CliError};

/// Load the catalog named on the command line, in the config, or the built-in one.
pub(crate) fn load_catalog(path: Option<&Path>, config: &Config) -> Result<Catalog> {
    let path = path.or(config.catalog.path.as_deref());
    if let Some(path) = path {
        debug!("Loading catalog from {}", path.display());
    }
    Catalog::load_or_builtin(path).map_err(|e| CliError::Config(e.to_string()).into())
}

fn describe(d: &QuickStartDescriptor) -> String {
    let mut line = d.name.clone();
    if let Some(version) = &d.version {
        line.push_str(&format!(" v{version}"));
    }
    if let Some(kind) = &d.kind {
        line.push_str(&format!(" [{kind}]"));
    }
    if let Some(description) = &d.description {
        line.push_str(&format!(" - {description}"));
    }
    line
}

/// Pick the application to flash.
///
/// A name must match a catalog entry. Without one, a single-entry catalog
/// picks itself and otherwise the user is asked; `None` means nothing was
/// chosen.
pub(crate) fn choose_application(
    cli: &Cli,
    catalog: &Catalog,
    name: Option<&str>,
) -> Result<Option<QuickStartDescriptor>> {
    if let Some(name) = name {
        return match catalog.find(name) {
            Some(d) => Ok(Some(d.clone())),
            None => Err(CliError::Usage(
                t!(
                    "quick_start.unknown_application",
                    name = name,
                    available = names(catalog)
                )
                .to_string(),
            )
            .into()),
        };
    }

    match catalog.entries() {
        [] => Ok(None),
        [only] => Ok(Some(only.clone())),
        entries => {
            let interactive = std::io::stdin().is_terminal() && std::io::stderr().is_terminal();
            if cli.non_interactive || !interactive {
                return Ok(None);
            }
            let labels: Vec<String> = entries.iter().map(describe).collect();
            let selection = Select::with_theme(&ColorfulTheme::default())
                .with_prompt(t!("quick_start.select_prompt").to_string())
                .items(&labels)
                .default(0)
                .interact_opt()
                .map_err(|e| CliError::Usage(e.to_string()))?;
            match selection {
                Some(index) => Ok(entries.get(index).cloned()),
                None => {
                    let message = t!("quick_start.selection_cancelled").to_string();
                    Err(CliError::Cancelled(message).into())
                },
            }
        },
    }
}

fn names(catalog: &Catalog) -> String {
    catalog
        .entries()
        .iter()
        .map(|d| d.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Catalog command implementation.
pub(crate) fn cmd_catalog(config: &Config, path: Option<&Path>, json: bool) -> Result<()> {
    let catalog = load_catalog(path, config)?;

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "applications": catalog.entries(),
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style(t!("catalog.header")).bold().underlined());
    if catalog.is_empty() {
        eprintln!("  {}", style(t!("catalog.empty")).dim());
    }
    for d in catalog.entries() {
        eprintln!("  {} {}", style("•").green(), describe(d));
        let address = d.flash_address.as_deref().unwrap_or("?");
        let url = d.url.as_deref().unwrap_or("?");
        eprintln!("      {} {}", style(address).cyan(), style(url).dim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["esplaunch"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    fn two_apps() -> Catalog {
        Catalog::new(vec![
            QuickStartDescriptor::new("blink", "https://example.com/blink.bin", "0x10000"),
            QuickStartDescriptor::new("hello", "https://example.com/hello.bin", "0x10000"),
        ])
    }

    #[test]
    fn test_choose_by_name() {
        let cli = cli(&["catalog"]);
        let chosen = choose_application(&cli, &two_apps(), Some("HELLO")).unwrap();
        assert_eq!(chosen.unwrap().name, "hello");
    }

    #[test]
    fn test_unknown_name_lists_available() {
        let cli = cli(&["catalog"]);
        let err = choose_application(&cli, &two_apps(), Some("nope")).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
        assert!(err.to_string().contains("blink"));
    }

    #[test]
    fn test_single_entry_picks_itself() {
        let cli = cli(&["--non-interactive", "catalog"]);
        let chosen = choose_application(&cli, &Catalog::builtin(), None).unwrap();
        assert_eq!(chosen.unwrap().name, "blink");
    }

    #[test]
    fn test_non_interactive_without_name_chooses_nothing() {
        let cli = cli(&["--non-interactive", "catalog"]);
        assert!(choose_application(&cli, &two_apps(), None).unwrap().is_none());
        assert!(choose_application(&cli, &Catalog::default(), None).unwrap().is_none());
    }

    #[test]
    fn test_bad_catalog_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_catalog(Some(&path), &Config::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Config(_))));
    }

    #[test]
    fn test_configured_catalog_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.toml");
        std::fs::write(
            &path,
            "[[application]]\nname = \"x\"\nurl = \"file:///x.bin\"\nflash_address = \"0\"\n",
        )
        .unwrap();
        let mut config = Config::default();
        config.catalog.path = Some(path);
        let catalog = load_catalog(None, &config).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.find("x").is_some());
    }

    #[test]
    fn test_describe_includes_metadata() {
        let line = describe(&Catalog::builtin().entries()[0]);
        assert!(line.starts_with("blink v1.0.0 [demo]"));
    }
}
