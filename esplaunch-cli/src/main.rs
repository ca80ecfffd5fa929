//! esplaunch CLI - flash ESP-series boards from the terminal.
//!
//! ## Features
//!
//! - Flash one or more images at hex addresses, sorted and validated first
//! - Quick-start applications downloaded from a catalog
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support
//! - Internationalization (i18n) support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod help;
mod output;
mod serial;

use commands::board::{cmd_board_info, cmd_list_ports};
use commands::catalog::cmd_catalog;
use commands::completions::{cmd_completions, cmd_completions_install};
use commands::flash::{
    cmd_erase, cmd_flash, cmd_plan, cmd_quick_start, cmd_reset, flash_options, parse_bin_arg,
};
use config::Config;

// Initialize i18n with locale files from the locales directory
rust_i18n::i18n!("locales", fallback = "en");

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors that carry their own exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or a choice only the user can make.
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration or catalog.
    #[error("{0}")]
    Config(String),
    /// The requested device is not attached.
    #[error("{0}")]
    DeviceNotFound(String),
    /// The user cancelled.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::DeviceNotFound(_) => 4,
            Self::Cancelled(_) => 130,
        }
    }
}

fn library_exit_code(err: &esplaunch::Error) -> i32 {
    match err {
        esplaunch::Error::UserCancelled => 130,
        esplaunch::Error::Catalog(_) => 3,
        esplaunch::Error::Network(_) => 1,
        esplaunch::Error::NoDevice => 4,
        e if e.is_plan_error() => 2,
        _ => 1,
    }
}

/// Exit code for an error that reached `main`.
pub(crate) fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return cli_err.exit_code();
    }
    if let Some(lib_err) = err.downcast_ref::<esplaunch::Error>() {
        return library_exit_code(lib_err);
    }
    1
}

/// esplaunch - flash ESP-series boards over USB serial.
///
/// Environment variables:
///   ESPLAUNCH_PORT              - Default serial port
///   ESPLAUNCH_BAUD              - Bulk transfer baud rate (default: 921600)
///   ESPLAUNCH_LANG              - Language/locale (en, zh-CN)
///   ESPLAUNCH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "esplaunch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "For more information, visit: https://github.com/esplaunch/esplaunch")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "ESPLAUNCH_PORT")]
    port: Option<String>,

    /// Baud rate for data transfer (default: 921600).
    #[arg(short, long, global = true, env = "ESPLAUNCH_BAUD")]
    baud: Option<u32>,

    /// Language/locale for messages (e.g., en, zh-CN).
    #[arg(long, global = true, env = "ESPLAUNCH_LANG")]
    lang: Option<String>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "ESPLAUNCH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Write firmware images to flash.
    Flash {
        /// Image with its flash address (format: file:address, can be repeated).
        #[arg(long = "bin", value_name = "FILE:ADDR", value_parser = parse_bin_arg)]
        bins: Vec<(PathBuf, String)>,

        /// Images whose address is guessed from the file name.
        files: Vec<PathBuf>,

        /// Erase the whole flash before writing.
        #[arg(long)]
        erase_all: bool,

        /// Send image data uncompressed.
        #[arg(long)]
        no_compress: bool,
    },

    /// Download and flash an application from the quick-start catalog.
    QuickStart {
        /// Application name (asks when omitted).
        name: Option<String>,

        /// Catalog file (TOML or JSON) instead of the configured one.
        #[arg(long, value_name = "PATH")]
        catalog: Option<PathBuf>,

        /// Erase the whole flash before writing.
        #[arg(long)]
        erase_all: bool,

        /// Send image data uncompressed.
        #[arg(long)]
        no_compress: bool,
    },

    /// List quick-start applications.
    Catalog {
        /// Catalog file (TOML or JSON) instead of the configured one.
        #[arg(long, value_name = "PATH")]
        catalog: Option<PathBuf>,

        /// Output the catalog as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show the write plan without touching a device.
    Plan {
        /// Image with its flash address (format: file:address, can be repeated).
        #[arg(long = "bin", value_name = "FILE:ADDR", value_parser = parse_bin_arg)]
        bins: Vec<(PathBuf, String)>,

        /// Images whose address is guessed from the file name.
        files: Vec<PathBuf>,

        /// Output the plan as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Erase flash memory.
    Erase {
        /// Erase entire flash (required confirmation).
        #[arg(long)]
        all: bool,
    },

    /// Hard-reset the board.
    Reset,

    /// Connect and show chip, features and MAC address.
    BoardInfo {
        /// Output board information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

fn init_logging(cli: &Cli) {
    // Controller messages are rendered by the terminal observer, so library
    // logs only show up from -v on.
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    esplaunch::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli, config: &mut Config) -> Result<()> {
    match &cli.command {
        Commands::Flash {
            bins,
            files,
            erase_all,
            no_compress,
        } => {
            let options = flash_options(config, *erase_all, *no_compress);
            cmd_flash(cli, config, bins, files, options)
        },
        Commands::QuickStart {
            name,
            catalog,
            erase_all,
            no_compress,
        } => {
            let options = flash_options(config, *erase_all, *no_compress);
            cmd_quick_start(cli, config, name.as_deref(), catalog.as_deref(), options)
        },
        Commands::Catalog { catalog, json } => cmd_catalog(config, catalog.as_deref(), *json),
        Commands::Plan { bins, files, json } => cmd_plan(cli, bins, files, *json),
        Commands::Erase { all } => cmd_erase(cli, config, *all),
        Commands::Reset => cmd_reset(cli, config),
        Commands::BoardInfo { json } => cmd_board_info(cli, config, *json),
        Commands::ListPorts { json } => cmd_list_ports(config, *json),
        Commands::Completions { shell, install } => {
            if *install {
                cmd_completions_install(*shell)
            } else {
                cmd_completions(*shell)
            }
        },
    }
}

fn main() {
    let raw_args: Vec<String> = env::args().collect();

    let locale = help::early_lang(&raw_args)
        .or_else(|| env::var("ESPLAUNCH_LANG").ok())
        .map_or_else(help::detect_locale, |l| help::normalize_locale(&l).to_string());
    rust_i18n::set_locale(&locale);

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Intercept help so headings and descriptions come from the locale files.
    let wants_help = raw_args.iter().any(|a| a == "-h" || a == "--help");
    if wants_help || raw_args.len() <= 1 {
        let mut app = help::build_localized_command();
        let subcommand = raw_args.iter().skip(1).find_map(|token| {
            app.get_subcommands()
                .find(|s| s.get_name() == token.as_str())
                .cloned()
        });
        let _ = match subcommand {
            Some(mut sub) => sub.print_help(),
            None => app.print_help(),
        };
        std::process::exit(0);
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    init_logging(&cli);
    debug!(
        "esplaunch v{} (locale: {locale}, verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );
    install_interrupt_handler();

    let mut config = match &cli.config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    if let Err(err) = run(&cli, &mut config) {
        let code = exit_code_for(&err);
        if code == 130 {
            eprintln!("{} {err}", style("✗").yellow());
        } else {
            eprintln!("{} {err:#}", style("Error:").red().bold());
        }
        std::process::exit(code);
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        let mut argv = vec!["esplaunch"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flash_bins_keep_raw_addresses() {
        let cli = parse(&[
            "flash",
            "--bin",
            "boot.bin:0x0",
            "--bin",
            "app.bin:zz",
            "extra.bin",
        ])
        .unwrap();
        match cli.command {
            Commands::Flash { bins, files, .. } => {
                assert_eq!(bins[0], (PathBuf::from("boot.bin"), "0x0".to_string()));
                assert_eq!(bins[1].1, "zz");
                assert_eq!(files, vec![PathBuf::from("extra.bin")]);
            },
            _ => panic!("expected flash"),
        }
    }

    #[test]
    fn test_bin_without_address_rejected() {
        assert!(parse(&["flash", "--bin", "app.bin"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = parse(&["list-ports", "--json", "-p", "COM3", "-b", "115200", "-vv"]).unwrap();
        assert_eq!(cli.port.as_deref(), Some("COM3"));
        assert_eq!(cli.baud, Some(115_200));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_quick_start_args() {
        let cli = parse(&["quick-start", "blink", "--catalog", "apps.toml", "--erase-all"]).unwrap();
        match cli.command {
            Commands::QuickStart {
                name,
                catalog,
                erase_all,
                no_compress,
            } => {
                assert_eq!(name.as_deref(), Some("blink"));
                assert_eq!(catalog, Some(PathBuf::from("apps.toml")));
                assert!(erase_all);
                assert!(!no_compress);
            },
            _ => panic!("expected quick-start"),
        }
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(parse(&["falsh"]).is_err());
    }
}
