//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use rust_i18n::t;
use std::env;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use crate::{Cli, CliError};

const BIN_NAME: &str = "esplaunch";

fn render(shell: Shell) -> Vec<u8> {
    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), BIN_NAME, &mut buf);
    buf
}

/// Print the completion script for `shell` to stdout.
pub(crate) fn cmd_completions(shell: Option<Shell>) -> Result<()> {
    let shell = shell.ok_or_else(|| CliError::Usage(t!("completions.shell_required").to_string()))?;
    io::stdout()
        .write_all(&render(shell))
        .context("Failed to write completions")
}

/// Detect the user's shell from the environment.
pub(crate) fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }
    None
}

fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let shell_name = Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match shell_name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

fn home_dir() -> Result<PathBuf> {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .context("Could not determine home directory")
}

fn xdg_dir(var: &str, fallback: &[&str]) -> PathBuf {
    env::var(var).map_or_else(
        |_| {
            fallback
                .iter()
                .fold(home_dir().unwrap_or_default(), |dir, part| dir.join(part))
        },
        PathBuf::from,
    )
}

/// Where the completion script for `shell` is installed.
fn get_completion_install_path(shell: Shell) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => xdg_dir("XDG_DATA_HOME", &[".local", "share"])
            .join("bash-completion")
            .join("completions")
            .join(BIN_NAME),
        Shell::Zsh => home_dir()?.join(".zfunc").join(format!("_{BIN_NAME}")),
        Shell::Fish => xdg_dir("XDG_CONFIG_HOME", &[".config"])
            .join("fish")
            .join("completions")
            .join(format!("{BIN_NAME}.fish")),
        Shell::PowerShell => match env::var("PROFILE") {
            Ok(profile) => Path::new(&profile)
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
                .join(format!("{BIN_NAME}.ps1")),
            Err(_) => home_dir()?
                .join(".config")
                .join("powershell")
                .join("completions")
                .join(format!("{BIN_NAME}.ps1")),
        },
        Shell::Elvish => xdg_dir("XDG_CONFIG_HOME", &[".config"])
            .join("elvish")
            .join("lib")
            .join(format!("{BIN_NAME}.elv")),
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

/// Make sure `~/.zshrc` puts `~/.zfunc` on the function path.
fn ensure_zsh_fpath() -> Result<()> {
    let zshrc = home_dir()?.join(".zshrc");
    let fpath_line = "fpath=(~/.zfunc $fpath)";
    let present = fs::read_to_string(&zshrc).is_ok_and(|content| content.contains(fpath_line));
    if present {
        return Ok(());
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# {BIN_NAME} completions")?;
    writeln!(file, "{fpath_line}")?;
    writeln!(file, "autoload -Uz compinit && compinit")?;
    eprintln!(
        "{} {}",
        style("✓").green().bold(),
        t!("completions.zshrc_updated", path = zshrc.display().to_string())
    );
    Ok(())
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = shell_arg
        .or_else(detect_shell_type)
        .ok_or_else(|| CliError::Usage(t!("completions.detect_failed").to_string()))?;
    let path = get_completion_install_path(shell)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, render(shell))
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} {}",
        style("✓").green().bold(),
        t!(
            "completions.installed",
            shell = format!("{shell:?}"),
            path = path.display().to_string()
        )
    );

    eprintln!();
    match shell {
        Shell::Bash => {
            eprintln!("{}", t!("completions.bash_hint"));
            eprintln!("  {}", style(format!("source {}", path.display())).cyan());
        },
        Shell::Zsh => {
            ensure_zsh_fpath()?;
            eprintln!("{} {}", t!("completions.zsh_hint"), style("exec zsh").cyan());
        },
        Shell::PowerShell => {
            eprintln!("{}", t!("completions.powershell_hint"));
            eprintln!("  {}", style(format!("Import-Module {}", path.display())).cyan());
        },
        _ => eprintln!("{}", t!("completions.auto_loaded")),
    }

    Ok(())
}
