//! Locale selection and localized help output.
//!
//! clap stays the single source of truth for the command structure; only
//! user-visible text (headings, command descriptions, argument help) is
//! swapped for translations from `locales/`.

use clap::CommandFactory;
use rust_i18n::t;

use crate::Cli;

/// Locales shipped in `locales/`.
pub(crate) const SUPPORTED_LOCALES: &[&str] = &["en", "zh-CN"];

/// Map a system locale string onto a supported locale.
///
/// `zh_CN.UTF-8`, `zh-TW` and `zh` all become `zh-CN`; everything else,
/// including `C` and `POSIX`, falls back to `en`.
pub(crate) fn normalize_locale(raw: &str) -> &'static str {
    let without_encoding = raw.split('.').next().unwrap_or(raw);
    let tag = without_encoding.replace('_', "-");

    if let Some(exact) = SUPPORTED_LOCALES.iter().find(|l| **l == tag) {
        return *exact;
    }
    let language = tag.split('-').next().unwrap_or(&tag).to_ascii_lowercase();
    if language == "zh" { "zh-CN" } else { "en" }
}

/// Best locale for this system.
pub(crate) fn detect_locale() -> String {
    let system = sys_locale::get_locale().unwrap_or_else(|| "en".to_string());
    normalize_locale(&system).to_string()
}

/// `--lang` from raw arguments, read before clap runs so help is localized.
pub(crate) fn early_lang(args: &[String]) -> Option<String> {
    let mut found = None;
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--lang=") {
            found = Some(value.to_string());
        } else if arg == "--lang" {
            found = iter.next().cloned();
        }
    }
    found
}

/// Replace an arg's help with `arg.<id>.help` when the locale has it.
pub(crate) fn localize_arg(arg: clap::Arg) -> clap::Arg {
    let key = format!("arg.{}.help", arg.get_id().as_str());
    let localized = t!(&key).to_string();
    if localized != key { arg.help(localized) } else { arg }
}

fn localized_about(command: &str) -> Option<String> {
    let key = format!("cmd.{}.about", command.replace('-', "_"));
    let localized = t!(&key).to_string();
    (localized != key).then_some(localized)
}

/// Build a clap `Command` with translated help text.
pub(crate) fn build_localized_command() -> clap::Command {
    // Headings must be 'static; the process prints help once and exits.
    let args_heading: &'static str =
        Box::leak(t!("help.arguments_heading").to_string().into_boxed_str());
    let opts_heading: &'static str =
        Box::leak(t!("help.options_heading").to_string().into_boxed_str());
    let headed = move |arg: clap::Arg| {
        let arg = localize_arg(arg);
        if arg.get_short().is_none() && arg.get_long().is_none() {
            arg.help_heading(args_heading)
        } else {
            arg.help_heading(opts_heading)
        }
    };

    let tpl = format!(
        "{{bin}} {{version}}\n\n{{about}}\n\n\
         {usage_h}:\n  {{usage}}\n\n\
         {cmds_h}:\n{{subcommands}}\n\n\
         {opts_h}:\n{{options}}\n\n\
         {{after-help}}\n",
        usage_h = t!("help.usage_heading"),
        cmds_h = t!("help.commands_heading"),
        opts_h = opts_heading,
    );
    let sub_tpl = format!(
        "{{bin}} {{version}}\n\n{{about}}\n\n\
         {usage_h}:\n  {{usage}}\n\n\
         {{all-args}}\n",
        usage_h = t!("help.usage_heading"),
    );

    Cli::command()
        .help_template(tpl)
        .about(t!("app.about").to_string())
        .after_help(t!("app.after_help").to_string())
        .mut_args(localize_arg)
        .mut_subcommands(move |sub| {
            let sub = match localized_about(sub.get_name()) {
                Some(about) => sub.about(about),
                None => sub,
            };
            sub.help_template(sub_tpl.clone()).mut_args(headed)
        })
        .disable_help_subcommand(true)
        .subcommand(clap::Command::new("help").about(t!("cmd.help.about").to_string()))
}
