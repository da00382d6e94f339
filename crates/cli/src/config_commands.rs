use {anyhow::Result, clap::Subcommand, std::path::Path};

use corral_config::{Severity, ValidationResult, find_config_file, validate_config, validate_file};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors and warnings.
    Check,
    /// Print the effective configuration, defaults and overrides included.
    Show,
}

pub fn handle_config(action: ConfigAction, explicit: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Check => check(explicit),
        ConfigAction::Show => {
            let config = crate::load_config(explicit)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        },
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(explicit: Option<&Path>) -> Result<()> {
    let path = explicit.map(Path::to_path_buf).or_else(find_config_file);
    let result = match &path {
        Some(path) => {
            eprintln!("Checking {}\n", path.display());
            validate_file(path)
        },
        None => {
            eprintln!("No config file found; checking defaults.\n");
            validate_config(&crate::load_config(None)?)
        },
    };
    report(&result);
    if result.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}

fn report(result: &ValidationResult) {
    for d in &result.diagnostics {
        let color = match d.severity {
            Severity::Error => RED,
            Severity::Warning => YELLOW,
        };
        if d.path.is_empty() {
            eprintln!("  {BOLD}{color}{}{RESET} {}", d.severity, d.message);
        } else {
            eprintln!("  {BOLD}{color}{}{RESET} {}: {}", d.severity, d.path, d.message);
        }
    }

    let count = |severity| {
        result
            .diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    };
    let (errors, warnings) = (count(Severity::Error), count(Severity::Warning));
    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("\n{errors} error(s), {warnings} warning(s)");
    }
}
