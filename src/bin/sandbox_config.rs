//! sandbox-config: inspect and validate sandbox broker configuration
//! profiles.
//!
//! Grounded on `config_manager.py`'s CLI `main()`: `--list`, `--validate`,
//! `--show`, `--auth`, plus `--template` for writing a starter profile.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sandbox_broker::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(name = "sandbox-config")]
#[command(about = "Inspect and validate sandbox broker configuration profiles")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// List configured environment names
    #[arg(short, long)]
    list: bool,

    /// Validate a named environment's configuration
    #[arg(short = 'v', long)]
    validate: Option<String>,

    /// Print a named environment's resolved configuration
    #[arg(short, long)]
    show: Option<String>,

    /// Print the authentication method a named environment resolves to
    #[arg(short, long)]
    auth: Option<String>,

    /// Write a starter configuration template to the given path and exit
    #[arg(short, long)]
    template: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(path) = &args.template {
        return match ConfigManager::write_template(path) {
            Ok(()) => {
                println!("Wrote configuration template to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let manager = match ConfigManager::load(&args.config) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if args.list {
        for name in manager.list_environments() {
            println!("{name}");
        }
        return ExitCode::SUCCESS;
    }

    if let Some(environment) = &args.validate {
        return match manager.get_config(environment) {
            Ok(_) => {
                println!("'{environment}' is valid");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("'{environment}' is invalid: {e}");
                ExitCode::FAILURE
            }
        };
    }

    if let Some(environment) = &args.show {
        return match manager.get_config(environment) {
            Ok(config) => {
                match serde_json::to_string_pretty(&config) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("Error: {e}");
                        return ExitCode::FAILURE;
                    }
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    if let Some(environment) = &args.auth {
        println!("{}", manager.auth_method(environment).as_str());
        return ExitCode::SUCCESS;
    }

    eprintln!("No action given. Use --list, --validate, --show, --auth or --template. See --help.");
    ExitCode::FAILURE
}
