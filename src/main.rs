// SPDX-License-Identifier: AGPL-3.0-or-later
//! imgserv-provision: brings up the imgserv primary/edge host pair

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use imgserv_provision::{
    error::exit,
    input::{select_source, CliOverrides},
    keys,
    orchestrator::{render_summary, remediation_for, ObservedFacts},
    settings::DEFAULT_SETTINGS_TOML,
    store, Collaborators, Orchestrator, Settings,
};

/// imgserv-provision: the provisioning orchestrator
///
/// Installs the capture service on this host, bootstraps key-based access to
/// the public edge host, verifies file sync and obtains a TLS certificate once
/// DNS has converged. Safe to re-run.
#[derive(Parser, Debug)]
#[command(name = "imgserv-provision")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file path
    #[arg(short, long, default_value = "/etc/imgserv/provision.toml", global = true)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Never prompt; read inputs from environment variables
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Production mode: install packages, manage the service, refuse factory credentials
    #[arg(long, global = true)]
    production: bool,

    /// Camera address
    #[arg(long, global = true)]
    camera_ip: Option<String>,

    /// Camera user name
    #[arg(long, global = true)]
    camera_user: Option<String>,

    /// Camera password
    #[arg(long, global = true)]
    camera_pass: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision both hosts (default)
    Provision,

    /// Show what a run would find, without changing anything
    Status {
        /// Print the observed facts as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the provisioning key's fingerprint
    Fingerprint {
        /// Private key path (defaults to paths.key_path)
        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// Write a commented default settings file
    Init {
        /// Force overwrite existing settings
        #[arg(short, long)]
        force: bool,
    },

    /// Show version information
    Version,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let code = tokio::select! {
        code = run(cli) => code,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted");
            exit::INTERRUPTED
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn run(cli: Cli) -> i32 {
    let settings = Settings::load(&cli.config);
    init_logging(&cli, settings.as_ref().ok());

    let result = match &cli.command {
        Some(Commands::Version) => {
            println!("imgserv-provision v{}", env!("CARGO_PKG_VERSION"));
            println!("Provisioning orchestrator for the imgserv primary/edge host pair");
            Ok(exit::SUCCESS)
        }
        Some(Commands::Init { force }) => init_settings(&cli.config, *force),
        _ => match settings {
            Ok(settings) => dispatch(&cli, settings).await,
            Err(e) => Err::<i32, _>(e)
                .with_context(|| format!("Failed to load settings from {}", cli.config.display())),
        },
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            eprintln!("Error: {:#}", e);
            exit::VALIDATION
        }
    }
}

async fn dispatch(cli: &Cli, settings: Settings) -> anyhow::Result<i32> {
    match &cli.command {
        None | Some(Commands::Provision) => provision(cli, settings).await,
        Some(Commands::Status { json }) => status(settings, *json).await,
        Some(Commands::Fingerprint { key }) => {
            let path = key.clone().unwrap_or_else(|| settings.paths.key_path.clone());
            fingerprint(&path)
        }
        Some(Commands::Init { .. }) | Some(Commands::Version) => Ok(exit::SUCCESS),
    }
}

fn init_logging(cli: &Cli, settings: Option<&Settings>) {
    let level = if cli.debug {
        "debug".to_string()
    } else if cli.verbose {
        "info".to_string()
    } else {
        settings
            .map(|s| s.logging.level.clone())
            .unwrap_or_else(|| "warn".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    let json = settings.is_some_and(|s| s.logging.format == "json");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Initialize a new settings file
fn init_settings(path: &Path, force: bool) -> anyhow::Result<i32> {
    if path.exists() && !force {
        anyhow::bail!(
            "Settings file already exists: {}. Use --force to overwrite.",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    std::fs::write(path, DEFAULT_SETTINGS_TOML)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "Created settings file");
    println!("Created settings file: {}", path.display());
    Ok(exit::SUCCESS)
}

async fn provision(cli: &Cli, settings: Settings) -> anyhow::Result<i32> {
    let overrides = CliOverrides {
        production: cli.production,
        camera_ip: cli.camera_ip.clone(),
        camera_user: cli.camera_user.clone(),
        camera_pass: cli.camera_pass.clone(),
    };

    let existing = store::load(&settings.paths.env_file).with_context(|| {
        format!(
            "Failed to read environment file {}",
            settings.paths.env_file.display()
        )
    })?;
    let source = select_source(cli.non_interactive);
    info!(source = source.name(), "Collecting inputs");
    let inputs = source
        .gather(&existing, &overrides)
        .context("Failed to collect inputs")?;

    let collaborators = Collaborators::system(&settings, inputs.vps_password.clone());
    let orchestrator = Orchestrator::new(settings, collaborators);
    let report = orchestrator.run(&inputs).await;

    print!("{}", render_summary(&report));
    Ok(report.exit_code)
}

async fn status(settings: Settings, json: bool) -> anyhow::Result<i32> {
    let env_file = settings.paths.env_file.clone();
    let collaborators = Collaborators::system(&settings, None);
    let orchestrator = Orchestrator::new(settings, collaborators);
    let facts = orchestrator
        .observe()
        .await
        .context("Failed to observe current state")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&facts)?);
        return Ok(exit::SUCCESS);
    }

    print_status(&env_file, &facts);
    Ok(exit::SUCCESS)
}

fn print_status(env_file: &Path, facts: &ObservedFacts) {
    let yes_no = |value: bool| if value { "yes" } else { "no" };
    let unknown = |value: Option<bool>| value.map(yes_no).unwrap_or("n/a");
    let stage = facts.derive();

    println!("Environment file: {} (present: {})", env_file.display(), yes_no(facts.env_file_present));
    if facts.missing_dependencies.is_empty() {
        println!("Dependencies: all present");
    } else {
        println!("Dependencies: missing {}", facts.missing_dependencies.join(", "));
    }
    println!("Repository checkout: {}", yes_no(facts.repository_present));
    match &facts.key_fingerprint {
        Some(fp) => println!("Provisioning key: {}", fp),
        None => println!("Provisioning key: missing or invalid"),
    }
    match &facts.edge_address {
        Some(address) => {
            println!("Edge host: {}", address);
            println!("  Key authentication: {}", unknown(facts.edge_key_auth));
        }
        None => println!("Edge host: not configured"),
    }
    if let Some(domain) = &facts.domain {
        println!("Domain: {}", domain);
        println!("  DNS converged: {}", unknown(facts.dns_converged));
        println!("  Certificate valid: {}", unknown(facts.certificate_valid));
    }
    println!();
    println!("Current state: {}", stage);
    if let Some(next) = stage.next() {
        println!("Next step: {} ({})", next, remediation_for(next));
    }
}

fn fingerprint(path: &Path) -> anyhow::Result<i32> {
    let fp = keys::fingerprint(path)
        .with_context(|| format!("Failed to read key {}", path.display()))?;
    println!("{}", fp);
    Ok(exit::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["imgserv-provision", "version"]).unwrap();
        match cli.command {
            Some(Commands::Version) => {}
            _ => panic!("Expected Version command"),
        }
    }

    #[test]
    fn test_default_command_is_provision() {
        let cli = Cli::try_parse_from(["imgserv-provision", "--production"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.production);
    }

    #[test]
    fn test_camera_flags() {
        let cli = Cli::try_parse_from([
            "imgserv-provision",
            "provision",
            "--camera-ip",
            "192.168.1.20",
            "--camera-pass",
            "s3cret",
        ])
        .unwrap();
        assert_eq!(cli.camera_ip.as_deref(), Some("192.168.1.20"));
        assert_eq!(cli.camera_pass.as_deref(), Some("s3cret"));
        assert!(cli.camera_user.is_none());
    }

    #[test]
    fn test_fingerprint_key_flag() {
        let cli =
            Cli::try_parse_from(["imgserv-provision", "fingerprint", "--key", "/tmp/k"]).unwrap();
        match cli.command {
            Some(Commands::Fingerprint { key }) => assert_eq!(key, Some(PathBuf::from("/tmp/k"))),
            _ => panic!("Expected Fingerprint command"),
        }
    }

    #[test]
    fn test_cli_verbose_flag() {
        let cli = Cli::try_parse_from(["imgserv-provision", "-v", "status"]).unwrap();
        assert!(cli.verbose);
    }
}
