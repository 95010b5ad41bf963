//! darwin-vz-nix CLI entry point.

use clap::{Parser, Subcommand};
use darwin_vz_nix::settings::Settings;
use tracing_subscriber::EnvFilter;

mod cli;

/// darwin-vz-nix - NixOS builder VMs on macOS Virtualization.framework
#[derive(Parser, Debug)]
#[command(name = "darwin-vz-nix")]
#[command(about = "Manage NixOS Linux VMs using macOS Virtualization.framework")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a NixOS virtual machine.
    Start(cli::start::StartCmd),

    /// Stop the running virtual machine.
    Stop(cli::stop::StopCmd),

    /// Show the status of the virtual machine.
    Status(cli::status::StatusCmd),

    /// Connect to the virtual machine via SSH.
    Ssh(cli::ssh::SshCmd),
}

fn main() {
    let cli = Cli::parse();

    let verbose = matches!(&cli.command, Commands::Start(cmd) if cmd.verbose);
    init_logging(verbose);

    tracing::debug!(version = darwin_vz_nix::VERSION, "starting darwin-vz-nix");

    let settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            Settings::default()
        }
    };

    let result = match cli.command {
        Commands::Start(cmd) => cmd.run(&settings).map(|status| status.code()),
        Commands::Stop(cmd) => cmd.run(&settings).map(|()| 0),
        Commands::Status(cmd) => cmd.run(&settings).map(|()| 0),
        Commands::Ssh(cmd) => cmd.run(&settings).map(|()| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Initialize the tracing subscriber on stderr.
fn init_logging(verbose: bool) {
    let default = if verbose {
        "darwin_vz_nix=debug"
    } else {
        "darwin_vz_nix=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
