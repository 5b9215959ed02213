use anyhow::Result;
use clap::{Parser, Subcommand};

use otarig::cli::boot::BootCommand;
use otarig::cli::clean_state::CleanStateCommand;
use otarig::cli::image::ImageCommand;
use otarig::cli::probe::ProbeCommand;
use otarig::cli::pull::PullCommand;
use otarig::cli::push::PushCommand;
use otarig::cli::run::RunCommand;

#[derive(Parser)]
#[command(name = "otarig")]
#[command(about = "Boots emulated OTA-client devices from built disk images and drives them over SSH", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot a device, optionally run a command, and tear it down
    Boot(BootCommand),
    /// Run a single command on a reachable device
    Run(RunCommand),
    /// Wait until the device answers over SSH
    Probe(ProbeCommand),
    /// Copy a file to the device
    Push(PushCommand),
    /// Copy a file from the device
    Pull(PullCommand),
    /// Reset persisted updater state on the device
    CleanState(CleanStateCommand),
    /// Report the boot image the rig would launch from
    Image(ImageCommand),
}

fn main() -> Result<()> {
    // Initialize logging with INFO level by default
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Boot(cmd) => cmd.execute(),
        Commands::Run(cmd) => cmd.execute(),
        Commands::Probe(cmd) => cmd.execute(),
        Commands::Push(cmd) => cmd.execute(),
        Commands::Pull(cmd) => cmd.execute(),
        Commands::CleanState(cmd) => cmd.execute(),
        Commands::Image(cmd) => cmd.execute(),
    }
}
