use anyhow::{bail, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::SessionArgs;
use crate::config::RigConfig;
use crate::device::DeviceInstance;
use crate::remote::RetryPolicy;
use crate::remote::RunOptions;

#[derive(Args)]
pub struct BootCommand {
    #[arg(long, help = "Build output directory (defaults to the config file)")]
    build_dir: Option<PathBuf>,

    #[arg(long, help = "Qemu wrapper script (defaults to the config file)")]
    qemu_wrapper: Option<PathBuf>,

    #[arg(long, help = "Command to run on the device once it is up")]
    command: Option<String>,

    #[arg(
        long,
        default_value_t = 360,
        help = "Seconds to wait for the device to become reachable"
    )]
    deadline: u64,

    #[command(flatten)]
    session: SessionArgs,
}

impl BootCommand {
    pub fn execute(self) -> Result<()> {
        let config = RigConfig::load()?;

        let Some(build_dir) = self.build_dir.or(config.build_dir) else {
            bail!("no build directory given; pass --build-dir or set it in the config file");
        };
        let Some(wrapper) = self.qemu_wrapper.or(config.qemu_wrapper) else {
            bail!("no qemu wrapper given; pass --qemu-wrapper or set it in the config file");
        };

        let policy = RetryPolicy::with_deadline(Duration::from_secs(self.deadline));
        let mut instance = DeviceInstance::launch(
            &wrapper,
            &build_dir,
            self.session.to_session(),
            &policy,
        )?;

        println!(
            "device up: pid {}, image {}",
            instance.pid(),
            instance.image_path().display()
        );

        if let Some(command) = &self.command {
            let result = instance
                .session()
                .run(command, &RunOptions::tolerant())?;
            println!("exit status: {}", result.exit_code);
        }

        instance.shutdown()?;
        Ok(())
    }
}
