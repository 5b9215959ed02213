use anyhow::Result;
use clap::Args;

use crate::cli::SessionArgs;
use crate::remote::{clear_updater_state, BootloaderTools, commit_boot_state};

#[derive(Args)]
pub struct CleanStateCommand {
    #[arg(long, help = "Also clear bootloader boot-count/upgrade flags")]
    boot_state: bool,

    #[command(flatten)]
    session: SessionArgs,
}

impl CleanStateCommand {
    pub fn execute(self) -> Result<()> {
        let session = self.session.to_session();

        clear_updater_state(&session)?;
        println!("updater state cleared");

        if self.boot_state {
            let tools = BootloaderTools::detect(&session)?;
            commit_boot_state(&session, tools)?;
            println!("boot state cleared via {}", tools.set_tool());
        }

        Ok(())
    }
}
