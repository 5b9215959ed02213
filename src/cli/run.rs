use anyhow::Result;
use clap::Args;

use crate::cli::SessionArgs;
use crate::remote::RunOptions;

#[derive(Args)]
pub struct RunCommand {
    #[arg(help = "Command to execute on the device")]
    command: String,

    #[arg(long, help = "Do not fail when the command exits non-zero")]
    tolerate: bool,

    #[command(flatten)]
    session: SessionArgs,
}

impl RunCommand {
    pub fn execute(self) -> Result<()> {
        let session = self.session.to_session();
        let options = RunOptions {
            check: !self.tolerate,
            ..Default::default()
        };

        let result = session.run(&self.command, &options)?;
        std::process::exit(result.exit_code);
    }
}
