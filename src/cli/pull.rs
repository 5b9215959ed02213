use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use crate::cli::SessionArgs;
use crate::remote::ScpTransfer;

#[derive(Args)]
pub struct PullCommand {
    #[arg(help = "File on the device to copy")]
    remote: String,

    #[arg(default_value = ".", help = "Local destination path")]
    local: PathBuf,

    #[command(flatten)]
    session: SessionArgs,
}

impl PullCommand {
    pub fn execute(self) -> Result<()> {
        let session = self.session.to_session();
        ScpTransfer::new(&session).download(&self.remote, &self.local)?;
        println!("copied {} to {}", self.remote, self.local.display());
        Ok(())
    }
}
