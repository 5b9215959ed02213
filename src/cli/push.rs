use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use crate::cli::SessionArgs;
use crate::remote::ScpTransfer;

#[derive(Args)]
pub struct PushCommand {
    #[arg(help = "Local file to copy")]
    local: PathBuf,

    #[arg(default_value = ".", help = "Destination path on the device")]
    remote: String,

    #[command(flatten)]
    session: SessionArgs,
}

impl PushCommand {
    pub fn execute(self) -> Result<()> {
        let session = self.session.to_session();
        ScpTransfer::new(&session).upload(&self.local, &self.remote)?;
        println!("copied {} to {}", self.local.display(), self.remote);
        Ok(())
    }
}
