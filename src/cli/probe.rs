use anyhow::Result;
use clap::Args;
use std::time::Duration;

use crate::cli::SessionArgs;
use crate::remote::{wait_for_device, RetryPolicy};

#[derive(Args)]
pub struct ProbeCommand {
    #[arg(
        long,
        default_value_t = 360,
        help = "Seconds to keep probing before giving up"
    )]
    deadline: u64,

    #[command(flatten)]
    session: SessionArgs,
}

impl ProbeCommand {
    pub fn execute(self) -> Result<()> {
        let session = self.session.to_session();
        let policy = RetryPolicy::with_deadline(Duration::from_secs(self.deadline));

        wait_for_device(&session, "true", &policy)?;
        println!("device {}:{} is reachable", session.host(), session.port());
        Ok(())
    }
}
