use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use crate::device::artifact::{find_boot_image, latest_build_artifact, IMAGE_KIND_PRIORITY};

#[derive(Args)]
pub struct ImageCommand {
    #[arg(help = "Build output directory to search")]
    build_dir: PathBuf,

    #[arg(long, help = "List every image format found, not just the winner")]
    all: bool,

    #[command(subcommand)]
    action: Option<ImageAction>,
}

#[derive(clap::Subcommand)]
enum ImageAction {
    /// Extract a partition from the selected boot image
    ExtractPartition {
        #[arg(help = "Partition number")]
        number: u32,

        #[arg(help = "Destination directory")]
        dst: PathBuf,
    },
}

impl ImageCommand {
    pub fn execute(self) -> Result<()> {
        if self.all {
            for kind in IMAGE_KIND_PRIORITY {
                match latest_build_artifact(&self.build_dir, kind.extension())? {
                    Some(path) => println!("{:12} {}", kind.to_string(), path.display()),
                    None => println!("{:12} (none)", kind.to_string()),
                }
            }
            return Ok(());
        }

        let image = find_boot_image(&self.build_dir)?;
        println!("{} {}", image.kind, image.path.display());

        if let Some(ImageAction::ExtractPartition { number, dst }) = self.action {
            crate::buildenv::extract_partition(&image.path, number, &dst)?;
            println!("partition {} extracted to {}", number, dst.display());
        }

        Ok(())
    }
}
