//! Boot image discovery in the build output directory.
//!
//! A build produces one of several image container formats depending on the
//! target machine. Discovery walks the build directory (covering both flat
//! output layouts and `tmp*/deploy/images/<machine>/` trees), picks the most
//! recently modified artifact per format, and skips the auxiliary data
//! partition images that share the same extension.

use crate::error::{Error, Result};
use log::info;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Supported boot image container formats, in probe priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// Partitioned block-storage image (SD card layout)
    Sdimg,
    /// Partitioned image with a UEFI boot partition
    Uefiimg,
    /// Partitioned image with a BIOS boot partition
    Biosimg,
    /// Partitioned image with a GPT label
    Gptimg,
    /// Raw NOR flash bank pair; boots through a distinct flash procedure
    VexpressNor,
}

/// Formats are probed in this fixed order; the first one present in the
/// build directory wins.
pub const IMAGE_KIND_PRIORITY: [ImageKind; 5] = [
    ImageKind::Sdimg,
    ImageKind::Uefiimg,
    ImageKind::Biosimg,
    ImageKind::Gptimg,
    ImageKind::VexpressNor,
];

impl ImageKind {
    /// File extension of this format, including the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageKind::Sdimg => ".sdimg",
            ImageKind::Uefiimg => ".uefiimg",
            ImageKind::Biosimg => ".biosimg",
            ImageKind::Gptimg => ".gptimg",
            ImageKind::VexpressNor => ".vexpress-nor",
        }
    }

    /// Raw flash images are a pair of flash-bank files rather than a single
    /// partitioned disk and need the dedicated flash launch path.
    pub fn is_flash(&self) -> bool {
        matches!(self, ImageKind::VexpressNor)
    }
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display as the extension without the dot.
        write!(f, "{}", &self.extension()[1..])
    }
}

/// A discovered boot image.
#[derive(Debug, Clone)]
pub struct BootImage {
    pub kind: ImageKind,
    pub path: PathBuf,
}

/// Returns the most recently modified artifact with the given extension
/// under `build_dir`, or `None` if there is none.
///
/// Files whose name contains the reserved `data` infix are the auxiliary
/// data partition image of the same build and are never selected.
pub fn latest_build_artifact(build_dir: &Path, extension: &str) -> Result<Option<PathBuf>> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    for entry in WalkDir::new(build_dir).follow_links(true) {
        let entry = entry.map_err(|e| {
            Error::Config(format!(
                "cannot walk build directory {}: {}",
                build_dir.display(),
                e
            ))
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(extension) || name.contains("data") {
            continue;
        }

        let modified = entry
            .metadata()
            .map_err(|e| Error::Config(format!("cannot stat {}: {}", entry.path().display(), e)))?
            .modified()
            .map_err(Error::Io)?;

        let is_newer = match &newest {
            Some((best, _)) => modified > *best,
            None => true,
        };
        if is_newer {
            newest = Some((modified, entry.path().to_path_buf()));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

/// Locates the boot image to launch from, trying each supported format in
/// priority order.
///
/// # Errors
///
/// Returns [`Error::Launch`] when no format matches anything in the build
/// directory.
pub fn find_boot_image(build_dir: &Path) -> Result<BootImage> {
    for kind in IMAGE_KIND_PRIORITY {
        if let Some(path) = latest_build_artifact(build_dir, kind.extension())? {
            info!("found latest {} image: {}", kind, path.display());
            return Ok(BootImage { kind, path });
        }
    }

    Err(Error::Launch(format!(
        "no supported boot image found under {}",
        build_dir.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"image").unwrap();
        // Keep modification times strictly ordered.
        thread::sleep(Duration::from_millis(20));
        path
    }

    #[test]
    fn test_latest_artifact_picks_most_recent() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "core-image-old.sdimg");
        let newer = touch(dir.path(), "core-image-new.sdimg");

        let found = latest_build_artifact(dir.path(), ".sdimg").unwrap();
        assert_eq!(found, Some(newer));
    }

    #[test]
    fn test_data_partition_image_is_never_selected() {
        let dir = TempDir::new().unwrap();
        let rootfs = touch(dir.path(), "core-image-foo.sdimg");
        // Newer, but a data partition image.
        touch(dir.path(), "core-image-foo-data.sdimg");

        let found = latest_build_artifact(dir.path(), ".sdimg").unwrap();
        assert_eq!(found, Some(rootfs));
    }

    #[test]
    fn test_only_data_images_means_none() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "data.ubifs");

        let found = latest_build_artifact(dir.path(), ".ubifs").unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn test_discovery_descends_into_deploy_tree() {
        let dir = TempDir::new().unwrap();
        let deploy = dir.path().join("tmp/deploy/images/qemux86-64");
        fs::create_dir_all(&deploy).unwrap();
        let image = touch(&deploy, "core-image-full.uefiimg");

        let found = latest_build_artifact(dir.path(), ".uefiimg").unwrap();
        assert_eq!(found, Some(image));
    }

    #[test]
    fn test_find_boot_image_priority_order() {
        let dir = TempDir::new().unwrap();
        // uefiimg is newer, but sdimg has higher priority.
        touch(dir.path(), "core-image.sdimg");
        touch(dir.path(), "core-image.uefiimg");

        let image = find_boot_image(dir.path()).unwrap();
        assert_eq!(image.kind, ImageKind::Sdimg);
    }

    #[test]
    fn test_find_boot_image_flash_fallback() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "core-image.vexpress-nor");

        let image = find_boot_image(dir.path()).unwrap();
        assert_eq!(image.kind, ImageKind::VexpressNor);
        assert!(image.kind.is_flash());
    }

    #[test]
    fn test_find_boot_image_empty_dir_fails() {
        let dir = TempDir::new().unwrap();
        let err = find_boot_image(dir.path()).unwrap_err();
        match err {
            Error::Launch(msg) => assert!(msg.contains("no supported boot image")),
            other => panic!("unexpected error: {}", other),
        }
    }
}
