use crate::catalog::ImageSpec;
use crate::checksum::{create_checksum, validate_checksum};
use crate::plan::{ARCHIVE_EXTENSION, IMAGES_SUBDIR};
use crate::podman::Podman;
use crate::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// `<dir>/images/<name>.tar`, with path separators of the name flattened.
pub fn archive_path(dir: &Path, image: &ImageSpec) -> PathBuf {
    let name = image.name.replace('/', "-");
    dir.join(IMAGES_SUBDIR)
        .join(format!("{name}.{ARCHIVE_EXTENSION}"))
}

pub struct ImageArchiver<'a> {
    podman: Podman<'a>,
}

impl<'a> ImageArchiver<'a> {
    pub fn new(podman: Podman<'a>) -> Self {
        Self { podman }
    }

    /// Save `image` under `dest_dir`. `None` when the image was never pulled.
    pub fn export(&self, image: &ImageSpec, dest_dir: &Path, dry_run: bool) -> Result<Option<PathBuf>> {
        let reference = image.reference();
        if !self.podman.image_exists(&reference) {
            warn!("Image {reference} is not present locally, skipping");
            return Ok(None);
        }

        let archive = archive_path(dest_dir, image);
        if dry_run {
            info!("Would save image {reference} to {}", archive.display());
            return Ok(Some(archive));
        }

        info!("Saving image {reference}");
        self.podman.save_image(&reference, &archive)?;
        create_checksum(&archive)?;
        Ok(Some(archive))
    }

    pub fn import(&self, archive: &Path, verify: bool, dry_run: bool) -> Result<()> {
        if verify {
            validate_checksum(archive)?;
        }
        if dry_run {
            info!("Would load image from {}", archive.display());
            return Ok(());
        }

        info!("Loading image from {}", archive.display());
        self.podman.load_image(archive)
    }
}
