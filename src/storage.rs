use crate::catalog::ImageSpec;
use crate::error::PodbakError;
use crate::podman::Podman;
use crate::Result;
use fs2::available_space;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Calculate the total size of a file or directory without following symlinks
pub fn calculate_size(path: &Path) -> Result<u64> {
    let metadata = fs::symlink_metadata(path)?;

    if metadata.is_dir() {
        let mut total_size = 0;
        for entry in fs::read_dir(path)? {
            total_size += calculate_size(&entry?.path())?;
        }
        Ok(total_size)
    } else {
        Ok(metadata.len())
    }
}

/// Approximate bytes a backup of `volumes` and `images` needs, before margin.
pub fn estimate_required(podman: &Podman, volumes: &[String], images: &[ImageSpec]) -> u64 {
    let mut required = 0;

    for volume in volumes {
        let size = podman
            .volume_mountpoint(volume)
            .and_then(|mountpoint| calculate_size(&mountpoint));
        match size {
            Ok(size) => required += size,
            Err(e) => debug!("Cannot size volume {volume}: {e}"),
        }
    }

    for image in images {
        let reference = image.reference();
        match podman.image_size(&reference) {
            Ok(size) => required += size,
            Err(e) => debug!("Cannot size image {reference}: {e}"),
        }
    }

    required
}

/// Fail when `destination` cannot hold the estimated backup plus `margin_percent`.
pub fn check_space(
    podman: &Podman,
    volumes: &[String],
    images: &[ImageSpec],
    destination: &Path,
    margin_percent: u64,
) -> Result<()> {
    let needed_size = estimate_required(podman, volumes, images);
    let needed_with_buffer = needed_size + needed_size * margin_percent / 100;

    let available_size = match available_space(destination) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(
                "Unable to determine free space on {}: {e}",
                destination.display()
            );
            return Ok(());
        }
    };

    debug!("Backup needs about {needed_with_buffer} bytes, {available_size} available");
    ensure_fits(needed_with_buffer, available_size)
}

fn ensure_fits(needed: u64, available: u64) -> Result<()> {
    if available < needed {
        return Err(PodbakError::InsufficientSpace { needed, available });
    }
    Ok(())
}

/// Format byte size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: u64 = 1024;

    if bytes < THRESHOLD {
        return format!("{bytes} B");
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= THRESHOLD as f64 && unit_index < UNITS.len() - 1 {
        size /= THRESHOLD as f64;
        unit_index += 1;
    }

    let unit = UNITS[unit_index];
    format!("{size:.1} {unit}")
}
