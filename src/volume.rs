use crate::catalog::{Catalog, RepairLink};
use crate::checksum::{create_checksum, validate_checksum};
use crate::error::PodbakError;
use crate::plan::{VolumeArchive, ARCHIVE_EXTENSION, VOLUMES_SUBDIR};
use crate::podman::Podman;
use crate::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Corrective action for a volume whose import reported an error.
pub trait VolumeFixup {
    /// Returning `Ok` clears the import error.
    fn repair(&self, podman: &Podman, volume: &str) -> Result<()>;
}

/// Recreates symlinks the runtime refuses to import.
pub struct SymlinkFixup {
    links: Vec<RepairLink>,
}

impl SymlinkFixup {
    pub fn new(links: Vec<RepairLink>) -> Self {
        Self { links }
    }
}

impl VolumeFixup for SymlinkFixup {
    fn repair(&self, podman: &Podman, volume: &str) -> Result<()> {
        let data_dir = podman.volume_mountpoint(volume)?;
        for link in &self.links {
            let path = data_dir.join(&link.link);
            debug!(
                "Linking {} to {} in volume {volume}",
                path.display(),
                link.target.display()
            );
            make_symlink(&link.target, &path)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, path)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, path: &Path) -> Result<()> {
    Err(PodbakError::validation(format!(
        "Cannot link {} to {} on this platform",
        path.display(),
        target.display()
    )))
}

/// `<dir>/volumes/<name>.tar`
pub fn archive_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(VOLUMES_SUBDIR)
        .join(format!("{name}.{ARCHIVE_EXTENSION}"))
}

pub struct VolumeArchiver<'a> {
    podman: Podman<'a>,
    fixups: HashMap<String, Box<dyn VolumeFixup>>,
}

impl<'a> VolumeArchiver<'a> {
    pub fn new(podman: Podman<'a>) -> Self {
        Self {
            podman,
            fixups: HashMap::new(),
        }
    }

    /// Registers a [`SymlinkFixup`] for every catalog volume with repair links.
    pub fn from_catalog(podman: Podman<'a>, catalog: &Catalog) -> Self {
        let mut archiver = Self::new(podman);
        for volume in &catalog.volumes {
            if !volume.repair_links.is_empty() {
                archiver = archiver.with_fixup(
                    &volume.name,
                    Box::new(SymlinkFixup::new(volume.repair_links.clone())),
                );
            }
        }
        archiver
    }

    pub fn with_fixup(mut self, volume: &str, fixup: Box<dyn VolumeFixup>) -> Self {
        self.fixups.insert(volume.to_string(), fixup);
        self
    }

    pub fn export(&self, name: &str, dest_dir: &Path, dry_run: bool) -> Result<PathBuf> {
        let archive = archive_path(dest_dir, name);
        if dry_run {
            info!("Would export volume {name} to {}", archive.display());
            return Ok(archive);
        }

        info!("Exporting volume {name}");
        self.podman.export_volume(name, &archive)?;
        create_checksum(&archive)?;
        Ok(archive)
    }

    /// A failed verification leaves the destination untouched.
    pub fn import(&self, volume: &VolumeArchive, verify: bool, dry_run: bool) -> Result<()> {
        if verify {
            validate_checksum(&volume.archive)?;
        }

        if dry_run {
            if volume.overwrite {
                info!("Would remove existing volume {}", volume.name);
            }
            info!(
                "Would import volume {} from {}",
                volume.name,
                volume.archive.display()
            );
            return Ok(());
        }

        info!("Importing volume {}", volume.name);
        match self.import_archive(volume) {
            Ok(()) => Ok(()),
            Err(e) => self.repair(&volume.name, e),
        }
    }

    fn import_archive(&self, volume: &VolumeArchive) -> Result<()> {
        if volume.overwrite {
            self.podman.remove_volume(&volume.name)?;
        }
        if !self.podman.volume_exists(&volume.name) {
            self.podman.create_volume(&volume.name)?;
        }
        self.podman.import_volume(&volume.name, &volume.archive)
    }

    fn repair(&self, name: &str, error: PodbakError) -> Result<()> {
        let fixup = match self.fixups.get(name) {
            Some(fixup) => fixup,
            None => return Err(error),
        };
        // nothing was imported at all
        if !self.podman.volume_exists(name) {
            return Err(error);
        }

        debug!("Applying repair for volume {name} after: {error}");
        match fixup.repair(&self.podman, name) {
            Ok(()) => {
                info!("Volume {name} repaired after import");
                Ok(())
            }
            Err(e) => {
                debug!("Repair of volume {name} failed: {e}");
                Err(error)
            }
        }
    }
}
