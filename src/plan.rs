//! Works out which volumes and images a run acts on.

use crate::catalog::{Catalog, ImageSpec};
use crate::checksum::is_sidecar;
use crate::error::PodbakError;
use crate::options::{Options, SkipVolumes};
use crate::podman::Podman;
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const VOLUMES_SUBDIR: &str = "volumes";
pub const IMAGES_SUBDIR: &str = "images";
pub const ARCHIVE_EXTENSION: &str = "tar";

/// Extras first, in caller order, then catalog volumes not skipped.
pub fn volumes_to_backup(catalog: &Catalog, options: &Options) -> Vec<String> {
    let mut volumes = options.extra_volumes.clone();

    if options.skip_volumes == SkipVolumes::All {
        return volumes;
    }

    let mut skip: Vec<&str> = options
        .skip_volumes
        .names()
        .iter()
        .map(String::as_str)
        .collect();
    if options.skip_database {
        skip.extend(catalog.database_volumes.iter().map(String::as_str));
    }

    for volume in &catalog.volumes {
        if !skip.contains(&volume.name.as_str()) {
            volumes.push(volume.name.clone());
        }
    }
    volumes
}

pub fn images_to_backup(catalog: &Catalog, skip_images: bool) -> Vec<ImageSpec> {
    if skip_images {
        return Vec::new();
    }
    catalog.services.iter().map(|s| s.image.clone()).collect()
}

/// A volume found in the backup, ready for import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeArchive {
    pub name: String,
    pub archive: PathBuf,
    /// The volume is already present and will be replaced.
    pub overwrite: bool,
}

/// `.tar` payloads of `dir`, sorted, sidecars excluded.
fn archive_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if is_sidecar(&path) {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXTENSION) {
            warn!("Ignoring unexpected file {} in the backup", path.display());
            continue;
        }
        entries.push(path);
    }
    entries.sort();
    Ok(entries)
}

/// Volumes to import from `source`, applying skip, force and skip-existing policy.
pub fn volumes_to_restore(
    source: &Path,
    options: &Options,
    catalog: &Catalog,
    podman: &Podman,
) -> Result<Vec<VolumeArchive>> {
    if options.skip_volumes == SkipVolumes::All {
        debug!("Skipping restoring of volumes");
        return Ok(Vec::new());
    }

    let volume_dir = source.join(VOLUMES_SUBDIR);
    if !volume_dir.is_dir() {
        return Err(PodbakError::NothingInBackup {
            kind: "volumes",
            path: volume_dir,
        });
    }

    let mut output = Vec::new();
    for archive in archive_entries(&volume_dir)? {
        let name = match archive.file_stem().and_then(|s| s.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };

        if options.skip_volumes.contains(&name) {
            info!("Skipping volume {name}");
            continue;
        }
        if options.skip_database && catalog.is_database_volume(&name) {
            info!("Skipping database volume {name}");
            continue;
        }

        let mut overwrite = false;
        if podman.volume_exists(&name) {
            if options.skip_existing {
                info!("Not restoring existing volume {name}");
                continue;
            }
            if !options.force {
                return Err(PodbakError::VolumeExists { name });
            }
            info!("Volume {name} will be overwritten");
            overwrite = true;
        }
        output.push(VolumeArchive {
            name,
            archive,
            overwrite,
        });
    }
    Ok(output)
}

/// Image archives to load from `source`.
pub fn images_to_restore(source: &Path, options: &Options) -> Result<Vec<PathBuf>> {
    if options.skip_images {
        debug!("Skipping restoring of images");
        return Ok(Vec::new());
    }

    let images_dir = source.join(IMAGES_SUBDIR);
    if !images_dir.is_dir() {
        warn!("No images found in the backup, they will need to be pulled");
        return Ok(Vec::new());
    }
    archive_entries(&images_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::VolumeSpec;
    use crate::runner::fake::FakeRunner;
    use tempfile::tempdir;

    fn synthetic_catalog() -> Catalog {
        let mut catalog = Catalog::default();
        catalog.volumes = vec![
            VolumeSpec::new("etc-rhn", "/etc/rhn"),
            VolumeSpec::new("var-pgsql", "/var/lib/pgsql"),
            VolumeSpec::new("var-log", "/var/log"),
        ];
        catalog.database_volumes = vec!["var-pgsql".to_string()];
        catalog
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_backup_volume_order() {
        let catalog = synthetic_catalog();
        let options = Options {
            extra_volumes: names(&["zeta", "alpha"]),
            ..Options::default()
        };
        assert_eq!(
            volumes_to_backup(&catalog, &options),
            names(&["zeta", "alpha", "etc-rhn", "var-pgsql", "var-log"])
        );
    }

    #[test]
    fn test_skip_all_returns_extras_only() {
        let catalog = synthetic_catalog();
        for skip_database in [false, true] {
            let options = Options {
                skip_volumes: SkipVolumes::from_list(names(&["all"])),
                extra_volumes: names(&["custom-data", "var-pgsql"]),
                skip_database,
                ..Options::default()
            };
            assert_eq!(
                volumes_to_backup(&catalog, &options),
                names(&["custom-data", "var-pgsql"])
            );
        }

        let options = Options {
            skip_volumes: SkipVolumes::All,
            ..Options::default()
        };
        assert!(volumes_to_backup(&catalog, &options).is_empty());
    }

    #[test]
    fn test_skip_database_excludes_database_volume() {
        let catalog = synthetic_catalog();
        let options = Options {
            skip_database: true,
            skip_volumes: SkipVolumes::from_list(names(&["var-log"])),
            ..Options::default()
        };
        assert_eq!(volumes_to_backup(&catalog, &options), names(&["etc-rhn"]));

        let options = Options {
            skip_database: true,
            ..Options::default()
        };
        let volumes = volumes_to_backup(&Catalog::default(), &options);
        assert!(!volumes.contains(&"var-pgsql".to_string()));
        assert!(volumes.contains(&"etc-rhn".to_string()));
    }

    #[test]
    fn test_images_to_backup() {
        let catalog = Catalog::default();
        assert!(images_to_backup(&catalog, true).is_empty());

        let images = images_to_backup(&catalog, false);
        assert_eq!(images.len(), catalog.services.len());
        assert_eq!(images[0].name, "server");
    }

    fn backup_tree(names: &[&str]) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let volumes = dir.path().join(VOLUMES_SUBDIR);
        fs::create_dir_all(&volumes).unwrap();
        for name in names {
            fs::write(volumes.join(format!("{name}.tar")), "data").unwrap();
            fs::write(volumes.join(format!("{name}.tar.sha256sum")), "x  y\n").unwrap();
        }
        dir
    }

    #[test]
    fn test_restore_lists_archive_not_catalog() {
        let dir = backup_tree(&["var-log", "custom-data", "etc-rhn"]);
        let runner = FakeRunner::new();
        let podman = Podman::new(&runner, "podman");

        let volumes =
            volumes_to_restore(dir.path(), &Options::default(), &synthetic_catalog(), &podman)
                .unwrap();
        let found: Vec<&str> = volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(found, vec!["custom-data", "etc-rhn", "var-log"]);
        assert!(volumes.iter().all(|v| !v.overwrite));
        assert!(volumes
            .iter()
            .all(|v| v.archive.extension().unwrap() == "tar"));
    }

    #[test]
    fn test_restore_skips() {
        let dir = backup_tree(&["var-log", "var-pgsql", "etc-rhn"]);
        let runner = FakeRunner::new();
        let podman = Podman::new(&runner, "podman");

        let options = Options {
            skip_database: true,
            skip_volumes: SkipVolumes::from_list(names(&["var-log"])),
            ..Options::default()
        };
        let volumes = volumes_to_restore(dir.path(), &options, &synthetic_catalog(), &podman)
            .unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "etc-rhn");

        let options = Options {
            skip_volumes: SkipVolumes::All,
            ..Options::default()
        };
        assert!(
            volumes_to_restore(dir.path(), &options, &synthetic_catalog(), &podman)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_restore_existing_volume_policy() {
        let dir = backup_tree(&["etc-rhn", "var-log"]);
        let runner = FakeRunner::new();
        runner.succeed("podman volume exists etc-rhn");
        let podman = Podman::new(&runner, "podman");
        let catalog = synthetic_catalog();

        // neither force nor continue: rejected, nothing imported
        match volumes_to_restore(dir.path(), &Options::default(), &catalog, &podman) {
            Err(PodbakError::VolumeExists { name }) => assert_eq!(name, "etc-rhn"),
            other => panic!("Expected VolumeExists, got {other:?}"),
        }
        assert!(runner.calls_matching("podman volume import").is_empty());

        let options = Options {
            skip_existing: true,
            ..Options::default()
        };
        let volumes = volumes_to_restore(dir.path(), &options, &catalog, &podman).unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "var-log");

        let options = Options {
            force: true,
            ..Options::default()
        };
        let volumes = volumes_to_restore(dir.path(), &options, &catalog, &podman).unwrap();
        assert_eq!(volumes.len(), 2);
        assert!(volumes[0].overwrite);
        assert!(!volumes[1].overwrite);
    }

    #[test]
    fn test_restore_without_volumes_dir() {
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        let podman = Podman::new(&runner, "podman");
        assert!(matches!(
            volumes_to_restore(dir.path(), &Options::default(), &synthetic_catalog(), &podman),
            Err(PodbakError::NothingInBackup { kind: "volumes", .. })
        ));
    }

    #[test]
    fn test_images_to_restore() {
        let dir = tempdir().unwrap();
        assert!(images_to_restore(dir.path(), &Options::default())
            .unwrap()
            .is_empty());

        let images = dir.path().join(IMAGES_SUBDIR);
        fs::create_dir_all(&images).unwrap();
        fs::write(images.join("server.tar"), "img").unwrap();
        fs::write(images.join("server.tar.sha256sum"), "x  server.tar\n").unwrap();
        fs::write(images.join("notes.txt"), "ignored").unwrap();

        let found = images_to_restore(dir.path(), &Options::default()).unwrap();
        assert_eq!(found, vec![images.join("server.tar")]);

        let options = Options {
            skip_images: true,
            ..Options::default()
        };
        assert!(images_to_restore(dir.path(), &options).unwrap().is_empty());
    }
}
