//! Service unit files and their drop-ins, bundled into one tar archive.

use crate::catalog::{Catalog, Replicas, ServiceRole, ServiceSpec};
use crate::checksum::{create_checksum, validate_checksum};
use crate::error::PodbakError;
use crate::options::Options;
use crate::systemd::Systemd;
use crate::Result;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info, warn};

pub const SYSTEMD_CONF_BACKUP_FILE: &str = "systemdBackup.tar";

/// Entry name for `path`: the same path relative to `/`.
pub fn entry_name(path: &Path) -> PathBuf {
    path.strip_prefix("/").unwrap_or(path).to_path_buf()
}

/// Where entry `name` lands under `root`. Entries climbing out with `..` are refused.
pub fn restore_destination(root: &Path, name: &Path) -> Result<PathBuf> {
    let mut destination = root.to_path_buf();
    for component in name.components() {
        match component {
            Component::Normal(part) => destination.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(PodbakError::PathTraversal {
                    path: name.to_path_buf(),
                })
            }
        }
    }
    Ok(destination)
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => return Vec::new(),
    };
    files.sort();
    files
}

pub struct UnitArchiver<'a> {
    systemd: Systemd<'a>,
    catalog: &'a Catalog,
    network: &'a str,
    restore_root: &'a Path,
}

impl<'a> UnitArchiver<'a> {
    pub fn new(
        systemd: Systemd<'a>,
        catalog: &'a Catalog,
        network: &'a str,
        restore_root: &'a Path,
    ) -> Self {
        Self {
            systemd,
            catalog,
            network,
            restore_root,
        }
    }

    fn unit_file(&self, unit: &str) -> Option<PathBuf> {
        let path = self.systemd.service_path(unit);
        if path.exists() {
            return Some(path);
        }
        self.systemd.fragment_path(unit).filter(|p| p.exists())
    }

    fn push_drop_ins(&self, unit: &str, items: &mut Vec<PathBuf>) {
        let dir = self.systemd.drop_in_dir(unit);
        if !dir.is_dir() {
            debug!("No drop-in directory {}", dir.display());
            return;
        }
        items.push(dir.clone());
        items.extend(files_in(&dir));
    }

    /// Unit files, drop-in directories and drop-ins of every installed service.
    pub fn gather(&self) -> Vec<PathBuf> {
        let mut items = Vec::new();

        for service in &self.catalog.services {
            let template = format!("{}@", service.name);
            let candidates = match service.replicas {
                Replicas::SingleMandatory => [service.name.clone(), template],
                Replicas::SingleOptional => [template, service.name.clone()],
            };
            let found = candidates
                .iter()
                .find_map(|unit| self.unit_file(unit).map(|path| (unit.clone(), path)));
            let (unit, path) = match found {
                Some(found) => found,
                None => {
                    debug!("Service {} is not installed, skipping", service.name);
                    continue;
                }
            };

            items.push(path);
            self.push_drop_ins(&unit, &mut items);
            if unit.ends_with('@') {
                for instance in self.systemd.template_instances(&unit) {
                    self.push_drop_ins(&instance, &mut items);
                }
            }
        }
        items
    }

    pub fn backup(&self, output_dir: &Path, dry_run: bool) -> Result<Option<PathBuf>> {
        let items = self.gather();
        if items.is_empty() {
            warn!("No service units found to back up");
        }

        if dry_run {
            for item in &items {
                info!("Would back up {}", item.display());
            }
            return Ok(None);
        }

        let path = output_dir.join(SYSTEMD_CONF_BACKUP_FILE);
        let mut builder = Builder::new(File::create(&path)?);
        for item in &items {
            debug!("Adding {} to the unit backup", item.display());
            builder.append_path_with_name(item, entry_name(item))?;
        }
        builder.into_inner()?.flush()?;

        create_checksum(&path)?;
        info!("Service units saved to {}", path.display());
        Ok(Some(path))
    }

    /// Write the archived units back, then reload the service manager.
    pub fn restore(&self, input_dir: &Path, options: &Options) -> Result<()> {
        info!("Restoring service units");
        let path = input_dir.join(SYSTEMD_CONF_BACKUP_FILE);
        if !path.exists() {
            return Err(PodbakError::ArchiveMissing { path });
        }
        if !options.skip_verify {
            validate_checksum(&path)?;
        }

        let mut errors = Vec::new();
        if let Err(e) = self.restore_archive(&path, options.dry_run) {
            errors.push(e);
        }
        if !options.dry_run {
            if let Err(e) = self.systemd.daemon_reload() {
                errors.push(e);
            }
        }

        match PodbakError::join(errors) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn restore_archive(&self, path: &Path, dry_run: bool) -> Result<()> {
        let mut archive = Archive::new(File::open(path)?);
        let mut errors = Vec::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.into_owned();
            let destination = match restore_destination(self.restore_root, &name) {
                Ok(destination) => destination,
                Err(e) => {
                    warn!("Refusing to restore {}", name.display());
                    errors.push(e);
                    continue;
                }
            };

            if dry_run {
                info!("Would restore {}", destination.display());
                continue;
            }

            debug!("Restoring unit file {}", destination.display());
            let header = entry.header().clone();
            match header.entry_type() {
                EntryType::Directory => {
                    if let Err(e) = fs::create_dir_all(&destination) {
                        warn!("Unable to create directory {}: {e}", destination.display());
                        errors.push(e.into());
                        continue;
                    }
                }
                EntryType::Regular => {
                    if let Err(e) = write_entry(&mut entry, &destination) {
                        warn!("Unable to restore {}: {e}", destination.display());
                        let _ = fs::remove_file(&destination);
                        errors.push(e);
                        continue;
                    }
                }
                _ => {
                    warn!("Unknown file type of {}", name.display());
                    continue;
                }
            }

            if let Err(e) = restore_attributes(&destination, &header) {
                warn!("Unable to restore file details for {}: {e}", destination.display());
            }
        }

        match PodbakError::join(errors) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Write the server and database units from the catalog. Used when the
    /// backup holds no unit archive.
    pub fn generate_default_units(&self, dry_run: bool) -> Result<()> {
        warn!("Generating default service units");
        let roles = [ServiceRole::Server, ServiceRole::Database];
        for service in roles
            .iter()
            .filter_map(|role| self.catalog.service_with_role(*role))
        {
            let unit = self.systemd.service_path(&service.name);
            let destination = restore_destination(self.restore_root, &unit)?;
            if dry_run {
                info!("Would write default unit {}", destination.display());
                continue;
            }

            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&destination, render_unit(service, self.catalog, self.network))?;
            info!("Wrote default unit {}", destination.display());
        }

        if !dry_run {
            self.systemd.daemon_reload()?;
        }
        Ok(())
    }
}

fn write_entry<R: io::Read>(entry: &mut R, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(destination)?;
    io::copy(entry, &mut file)?;
    Ok(())
}

fn restore_attributes(path: &Path, header: &Header) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = header.mode()?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
        let uid = u32::try_from(header.uid()?)
            .map_err(|_| PodbakError::validation(format!("Owner id out of range for {}", path.display())))?;
        let gid = u32::try_from(header.gid()?)
            .map_err(|_| PodbakError::validation(format!("Group id out of range for {}", path.display())))?;
        std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
    }

    let modified = SystemTime::UNIX_EPOCH
        .checked_add(Duration::from_secs(header.mtime()?))
        .ok_or_else(|| PodbakError::validation(format!("Invalid mtime for {}", path.display())))?;
    File::open(path)?.set_modified(modified)?;
    Ok(())
}

/// Volume mounts of `service`: the database volumes for the database unit,
/// every other catalog volume for the server.
fn service_volumes<'c>(service: &ServiceSpec, catalog: &'c Catalog) -> Vec<(&'c str, &'c str)> {
    catalog
        .volumes
        .iter()
        .filter(|v| catalog.is_database_volume(&v.name) == (service.role == ServiceRole::Database))
        .map(|v| (v.name.as_str(), v.mount_path.as_str()))
        .collect()
}

pub fn render_unit(service: &ServiceSpec, catalog: &Catalog, network: &str) -> String {
    let name = &service.name;
    let mut volumes = String::new();
    for (volume, mount_path) in service_volumes(service, catalog) {
        volumes.push_str(&format!("\t-v {volume}:{mount_path} \\\n"));
    }

    format!(
        r#"# {name}.service, generated by podbak
# Use a {name}.service.d/local.conf file to override

[Unit]
Description={description}
Wants=network.target
After=network-online.target
RequiresMountsFor=%t/containers

[Service]
Environment=PODMAN_SYSTEMD_UNIT=%n
Environment=IMAGE={image}
Restart=on-failure
ExecStartPre=/bin/rm -f %t/{name}.pid %t/%n.ctr-id
ExecStartPre=/usr/bin/podman rm --ignore --force -t 10 {name}
ExecStart=/usr/bin/podman run \
	--conmon-pidfile %t/{name}.pid \
	--cidfile=%t/%n.ctr-id \
	--cgroups=no-conmon \
	--sdnotify=conmon \
	-d \
	--name {name} \
	--hostname {name} \
{volumes}	--network {network} \
	${{IMAGE}}
ExecStop=/usr/bin/podman stop \
	--ignore -t 10 \
	--cidfile=%t/%n.ctr-id
ExecStopPost=/usr/bin/podman rm \
	-f \
	--ignore -t 10 \
	--cidfile=%t/%n.ctr-id

PIDFile=%t/{name}.pid
TimeoutStopSec=180
TimeoutStartSec=900
Type=forking

[Install]
WantedBy=multi-user.target default.target
"#,
        description = service.description,
        image = service.image.reference(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;
    use std::collections::HashMap;
    use std::io::Read;
    use tempfile::tempdir;

    fn install(unit_dir: &Path, file: &str, content: &str) -> PathBuf {
        let path = unit_dir.join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn entries(path: &Path) -> HashMap<PathBuf, (EntryType, Vec<u8>)> {
        let mut archive = Archive::new(File::open(path).unwrap());
        let mut found = HashMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().into_owned();
            let kind = entry.header().entry_type();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            found.insert(name, (kind, data));
        }
        found
    }

    #[test]
    fn test_restore_destination() {
        let root = Path::new("/restore");
        assert_eq!(
            restore_destination(root, Path::new("etc/systemd/system/a.service")).unwrap(),
            PathBuf::from("/restore/etc/systemd/system/a.service")
        );
        assert_eq!(
            restore_destination(root, Path::new("/etc/a.service")).unwrap(),
            PathBuf::from("/restore/etc/a.service")
        );
        assert!(matches!(
            restore_destination(root, Path::new("etc/../../shadow")),
            Err(PodbakError::PathTraversal { .. })
        ));
        assert_eq!(entry_name(Path::new("/etc/a")), PathBuf::from("etc/a"));
    }

    #[test]
    fn test_gather_units() {
        let dir = tempdir().unwrap();
        let unit_dir = dir.path();
        let server = install(unit_dir, "uyuni-server.service", "[Unit]\n");
        let conf = install(unit_dir, "uyuni-server.service.d/custom.conf", "[Service]\n");
        let hub = install(unit_dir, "uyuni-hub-xmlrpc@.service", "[Unit]\n");
        let hub_conf = install(unit_dir, "uyuni-hub-xmlrpc@0.service.d/local.conf", "x");
        let db = install(unit_dir, "uyuni-db.service", "[Unit]\n");

        let runner = FakeRunner::new();
        runner.respond(
            "systemctl list-units --all --plain --no-legend uyuni-hub-xmlrpc@*",
            "uyuni-hub-xmlrpc@0.service loaded active running Hub\n",
        );
        let catalog = Catalog::default();
        let systemd = Systemd::new(&runner, "systemctl", unit_dir);
        let archiver = UnitArchiver::new(systemd, &catalog, "uyuni", Path::new("/"));

        let items = archiver.gather();
        assert_eq!(
            items,
            vec![
                server,
                unit_dir.join("uyuni-server.service.d"),
                conf,
                hub,
                unit_dir.join("uyuni-hub-xmlrpc@0.service.d"),
                hub_conf,
                db,
            ]
        );
    }

    #[test]
    fn test_backup_and_restore_units() {
        let source = tempdir().unwrap();
        let output = tempdir().unwrap();
        let target = tempdir().unwrap();
        let unit_dir = source.path().join("etc/systemd/system");
        install(&unit_dir, "uyuni-server.service", "[Unit]\nDescription=server\n");
        install(&unit_dir, "uyuni-server.service.d/custom.conf", "[Service]\n");

        let runner = FakeRunner::new();
        let catalog = Catalog::default();
        let systemd = Systemd::new(&runner, "systemctl", &unit_dir);
        let archiver = UnitArchiver::new(systemd, &catalog, "uyuni", target.path());

        let archive = archiver.backup(output.path(), false).unwrap().unwrap();
        assert!(validate_checksum(&archive).is_ok());
        let found = entries(&archive);
        let server_entry = entry_name(&unit_dir.join("uyuni-server.service"));
        assert!(server_entry.is_relative());
        assert_eq!(found[&server_entry].0, EntryType::Regular);
        assert_eq!(
            found[&entry_name(&unit_dir.join("uyuni-server.service.d"))].0,
            EntryType::Directory
        );

        archiver.restore(output.path(), &Options::default()).unwrap();
        let restored = target.path().join(&server_entry);
        assert_eq!(
            fs::read_to_string(restored).unwrap(),
            "[Unit]\nDescription=server\n"
        );
        assert!(target
            .path()
            .join(entry_name(&unit_dir.join("uyuni-server.service.d/custom.conf")))
            .exists());
        assert_eq!(runner.calls_matching("systemctl daemon-reload").len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_keeps_mode() {
        use std::os::unix::fs::PermissionsExt;

        let source = tempdir().unwrap();
        let output = tempdir().unwrap();
        let target = tempdir().unwrap();
        let server = install(source.path(), "uyuni-server.service", "[Unit]\n");
        fs::set_permissions(&server, fs::Permissions::from_mode(0o640)).unwrap();

        let runner = FakeRunner::new();
        let catalog = Catalog::default();
        let systemd = Systemd::new(&runner, "systemctl", source.path());
        let archiver = UnitArchiver::new(systemd, &catalog, "uyuni", target.path());

        archiver.backup(output.path(), false).unwrap();
        archiver.restore(output.path(), &Options::default()).unwrap();

        let restored = target.path().join(entry_name(&server));
        let mode = fs::metadata(&restored).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
        let seconds = |path: &Path| {
            fs::metadata(path)
                .unwrap()
                .modified()
                .unwrap()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap()
                .as_secs()
        };
        assert_eq!(seconds(&restored), seconds(&server));
    }

    #[test]
    fn test_restore_rejects_traversal() {
        let output = tempdir().unwrap();
        let target = tempdir().unwrap();
        let archive = output.path().join(SYSTEMD_CONF_BACKUP_FILE);

        let mut builder = Builder::new(File::create(&archive).unwrap());
        let data = b"evil";
        let mut header = Header::new_gnu();
        let name = b"../escape.service";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();
        let mut header = Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "etc/ok.service", &b"ok"[..]).unwrap();
        builder.into_inner().unwrap();
        create_checksum(&archive).unwrap();

        let runner = FakeRunner::new();
        let catalog = Catalog::default();
        let systemd = Systemd::new(&runner, "systemctl", target.path());
        let archiver = UnitArchiver::new(systemd, &catalog, "uyuni", target.path());

        let result = archiver.restore(output.path(), &Options::default());
        assert!(matches!(result, Err(PodbakError::PathTraversal { .. })));
        assert!(!target.path().parent().unwrap().join("escape.service").exists());
        // the valid entry is still restored
        assert!(target.path().join("etc/ok.service").exists());
    }

    #[test]
    fn test_restore_skips_other_entry_types() {
        let output = tempdir().unwrap();
        let target = tempdir().unwrap();
        let archive = output.path().join(SYSTEMD_CONF_BACKUP_FILE);

        let mut builder = Builder::new(File::create(&archive).unwrap());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_path("etc/link.service").unwrap();
        header.set_link_name("uyuni-server.service").unwrap();
        header.set_size(0);
        header.set_mode(0o777);
        header.set_cksum();
        builder.append(&header, io::empty()).unwrap();
        let mut header = Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        builder.append_data(&mut header, "etc/ok.service", &b"ok"[..]).unwrap();
        builder.into_inner().unwrap();
        create_checksum(&archive).unwrap();

        let runner = FakeRunner::new();
        let catalog = Catalog::default();
        let systemd = Systemd::new(&runner, "systemctl", target.path());
        let archiver = UnitArchiver::new(systemd, &catalog, "uyuni", target.path());

        archiver.restore(output.path(), &Options::default()).unwrap();
        assert!(fs::symlink_metadata(target.path().join("etc/link.service")).is_err());
        assert_eq!(fs::read(target.path().join("etc/ok.service")).unwrap(), b"ok");
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_survives_bad_attributes() {
        use std::os::unix::fs::PermissionsExt;

        let output = tempdir().unwrap();
        let target = tempdir().unwrap();
        let archive = output.path().join(SYSTEMD_CONF_BACKUP_FILE);

        // an owner id no chown can take
        let mut builder = Builder::new(File::create(&archive).unwrap());
        let mut header = Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o600);
        header.set_uid(u64::from(u32::MAX) + 1);
        header.set_gid(0);
        builder
            .append_data(&mut header, "etc/odd.service", &b"ok"[..])
            .unwrap();
        builder.into_inner().unwrap();
        create_checksum(&archive).unwrap();

        let runner = FakeRunner::new();
        let catalog = Catalog::default();
        let systemd = Systemd::new(&runner, "systemctl", target.path());
        let archiver = UnitArchiver::new(systemd, &catalog, "uyuni", target.path());

        archiver.restore(output.path(), &Options::default()).unwrap();
        let restored = target.path().join("etc/odd.service");
        assert_eq!(fs::read(&restored).unwrap(), b"ok");
        let mode = fs::metadata(&restored).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(runner.calls_matching("systemctl daemon-reload").len(), 1);
    }

    #[test]
    fn test_restore_missing_and_dry_run() {
        let source = tempdir().unwrap();
        let output = tempdir().unwrap();
        let target = tempdir().unwrap();
        install(source.path(), "uyuni-server.service", "[Unit]\n");

        let runner = FakeRunner::new();
        let catalog = Catalog::default();
        let systemd = Systemd::new(&runner, "systemctl", source.path());
        let archiver = UnitArchiver::new(systemd, &catalog, "uyuni", target.path());

        assert!(matches!(
            archiver.restore(output.path(), &Options::default()),
            Err(PodbakError::ArchiveMissing { .. })
        ));

        archiver.backup(output.path(), false).unwrap();
        let options = Options {
            dry_run: true,
            ..Options::default()
        };
        archiver.restore(output.path(), &options).unwrap();
        assert_eq!(fs::read_dir(target.path()).unwrap().count(), 0);
        assert!(runner.calls_matching("systemctl daemon-reload").is_empty());
    }

    #[test]
    fn test_generate_default_units() {
        let target = tempdir().unwrap();
        let runner = FakeRunner::new();
        let catalog = Catalog::default();
        let unit_dir = PathBuf::from("/etc/systemd/system");
        let systemd = Systemd::new(&runner, "systemctl", &unit_dir);
        let archiver = UnitArchiver::new(systemd, &catalog, "uyuni", target.path());

        archiver.generate_default_units(true).unwrap();
        assert!(fs::read_dir(target.path()).unwrap().next().is_none());
        assert!(runner.calls().is_empty());

        archiver.generate_default_units(false).unwrap();
        let server = fs::read_to_string(
            target.path().join("etc/systemd/system/uyuni-server.service"),
        )
        .unwrap();
        assert!(server.contains("Environment=IMAGE=registry.opensuse.org/uyuni/server:latest"));
        assert!(server.contains("-v etc-rhn:/etc/rhn"));
        assert!(!server.contains("var-pgsql"));
        assert!(server.contains("--network uyuni"));

        let db = fs::read_to_string(target.path().join("etc/systemd/system/uyuni-db.service"))
            .unwrap();
        assert!(db.contains("-v var-pgsql:/var/lib/pgsql"));
        assert!(!target
            .path()
            .join("etc/systemd/system/uyuni-hub-xmlrpc.service")
            .exists());
        assert_eq!(runner.calls(), vec!["systemctl daemon-reload"]);
    }
}
