use crate::catalog::ImageSpec;
use crate::config::Config;
use crate::error::{Direction, Outcome, PodbakError};
use crate::image::ImageArchiver;
use crate::netconfig::RuntimeConfigArchiver;
use crate::options::Options;
use crate::plan::{self, IMAGES_SUBDIR, VOLUMES_SUBDIR};
use crate::podman::Podman;
use crate::progress::{ProgressConfig, StepProgress};
use crate::runner::CommandRunner;
use crate::sanity;
use crate::service::ServiceController;
use crate::storage::{self, calculate_size, format_size};
use crate::systemd::Systemd;
use crate::units::UnitArchiver;
use crate::volume::VolumeArchiver;
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What a backup or restore run did, and how it ended.
#[derive(Debug)]
pub struct RunReport {
    pub direction: Direction,
    pub directory: PathBuf,
    pub dry_run: bool,
    /// Volumes exported or imported, in processing order.
    pub volumes: Vec<String>,
    /// Image references saved, or image archives loaded.
    pub images: Vec<String>,
    pub total_size: u64,
    pub duration: Duration,
    pub outcome: Outcome,
}

impl RunReport {
    pub fn new(direction: Direction, directory: &Path, dry_run: bool) -> Self {
        Self {
            direction,
            directory: directory.to_path_buf(),
            dry_run,
            volumes: Vec::new(),
            images: Vec::new(),
            total_size: 0,
            duration: Duration::from_secs(0),
            outcome: Outcome::Success,
        }
    }

    pub fn summary(&self) -> String {
        let verb = match (self.direction, self.dry_run) {
            (Direction::Backup, false) => "Created backup",
            (Direction::Backup, true) => "Would create backup",
            (Direction::Restore, false) => "Restored backup",
            (Direction::Restore, true) => "Would restore backup",
        };
        if self.total_size > 0 {
            format!(
                "{verb}: {} ({} volumes, {} images, {})",
                self.directory.display(),
                self.volumes.len(),
                self.images.len(),
                format_size(self.total_size)
            )
        } else {
            format!(
                "{verb}: {} ({} volumes, {} images)",
                self.directory.display(),
                self.volumes.len(),
                self.images.len()
            )
        }
    }
}

/// Runtime handles and flags shared by the phases of one run.
pub(crate) struct RunContext<'r> {
    pub podman: Podman<'r>,
    pub systemd: Systemd<'r>,
    pub options: &'r Options,
}

/// Runs the backup pipeline against one output directory.
pub struct BackupOrchestrator<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a Config,
    progress: ProgressConfig,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a Config) -> Self {
        Self {
            runner,
            config,
            progress: ProgressConfig::disabled(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressConfig) -> Self {
        self.progress = progress;
        self
    }

    pub fn run(&self, output_dir: &Path, options: &Options) -> RunReport {
        let start_time = Instant::now();
        print_intro(output_dir, options);

        let mut report = RunReport::new(Direction::Backup, output_dir, options.dry_run);
        report.outcome = self.execute(output_dir, options, &mut report);
        if !options.dry_run && output_dir.exists() {
            report.total_size = calculate_size(output_dir).unwrap_or(0);
        }
        report.duration = start_time.elapsed();

        if !report.outcome.abort() {
            info!("Backup finished into {}", output_dir.display());
        }
        report
    }

    fn execute(&self, output_dir: &Path, options: &Options, report: &mut RunReport) -> Outcome {
        let config = self.config;
        let dry_run = options.dry_run;
        let podman = Podman::new(self.runner, &config.runtime);
        let systemd = Systemd::new(self.runner, &config.service_manager, &config.unit_dir);

        if let Err(e) = sanity::check_backup(self.runner, config, output_dir) {
            return Outcome::FatalNoData(e);
        }
        if let Err(e) = prepare_output_dirs(output_dir, dry_run) {
            return Outcome::FatalNoData(e);
        }

        let volumes = plan::volumes_to_backup(&config.catalog, options);
        let images = plan::images_to_backup(&config.catalog, options.skip_images);
        debug!("Volumes to back up: {}", volumes.join(", "));

        if !dry_run {
            if let Err(e) = storage::check_space(
                &podman,
                &volumes,
                &images,
                output_dir,
                config.space_margin_percent,
            ) {
                return Outcome::FatalNoData(e);
            }
        }

        // the database is only consistent on disk while its service is down
        let mut services = ServiceController::new(systemd, service_units(config));
        let with_database = volumes.iter().any(|v| config.catalog.is_database_volume(v));
        if with_database {
            if dry_run {
                info!("Would stop the server services");
            } else if let Err(e) = services.stop() {
                let outcome = Outcome::FatalNoData(e);
                return match services.finish(options.no_restart) {
                    Ok(()) => outcome,
                    Err(e) => outcome.with_warning(e),
                };
            }
        }

        let context = RunContext {
            podman,
            systemd,
            options,
        };
        let outcome = self.archive(&context, output_dir, &volumes, &images, report);

        match services.finish(options.no_restart) {
            Ok(()) => outcome,
            Err(e) => outcome.with_warning(e),
        }
    }

    fn archive(
        &self,
        context: &RunContext,
        output_dir: &Path,
        volumes: &[String],
        images: &[ImageSpec],
        report: &mut RunReport,
    ) -> Outcome {
        let options = context.options;
        let dry_run = options.dry_run;
        let volume_archiver = VolumeArchiver::new(context.podman);
        let image_archiver = ImageArchiver::new(context.podman);
        let mut progress = StepProgress::new(&self.progress, volumes.len() + images.len());

        info!("Backing up container volumes");
        for volume in volumes {
            progress.start_step(&format!("volume {volume}"));
            if let Err(e) = volume_archiver.export(volume, output_dir, dry_run) {
                progress.finish();
                return Outcome::FatalDataRemains(e);
            }
            report.volumes.push(volume.clone());
            progress.finish_step();
        }

        info!("Backing up container images");
        for image in images {
            progress.start_step(&format!("image {}", image.name));
            match image_archiver.export(image, output_dir, dry_run) {
                Ok(Some(_)) => report.images.push(image.reference()),
                Ok(None) => {}
                Err(e) => {
                    progress.finish();
                    return Outcome::FatalDataRemains(e);
                }
            }
            progress.finish_step();
        }
        progress.finish();

        if options.skip_config {
            info!("Skipping configuration backup");
            return Outcome::Success;
        }

        // restore falls back to defaults for anything missing here
        let mut warnings = Vec::new();
        let config = self.config;
        info!("Backing up service units");
        let units = UnitArchiver::new(context.systemd, &config.catalog, &config.network, &config.restore_root);
        if let Err(e) = units.backup(output_dir, dry_run) {
            warn!("Service units were not backed up: {e}");
            warnings.push(e);
        }

        info!("Backing up runtime configuration");
        let runtime = RuntimeConfigArchiver::new(context.podman, &config.network, &config.secrets_store);
        if let Err(e) = runtime.backup(output_dir, dry_run) {
            warn!("Runtime configuration was not backed up: {e}");
            warnings.push(e);
        }

        Outcome::from_warnings(warnings)
    }
}

/// Server first, then its database: the order they are stopped in.
pub fn service_units(config: &Config) -> Vec<String> {
    let mut units = vec![config.server_service().to_string()];
    if let Some(database) = config.database_service() {
        units.push(database.to_string());
    }
    units
}

fn prepare_output_dirs(output_dir: &Path, dry_run: bool) -> Result<()> {
    for dir in [
        output_dir.to_path_buf(),
        output_dir.join(VOLUMES_SUBDIR),
        output_dir.join(IMAGES_SUBDIR),
    ] {
        if dry_run {
            info!("Would create '{}' directory", dir.display());
            continue;
        }
        fs::create_dir_all(&dir).map_err(|e| {
            PodbakError::validation(format!(
                "Unable to create output directory {}: {e}",
                dir.display()
            ))
        })?;
    }
    Ok(())
}

fn print_intro(output_dir: &Path, options: &Options) {
    debug!("Creating backup with options:");
    debug!("output directory: {}", output_dir.display());
    debug!("dry run: {}", options.dry_run);
    debug!("skip database: {}", options.skip_database);
    debug!("skip config: {}", options.skip_config);
    debug!("skip restart: {}", options.no_restart);
    debug!("skip images: {}", options.skip_images);
    debug!("skip volumes: {:?}", options.skip_volumes);
    debug!("extra volumes: {:?}", options.extra_volumes);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::{Catalog, ServiceRole, VolumeSpec};
    use crate::checksum::sidecar_path;
    use crate::netconfig::PODMAN_CONF_BACKUP_FILE;
    use crate::options::SkipVolumes;
    use crate::runner::fake::FakeRunner;
    use crate::units::SYSTEMD_CONF_BACKUP_FILE;
    use tempfile::{tempdir, TempDir};

    pub(crate) const NETWORK_JSON: &str = r#"[{"name": "uyuni", "network_interface": "podman1",
        "subnets": [{"subnet": "10.89.1.0/24", "gateway": "10.89.1.1"}]}]"#;

    pub(crate) fn synthetic_catalog() -> Catalog {
        let defaults = Catalog::default();
        Catalog {
            volumes: vec![
                VolumeSpec::new("etc-rhn", "/etc/rhn"),
                VolumeSpec::new("var-pgsql", "/var/lib/pgsql"),
                VolumeSpec::new("var-log", "/var/log"),
            ],
            database_volumes: vec!["var-pgsql".to_string()],
            services: defaults
                .services
                .into_iter()
                .filter(|s| s.role != ServiceRole::Auxiliary)
                .collect(),
        }
    }

    /// A host with an installed server and one runtime secret.
    pub(crate) fn host(root: &Path, installed: bool) -> Config {
        let unit_dir = root.join("units");
        fs::create_dir_all(&unit_dir).unwrap();
        if installed {
            fs::write(unit_dir.join("uyuni-server.service"), "[Unit]\n").unwrap();
            fs::write(unit_dir.join("uyuni-db.service"), "[Unit]\n").unwrap();
        }
        let secrets_store = root.join("secretsdata.json");
        fs::write(&secrets_store, r#"{"id1": "dXNlcg=="}"#).unwrap();
        Config {
            unit_dir,
            secrets_store,
            restore_root: root.join("restored"),
            catalog: synthetic_catalog(),
            ..Config::default()
        }
    }

    pub(crate) fn host_runner() -> FakeRunner {
        let runner = FakeRunner::new();
        runner.respond("podman network inspect uyuni", NETWORK_JSON);
        runner.respond("podman secret ls", "db-user:id1,");
        runner
    }

    fn setup() -> (TempDir, Config, PathBuf) {
        let dir = tempdir().unwrap();
        let config = host(dir.path(), true);
        let output = dir.path().join("backup");
        (dir, config, output)
    }

    #[test]
    fn test_backup_creates_layout() {
        let (_dir, config, output) = setup();
        let runner = host_runner();

        let report = BackupOrchestrator::new(&runner, &config).run(&output, &Options::default());
        assert!(report.outcome.is_success(), "{:?}", report.outcome);
        assert_eq!(report.volumes, vec!["etc-rhn", "var-pgsql", "var-log"]);
        assert_eq!(report.images.len(), 2);

        for volume in &report.volumes {
            let archive = output.join("volumes").join(format!("{volume}.tar"));
            assert!(archive.exists());
            assert!(sidecar_path(&archive).exists());
        }
        assert!(output.join("images").join("server.tar").exists());
        assert!(output.join("images").join("uyuni-db.tar").exists());
        for archive in [PODMAN_CONF_BACKUP_FILE, SYSTEMD_CONF_BACKUP_FILE] {
            assert!(output.join(archive).exists());
            assert!(sidecar_path(&output.join(archive)).exists());
        }
        assert!(report.total_size > 0);
        assert!(report.summary().starts_with("Created backup:"));
        assert!(report.summary().contains("3 volumes, 2 images"));
    }

    #[test]
    fn test_services_stopped_around_volumes() {
        let (_dir, config, output) = setup();
        let runner = host_runner();
        runner.succeed("systemctl is-active");

        let report = BackupOrchestrator::new(&runner, &config).run(&output, &Options::default());
        assert!(report.outcome.is_success());

        let calls = runner.calls();
        let last = |prefix: &str| calls.iter().rposition(|c| c.starts_with(prefix)).unwrap();
        let stop_db = runner.position("systemctl stop uyuni-db").unwrap();
        assert!(runner.position("systemctl stop uyuni-server").unwrap() < stop_db);
        assert!(stop_db < runner.position("podman volume export").unwrap());

        let start_db = runner.position("systemctl start uyuni-db").unwrap();
        let start_server = runner.position("systemctl start uyuni-server").unwrap();
        assert!(last("podman volume export") < start_db);
        assert!(last("podman image save") < start_db);
        assert!(start_db < start_server);
    }

    #[test]
    fn test_no_stop_without_database() {
        let (_dir, config, output) = setup();
        let runner = host_runner();
        runner.succeed("systemctl is-active");
        let options = Options {
            skip_database: true,
            ..Options::default()
        };

        let report = BackupOrchestrator::new(&runner, &config).run(&output, &options);
        assert!(report.outcome.is_success());
        assert_eq!(report.volumes, vec!["etc-rhn", "var-log"]);
        assert!(runner.calls_matching("systemctl stop").is_empty());
        assert!(runner.calls_matching("systemctl start").is_empty());
    }

    #[test]
    fn test_no_restart() {
        let (_dir, config, output) = setup();
        let runner = host_runner();
        runner.succeed("systemctl is-active");
        let options = Options {
            no_restart: true,
            ..Options::default()
        };

        let report = BackupOrchestrator::new(&runner, &config).run(&output, &options);
        assert!(report.outcome.is_success());
        assert_eq!(runner.calls_matching("systemctl stop").len(), 2);
        assert!(runner.calls_matching("systemctl start").is_empty());
    }

    #[test]
    fn test_dry_run_makes_no_changes() {
        let (_dir, config, output) = setup();
        let runner = host_runner();
        runner.succeed("systemctl is-active");
        let options = Options {
            dry_run: true,
            ..Options::default()
        };

        let report = BackupOrchestrator::new(&runner, &config).run(&output, &options);
        assert!(report.outcome.is_success());
        assert!(!output.exists());
        assert_eq!(report.volumes, vec!["etc-rhn", "var-pgsql", "var-log"]);
        assert_eq!(report.images.len(), 2);
        for prefix in [
            "systemctl stop",
            "systemctl start",
            "podman volume export",
            "podman image save",
            "podman network inspect",
            "podman secret",
        ] {
            assert!(runner.calls_matching(prefix).is_empty(), "{prefix} was called");
        }
        assert!(report.summary().starts_with("Would create backup:"));
    }

    #[test]
    fn test_volume_failure_keeps_data_and_restarts() {
        let (_dir, config, output) = setup();
        let runner = host_runner();
        runner.succeed("systemctl is-active");
        runner.fail("podman volume export var-pgsql");

        let report = BackupOrchestrator::new(&runner, &config).run(&output, &Options::default());
        assert!(report.outcome.abort());
        assert!(report.outcome.data_remains());
        assert_eq!(report.volumes, vec!["etc-rhn"]);
        assert!(output.join("volumes").join("etc-rhn.tar").exists());
        assert!(runner.calls_matching("podman volume export var-log").is_empty());
        assert!(runner.calls_matching("podman image save").is_empty());
        assert_eq!(runner.calls_matching("systemctl start").len(), 2);
    }

    #[test]
    fn test_image_failure_aborts_with_data() {
        let (_dir, config, output) = setup();
        let runner = host_runner();
        runner.fail("podman image save");

        let report = BackupOrchestrator::new(&runner, &config).run(&output, &Options::default());
        assert!(report.outcome.data_remains());
        assert!(!output.join(SYSTEMD_CONF_BACKUP_FILE).exists());
    }

    #[test]
    fn test_missing_image_is_not_fatal() {
        let (_dir, config, output) = setup();
        let runner = host_runner();
        runner.fail("podman image exists registry.opensuse.org/uyuni/uyuni-db");

        let report = BackupOrchestrator::new(&runner, &config).run(&output, &Options::default());
        assert!(report.outcome.is_success());
        assert_eq!(
            report.images,
            vec!["registry.opensuse.org/uyuni/server:latest"]
        );
    }

    #[test]
    fn test_sanity_failure_writes_nothing() {
        let (_dir, config, output) = setup();
        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("leftover"), "x").unwrap();
        let runner = host_runner();

        let report = BackupOrchestrator::new(&runner, &config).run(&output, &Options::default());
        assert!(matches!(
            report.outcome,
            Outcome::FatalNoData(PodbakError::OutputNotEmpty { .. })
        ));
        assert!(!output.join("volumes").exists());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_skip_config_and_extras() {
        let (_dir, config, output) = setup();
        let runner = host_runner();
        let options = Options {
            skip_config: true,
            skip_images: true,
            skip_volumes: SkipVolumes::from_list(vec!["all".to_string()]),
            extra_volumes: vec!["custom-data".to_string()],
            ..Options::default()
        };

        let report = BackupOrchestrator::new(&runner, &config).run(&output, &options);
        assert!(report.outcome.is_success());
        assert_eq!(report.volumes, vec!["custom-data"]);
        assert!(report.images.is_empty());
        assert!(!output.join(PODMAN_CONF_BACKUP_FILE).exists());
        assert!(!output.join(SYSTEMD_CONF_BACKUP_FILE).exists());
    }

    #[test]
    fn test_failed_restart_is_a_warning() {
        let (_dir, config, output) = setup();
        let runner = host_runner();
        runner.succeed("systemctl is-active");
        runner.fail("systemctl start uyuni-server");

        let report = BackupOrchestrator::new(&runner, &config).run(&output, &Options::default());
        assert!(matches!(report.outcome, Outcome::RecoverableWarning(_)));
        assert_eq!(report.outcome.exit_code(), 4);
    }
}
