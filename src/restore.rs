use crate::backup::{service_units, RunContext, RunReport};
use crate::config::Config;
use crate::error::{Direction, Outcome, PodbakError};
use crate::image::ImageArchiver;
use crate::netconfig::RuntimeConfigArchiver;
use crate::options::Options;
use crate::plan;
use crate::podman::Podman;
use crate::progress::{ProgressConfig, StepProgress};
use crate::runner::CommandRunner;
use crate::sanity;
use crate::service::ServiceController;
use crate::systemd::Systemd;
use crate::units::UnitArchiver;
use crate::volume::VolumeArchiver;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Runs the restore pipeline from one backup directory.
pub struct RestoreOrchestrator<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a Config,
    progress: ProgressConfig,
}

impl<'a> RestoreOrchestrator<'a> {
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

    pub fn run(&self, input_dir: &Path, options: &Options) -> RunReport {
        let start_time = Instant::now();
        debug!(
            "Restoring from {} with options {:?}",
            input_dir.display(),
            options
        );

        let mut report = RunReport::new(Direction::Restore, input_dir, options.dry_run);
        report.outcome = self.execute(input_dir, options, &mut report);
        report.duration = start_time.elapsed();
        report
    }

    fn execute(&self, input_dir: &Path, options: &Options, report: &mut RunReport) -> Outcome {
        let config = self.config;
        let dry_run = options.dry_run;
        let podman = Podman::new(self.runner, &config.runtime);
        let systemd = Systemd::new(self.runner, &config.service_manager, &config.unit_dir);

        if let Err(e) = sanity::check_restore(self.runner, config, input_dir, options.force) {
            return Outcome::FatalNoData(e);
        }

        let volumes = match plan::volumes_to_restore(input_dir, options, &config.catalog, &podman) {
            Ok(volumes) => volumes,
            Err(e) => return Outcome::FatalNoData(e),
        };
        let images = match plan::images_to_restore(input_dir, options) {
            Ok(images) => images,
            Err(e) => return Outcome::FatalNoData(e),
        };

        let mut services = ServiceController::new(systemd, service_units(config));
        let with_database = volumes
            .iter()
            .any(|v| config.catalog.is_database_volume(&v.name));
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
        let outcome = self.restore_all(&context, input_dir, &volumes, &images, report);

        let restarted = services.stopped_any() && !options.no_restart;
        let outcome = match services.finish(options.no_restart) {
            Ok(()) => outcome,
            Err(e) => outcome.with_warning(e),
        };
        if !restarted && !dry_run && !outcome.abort() {
            info!(
                "Start the restored deployment with: {} start {}",
                config.service_manager,
                config.server_service()
            );
        }
        outcome
    }

    fn restore_all(
        &self,
        context: &RunContext,
        input_dir: &Path,
        volumes: &[plan::VolumeArchive],
        images: &[PathBuf],
        report: &mut RunReport,
    ) -> Outcome {
        let RunContext {
            podman,
            systemd,
            options,
        } = *context;
        let config = self.config;
        let dry_run = options.dry_run;
        let verify = !options.skip_verify;
        let volume_archiver = VolumeArchiver::from_catalog(podman, &config.catalog);
        let image_archiver = ImageArchiver::new(podman);
        let mut progress = StepProgress::new(&self.progress, volumes.len() + images.len());

        info!("Restoring container volumes");
        // every volume gets its chance before the run is declared broken
        let mut failures = Vec::new();
        for volume in volumes {
            progress.start_step(&format!("volume {}", volume.name));
            match volume_archiver.import(volume, verify, dry_run) {
                Ok(()) => report.volumes.push(volume.name.clone()),
                Err(e) => {
                    warn!("Failed to restore volume {}: {e}", volume.name);
                    failures.push(e);
                }
            }
            progress.finish_step();
        }
        if let Some(e) = PodbakError::join(failures) {
            progress.finish();
            return Outcome::FatalDataRemains(e);
        }

        let mut warnings = Vec::new();
        info!("Restoring container images");
        for image in images {
            progress.start_step(&format!("image {}", image.display()));
            match image_archiver.import(image, verify, dry_run) {
                Ok(()) => report.images.push(image.display().to_string()),
                Err(e) => {
                    warn!("Failed to restore image {}: {e}", image.display());
                    warnings.push(e);
                }
            }
            progress.finish_step();
        }
        progress.finish();

        let units = UnitArchiver::new(systemd, &config.catalog, &config.network, &config.restore_root);
        let runtime = RuntimeConfigArchiver::new(podman, &config.network, &config.secrets_store);

        if options.skip_config {
            info!("Skipping configuration restore, using defaults");
            if let Err(e) = runtime.default_network(options) {
                warnings.push(e);
            }
            if let Err(e) = units.generate_default_units(dry_run) {
                warnings.push(e);
            }
            return Outcome::from_warnings(warnings);
        }

        match units.restore(input_dir, options) {
            Ok(()) => {}
            Err(e @ PodbakError::ArchiveMissing { .. }) => {
                warn!("{e}, the default units will be used");
                warnings.push(e);
                if let Err(e) = units.generate_default_units(dry_run) {
                    warnings.push(e);
                }
            }
            Err(e) => {
                warn!("Service units were not fully restored: {e}");
                warnings.push(e);
            }
        }

        info!("Restoring runtime configuration");
        if let Err(e) = runtime.restore(input_dir, options) {
            warn!("Runtime configuration was not fully restored: {e}");
            warnings.push(e);
        }

        Outcome::from_warnings(warnings)
    }
}
