pub mod backup;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod error;
pub mod image;
pub mod netconfig;
pub mod options;
pub mod plan;
pub mod podman;
pub mod progress;
pub mod restore;
pub mod runner;
pub mod sanity;
pub mod service;
pub mod storage;
pub mod systemd;
pub mod units;
pub mod volume;

pub use backup::{BackupOrchestrator, RunReport};
pub use catalog::{Catalog, ImageSpec, ServiceSpec, VolumeSpec};
pub use config::{default_config, dump_config, load_config, load_config_from, Config};
pub use error::{Direction, Outcome, PodbakError};
pub use options::{Options, SkipVolumes};
pub use progress::ProgressConfig;
pub use restore::RestoreOrchestrator;
pub use runner::{CommandRunner, SystemRunner};
pub use storage::{calculate_size, format_size};

/// Main library result type
pub type Result<T> = std::result::Result<T, PodbakError>;
