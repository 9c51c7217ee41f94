//! Preconditions checked before any destructive action.

use crate::config::Config;
use crate::error::PodbakError;
use crate::runner::CommandRunner;
use crate::Result;
use std::fs;
use std::path::Path;
use tracing::warn;

/// A host carries an initialized server once the server unit is installed.
pub fn server_initialized(config: &Config) -> bool {
    config
        .unit_dir
        .join(format!("{}.service", config.server_service()))
        .exists()
}

fn require_runtime(runner: &dyn CommandRunner, config: &Config) -> Result<()> {
    if runner.resolve(&config.runtime).is_none() {
        return Err(PodbakError::RuntimeMissing {
            program: config.runtime.clone(),
        });
    }
    Ok(())
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

pub fn check_backup(runner: &dyn CommandRunner, config: &Config, output_dir: &Path) -> Result<()> {
    require_runtime(runner, config)?;

    if output_dir.exists() && !(output_dir.is_dir() && is_empty_dir(output_dir)?) {
        return Err(PodbakError::OutputNotEmpty {
            path: output_dir.to_path_buf(),
        });
    }

    if !server_initialized(config) {
        return Err(PodbakError::ServerNotInitialized);
    }

    Ok(())
}

pub fn check_restore(
    runner: &dyn CommandRunner,
    config: &Config,
    input_dir: &Path,
    force: bool,
) -> Result<()> {
    require_runtime(runner, config)?;

    if !input_dir.is_dir() {
        return Err(PodbakError::InputNotFound {
            path: input_dir.to_path_buf(),
        });
    }

    if server_initialized(config) {
        if force {
            warn!("Restoring over already initialized server");
        } else {
            return Err(PodbakError::ServerAlreadyInitialized);
        }
    }

    Ok(())
}
