use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PodbakError {
    #[error("Container runtime '{program}' not found in PATH")]
    RuntimeMissing { program: String },

    #[error("Output directory {path} already exists and is not empty")]
    OutputNotEmpty { path: PathBuf },

    #[error("Input directory {path} does not exist")]
    InputNotFound { path: PathBuf },

    #[error("Server is not initialized")]
    ServerNotInitialized,

    #[error("Server is already initialized. Use force to overwrite")]
    ServerAlreadyInitialized,

    #[error("Insufficient disk space: need {needed} bytes, have {available}")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("Command '{command}' failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Checksum file missing for {path}")]
    ChecksumMissing { path: PathBuf },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Volume {name} already exists, not restoring unless forced")]
    VolumeExists { name: String },

    #[error("No {kind} found in the backup at {path}")]
    NothingInBackup { kind: &'static str, path: PathBuf },

    #[error("Network {name} already exists")]
    NetworkExists { name: String },

    #[error("Secret {name} already exists, not restoring unless forced")]
    SecretExists { name: String },

    #[error("Invalid network data: {message}")]
    InvalidNetworkData { message: String },

    #[error("Path traversal attempt detected: {path}")]
    PathTraversal { path: PathBuf },

    #[error("Archive {path} not found")]
    ArchiveMissing { path: PathBuf },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("{}", join_errors(.0))]
    Multiple(Vec<PodbakError>),
}

fn join_errors(errors: &[PodbakError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl PodbakError {
    /// Create a configuration error with a custom message
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a validation error with a custom message
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Fold a list of errors into one. `None` when the list is empty.
    pub fn join(mut errors: Vec<PodbakError>) -> Option<PodbakError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(PodbakError::Multiple(errors)),
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PodbakError::Validation { .. } => 2,
            PodbakError::Config { .. } => 2,
            _ => 1,
        }
    }

    /// Provide helpful suggestions for resolving the error
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            PodbakError::RuntimeMissing { program } => {
                vec![format!("Install {program} before running this command")]
            }
            PodbakError::OutputNotEmpty { .. } => vec![
                "Choose a new or empty output directory".to_string(),
                "Remove the previous backup first".to_string(),
            ],
            PodbakError::InsufficientSpace { .. } => vec![
                "Free up disk space".to_string(),
                "Choose a different backup location".to_string(),
                "Skip images with --skip-images".to_string(),
            ],
            PodbakError::ServerAlreadyInitialized => {
                vec!["Use --force to restore over the existing server".to_string()]
            }
            PodbakError::VolumeExists { .. } => vec![
                "Use --continue to skip volumes already present".to_string(),
                "Use --force to overwrite existing volumes".to_string(),
            ],
            PodbakError::ChecksumMismatch { .. } | PodbakError::ChecksumMissing { .. } => vec![
                "Check the backup was copied completely".to_string(),
                "Use --skip-verify to restore without verification".to_string(),
            ],
            _ => vec![],
        }
    }
}

/// Which pipeline produced an [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Backup,
    Restore,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Backup => write!(f, "backup"),
            Direction::Restore => write!(f, "restore"),
        }
    }
}

/// Final classification of a backup or restore run.
///
/// Built once at the orchestrator boundary. `FatalNoData` and
/// `FatalDataRemains` mean the pipeline stopped early; the latter means
/// partially written output must be kept for manual recovery.
#[derive(Debug)]
pub enum Outcome {
    Success,
    RecoverableWarning(PodbakError),
    FatalNoData(PodbakError),
    FatalDataRemains(PodbakError),
}

impl Outcome {
    /// Success when nothing went wrong, otherwise a warning carrying every error.
    pub fn from_warnings(errors: Vec<PodbakError>) -> Self {
        match PodbakError::join(errors) {
            None => Outcome::Success,
            Some(err) => Outcome::RecoverableWarning(err),
        }
    }

    /// Fold a late error into the outcome. A fatal outcome keeps its cause.
    pub fn with_warning(self, error: PodbakError) -> Self {
        match self {
            Outcome::Success => Outcome::RecoverableWarning(error),
            Outcome::RecoverableWarning(PodbakError::Multiple(mut errors)) => {
                errors.push(error);
                Outcome::RecoverableWarning(PodbakError::Multiple(errors))
            }
            Outcome::RecoverableWarning(previous) => {
                Outcome::RecoverableWarning(PodbakError::Multiple(vec![previous, error]))
            }
            fatal => {
                tracing::warn!("{error}");
                fatal
            }
        }
    }

    pub fn abort(&self) -> bool {
        matches!(self, Outcome::FatalNoData(_) | Outcome::FatalDataRemains(_))
    }

    pub fn data_remains(&self) -> bool {
        matches!(self, Outcome::FatalDataRemains(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn error(&self) -> Option<&PodbakError> {
        match self {
            Outcome::Success => None,
            Outcome::RecoverableWarning(e)
            | Outcome::FatalNoData(e)
            | Outcome::FatalDataRemains(e) => Some(e),
        }
    }

    /// The message shown to the user for this outcome.
    pub fn user_message(&self, direction: Direction, dir: &Path) -> Option<String> {
        match (self, direction) {
            (Outcome::Success, _) => None,
            (Outcome::FatalDataRemains(_), Direction::Backup) => Some(format!(
                "Backup aborted, partially backed up files remain in '{}'",
                dir.display()
            )),
            (Outcome::FatalDataRemains(_), Direction::Restore) => Some(
                "Restore aborted with partially restored files. Resolve the error and try again"
                    .to_string(),
            ),
            (Outcome::RecoverableWarning(_), Direction::Backup) => Some(
                "Important data were backed up successfully, but errors were present. \
                 Restore will use default values where needed"
                    .to_string(),
            ),
            (Outcome::RecoverableWarning(_), Direction::Restore) => {
                Some("Important data were restored successfully, but with warnings".to_string())
            }
            (Outcome::FatalNoData(e), _) => Some(e.to_string()),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::FatalDataRemains(_) => 3,
            Outcome::RecoverableWarning(_) => 4,
            Outcome::FatalNoData(e) => e.exit_code(),
        }
    }
}
