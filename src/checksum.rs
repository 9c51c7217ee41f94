//! `sha256sum`-format sidecar files next to archive payloads.

use crate::error::PodbakError;
use crate::Result;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

pub const CHECKSUM_SUFFIX: &str = "sha256sum";

/// `<file>.sha256sum`
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(CHECKSUM_SUFFIX);
    PathBuf::from(name)
}

pub fn is_sidecar(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(CHECKSUM_SUFFIX))
        .unwrap_or(false)
}

pub fn file_digest(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Write the sidecar for `path` and return its location.
pub fn create_checksum(path: &Path) -> Result<PathBuf> {
    let digest = file_digest(path)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PodbakError::validation("Invalid archive filename"))?;
    let sidecar = sidecar_path(path);
    fs::write(&sidecar, format!("{digest}  {file_name}\n"))?;
    Ok(sidecar)
}

/// Compare `path` against its sidecar. A missing sidecar is its own error.
pub fn validate_checksum(path: &Path) -> Result<()> {
    let sidecar = sidecar_path(path);
    if !sidecar.exists() {
        return Err(PodbakError::ChecksumMissing {
            path: path.to_path_buf(),
        });
    }
    let content = fs::read_to_string(&sidecar)?;
    let expected = content
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    let actual = file_digest(path)?;
    if expected != actual {
        return Err(PodbakError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}
