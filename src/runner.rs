//! Subprocess execution behind a trait so every component can be driven by a fake.

use crate::error::PodbakError;
use crate::Result;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

pub trait CommandRunner {
    /// Run a command and return its stdout. A non-zero exit is an error.
    fn output(&self, program: &str, args: &[&str]) -> Result<Vec<u8>>;

    /// Run a command feeding `input` on stdin.
    fn run_with_input(&self, program: &str, args: &[&str], input: &[u8]) -> Result<()>;

    /// Find `program` on the executable search path.
    fn resolve(&self, program: &str) -> Option<PathBuf>;

    fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        self.output(program, args).map(|_| ())
    }

    /// Whether the command exits with status 0.
    fn succeeds(&self, program: &str, args: &[&str]) -> bool {
        self.output(program, args).is_ok()
    }
}

pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Runs real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

fn failure(program: &str, args: &[&str], output: &std::process::Output) -> PodbakError {
    PodbakError::Command {
        command: command_line(program, args),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

impl CommandRunner for SystemRunner {
    fn output(&self, program: &str, args: &[&str]) -> Result<Vec<u8>> {
        debug!("Running {}", command_line(program, args));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(failure(program, args, &output));
        }
        Ok(output.stdout)
    }

    fn run_with_input(&self, program: &str, args: &[&str], input: &[u8]) -> Result<()> {
        debug!("Running {} with input", command_line(program, args));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input)?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(failure(program, args, &output));
        }
        Ok(())
    }

    fn resolve(&self, program: &str) -> Option<PathBuf> {
        let candidate = PathBuf::from(program);
        if candidate.components().count() > 1 {
            return is_executable(&candidate).then_some(candidate);
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(program))
            .find(|p| is_executable(p))
    }
}

fn is_executable(path: &std::path::Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}
