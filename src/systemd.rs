//! Typed calls into the service manager CLI.

use crate::runner::CommandRunner;
use crate::Result;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy)]
pub struct Systemd<'a> {
    runner: &'a dyn CommandRunner,
    program: &'a str,
    unit_dir: &'a Path,
}

impl<'a> Systemd<'a> {
    pub fn new(runner: &'a dyn CommandRunner, program: &'a str, unit_dir: &'a Path) -> Self {
        Self {
            runner,
            program,
            unit_dir,
        }
    }

    pub fn unit_dir(&self) -> &Path {
        self.unit_dir
    }

    /// `<unit_dir>/<name>.service`
    pub fn service_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{name}.service"))
    }

    /// `<unit_dir>/<name>.service.d`
    pub fn drop_in_dir(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{name}.service.d"))
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.runner
            .succeeds(self.program, &["is-active", "--quiet", name])
    }

    pub fn stop(&self, name: &str) -> Result<()> {
        self.runner.run(self.program, &["stop", name])
    }

    pub fn start(&self, name: &str) -> Result<()> {
        self.runner.run(self.program, &["start", name])
    }

    pub fn daemon_reload(&self) -> Result<()> {
        self.runner.run(self.program, &["daemon-reload"])
    }

    /// Unit file backing `name`, `None` when the unit is not installed.
    pub fn fragment_path(&self, name: &str) -> Option<PathBuf> {
        let unit = format!("{name}.service");
        let out = self
            .runner
            .output(self.program, &["show", "-p", "FragmentPath", "--value", &unit])
            .ok()?;
        let path = String::from_utf8_lossy(&out).trim().to_string();
        if path.is_empty() {
            None
        } else {
            Some(PathBuf::from(path))
        }
    }

    /// Instance names (`name@N`) of a template unit.
    pub fn template_instances(&self, template: &str) -> Vec<String> {
        let pattern = format!("{template}*.service");
        let out = match self.runner.output(
            self.program,
            &["list-units", "--all", "--plain", "--no-legend", &pattern],
        ) {
            Ok(out) => out,
            Err(_) => return Vec::new(),
        };
        String::from_utf8_lossy(&out)
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter_map(|unit| unit.strip_suffix(".service"))
            .filter(|unit| unit.len() > template.len())
            .map(|unit| unit.to_string())
            .collect()
    }
}
