//! Typed calls into the container runtime CLI.

use crate::error::PodbakError;
use crate::runner::CommandRunner;
use crate::Result;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy)]
pub struct Podman<'a> {
    runner: &'a dyn CommandRunner,
    program: &'a str,
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl<'a> Podman<'a> {
    pub fn new(runner: &'a dyn CommandRunner, program: &'a str) -> Self {
        Self { runner, program }
    }

    pub fn program(&self) -> &str {
        self.program
    }

    pub fn runner(&self) -> &'a dyn CommandRunner {
        self.runner
    }

    pub fn output(&self, args: &[&str]) -> Result<Vec<u8>> {
        self.runner.output(self.program, args)
    }

    pub fn run(&self, args: &[&str]) -> Result<()> {
        self.runner.run(self.program, args)
    }

    pub fn run_with_input(&self, args: &[&str], input: &[u8]) -> Result<()> {
        self.runner.run_with_input(self.program, args, input)
    }

    fn output_string(&self, args: &[&str]) -> Result<String> {
        let out = self.output(args)?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    pub fn volume_exists(&self, name: &str) -> bool {
        self.runner
            .succeeds(self.program, &["volume", "exists", name])
    }

    pub fn create_volume(&self, name: &str) -> Result<()> {
        self.run(&["volume", "create", name])
    }

    pub fn remove_volume(&self, name: &str) -> Result<()> {
        self.run(&["volume", "rm", "--force", name])
    }

    pub fn export_volume(&self, name: &str, output: &Path) -> Result<()> {
        let output = path_arg(output);
        self.run(&["volume", "export", name, "--output", &output])
    }

    pub fn import_volume(&self, name: &str, archive: &Path) -> Result<()> {
        let archive = path_arg(archive);
        self.run(&["volume", "import", name, &archive])
    }

    pub fn volume_mountpoint(&self, name: &str) -> Result<PathBuf> {
        let out = self.output_string(&["volume", "inspect", "--format", "{{.Mountpoint}}", name])?;
        if out.is_empty() {
            return Err(PodbakError::validation(format!(
                "No mountpoint reported for volume {name}"
            )));
        }
        Ok(PathBuf::from(out))
    }

    pub fn image_exists(&self, reference: &str) -> bool {
        self.runner
            .succeeds(self.program, &["image", "exists", reference])
    }

    pub fn image_size(&self, reference: &str) -> Result<u64> {
        let out = self.output_string(&["image", "inspect", "--format", "{{.Size}}", reference])?;
        out.parse()
            .map_err(|_| PodbakError::validation(format!("Unexpected image size '{out}'")))
    }

    pub fn save_image(&self, reference: &str, output: &Path) -> Result<()> {
        let output = path_arg(output);
        self.run(&["image", "save", "--quiet", "-o", &output, reference])
    }

    pub fn load_image(&self, archive: &Path) -> Result<()> {
        let archive = path_arg(archive);
        self.run(&["image", "load", "--quiet", "-i", &archive])
    }

    pub fn network_exists(&self, name: &str) -> bool {
        self.runner
            .succeeds(self.program, &["network", "exists", name])
    }

    pub fn inspect_network(&self, name: &str) -> Result<Vec<u8>> {
        self.output(&["network", "inspect", name])
    }

    pub fn remove_network(&self, name: &str) -> Result<()> {
        self.run(&["network", "rm", "--force", name])
    }

    pub fn network_backend(&self) -> Result<String> {
        self.output_string(&["info", "--format", "{{.Host.NetworkBackend}}"])
    }

    /// `name:id,` pairs for every runtime-managed secret.
    pub fn list_secrets(&self) -> Result<Vec<(String, String)>> {
        let out = self.output_string(&[
            "secret",
            "ls",
            "--format",
            "{{range .}}{{.Name}}:{{.ID}},{{end}}",
        ])?;
        Ok(out
            .split(',')
            .filter_map(|pair| pair.trim().split_once(':'))
            .map(|(name, id)| (name.to_string(), id.to_string()))
            .collect())
    }

    pub fn secret_exists(&self, name: &str) -> bool {
        self.runner
            .succeeds(self.program, &["secret", "exists", name])
    }

    pub fn create_secret(&self, name: &str, value: &[u8], replace: bool) -> Result<()> {
        let mut args = vec!["secret", "create"];
        if replace {
            args.push("--replace");
        }
        args.push(name);
        args.push("-");
        self.run_with_input(&args, value)
    }
}
