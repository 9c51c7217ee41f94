use std::io::IsTerminal;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub enabled: bool,
    pub is_interactive: bool,
    /// Runs with fewer steps than this show no bar.
    pub min_steps_threshold: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            is_interactive: std::io::stderr().is_terminal(),
            min_steps_threshold: 2,
        }
    }
}

impl ProgressConfig {
    pub fn auto_detect() -> Self {
        // Disable in CI environments
        if is_ci_environment() {
            Self {
                enabled: false,
                is_interactive: false,
                ..Self::default()
            }
        } else {
            Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            is_interactive: false,
            min_steps_threshold: 0,
        }
    }

    pub fn should_show_progress(&self, steps: usize) -> bool {
        self.enabled && self.is_interactive && steps >= self.min_steps_threshold
    }
}

#[cfg(feature = "progress")]
mod bar {
    use indicatif::{ProgressBar, ProgressStyle};

    pub struct Bar(Option<ProgressBar>);

    impl Bar {
        pub fn new(show: bool, total: usize) -> Self {
            Bar(show.then(|| {
                let pb = ProgressBar::new(total as u64);
                if let Ok(style) =
                    ProgressStyle::default_bar().template("[{bar:24.cyan/blue}] {pos}/{len} {msg}")
                {
                    pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
                }
                pb
            }))
        }

        pub fn message(&self, message: &str) {
            if let Some(ref pb) = self.0 {
                pb.set_message(message.to_string());
            }
        }

        pub fn position(&self, position: usize) {
            if let Some(ref pb) = self.0 {
                pb.set_position(position as u64);
            }
        }

        pub fn finish(&mut self) {
            if let Some(pb) = self.0.take() {
                pb.finish_and_clear();
            }
        }
    }
}

#[cfg(not(feature = "progress"))]
mod bar {
    pub struct Bar;

    impl Bar {
        pub fn new(_show: bool, _total: usize) -> Self {
            Bar
        }

        pub fn message(&self, _message: &str) {}

        pub fn position(&self, _position: usize) {}

        pub fn finish(&mut self) {}
    }
}

/// Counts volume and image steps, drawing a bar when enabled.
pub struct StepProgress {
    total: usize,
    completed: usize,
    bar: bar::Bar,
}

impl StepProgress {
    pub fn new(config: &ProgressConfig, total: usize) -> Self {
        Self {
            total,
            completed: 0,
            bar: bar::Bar::new(config.should_show_progress(total), total),
        }
    }

    pub fn start_step(&mut self, message: &str) {
        debug!("Step {}/{}: {message}", self.completed + 1, self.total);
        self.bar.message(message);
    }

    pub fn finish_step(&mut self) {
        self.completed += 1;
        self.bar.position(self.completed);
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn finish(&mut self) {
        self.bar.finish();
    }
}

/// Check if we're running in a CI environment
fn is_ci_environment() -> bool {
    std::env::var("CI").is_ok()
        || std::env::var("GITHUB_ACTIONS").is_ok()
        || std::env::var("GITLAB_CI").is_ok()
        || std::env::var("JENKINS_URL").is_ok()
        || std::env::var("BUILDKITE").is_ok()
}
