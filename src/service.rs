use crate::error::PodbakError;
use crate::systemd::Systemd;
use crate::Result;
use tracing::{info, warn};

/// Stops the managed units around a backup window and brings back what it stopped.
pub struct ServiceController<'a> {
    systemd: Systemd<'a>,
    units: Vec<String>,
    stopped: Vec<String>,
}

impl<'a> ServiceController<'a> {
    /// `units` in stop order: the server first, then its database.
    pub fn new(systemd: Systemd<'a>, units: Vec<String>) -> Self {
        Self {
            systemd,
            units,
            stopped: Vec::new(),
        }
    }

    /// Stop every active unit. Returns whether anything changed state.
    pub fn stop(&mut self) -> Result<bool> {
        for unit in &self.units {
            if !self.systemd.is_active(unit) {
                continue;
            }
            info!("Stopping {unit} service");
            self.systemd.stop(unit)?;
            self.stopped.push(unit.clone());
        }
        Ok(!self.stopped.is_empty())
    }

    pub fn stopped_any(&self) -> bool {
        !self.stopped.is_empty()
    }

    /// Start the units this controller stopped, in reverse order.
    pub fn start(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        while let Some(unit) = self.stopped.pop() {
            info!("Starting {unit} service");
            if let Err(e) = self.systemd.start(&unit) {
                warn!("Failed to start {unit}: {e}");
                errors.push(e);
            }
        }
        match PodbakError::join(errors) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// End of the window: start what was stopped unless `no_restart`.
    pub fn finish(&mut self, no_restart: bool) -> Result<()> {
        if self.stopped.is_empty() {
            return Ok(());
        }
        if no_restart {
            warn!(
                "Not restarting {} as requested, start them manually",
                self.stopped.join(", ")
            );
            self.stopped.clear();
            return Ok(());
        }
        self.start()
    }
}
