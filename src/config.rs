use crate::catalog::{Catalog, ServiceRole};
use crate::error::PodbakError;
use crate::Result;
use configparser::ini::Ini;
use std::path::{Path, PathBuf};

pub const DEFAULT_SECRETS_STORE: &str =
    "/var/lib/containers/storage/secrets/filedriver/secretsdata.json";

#[derive(Debug, Clone)]
pub struct Config {
    /// Container runtime executable.
    pub runtime: String,
    /// Service manager executable.
    pub service_manager: String,
    /// Container network the deployment runs on.
    pub network: String,
    /// Runtime-internal file mapping secret IDs to their stored values.
    pub secrets_store: PathBuf,
    /// Directory holding the deployment's unit files.
    pub unit_dir: PathBuf,
    /// Prefix applied to unit archive entries on restore.
    pub restore_root: PathBuf,
    /// Safety margin added to the estimated backup size.
    pub space_margin_percent: u64,
    pub catalog: Catalog,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            runtime: "podman".to_string(),
            service_manager: "systemctl".to_string(),
            network: "uyuni".to_string(),
            secrets_store: PathBuf::from(DEFAULT_SECRETS_STORE),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            restore_root: PathBuf::from("/"),
            space_margin_percent: 10,
            catalog: Catalog::default(),
        }
    }
}

impl Config {
    pub fn server_service(&self) -> &str {
        self.catalog
            .service_with_role(ServiceRole::Server)
            .map(|s| s.name.as_str())
            .unwrap_or("uyuni-server")
    }

    pub fn database_service(&self) -> Option<&str> {
        self.catalog
            .service_with_role(ServiceRole::Database)
            .map(|s| s.name.as_str())
    }
}

/// Get default configuration
pub fn default_config() -> Config {
    Config::default()
}

/// Load configuration from file, falling back to defaults
pub fn load_config() -> Result<Config> {
    let config_path = get_config_path()?;

    if !config_path.exists() {
        return Ok(default_config());
    }

    load_config_from(&config_path)
}

/// Load configuration from an explicit INI file
pub fn load_config_from(path: &Path) -> Result<Config> {
    let mut conf = Ini::new();
    conf.load(path)
        .map_err(|e| PodbakError::config(format!("Failed to parse config file: {e}")))?;

    let mut config = default_config();

    if let Some(value) = conf.get("podbak", "runtime") {
        config.runtime = value;
    }
    if let Some(value) = conf.get("podbak", "service_manager") {
        config.service_manager = value;
    }
    if let Some(value) = conf.get("podbak", "network") {
        config.network = value;
    }
    if let Some(value) = conf.get("podbak", "secrets_store") {
        config.secrets_store = PathBuf::from(value);
    }
    if let Some(value) = conf.get("podbak", "unit_dir") {
        config.unit_dir = PathBuf::from(value);
    }
    if let Some(value) = conf.get("podbak", "restore_root") {
        config.restore_root = PathBuf::from(value);
    }

    if let Some(value) = conf.get("podbak", "space_margin_percent") {
        config.space_margin_percent = value
            .parse()
            .map_err(|_| PodbakError::config(format!("Invalid space_margin_percent: {value}")))?;
    }

    let registry = conf.get("images", "registry");
    let tag = conf.get("images", "tag");
    config
        .catalog
        .override_images(registry.as_deref(), tag.as_deref());

    Ok(config)
}

/// Get the configuration file path for the current platform
fn get_config_path() -> Result<PathBuf> {
    if let Some(config_dir) = std::env::var_os("XDG_CONFIG_HOME") {
        Ok(PathBuf::from(config_dir).join("podbak").join("config.ini"))
    } else if let Some(home) = std::env::var_os("HOME") {
        Ok(PathBuf::from(home)
            .join(".config")
            .join("podbak")
            .join("config.ini"))
    } else {
        Err(PodbakError::config("Could not determine config directory"))
    }
}

/// Display the current configuration in a user-friendly format
pub fn dump_config(config: &Config) -> Result<()> {
    let config_path = get_config_path()?;

    println!("podbak Configuration");
    println!("====================");
    println!();

    if config_path.exists() {
        println!("Config file: {} (found)", config_path.display());
    } else {
        println!(
            "Config file: {} (not found, using defaults)",
            config_path.display()
        );
    }
    println!();

    println!("Current Settings:");
    println!("----------------");
    println!("runtime              = {}", config.runtime);
    println!("service_manager      = {}", config.service_manager);
    println!("network              = {}", config.network);
    println!("secrets_store        = {}", config.secrets_store.display());
    println!("unit_dir             = {}", config.unit_dir.display());
    println!("restore_root         = {}", config.restore_root.display());
    println!("space_margin_percent = {}", config.space_margin_percent);
    println!();

    println!("Built-in volumes:");
    println!("----------------");
    for volume in &config.catalog.volumes {
        let db = if config.catalog.is_database_volume(&volume.name) {
            " (database)"
        } else {
            ""
        };
        println!("{:<24} {}{db}", volume.name, volume.mount_path);
    }
    println!();

    println!("Services:");
    println!("--------");
    for service in &config.catalog.services {
        println!("{:<26} {}", service.name, service.image.reference());
    }

    Ok(())
}
