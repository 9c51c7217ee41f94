//! Runtime network and secrets configuration, bundled into one tar archive.

use crate::checksum::{create_checksum, validate_checksum};
use crate::error::PodbakError;
use crate::options::Options;
use crate::podman::Podman;
use crate::runner::command_line;
use crate::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, Header};
use tracing::{debug, error, info, warn};

pub const PODMAN_CONF_BACKUP_FILE: &str = "podmanBackup.tar";
pub const NETWORK_ENTRY: &str = "uyuniNetwork.json";
pub const SECRETS_ENTRY: &str = "secrets.json";

const IPV6_DISABLE_FILES: &[&str] = &[
    "sys/module/ipv6/parameters/disable",
    "proc/sys/net/ipv6/conf/default/disable_ipv6",
    "proc/sys/net/ipv6/conf/all/disable_ipv6",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub subnet: String,
    #[serde(default)]
    pub gateway: Option<String>,
}

/// The parts of `podman network inspect` needed to recreate the network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkConfigData {
    pub subnets: Vec<Subnet>,
    pub interface: String,
    pub dns_servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    #[serde(rename = "Name")]
    pub name: String,
    /// Value as held in the runtime store, base64 encoded.
    #[serde(rename = "Secret")]
    pub secret: String,
}

fn invalid_network(message: &str) -> PodbakError {
    PodbakError::InvalidNetworkData {
        message: message.to_string(),
    }
}

/// Expects a one-element array carrying `subnets` and `network_interface`.
pub fn parse_network_data(data: &[u8]) -> Result<NetworkConfigData> {
    let networks: Vec<Map<String, Value>> = serde_json::from_slice(data)?;
    let network = match networks.as_slice() {
        [network] => network,
        _ => return Err(invalid_network("expected exactly one network")),
    };

    let subnets = network
        .get("subnets")
        .ok_or_else(|| invalid_network("missing subnets"))?;
    let interface = network
        .get("network_interface")
        .ok_or_else(|| invalid_network("missing network_interface"))?;

    // optional, and null when the network has no dedicated DNS
    let dns_servers: Option<Vec<String>> = match network.get("network_dns_servers") {
        Some(value) => serde_json::from_value(value.clone())?,
        None => None,
    };

    Ok(NetworkConfigData {
        subnets: serde_json::from_value(subnets.clone())?,
        interface: serde_json::from_value(interface.clone())?,
        dns_servers: dns_servers.unwrap_or_default(),
    })
}

pub fn parse_secrets_data(data: &[u8]) -> Result<Vec<SecretRecord>> {
    Ok(serde_json::from_slice(data)?)
}

/// Decoded secret value. Values that are not base64 are used as they are.
pub fn decode_secret(record: &SecretRecord) -> Vec<u8> {
    match STANDARD.decode(&record.secret) {
        Ok(value) => value,
        Err(_) => {
            warn!("Unable to decode secret {}, using as is", record.name);
            record.secret.clone().into_bytes()
        }
    }
}

/// IPv6 is usable unless one of the kernel switches under `root` disables it.
pub fn ipv6_enabled(root: &Path) -> bool {
    !IPV6_DISABLE_FILES.iter().any(|file| {
        fs::read_to_string(root.join(file))
            .map(|content| content.trim() == "1")
            .unwrap_or(false)
    })
}

fn read_entry<R: Read>(entry: std::io::Result<tar::Entry<'_, R>>) -> Result<(String, Vec<u8>)> {
    let mut entry = entry?;
    let name = entry.path()?.to_string_lossy().into_owned();
    let mut data = Vec::new();
    entry.read_to_end(&mut data)?;
    Ok((name, data))
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, mode: u32, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

pub struct RuntimeConfigArchiver<'a> {
    podman: Podman<'a>,
    network: &'a str,
    secrets_store: &'a Path,
    host_root: PathBuf,
}

impl<'a> RuntimeConfigArchiver<'a> {
    pub fn new(podman: Podman<'a>, network: &'a str, secrets_store: &'a Path) -> Self {
        Self {
            podman,
            network,
            secrets_store,
            host_root: PathBuf::from("/"),
        }
    }

    /// Root under which the kernel IPv6 switches are read.
    pub fn with_host_root(mut self, root: &Path) -> Self {
        self.host_root = root.to_path_buf();
        self
    }

    fn backup_network(&self) -> Result<Vec<u8>> {
        self.podman.inspect_network(self.network)
    }

    fn backup_secrets(&self) -> Result<Vec<u8>> {
        let names = self.podman.list_secrets()?;
        let store: HashMap<String, String> =
            serde_json::from_slice(&fs::read(self.secrets_store)?)?;

        let records: Vec<SecretRecord> = names
            .into_iter()
            .filter_map(|(name, id)| {
                store.get(&id).map(|secret| SecretRecord {
                    name,
                    secret: secret.clone(),
                })
            })
            .collect();
        debug!("Collected {} secrets", records.len());
        Ok(serde_json::to_vec(&records)?)
    }

    /// Write `podmanBackup.tar` into `output_dir`. Each half is best effort and
    /// simply left out when it cannot be gathered.
    pub fn backup(&self, output_dir: &Path, dry_run: bool) -> Result<Option<PathBuf>> {
        if dry_run {
            info!(
                "Would run {}",
                command_line(self.podman.program(), &["network", "inspect", self.network])
            );
            info!(
                "Would run {}",
                command_line(self.podman.program(), &["secret", "ls"])
            );
            return Ok(None);
        }

        let network = self
            .backup_network()
            .map_err(|e| warn!("Network was not backed up: {e}"))
            .ok();
        let secrets = self
            .backup_secrets()
            .map_err(|e| warn!("Secrets were not backed up: {e}"))
            .ok();

        let path = output_dir.join(PODMAN_CONF_BACKUP_FILE);
        let mut builder = Builder::new(File::create(&path)?);
        if let Some(network) = network {
            append_entry(&mut builder, NETWORK_ENTRY, 0o644, &network)?;
        }
        if let Some(secrets) = secrets {
            append_entry(&mut builder, SECRETS_ENTRY, 0o600, &secrets)?;
        }
        builder.into_inner()?.flush()?;

        create_checksum(&path)?;
        info!("Runtime configuration saved to {}", path.display());
        Ok(Some(path))
    }

    /// Restore from `input_dir`, falling back to a default network when the
    /// backup holds no usable network description.
    pub fn restore(&self, input_dir: &Path, options: &Options) -> Result<()> {
        let path = input_dir.join(PODMAN_CONF_BACKUP_FILE);
        if !path.exists() {
            warn!("Runtime configuration not found in the backup, trying defaults");
            return self.default_network(options);
        }
        if !options.skip_verify {
            validate_checksum(&path)?;
        }
        self.restore_archive(&path, options)
    }

    fn restore_archive(&self, path: &Path, options: &Options) -> Result<()> {
        let mut archive = Archive::new(File::open(path)?);
        let mut errors = Vec::new();
        let mut network_seen = false;

        for entry in archive.entries()? {
            // a damaged archive still gets the default network below
            let (name, data) = match read_entry(entry) {
                Ok(read) => read,
                Err(e) => {
                    warn!("Runtime backup {} is damaged: {e}", path.display());
                    errors.push(e);
                    break;
                }
            };

            let result = match name.as_str() {
                NETWORK_ENTRY => {
                    network_seen = true;
                    self.restore_network(&data, options)
                }
                SECRETS_ENTRY => self.restore_secrets(&data, options),
                other => {
                    warn!("Ignoring unexpected file in the runtime backup: {other}");
                    Ok(())
                }
            };
            if let Err(e) = result {
                errors.push(e);
            }
        }

        if !network_seen {
            warn!("No network configuration in the backup, trying default");
            if let Err(e) = self.default_network(options) {
                errors.push(e);
            }
        }

        match PodbakError::join(errors) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn restore_network(&self, data: &[u8], options: &Options) -> Result<()> {
        let details = match parse_network_data(data) {
            Ok(details) => details,
            Err(e) => {
                warn!("Failed to decode backed up network configuration, trying default: {e}");
                return match self.default_network(options) {
                    Ok(()) => Err(e),
                    Err(fallback) => Err(PodbakError::Multiple(vec![e, fallback])),
                };
            }
        };

        self.clear_network(options)?;

        let mut args = vec!["network".to_string(), "create".to_string()];
        if !details.interface.is_empty() {
            args.push("--interface-name".to_string());
            args.push(details.interface);
        }
        for subnet in details.subnets {
            args.push("--subnet".to_string());
            args.push(subnet.subnet);
            if let Some(gateway) = subnet.gateway {
                args.push("--gateway".to_string());
                args.push(gateway);
            }
        }
        for dns in details.dns_servers {
            args.push("--dns".to_string());
            args.push(dns);
        }
        args.push(self.network.to_string());

        info!("Restoring {} network", self.network);
        self.create_network(&args, options.dry_run)
    }

    /// Make room for the network unless it exists and force is not set.
    fn clear_network(&self, options: &Options) -> Result<()> {
        if !self.podman.network_exists(self.network) {
            return Ok(());
        }
        if !options.force {
            warn!("Network {} already exists, not restoring unless forced", self.network);
            return Err(PodbakError::NetworkExists {
                name: self.network.to_string(),
            });
        }
        if options.dry_run {
            info!("Would remove existing network {}", self.network);
            return Ok(());
        }
        self.podman.remove_network(self.network)
    }

    /// Create the network without backed up settings.
    pub fn default_network(&self, options: &Options) -> Result<()> {
        self.clear_network(options)?;

        let mut args = vec!["network".to_string(), "create".to_string()];
        if ipv6_enabled(&self.host_root) {
            match self.podman.network_backend() {
                Ok(backend) if backend == "netavark" => args.push("--ipv6".to_string()),
                Ok(backend) => {
                    info!("Network backend {backend} is not netavark, not enabling IPv6")
                }
                Err(e) => warn!("Failed to find the network backend: {e}"),
            }
        }
        args.push(self.network.to_string());

        info!("Setting up default {} network", self.network);
        self.create_network(&args, options.dry_run)
            .map_err(|e| {
                error!("Unable to create the network, create it manually before starting the service");
                e
            })
    }

    fn create_network(&self, args: &[String], dry_run: bool) -> Result<()> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        if dry_run {
            info!("Would run {}", command_line(self.podman.program(), &args));
            return Ok(());
        }
        self.podman.run(&args)
    }

    fn restore_secrets(&self, data: &[u8], options: &Options) -> Result<()> {
        let records = parse_secrets_data(data).map_err(|e| {
            warn!("Failed to decode backed up secrets, no secrets were restored");
            e
        })?;

        if options.dry_run {
            for record in &records {
                info!("Would restore secret {}", record.name);
            }
            return Ok(());
        }

        info!("Restoring {} secrets", records.len());
        let mut errors = Vec::new();
        for record in &records {
            let replace = self.podman.secret_exists(&record.name);
            if replace && !options.force {
                error!(
                    "Secret {} is already present, not restoring unless forced",
                    record.name
                );
                errors.push(PodbakError::SecretExists {
                    name: record.name.clone(),
                });
                continue;
            }
            let value = decode_secret(record);
            if let Err(e) = self.podman.create_secret(&record.name, &value, replace) {
                error!("Unable to create secret {}: {e}", record.name);
                errors.push(e);
            }
        }

        match PodbakError::join(errors) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
