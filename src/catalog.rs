//! The deployment's fixed tables: built-in volumes, service images and units.

use std::path::PathBuf;

/// A symlink recreated inside a volume when its import reports trailing links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairLink {
    /// Link location, relative to the volume data directory.
    pub link: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    /// Mount path inside the server container.
    pub mount_path: String,
    pub repair_links: Vec<RepairLink>,
}

impl VolumeSpec {
    pub fn new(name: &str, mount_path: &str) -> Self {
        Self {
            name: name.to_string(),
            mount_path: mount_path.to_string(),
            repair_links: Vec::new(),
        }
    }

    pub fn with_repair_link(mut self, link: &str, target: &str) -> Self {
        self.repair_links.push(RepairLink {
            link: PathBuf::from(link),
            target: PathBuf::from(target),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub name: String,
    pub registry: String,
    pub tag: String,
}

impl ImageSpec {
    /// Full image reference, e.g. `registry.opensuse.org/uyuni/server:latest`.
    pub fn reference(&self) -> String {
        let registry = self.registry.trim_end_matches('/');
        if registry.is_empty() {
            format!("{}:{}", self.name, self.tag)
        } else {
            format!("{registry}/{}:{}", self.name, self.tag)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replicas {
    /// Plain `name.service` unit, always installed.
    SingleMandatory,
    /// Templated `name@.service` unit, installed only when the feature is used.
    SingleOptional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    Server,
    Database,
    Auxiliary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: ImageSpec,
    pub replicas: Replicas,
    pub role: ServiceRole,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub volumes: Vec<VolumeSpec>,
    /// Volumes holding database state. Their presence in a run gates service stop.
    pub database_volumes: Vec<String>,
    pub services: Vec<ServiceSpec>,
}

pub const DEFAULT_REGISTRY: &str = "registry.opensuse.org/uyuni";
pub const DEFAULT_TAG: &str = "latest";

const SERVER_VOLUMES: &[(&str, &str)] = &[
    ("var-lib-cobbler", "/var/lib/cobbler"),
    ("var-pgsql", "/var/lib/pgsql"),
    ("var-cache", "/var/cache"),
    ("var-spacewalk", "/var/spacewalk"),
    ("var-log", "/var/log"),
    ("srv-salt", "/srv/salt"),
    ("srv-www-pub", "/srv/www/htdocs/pub"),
    ("srv-www-cobbler", "/srv/www/cobbler"),
    ("srv-www-osimages", "/srv/www/os-images"),
    ("srv-www-distributions", "/srv/www/distributions"),
    ("srv-tftpboot", "/srv/tftpboot"),
    ("srv-formulametadata", "/srv/formula_metadata"),
    ("srv-pillar", "/srv/pillar"),
    ("srv-susemanager", "/srv/susemanager"),
    ("srv-spacewalk", "/srv/spacewalk"),
    ("root", "/root"),
    ("etc-apache2", "/etc/apache2"),
    ("etc-rhn", "/etc/rhn"),
    ("etc-systemd-multi", "/etc/systemd/system/multi-user.target.wants"),
    ("etc-systemd-sockets", "/etc/systemd/system/sockets.target.wants"),
    ("etc-salt", "/etc/salt"),
    ("etc-tomcat", "/etc/tomcat"),
    ("etc-cobbler", "/etc/cobbler"),
    ("etc-sysconfig", "/etc/sysconfig"),
    ("etc-tls", "/etc/pki/tls"),
    ("etc-postfix", "/etc/postfix"),
    ("ca-cert", "/etc/pki/trust/anchors"),
];

impl Default for Catalog {
    fn default() -> Self {
        let volumes = SERVER_VOLUMES
            .iter()
            .map(|(name, path)| {
                let spec = VolumeSpec::new(name, path);
                match *name {
                    "etc-apache2" => spec.with_repair_link("mime.types", "../mime.types"),
                    "etc-postfix" => spec.with_repair_link("ssl/cacerts", "../../ssl/certs"),
                    _ => spec,
                }
            })
            .collect();

        let image = |name: &str| ImageSpec {
            name: name.to_string(),
            registry: DEFAULT_REGISTRY.to_string(),
            tag: DEFAULT_TAG.to_string(),
        };
        let service = |name: &str, image_name: &str, replicas, role, description: &str| {
            ServiceSpec {
                name: name.to_string(),
                image: image(image_name),
                replicas,
                role,
                description: description.to_string(),
            }
        };

        let services = vec![
            service(
                "uyuni-server",
                "server",
                Replicas::SingleMandatory,
                ServiceRole::Server,
                "Main service",
            ),
            service(
                "uyuni-server-migration",
                "server-migration-14-16",
                Replicas::SingleOptional,
                ServiceRole::Auxiliary,
                "Migration helper",
            ),
            service(
                "uyuni-server-attestation",
                "server-attestation",
                Replicas::SingleOptional,
                ServiceRole::Auxiliary,
                "Confidential computing attestation",
            ),
            service(
                "uyuni-hub-xmlrpc",
                "server-hub-xmlrpc-api",
                Replicas::SingleOptional,
                ServiceRole::Auxiliary,
                "Hub XML-RPC API",
            ),
            service(
                "uyuni-server-saline",
                "server-saline",
                Replicas::SingleOptional,
                ServiceRole::Auxiliary,
                "Saline",
            ),
            service(
                "uyuni-db",
                "uyuni-db",
                Replicas::SingleMandatory,
                ServiceRole::Database,
                "Database",
            ),
        ];

        Catalog {
            volumes,
            database_volumes: vec!["var-pgsql".to_string()],
            services,
        }
    }
}

impl Catalog {
    pub fn volume(&self, name: &str) -> Option<&VolumeSpec> {
        self.volumes.iter().find(|v| v.name == name)
    }

    pub fn is_database_volume(&self, name: &str) -> bool {
        self.database_volumes.iter().any(|v| v == name)
    }

    pub fn service_with_role(&self, role: ServiceRole) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.role == role)
    }

    /// Point every image at another registry and/or tag.
    pub fn override_images(&mut self, registry: Option<&str>, tag: Option<&str>) {
        for service in &mut self.services {
            if let Some(registry) = registry {
                service.image.registry = registry.to_string();
            }
            if let Some(tag) = tag {
                service.image.tag = tag.to_string();
            }
        }
    }
}
