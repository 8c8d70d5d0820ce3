//! Canonical service descriptors and the resolved project.
//!
//! A [`ServiceDescriptor`] is the immutable, fully-merged definition of one
//! service's desired container configuration. Everything here is produced
//! from merged+interpolated documents and validated before any engine call.

use crate::document::{
    AttachmentConfig, BuildField, CommandField, ConfigDocument, NetworksField, ServiceConfig,
    StringOrNum,
};
use crate::interpolate::interpolate_service;
use crate::merge::{flatten_layer, merge_layers};
use crate::types::{ProjectName, ServiceName};
use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Network the implicit attachment goes to when a service declares none.
pub const DEFAULT_NETWORK: &str = "default";

/// Default grace period between a polite stop and a forced kill.
pub const DEFAULT_STOP_GRACE_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// One expanded port binding; ranges in the source spec become one binding
/// per port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub protocol: Protocol,
    pub host_address: Option<String>,
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MountMode {
    ReadWrite,
    ReadOnly,
}

/// One volume mount. An absent source is an anonymous volume the engine
/// provisions at create time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub source: Option<String>,
    pub target: String,
    pub mode: MountMode,
}

impl VolumeMount {
    /// Whether the source is a host path rather than a named volume.
    pub fn is_host_path(&self) -> bool {
        self.source
            .as_deref()
            .is_some_and(|s| s.starts_with('/') || s.starts_with("./") || s.starts_with("~"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumesFromRef {
    pub service: ServiceName,
    pub mode: MountMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub aliases: BTreeSet<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
}

/// Container network namespace selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NetworkMode {
    Bridge,
    Host,
    None,
    /// Share the namespace of another service in this project.
    Service(ServiceName),
    /// Share the namespace of a raw container; validated by the engine.
    Container(String),
}

impl NetworkMode {
    fn parse(service: &str, raw: &str) -> Result<Self, ConfigError> {
        if let Some(name) = raw.strip_prefix("service:") {
            if name.is_empty() {
                return Err(ConfigError::InvalidNetworkMode {
                    service: service.to_owned(),
                    mode: raw.to_owned(),
                });
            }
            return Ok(NetworkMode::Service(ServiceName::new(name)));
        }
        if let Some(id) = raw.strip_prefix("container:") {
            if id.is_empty() {
                return Err(ConfigError::InvalidNetworkMode {
                    service: service.to_owned(),
                    mode: raw.to_owned(),
                });
            }
            return Ok(NetworkMode::Container(id.to_owned()));
        }
        match raw {
            "bridge" => Ok(NetworkMode::Bridge),
            "host" => Ok(NetworkMode::Host),
            "none" => Ok(NetworkMode::None),
            _ => Err(ConfigError::InvalidNetworkMode {
                service: service.to_owned(),
                mode: raw.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RestartPolicy {
    No,
    Always,
    UnlessStopped,
    OnFailure { max_retries: Option<u32> },
}

impl RestartPolicy {
    fn parse(service: &str, raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "no" | "" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            "on-failure" => Ok(RestartPolicy::OnFailure { max_retries: None }),
            other => {
                if let Some(count) = other.strip_prefix("on-failure:") {
                    let retries =
                        count
                            .parse::<u32>()
                            .map_err(|_| ConfigError::InvalidRestart {
                                service: service.to_owned(),
                                policy: raw.to_owned(),
                            })?;
                    Ok(RestartPolicy::OnFailure {
                        max_retries: Some(retries),
                    })
                } else {
                    Err(ConfigError::InvalidRestart {
                        service: service.to_owned(),
                        policy: raw.to_owned(),
                    })
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildContext {
    pub context: String,
    pub dockerfile: Option<String>,
}

/// Command or entrypoint override, in shell or exec form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    Shell(String),
    Exec(Vec<String>),
}

impl From<&CommandField> for Command {
    fn from(field: &CommandField) -> Self {
        match field {
            CommandField::Shell(s) => Command::Shell(s.clone()),
            CommandField::Exec(items) => Command::Exec(items.clone()),
        }
    }
}

/// Canonical, immutable definition of one service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: ServiceName,
    pub image: Option<String>,
    pub build: Option<BuildContext>,
    pub command: Option<Command>,
    pub entrypoint: Option<Command>,
    pub environment: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub expose: Vec<String>,
    pub volumes: Vec<VolumeMount>,
    pub devices: Vec<String>,
    pub volumes_from: Vec<VolumesFromRef>,
    pub networks: BTreeMap<String, NetworkAttachment>,
    pub depends_on: BTreeSet<ServiceName>,
    pub links: BTreeMap<ServiceName, Option<String>>,
    pub external_links: Vec<String>,
    pub network_mode: NetworkMode,
    pub restart: RestartPolicy,
    pub stop_signal: Option<String>,
    pub stop_grace_period_secs: u64,
    pub labels: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    /// Image reference the container will run; for build-only services this
    /// is the tag the builder will produce.
    pub fn image_or_build_tag(&self, project: &ProjectName) -> String {
        match &self.image {
            Some(image) => image.clone(),
            None => format!("{project}_{name}", name = self.name),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkDecl {
    pub driver: Option<String>,
    pub options: BTreeMap<String, String>,
    pub external: bool,
    /// Engine-side name when the external declaration carries one.
    pub external_name: Option<String>,
    pub ipam: Option<IpamDecl>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpamDecl {
    pub driver: Option<String>,
    pub pools: Vec<IpamPoolDecl>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpamPoolDecl {
    pub subnet: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeDecl {
    pub driver: Option<String>,
    pub options: BTreeMap<String, String>,
    pub external: bool,
    pub external_name: Option<String>,
}

/// The complete resolved application: services in document order plus the
/// declared networks and volumes. Read-only after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub name: ProjectName,
    pub services: Vec<ServiceDescriptor>,
    pub networks: BTreeMap<String, NetworkDecl>,
    pub volumes: BTreeMap<String, VolumeDecl>,
}

/// Result of resolution: the project plus any interpolation warnings.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub project: Project,
    pub warnings: Vec<String>,
}

impl Project {
    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.name == *name)
    }

    pub fn service_names(&self) -> Vec<ServiceName> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    /// Resolve an ordered list of layer names against a document registry
    /// into a canonical project.
    pub fn resolve(
        name: ProjectName,
        layer_names: &[String],
        registry: &BTreeMap<String, ConfigDocument>,
        environment: &BTreeMap<String, String>,
    ) -> Result<Resolved, ConfigError> {
        let mut flattened = Vec::with_capacity(layer_names.len());
        for layer in layer_names {
            flattened.push(flatten_layer(layer, registry)?);
        }
        let merged = merge_layers(&flattened);

        let mut warnings = Vec::new();
        let mut services = Vec::with_capacity(merged.services.len());
        for (service_name, config) in &merged.services {
            let mut config = config.clone();
            interpolate_service(&mut config, environment, &mut warnings);
            services.push(normalize_service(service_name, &config, environment)?);
        }

        let mut networks = BTreeMap::new();
        for (net_name, config) in &merged.networks {
            networks.insert(net_name.clone(), normalize_network(config.as_ref()));
        }
        let mut volumes = BTreeMap::new();
        for (vol_name, config) in &merged.volumes {
            volumes.insert(vol_name.clone(), normalize_volume(config.as_ref()));
        }

        // Services without explicit attachments land on the implicit default
        // network, which is project-owned unless declared otherwise.
        if services
            .iter()
            .any(|s| s.networks.contains_key(DEFAULT_NETWORK))
            && !networks.contains_key(DEFAULT_NETWORK)
        {
            networks.insert(DEFAULT_NETWORK.to_owned(), NetworkDecl::default());
        }

        let project = Project {
            name,
            services,
            networks,
            volumes,
        };
        project.validate_references()?;
        Ok(Resolved { project, warnings })
    }

    /// Every network attachment and named volume source must be declared.
    fn validate_references(&self) -> Result<(), ConfigError> {
        for service in &self.services {
            for network in service.networks.keys() {
                if !self.networks.contains_key(network) {
                    return Err(ConfigError::UndeclaredNetwork {
                        service: service.name.to_string(),
                        network: network.clone(),
                    });
                }
            }
            for mount in &service.volumes {
                if let Some(source) = &mount.source {
                    if !mount.is_host_path() && !self.volumes.contains_key(source) {
                        return Err(ConfigError::UndeclaredVolume {
                            service: service.name.to_string(),
                            volume: source.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn normalize_network(config: Option<&crate::document::NetworkConfig>) -> NetworkDecl {
    let Some(config) = config else {
        return NetworkDecl::default();
    };
    NetworkDecl {
        driver: config.driver.clone(),
        options: config
            .driver_opts
            .iter()
            .map(|(k, v)| (k.clone(), v.as_string()))
            .collect(),
        external: config.external.is_external(),
        external_name: config.external.external_name().map(str::to_owned),
        ipam: config.ipam.as_ref().map(|ipam| IpamDecl {
            driver: ipam.driver.clone(),
            pools: ipam
                .config
                .iter()
                .map(|pool| IpamPoolDecl {
                    subnet: pool.subnet.clone(),
                    gateway: pool.gateway.clone(),
                })
                .collect(),
        }),
    }
}

fn normalize_volume(config: Option<&crate::document::VolumeConfig>) -> VolumeDecl {
    let Some(config) = config else {
        return VolumeDecl::default();
    };
    VolumeDecl {
        driver: config.driver.clone(),
        options: config
            .driver_opts
            .iter()
            .map(|(k, v)| (k.clone(), v.as_string()))
            .collect(),
        external: config.external.is_external(),
        external_name: config.external.external_name().map(str::to_owned),
    }
}

fn normalize_service(
    name: &str,
    config: &ServiceConfig,
    environment: &BTreeMap<String, String>,
) -> Result<ServiceDescriptor, ConfigError> {
    let build = match &config.build {
        None => None,
        Some(BuildField::Context(context)) => Some(BuildContext {
            context: context.clone(),
            dockerfile: None,
        }),
        Some(BuildField::Detailed(detail)) => Some(BuildContext {
            context: detail.context.clone(),
            dockerfile: detail.dockerfile.clone(),
        }),
    };
    if config.image.is_none() && build.is_none() {
        return Err(ConfigError::MissingImage {
            service: name.to_owned(),
        });
    }

    let env = mapping_to_map(config.environment.as_ref(), environment);
    let labels = mapping_to_map(config.labels.as_ref(), environment);

    let mut ports = Vec::new();
    if let Some(specs) = &config.ports {
        for spec in specs {
            ports.extend(parse_port_spec(name, &spec.as_string())?);
        }
    }
    let mut expose = Vec::new();
    if let Some(specs) = &config.expose {
        for spec in specs {
            let raw = spec.as_string();
            let normalized = if raw.contains('/') {
                raw
            } else {
                format!("{raw}/tcp")
            };
            if !expose.contains(&normalized) {
                expose.push(normalized);
            }
        }
    }

    let mut volumes = Vec::new();
    if let Some(specs) = &config.volumes {
        for spec in specs {
            volumes.push(parse_volume_spec(name, spec)?);
        }
    }

    let mut volumes_from = Vec::new();
    if let Some(refs) = &config.volumes_from {
        for reference in refs {
            volumes_from.push(parse_volumes_from(name, reference)?);
        }
    }

    let mut links = BTreeMap::new();
    if let Some(raw_links) = &config.links {
        for link in raw_links {
            match link.split_once(':') {
                Some((service, alias)) => {
                    links.insert(ServiceName::new(service), Some(alias.to_owned()));
                }
                None => {
                    links.insert(ServiceName::new(link.as_str()), None);
                }
            }
        }
    }

    let depends_on: BTreeSet<ServiceName> = config
        .depends_on
        .iter()
        .flatten()
        .map(|d| ServiceName::new(d.as_str()))
        .collect();

    let network_mode = match &config.network_mode {
        Some(raw) => NetworkMode::parse(name, raw)?,
        None => NetworkMode::Bridge,
    };

    let mut networks = normalize_attachments(config.networks.as_ref());
    if !networks.is_empty() && !matches!(network_mode, NetworkMode::Bridge) {
        return Err(ConfigError::MutuallyExclusive {
            a: "network_mode".to_owned(),
            b: "networks".to_owned(),
        });
    }
    if networks.is_empty() && matches!(network_mode, NetworkMode::Bridge) {
        networks.insert(DEFAULT_NETWORK.to_owned(), NetworkAttachment::default());
    }

    let restart = match &config.restart {
        Some(raw) => RestartPolicy::parse(name, raw)?,
        None => RestartPolicy::No,
    };

    let stop_grace_period_secs = match &config.stop_grace_period {
        None => DEFAULT_STOP_GRACE_SECS,
        Some(StringOrNum::Num(secs)) => *secs,
        Some(StringOrNum::Text(text)) => {
            parse_duration_secs(text).ok_or_else(|| ConfigError::InvalidDuration {
                service: name.to_owned(),
                value: text.clone(),
            })?
        }
    };

    Ok(ServiceDescriptor {
        name: ServiceName::new(name),
        image: config.image.clone(),
        build,
        command: config.command.as_ref().map(Command::from),
        entrypoint: config.entrypoint.as_ref().map(Command::from),
        environment: env,
        ports,
        expose,
        volumes,
        devices: config.devices.clone().unwrap_or_default(),
        volumes_from,
        networks,
        depends_on,
        links,
        external_links: config.external_links.clone().unwrap_or_default(),
        network_mode,
        restart,
        stop_signal: config.stop_signal.clone(),
        stop_grace_period_secs,
        labels,
    })
}

fn mapping_to_map(
    field: Option<&crate::document::MappingField>,
    fallback: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    field
        .map(|mapping| {
            mapping
                .entries()
                .into_iter()
                .map(|(k, v)| {
                    let value = v.unwrap_or_else(|| fallback.get(&k).cloned().unwrap_or_default());
                    (k, value)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn normalize_attachments(
    field: Option<&NetworksField>,
) -> BTreeMap<String, NetworkAttachment> {
    let mut out = BTreeMap::new();
    match field {
        None => {}
        Some(NetworksField::List(names)) => {
            for name in names {
                out.insert(name.clone(), NetworkAttachment::default());
            }
        }
        Some(NetworksField::Map(map)) => {
            for (name, attachment) in map {
                let attachment = attachment.clone().unwrap_or_default();
                out.insert(name.clone(), attachment_from_config(&attachment));
            }
        }
    }
    out
}

fn attachment_from_config(config: &AttachmentConfig) -> NetworkAttachment {
    NetworkAttachment {
        aliases: config.aliases.iter().cloned().collect(),
        ipv4_address: config.ipv4_address.clone(),
        ipv6_address: config.ipv6_address.clone(),
    }
}

fn parse_volumes_from(service: &str, reference: &str) -> Result<VolumesFromRef, ConfigError> {
    let (target, mode) = match reference.split_once(':') {
        None => (reference, MountMode::ReadWrite),
        Some((target, "rw")) => (target, MountMode::ReadWrite),
        Some((target, "ro")) => (target, MountMode::ReadOnly),
        Some(_) => {
            return Err(ConfigError::InvalidVolume {
                service: service.to_owned(),
                spec: reference.to_owned(),
            })
        }
    };
    if target.is_empty() {
        return Err(ConfigError::InvalidVolume {
            service: service.to_owned(),
            spec: reference.to_owned(),
        });
    }
    Ok(VolumesFromRef {
        service: ServiceName::new(target),
        mode,
    })
}

fn parse_volume_spec(service: &str, spec: &str) -> Result<VolumeMount, ConfigError> {
    let invalid = || ConfigError::InvalidVolume {
        service: service.to_owned(),
        spec: spec.to_owned(),
    };
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, target, mode) = match parts.as_slice() {
        [target] => (None, *target, MountMode::ReadWrite),
        [source, target] => (Some(*source), *target, MountMode::ReadWrite),
        [source, target, mode] => {
            let mode = match *mode {
                "rw" => MountMode::ReadWrite,
                "ro" => MountMode::ReadOnly,
                _ => return Err(invalid()),
            };
            (Some(*source), *target, mode)
        }
        _ => return Err(invalid()),
    };
    if target.is_empty() || source.is_some_and(str::is_empty) {
        return Err(invalid());
    }
    Ok(VolumeMount {
        source: source.map(str::to_owned),
        target: target.to_owned(),
        mode,
    })
}

fn parse_port_spec(service: &str, spec: &str) -> Result<Vec<PortBinding>, ConfigError> {
    let invalid = || ConfigError::InvalidPort {
        service: service.to_owned(),
        spec: spec.to_owned(),
    };

    let (body, protocol) = match spec.rsplit_once('/') {
        Some((body, "tcp")) => (body, Protocol::Tcp),
        Some((body, "udp")) => (body, Protocol::Udp),
        Some(_) => return Err(invalid()),
        None => (spec, Protocol::Tcp),
    };

    let parts: Vec<&str> = body.split(':').collect();
    let (host_address, host_part, container_part) = match parts.as_slice() {
        [container] => (None, None, *container),
        [host, container] => (None, Some(*host), *container),
        [address, host, container] => (Some((*address).to_owned()), Some(*host), *container),
        _ => return Err(invalid()),
    };

    let container_ports = parse_port_range(container_part).ok_or_else(invalid)?;
    let host_ports: Option<Vec<u16>> = match host_part {
        None | Some("") => None,
        Some(range) => Some(parse_port_range(range).ok_or_else(invalid)?),
    };

    if let Some(hosts) = &host_ports {
        if hosts.len() != container_ports.len() {
            return Err(invalid());
        }
    }

    Ok(container_ports
        .into_iter()
        .enumerate()
        .map(|(i, container_port)| PortBinding {
            container_port,
            protocol,
            host_address: host_address.clone(),
            host_port: host_ports.as_ref().map(|hosts| hosts[i]),
        })
        .collect())
}

fn parse_port_range(raw: &str) -> Option<Vec<u16>> {
    match raw.split_once('-') {
        None => Some(vec![raw.parse().ok()?]),
        Some((start, end)) => {
            let start: u16 = start.parse().ok()?;
            let end: u16 = end.parse().ok()?;
            if end < start {
                return None;
            }
            Some((start..=end).collect())
        }
    }
}

/// Parse `"90"`, `"10s"`, `"1m30s"`, `"2h"` into seconds.
fn parse_duration_secs(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return trimmed.parse().ok();
    }
    let mut total: u64 = 0;
    let mut number = String::new();
    for c in trimmed.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let value: u64 = number.parse().ok()?;
        number.clear();
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        total += value * unit;
    }
    if number.is_empty() {
        Some(total)
    } else {
        None
    }
}
