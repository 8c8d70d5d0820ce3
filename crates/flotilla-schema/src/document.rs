use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One configuration layer as parsed from a YAML document.
///
/// Field shapes mirror what authors actually write (string-or-list commands,
/// map-or-list environments); canonicalization happens in
/// [`crate::descriptor`], after merging.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub networks: BTreeMap<String, Option<NetworkConfig>>,
    #[serde(default)]
    pub volumes: BTreeMap<String, Option<VolumeConfig>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<MappingField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<MappingField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<StringOrNum>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expose: Option<Vec<StringOrNum>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_links: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes_from: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networks: Option<NetworksField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_grace_period: Option<StringOrNum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extends: Option<ExtendsConfig>,
}

/// Build context, either a bare path or the detailed form.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum BuildField {
    Context(String),
    Detailed(BuildConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
}

/// Command given either in shell form or exec form.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandField {
    Shell(String),
    Exec(Vec<String>),
}

/// YAML scalar that may arrive as a string or a bare number.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StringOrNum {
    Num(u64),
    Text(String),
}

impl StringOrNum {
    pub fn as_string(&self) -> String {
        match self {
            StringOrNum::Num(n) => n.to_string(),
            StringOrNum::Text(s) => s.clone(),
        }
    }
}

/// Environment or label block: either a mapping or a `KEY=VALUE` list.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MappingField {
    Map(BTreeMap<String, MappingValue>),
    List(Vec<String>),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MappingValue {
    Null,
    Bool(bool),
    Num(i64),
    Text(String),
}

impl MappingValue {
    fn as_option_string(&self) -> Option<String> {
        match self {
            MappingValue::Null => None,
            MappingValue::Bool(b) => Some(b.to_string()),
            MappingValue::Num(n) => Some(n.to_string()),
            MappingValue::Text(s) => Some(s.clone()),
        }
    }
}

impl MappingField {
    /// Flatten to `(key, value)` pairs. A `None` value means the entry was
    /// written without a value (`KEY` list item or null mapping value) and
    /// should be filled from the resolver's environment.
    pub fn entries(&self) -> Vec<(String, Option<String>)> {
        match self {
            MappingField::Map(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.as_option_string()))
                .collect(),
            MappingField::List(items) => items
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_owned(), Some(v.to_owned())),
                    None => (item.clone(), None),
                })
                .collect(),
        }
    }

    /// Rebuild the canonical mapping form from merged entries.
    pub fn from_entries(entries: BTreeMap<String, Option<String>>) -> Self {
        MappingField::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k, v.map_or(MappingValue::Null, MappingValue::Text)))
                .collect(),
        )
    }
}

/// Network attachments: either a plain list of names or a detailed mapping.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum NetworksField {
    List(Vec<String>),
    Map(BTreeMap<String, Option<AttachmentConfig>>),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AttachmentConfig {
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExtendsConfig {
    /// Document the referenced service lives in; the current document when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub service: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub driver_opts: BTreeMap<String, StringOrNum>,
    #[serde(default)]
    pub external: ExternalField,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VolumeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub driver_opts: BTreeMap<String, StringOrNum>,
    #[serde(default)]
    pub external: ExternalField,
}

/// `external: true` or `external: {name: ...}`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ExternalField {
    Flag(bool),
    Named { name: String },
}

impl Default for ExternalField {
    fn default() -> Self {
        ExternalField::Flag(false)
    }
}

impl ExternalField {
    pub fn is_external(&self) -> bool {
        !matches!(self, ExternalField::Flag(false))
    }

    /// Engine-side name for an external resource, when it differs from the key.
    pub fn external_name(&self) -> Option<&str> {
        match self {
            ExternalField::Named { name } => Some(name),
            ExternalField::Flag(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IpamConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub config: Vec<IpamPool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IpamPool {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// Ordered layer names plus a registry of every loaded document (the layers
/// themselves and any `extends` targets), keyed by the reference string used
/// to reach them.
#[derive(Debug, Clone, Default)]
pub struct DocumentSet {
    pub layer_names: Vec<String>,
    pub registry: BTreeMap<String, ConfigDocument>,
}

/// Load configuration layers in order, pulling in `extends`-referenced files
/// relative to the first layer's directory.
pub fn load_documents(paths: &[std::path::PathBuf]) -> Result<DocumentSet, ConfigError> {
    let base_dir = paths
        .first()
        .and_then(|p| p.parent())
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let mut set = DocumentSet::default();
    let mut queue: Vec<(String, std::path::PathBuf)> = Vec::new();
    for path in paths {
        let key = path.display().to_string();
        set.layer_names.push(key.clone());
        queue.push((key, path.clone()));
    }

    while let Some((key, path)) = queue.pop() {
        if set.registry.contains_key(&key) {
            continue;
        }
        let document = parse_document_file(&path)?;
        for service in document.services.values() {
            if let Some(extends) = &service.extends {
                if let Some(file) = &extends.file {
                    if !set.registry.contains_key(file) {
                        queue.push((file.clone(), base_dir.join(file)));
                    }
                }
            }
        }
        set.registry.insert(key, document);
    }
    Ok(set)
}

pub fn parse_document_str(input: &str) -> Result<ConfigDocument, ConfigError> {
    Ok(serde_yaml::from_str(input)?)
}

pub fn parse_document_file(path: impl AsRef<Path>) -> Result<ConfigDocument, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_document_str(&content)
}
