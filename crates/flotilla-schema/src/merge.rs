//! Layered merging of configuration documents.
//!
//! Merging is a pure function over two parsed layers; the resolver folds an
//! ordered document list through it. `extends` references are flattened per
//! document before the cross-document fold so both paths share one rule set.

use crate::document::{ConfigDocument, MappingField, ServiceConfig, StringOrNum};
use crate::ConfigError;
use std::collections::BTreeMap;

/// Merge one override layer onto a base service.
///
/// Rules: scalar fields are replaced by the latest non-absent value;
/// append-only set lists (ports, expose, external_links) concatenate with
/// duplicates removed; environment and labels merge key-by-key with the
/// override winning; volumes and devices merge by target path with a later
/// entry fully replacing an earlier one sharing the same target.
pub fn merge_service(base: &ServiceConfig, over: &ServiceConfig) -> ServiceConfig {
    ServiceConfig {
        image: over.image.clone().or_else(|| base.image.clone()),
        build: over.build.clone().or_else(|| base.build.clone()),
        command: over.command.clone().or_else(|| base.command.clone()),
        entrypoint: over.entrypoint.clone().or_else(|| base.entrypoint.clone()),
        environment: merge_mapping(&base.environment, &over.environment),
        labels: merge_mapping(&base.labels, &over.labels),
        ports: merge_set_list(&base.ports, &over.ports),
        expose: merge_set_list(&base.expose, &over.expose),
        external_links: merge_string_set_list(&base.external_links, &over.external_links),
        links: over.links.clone().or_else(|| base.links.clone()),
        depends_on: over.depends_on.clone().or_else(|| base.depends_on.clone()),
        volumes: merge_by_target(&base.volumes, &over.volumes),
        devices: merge_by_target(&base.devices, &over.devices),
        volumes_from: over
            .volumes_from
            .clone()
            .or_else(|| base.volumes_from.clone()),
        networks: over.networks.clone().or_else(|| base.networks.clone()),
        network_mode: over
            .network_mode
            .clone()
            .or_else(|| base.network_mode.clone()),
        restart: over.restart.clone().or_else(|| base.restart.clone()),
        stop_signal: over.stop_signal.clone().or_else(|| base.stop_signal.clone()),
        stop_grace_period: over
            .stop_grace_period
            .clone()
            .or_else(|| base.stop_grace_period.clone()),
        extends: None,
    }
}

fn merge_mapping(
    base: &Option<MappingField>,
    over: &Option<MappingField>,
) -> Option<MappingField> {
    match (base, over) {
        (None, None) => None,
        (Some(b), None) => Some(b.clone()),
        (None, Some(o)) => Some(o.clone()),
        (Some(b), Some(o)) => {
            let mut merged: BTreeMap<String, Option<String>> = b.entries().into_iter().collect();
            for (key, value) in o.entries() {
                merged.insert(key, value);
            }
            Some(MappingField::from_entries(merged))
        }
    }
}

fn merge_set_list(
    base: &Option<Vec<StringOrNum>>,
    over: &Option<Vec<StringOrNum>>,
) -> Option<Vec<StringOrNum>> {
    match (base, over) {
        (None, None) => None,
        (Some(b), None) => Some(b.clone()),
        (None, Some(o)) => Some(o.clone()),
        (Some(b), Some(o)) => {
            let mut out: Vec<StringOrNum> = Vec::with_capacity(b.len() + o.len());
            for item in b.iter().chain(o) {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Some(out)
        }
    }
}

fn merge_string_set_list(
    base: &Option<Vec<String>>,
    over: &Option<Vec<String>>,
) -> Option<Vec<String>> {
    match (base, over) {
        (None, None) => None,
        (Some(b), None) => Some(b.clone()),
        (None, Some(o)) => Some(o.clone()),
        (Some(b), Some(o)) => {
            let mut out: Vec<String> = Vec::with_capacity(b.len() + o.len());
            for item in b.iter().chain(o) {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Some(out)
        }
    }
}

/// Target path of a volume or device spec: the container-side path.
fn spec_target(spec: &str) -> &str {
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.len() {
        2 | 3 => parts[1],
        _ => parts[0],
    }
}

fn merge_by_target(base: &Option<Vec<String>>, over: &Option<Vec<String>>) -> Option<Vec<String>> {
    match (base, over) {
        (None, None) => None,
        (Some(b), None) => Some(b.clone()),
        (None, Some(o)) => Some(o.clone()),
        (Some(b), Some(o)) => {
            let mut out: Vec<String> = b
                .iter()
                .filter(|entry| {
                    let target = spec_target(entry);
                    !o.iter().any(|candidate| spec_target(candidate) == target)
                })
                .cloned()
                .collect();
            out.extend(o.iter().cloned());
            Some(out)
        }
    }
}

/// Resolve a service's `extends` chain within a registry of named documents.
///
/// The referenced service is resolved first (recursively), then the extending
/// service's own fields are merged on top. The chain must be cycle-free.
pub fn resolve_extends(
    doc_name: &str,
    service_name: &str,
    registry: &BTreeMap<String, ConfigDocument>,
    visited: &mut Vec<String>,
) -> Result<ServiceConfig, ConfigError> {
    let document = registry
        .get(doc_name)
        .ok_or_else(|| ConfigError::UnresolvedExtends {
            service: service_name.to_owned(),
            reference: doc_name.to_owned(),
        })?;
    let config =
        document
            .services
            .get(service_name)
            .ok_or_else(|| ConfigError::UnresolvedExtends {
                service: service_name.to_owned(),
                reference: format!("{doc_name}::{service_name}"),
            })?;

    let Some(extends) = &config.extends else {
        return Ok(config.clone());
    };

    let link = format!("{doc_name}::{service_name}");
    if visited.contains(&link) {
        let mut chain = visited.clone();
        chain.push(link);
        return Err(ConfigError::ExtendsCycle(chain));
    }
    visited.push(link);

    let target_doc = extends.file.as_deref().unwrap_or(doc_name);
    let referenced = resolve_extends(target_doc, &extends.service, registry, visited)?;
    visited.pop();

    Ok(merge_service(&referenced, config))
}

/// Flatten every `extends` reference in one layer against the registry.
pub fn flatten_layer(
    doc_name: &str,
    registry: &BTreeMap<String, ConfigDocument>,
) -> Result<ConfigDocument, ConfigError> {
    let document = registry
        .get(doc_name)
        .ok_or_else(|| ConfigError::UnresolvedExtends {
            service: String::new(),
            reference: doc_name.to_owned(),
        })?;

    let mut flattened = document.clone();
    for (name, config) in &mut flattened.services {
        if config.extends.is_some() {
            let mut visited = Vec::new();
            *config = resolve_extends(doc_name, name, registry, &mut visited)?;
        }
    }
    Ok(flattened)
}

/// Fold an ordered list of (flattened) layers into one document.
///
/// Services merge field-by-field per [`merge_service`]; network and volume
/// declarations are replaced wholesale by the latest layer that names them.
pub fn merge_layers(layers: &[ConfigDocument]) -> ConfigDocument {
    let mut merged = ConfigDocument::default();
    for layer in layers {
        merged.version = layer.version.clone().or(merged.version);
        for (name, config) in &layer.services {
            let combined = match merged.services.get(name) {
                Some(existing) => merge_service(existing, config),
                None => config.clone(),
            };
            merged.services.insert(name.clone(), combined);
        }
        for (name, network) in &layer.networks {
            merged.networks.insert(name.clone(), network.clone());
        }
        for (name, volume) in &layer.volumes {
            merged.volumes.insert(name.clone(), volume.clone());
        }
    }
    merged
}
