//! Variable substitution in scalar string fields, applied after merging.
//!
//! Supports `$VAR`, `${VAR}`, `${VAR:-default}` and the `$$` escape. An unset
//! variable without a default substitutes the empty string and records a
//! warning; interpolation never hard-fails.

use crate::document::{CommandField, MappingField, ServiceConfig, StringOrNum};
use std::collections::BTreeMap;
use tracing::warn;

/// Substitute variable references in one string.
pub fn interpolate(
    input: &str,
    env: &BTreeMap<String, String>,
    warnings: &mut Vec<String>,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut body = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    body.push(inner);
                }
                if closed {
                    out.push_str(&resolve(&body, env, warnings));
                } else {
                    // Unterminated brace: keep the literal text.
                    out.push_str("${");
                    out.push_str(&body);
                }
            }
            Some(next) if next.is_ascii_alphanumeric() || *next == '_' => {
                let mut name = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        name.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&resolve(&name, env, warnings));
            }
            _ => out.push('$'),
        }
    }
    out
}

fn resolve(body: &str, env: &BTreeMap<String, String>, warnings: &mut Vec<String>) -> String {
    let (name, default) = match body.split_once(":-") {
        Some((n, d)) => (n, Some(d)),
        None => (body, None),
    };
    if let Some(value) = env.get(name) {
        return value.clone();
    }
    if let Some(default) = default {
        return default.to_owned();
    }
    let message = format!("the {name} variable is not set, defaulting to a blank string");
    warn!("{message}");
    warnings.push(message);
    String::new()
}

/// Apply [`interpolate`] to every scalar string field of a merged service.
pub fn interpolate_service(
    config: &mut ServiceConfig,
    env: &BTreeMap<String, String>,
    warnings: &mut Vec<String>,
) {
    apply_opt(&mut config.image, env, warnings);
    apply_opt(&mut config.network_mode, env, warnings);
    apply_opt(&mut config.restart, env, warnings);
    apply_opt(&mut config.stop_signal, env, warnings);

    if let Some(StringOrNum::Text(value)) = &mut config.stop_grace_period {
        *value = interpolate(value, env, warnings);
    }
    if let Some(command) = &mut config.command {
        apply_command(command, env, warnings);
    }
    if let Some(entrypoint) = &mut config.entrypoint {
        apply_command(entrypoint, env, warnings);
    }
    if let Some(mapping) = &mut config.environment {
        apply_mapping(mapping, env, warnings);
    }
    if let Some(mapping) = &mut config.labels {
        apply_mapping(mapping, env, warnings);
    }
    for field in [
        &mut config.external_links,
        &mut config.links,
        &mut config.depends_on,
        &mut config.volumes,
        &mut config.devices,
        &mut config.volumes_from,
    ] {
        if let Some(items) = field {
            for item in items.iter_mut() {
                *item = interpolate(item, env, warnings);
            }
        }
    }
    for field in [&mut config.ports, &mut config.expose] {
        if let Some(items) = field {
            for item in items.iter_mut() {
                if let StringOrNum::Text(value) = item {
                    *value = interpolate(value, env, warnings);
                }
            }
        }
    }
}

fn apply_opt(
    field: &mut Option<String>,
    env: &BTreeMap<String, String>,
    warnings: &mut Vec<String>,
) {
    if let Some(value) = field {
        *value = interpolate(value, env, warnings);
    }
}

fn apply_command(
    command: &mut CommandField,
    env: &BTreeMap<String, String>,
    warnings: &mut Vec<String>,
) {
    match command {
        CommandField::Shell(value) => *value = interpolate(value, env, warnings),
        CommandField::Exec(items) => {
            for item in items.iter_mut() {
                *item = interpolate(item, env, warnings);
            }
        }
    }
}

fn apply_mapping(
    mapping: &mut MappingField,
    env: &BTreeMap<String, String>,
    warnings: &mut Vec<String>,
) {
    let interpolated = mapping
        .entries()
        .into_iter()
        .map(|(k, v)| (k, v.map(|value| interpolate(&value, env, warnings))))
        .collect();
    *mapping = MappingField::from_entries(interpolated);
}
