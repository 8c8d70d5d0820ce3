use crate::descriptor::ServiceDescriptor;
use crate::types::Fingerprint;
use crate::ConfigError;

/// Compute the configuration fingerprint of a descriptor.
///
/// The digest covers every semantic field through the descriptor's canonical
/// JSON form; map fields are ordered, so two semantically equal descriptors
/// always hash identically. The reserved config-hash label is written at
/// container-create time and is never part of the hashed value.
pub fn compute_fingerprint(descriptor: &ServiceDescriptor) -> Result<Fingerprint, ConfigError> {
    let canonical = serde_json::to_string(descriptor)?;
    let hex = blake3::hash(canonical.as_bytes()).to_hex().to_string();
    Ok(Fingerprint::new(hex))
}
