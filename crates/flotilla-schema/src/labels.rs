//! Reserved labels written onto engine-managed objects.
//!
//! These labels are the sole persisted state: a later invocation reconstructs
//! "what belongs to this project" purely from label filters against the engine.

use crate::types::{Fingerprint, ProjectName, ServiceName};
use std::collections::BTreeMap;

/// Project the object belongs to.
pub const LABEL_PROJECT: &str = "io.flotilla.project";
/// Service the container realizes.
pub const LABEL_SERVICE: &str = "io.flotilla.service";
/// 1-based instance index within the service.
pub const LABEL_NUMBER: &str = "io.flotilla.container-number";
/// `"true"` for ad-hoc run containers, `"false"` for the numbered set.
pub const LABEL_ONE_OFF: &str = "io.flotilla.oneoff";
/// Fingerprint of the descriptor the container was created from.
pub const LABEL_CONFIG_HASH: &str = "io.flotilla.config-hash";

/// Full label set for a container instance: user labels first, reserved
/// labels layered on top (reserved keys always win).
pub fn instance_labels(
    project: &ProjectName,
    service: &ServiceName,
    number: u32,
    one_off: bool,
    fingerprint: &Fingerprint,
    user: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = user.clone();
    labels.insert(LABEL_PROJECT.to_owned(), project.to_string());
    labels.insert(LABEL_SERVICE.to_owned(), service.to_string());
    labels.insert(LABEL_NUMBER.to_owned(), number.to_string());
    labels.insert(LABEL_ONE_OFF.to_owned(), one_off.to_string());
    labels.insert(LABEL_CONFIG_HASH.to_owned(), fingerprint.to_string());
    labels
}
