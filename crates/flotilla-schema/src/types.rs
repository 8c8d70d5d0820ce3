//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings for backward compatibility.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<$name> for String {
            fn eq(&self, other: &$name) -> bool {
                *self == other.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Name of a project; scopes every container, network, and volume it owns.
    ProjectName
);

string_newtype!(
    /// Name of one service within a project, unique within that project.
    ServiceName
);

string_newtype!(
    /// Engine-assigned container identifier.
    ContainerId
);

string_newtype!(
    /// 64-character hex blake3 digest of a service descriptor's semantic fields.
    Fingerprint
);

impl Fingerprint {
    /// Truncated 12-character prefix, used for display and staging names.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

/// Sanitize a raw directory or user-supplied name into a valid project name.
///
/// Keeps lowercase ASCII alphanumerics only; an empty result falls back to
/// `"default"`.
pub fn sanitize_project_name(raw: &str) -> ProjectName {
    let cleaned: String = raw
        .to_lowercase()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    if cleaned.is_empty() {
        ProjectName::new("default")
    } else {
        ProjectName::new(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_display_and_as_ref() {
        let name = ServiceName::new("web");
        assert_eq!(name.to_string(), "web");
        assert_eq!(name.as_str(), "web");
        assert_eq!(AsRef::<str>::as_ref(&name), "web");
    }

    #[test]
    fn service_name_serde_roundtrip() {
        let name = ServiceName::new("db");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"db\"");
        let back: ServiceName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }

    #[test]
    fn fingerprint_short_is_prefix() {
        let fp = Fingerprint::new("abcdef0123456789abcdef");
        assert_eq!(fp.short(), "abcdef012345");
        assert!(fp.as_str().starts_with(fp.short()));
    }

    #[test]
    fn fingerprint_short_handles_small_values() {
        let fp = Fingerprint::new("abc");
        assert_eq!(fp.short(), "abc");
    }

    #[test]
    fn sanitize_strips_and_lowercases() {
        assert_eq!(sanitize_project_name("My_App.2"), "myapp2");
        assert_eq!(sanitize_project_name("web-stack"), "webstack");
    }

    #[test]
    fn sanitize_falls_back_to_default() {
        assert_eq!(sanitize_project_name("___"), "default");
        assert_eq!(sanitize_project_name(""), "default");
    }
}
