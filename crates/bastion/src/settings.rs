use bastion_contracts::SETTINGS_SCHEMA_VERSION;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::policy::{AccessPolicy, PolicyError};
use crate::registry::GuardToken;

/// Native pointer width of the host the rewritten program will run on.
pub const POINTER_SIZE: u64 = std::mem::size_of::<usize>() as u64;

fn default_schema_version() -> String {
    SETTINGS_SCHEMA_VERSION.to_string()
}

fn default_max_locals_size() -> u64 {
    32 * POINTER_SIZE
}

fn default_max_push_size() -> u64 {
    64
}

/// Everything a rewrite depends on. Part of the guard token, so two rewrites with equal
/// settings and input produce identical output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteSettings {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default)]
    pub policy: AccessPolicy,
    #[serde(default = "default_max_locals_size")]
    pub max_locals_size: u64,
    #[serde(default = "default_max_push_size")]
    pub max_push_size: u64,
    /// Full type names allowed to use explicit layout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_layout_allow: Option<String>,
    /// Declared type names whose pointer accesses skip origin tracing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer_operation_allow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_salt: Option<String>,
}

impl Default for RewriteSettings {
    fn default() -> Self {
        Self::new(AccessPolicy::safe_default())
    }
}

impl RewriteSettings {
    pub fn new(policy: AccessPolicy) -> Self {
        Self {
            schema_version: default_schema_version(),
            policy,
            max_locals_size: default_max_locals_size(),
            max_push_size: default_max_push_size(),
            explicit_layout_allow: None,
            pointer_operation_allow: None,
            token_salt: None,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, PolicyError> {
        let mut settings: RewriteSettings =
            serde_json::from_str(text).map_err(|e| PolicyError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&mut self) -> Result<(), PolicyError> {
        if self.schema_version != SETTINGS_SCHEMA_VERSION {
            return Err(PolicyError::SchemaVersion {
                found: self.schema_version.clone(),
            });
        }
        self.policy.validate()?;
        self.patterns().map(|_| ())
    }

    pub(crate) fn patterns(&self) -> Result<Patterns, PolicyError> {
        Ok(Patterns {
            explicit_layout: compile("explicit_layout_allow", &self.explicit_layout_allow)?,
            pointer_operation: compile("pointer_operation_allow", &self.pointer_operation_allow)?,
        })
    }

    /// Token for rewriting `source` under these settings.
    pub fn token_for(&self, source: &[u8]) -> Result<GuardToken, PolicyError> {
        let canonical =
            serde_json::to_vec(self).map_err(|e| PolicyError::Parse(e.to_string()))?;
        Ok(GuardToken::derive(&[source, &canonical]))
    }
}

fn compile(setting: &'static str, pattern: &Option<String>) -> Result<Option<Regex>, PolicyError> {
    pattern
        .as_deref()
        .map(|p| {
            // Whole-name match.
            Regex::new(&format!("^(?:{p})$")).map_err(|e| PolicyError::InvalidPattern {
                setting,
                message: e.to_string(),
            })
        })
        .transpose()
}

/// Allow patterns compiled once per rewrite.
pub(crate) struct Patterns {
    explicit_layout: Option<Regex>,
    pointer_operation: Option<Regex>,
}

impl Patterns {
    pub(crate) fn allows_explicit_layout(&self, type_name: &str) -> bool {
        self.explicit_layout
            .as_ref()
            .is_some_and(|re| re.is_match(type_name))
    }

    pub(crate) fn allows_pointer_operation(&self, type_name: &str) -> bool {
        self.pointer_operation
            .as_ref()
            .is_some_and(|re| re.is_match(type_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let settings = RewriteSettings::from_json(r#"{"policy":{}}"#).expect("parse");
        assert_eq!(settings.max_locals_size, 32 * POINTER_SIZE);
        assert_eq!(settings.max_push_size, 64);
        assert!(settings.token_salt.is_none());
    }

    #[test]
    fn invalid_pattern_is_a_configuration_error() {
        let err = RewriteSettings::from_json(r#"{"pointer_operation_allow":"("}"#).unwrap_err();
        assert!(matches!(
            err,
            PolicyError::InvalidPattern {
                setting: "pointer_operation_allow",
                ..
            }
        ));
    }

    #[test]
    fn patterns_match_whole_names() {
        let mut settings = RewriteSettings::new(AccessPolicy::new());
        settings.explicit_layout_allow = Some("Interop\\.Header".to_string());
        let patterns = settings.patterns().expect("compile");
        assert!(patterns.allows_explicit_layout("Interop.Header"));
        assert!(!patterns.allows_explicit_layout("Interop.HeaderEx"));
        assert!(!patterns.allows_pointer_operation("Interop.Header"));
    }

    #[test]
    fn salt_changes_token() {
        let mut settings = RewriteSettings::new(AccessPolicy::new());
        let a = settings.token_for(b"program").expect("token");
        assert_eq!(a, settings.token_for(b"program").expect("token"));
        settings.token_salt = Some("worker-2".to_string());
        assert_ne!(a, settings.token_for(b"program").expect("token"));
    }
}
