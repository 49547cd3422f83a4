//! Hierarchical whitelist: namespace -> type -> member.
//!
//! Access only ever tightens. Re-configuring a node may keep or narrow its access, a child can
//! never be laxer than a `Denied` parent, and both rules are checked the moment the mutation is
//! made, so an inconsistent policy cannot be built or loaded.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;

use bastion_contracts::POLICY_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};

use crate::rewriters::MemberRewriter;

/// Namespace/type access. Ordered from strictest to laxest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Denied,
    /// Neither allowed nor denied as a whole; children decide.
    Neutral,
    Allowed,
}

impl Access {
    pub fn as_str(self) -> &'static str {
        match self {
            Access::Denied => "denied",
            Access::Neutral => "neutral",
            Access::Allowed => "allowed",
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Member access is always concrete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberAccess {
    Denied,
    Allowed,
}

impl MemberAccess {
    fn as_access(self) -> Access {
        match self {
            MemberAccess::Denied => Access::Denied,
            MemberAccess::Allowed => Access::Allowed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Re-configuration tried to loosen an existing rule.
    Widening {
        symbol: String,
        from: Access,
        to: Access,
    },
    /// Child rule laxer than a denied parent.
    LaxerThanParent { symbol: String, parent: String },
    EmptyName { what: &'static str },
    SchemaVersion { found: String },
    InvalidPattern { setting: &'static str, message: String },
    Parse(String),
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyError::Widening { symbol, from, to } => write!(
                f,
                "access for {symbol} cannot be widened from {from} to {to}"
            ),
            PolicyError::LaxerThanParent { symbol, parent } => write!(
                f,
                "access for {symbol} cannot be laxer than denied parent {parent}"
            ),
            PolicyError::EmptyName { what } => write!(f, "{what} name must not be empty"),
            PolicyError::SchemaVersion { found } => write!(
                f,
                "unsupported policy schema_version {found:?} (expected {POLICY_SCHEMA_VERSION:?})"
            ),
            PolicyError::InvalidPattern { setting, message } => {
                write!(f, "invalid {setting} pattern: {message}")
            }
            PolicyError::Parse(msg) => write!(f, "failed to parse policy: {msg}"),
        }
    }
}

impl std::error::Error for PolicyError {}

fn default_schema_version() -> String {
    POLICY_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default)]
    namespaces: BTreeMap<String, NamespacePolicy>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            namespaces: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespacePolicy {
    access: Access,
    #[serde(skip)]
    name: String,
    #[serde(default)]
    types: BTreeMap<String, TypePolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypePolicy {
    access: Access,
    #[serde(skip)]
    name: String,
    #[serde(default)]
    members: BTreeMap<String, MemberPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPolicy {
    access: MemberAccess,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    rewriters: Vec<MemberRewriter>,
}

fn tighten(symbol: &str, current: &mut Access, requested: Access) -> Result<(), PolicyError> {
    if requested > *current {
        return Err(PolicyError::Widening {
            symbol: symbol.to_string(),
            from: *current,
            to: requested,
        });
    }
    *current = requested;
    Ok(())
}

fn non_empty(name: &str, what: &'static str) -> Result<(), PolicyError> {
    if name.trim().is_empty() {
        Err(PolicyError::EmptyName { what })
    } else {
        Ok(())
    }
}

impl AccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self, PolicyError> {
        let mut policy: AccessPolicy =
            serde_json::from_str(text).map_err(|e| PolicyError::Parse(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn to_json_pretty(&self) -> Result<String, PolicyError> {
        serde_json::to_string_pretty(self).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    /// Adds or tightens a namespace rule and returns it for further configuration.
    pub fn namespace(&mut self, name: &str, access: Access) -> Result<&mut NamespacePolicy, PolicyError> {
        non_empty(name, "namespace")?;
        match self.namespaces.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let existing = entry.into_mut();
                if access == Access::Denied {
                    if let Some((type_name, _)) =
                        existing.types.iter().find(|(_, t)| t.access != Access::Denied)
                    {
                        return Err(PolicyError::LaxerThanParent {
                            symbol: format!("{name}.{type_name}"),
                            parent: name.to_string(),
                        });
                    }
                }
                tighten(name, &mut existing.access, access)?;
                Ok(existing)
            }
            Entry::Vacant(entry) => Ok(entry.insert(NamespacePolicy {
                access,
                name: name.to_string(),
                types: BTreeMap::new(),
            })),
        }
    }

    pub fn namespaces(&self) -> impl Iterator<Item = (&str, &NamespacePolicy)> {
        self.namespaces.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_namespace(&self, name: &str) -> Option<&NamespacePolicy> {
        self.namespaces.get(name)
    }

    /// Re-checks every invariant the builder methods enforce. Run after deserialization,
    /// which bypasses them, and restores the node names serde skips.
    pub fn validate(&mut self) -> Result<(), PolicyError> {
        if self.schema_version != POLICY_SCHEMA_VERSION {
            return Err(PolicyError::SchemaVersion {
                found: self.schema_version.clone(),
            });
        }
        for (ns_name, ns) in self.namespaces.iter_mut() {
            non_empty(ns_name, "namespace")?;
            ns.name = ns_name.clone();
            for (type_name, ty) in ns.types.iter_mut() {
                non_empty(type_name, "type")?;
                ty.name = format!("{ns_name}.{type_name}");
                if ns.access == Access::Denied && ty.access != Access::Denied {
                    return Err(PolicyError::LaxerThanParent {
                        symbol: ty.name.clone(),
                        parent: ns_name.clone(),
                    });
                }
                for (member_name, member) in &ty.members {
                    non_empty(member_name, "member")?;
                    if ty.access == Access::Denied && member.access != MemberAccess::Denied {
                        return Err(PolicyError::LaxerThanParent {
                            symbol: format!("{}::{member_name}", ty.name),
                            parent: ty.name.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl NamespacePolicy {
    pub fn access(&self) -> Access {
        self.access
    }

    /// Adds or tightens a type rule.
    pub fn ty(&mut self, name: &str, access: Access) -> Result<&mut TypePolicy, PolicyError> {
        non_empty(name, "type")?;
        let full = format!("{}.{name}", self.name);
        if self.access == Access::Denied && access != Access::Denied {
            return Err(PolicyError::LaxerThanParent {
                symbol: full,
                parent: self.name.clone(),
            });
        }
        match self.types.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let existing = entry.into_mut();
                if access == Access::Denied {
                    if let Some((member_name, _)) = existing
                        .members
                        .iter()
                        .find(|(_, m)| m.access != MemberAccess::Denied)
                    {
                        return Err(PolicyError::LaxerThanParent {
                            symbol: format!("{full}::{member_name}"),
                            parent: full,
                        });
                    }
                }
                tighten(&full, &mut existing.access, access)?;
                Ok(existing)
            }
            Entry::Vacant(entry) => Ok(entry.insert(TypePolicy {
                access,
                name: full,
                members: BTreeMap::new(),
            })),
        }
    }

    pub fn types(&self) -> impl Iterator<Item = (&str, &TypePolicy)> {
        self.types.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_type(&self, name: &str) -> Option<&TypePolicy> {
        self.types.get(name)
    }
}

impl TypePolicy {
    pub fn access(&self) -> Access {
        self.access
    }

    /// Adds or tightens a member rule. Rewriters accumulate in registration order.
    pub fn member(
        &mut self,
        name: &str,
        access: MemberAccess,
        rewriters: Vec<MemberRewriter>,
    ) -> Result<&mut Self, PolicyError> {
        non_empty(name, "member")?;
        let full = format!("{}::{name}", self.name);
        if self.access == Access::Denied && access != MemberAccess::Denied {
            return Err(PolicyError::LaxerThanParent {
                symbol: full,
                parent: self.name.clone(),
            });
        }
        match self.members.get_mut(name) {
            Some(existing) => {
                let mut current = existing.access.as_access();
                tighten(&full, &mut current, access.as_access())?;
                existing.access = access;
                existing.rewriters.extend(rewriters);
            }
            None => {
                self.members.insert(
                    name.to_string(),
                    MemberPolicy { access, rewriters },
                );
            }
        }
        Ok(self)
    }

    /// Shorthand for an allowed member with rewriters.
    pub fn allow(&mut self, name: &str, rewriters: Vec<MemberRewriter>) -> Result<&mut Self, PolicyError> {
        self.member(name, MemberAccess::Allowed, rewriters)
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &MemberPolicy)> {
        self.members.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_member(&self, name: &str) -> Option<&MemberPolicy> {
        self.members.get(name)
    }
}

impl MemberPolicy {
    pub fn access(&self) -> MemberAccess {
        self.access
    }

    pub fn rewriters(&self) -> &[MemberRewriter] {
        &self.rewriters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tightening_is_accepted_and_widening_rejected() {
        let mut policy = AccessPolicy::new();
        policy.namespace("System", Access::Allowed).expect("allow");
        policy.namespace("System", Access::Neutral).expect("tighten");
        let err = policy.namespace("System", Access::Allowed).unwrap_err();
        assert_eq!(
            err,
            PolicyError::Widening {
                symbol: "System".to_string(),
                from: Access::Neutral,
                to: Access::Allowed,
            }
        );
    }

    #[test]
    fn child_cannot_be_laxer_than_denied_parent() {
        let mut policy = AccessPolicy::new();
        let io = policy.namespace("System.IO", Access::Denied).expect("deny");
        let err = io.ty("File", Access::Neutral).unwrap_err();
        assert!(matches!(err, PolicyError::LaxerThanParent { .. }));
        assert!(err.to_string().contains("System.IO.File"));
        io.ty("File", Access::Denied).expect("denied child is fine");

        let mut policy = AccessPolicy::new();
        let console = policy
            .namespace("System", Access::Neutral)
            .and_then(|ns| ns.ty("Console", Access::Denied))
            .expect("configure");
        let err = console
            .member("WriteLine", MemberAccess::Allowed, Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("System.Console::WriteLine"));
    }

    #[test]
    fn denying_a_parent_with_laxer_children_is_rejected() {
        let mut policy = AccessPolicy::new();
        policy
            .namespace("System", Access::Allowed)
            .and_then(|ns| ns.ty("String", Access::Allowed))
            .and_then(|ty| ty.allow("Concat", Vec::new()))
            .expect("configure");

        let err = policy.namespace("System", Access::Denied).unwrap_err();
        assert_eq!(
            err,
            PolicyError::LaxerThanParent {
                symbol: "System.String".to_string(),
                parent: "System".to_string(),
            }
        );
        assert_eq!(policy.get_namespace("System").map(|ns| ns.access()), Some(Access::Allowed));

        let ns = policy.namespace("System", Access::Allowed).expect("unchanged");
        let err = ns.ty("String", Access::Denied).unwrap_err();
        assert_eq!(
            err,
            PolicyError::LaxerThanParent {
                symbol: "System.String::Concat".to_string(),
                parent: "System.String".to_string(),
            }
        );

        // Whatever the builder accepted must reload.
        let text = policy.to_json_pretty().expect("serialize");
        assert_eq!(AccessPolicy::from_json(&text).expect("reload"), policy);
    }

    #[test]
    fn member_rewriters_accumulate() {
        let mut policy = AccessPolicy::new();
        let list = policy
            .namespace("System.Collections.Generic", Access::Neutral)
            .and_then(|ns| ns.ty("List`1", Access::Neutral))
            .expect("configure");
        list.allow("Add", vec![MemberRewriter::CountIncrement { units: 1 }])
            .and_then(|t| t.allow("Add", vec![MemberRewriter::DisposableReturn]))
            .expect("allow twice");
        let add = list.get_member("Add").expect("member");
        assert_eq!(
            add.rewriters(),
            &[
                MemberRewriter::CountIncrement { units: 1 },
                MemberRewriter::DisposableReturn
            ]
        );
        list.member("Add", MemberAccess::Denied, Vec::new())
            .expect("tighten member");
        let err = list
            .member("Add", MemberAccess::Allowed, Vec::new())
            .unwrap_err();
        assert!(matches!(err, PolicyError::Widening { .. }));
    }

    #[test]
    fn json_round_trip_restores_names_and_validates() {
        let mut policy = AccessPolicy::new();
        policy
            .namespace("System", Access::Neutral)
            .and_then(|ns| ns.ty("String", Access::Allowed))
            .expect("configure");
        let text = policy.to_json_pretty().expect("serialize");
        let loaded = AccessPolicy::from_json(&text).expect("load");
        assert_eq!(loaded, policy);

        let bad = r#"{"schema_version":"bastion.policy@0.1.0","namespaces":{"System.IO":{"access":"denied","types":{"File":{"access":"allowed"}}}}}"#;
        assert!(matches!(
            AccessPolicy::from_json(bad),
            Err(PolicyError::LaxerThanParent { .. })
        ));

        let wrong_schema = r#"{"schema_version":"other@1","namespaces":{}}"#;
        assert!(matches!(
            AccessPolicy::from_json(wrong_schema),
            Err(PolicyError::SchemaVersion { .. })
        ));
    }
}
