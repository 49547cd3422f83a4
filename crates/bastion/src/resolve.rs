//! Turning program references into policy decisions.

use bastion_contracts::GUARD_NAMESPACE;
use bastion_il::{MemberRef, Program, RefKind, TypeRef, TypeSig};

use crate::error::RewriteError;
use crate::policy::{Access, AccessPolicy, MemberAccess};
use crate::rewriters::MemberRewriter;

/// Outcome of resolving one symbol against a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision<'p> {
    Denied,
    /// Allowed, with the rewriters to apply at each use site (possibly none).
    Allowed(&'p [MemberRewriter]),
}

impl Decision<'_> {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }
}

impl AccessPolicy {
    /// Resolves a type (`member == None`) or a member of a type.
    ///
    /// Anything outside a configured namespace is denied. A type that has no rule of its own
    /// inherits an `Allowed` namespace and is denied otherwise. A member without a rule is
    /// allowed only when its type is allowed outright; `Neutral` types require every member
    /// to be listed.
    pub fn resolve(&self, namespace: &str, type_name: &str, member: Option<&str>) -> Decision<'_> {
        let Some(ns) = self.get_namespace(namespace) else {
            return Decision::Denied;
        };
        if ns.access() == Access::Denied {
            return Decision::Denied;
        }
        let ty = ns.get_type(type_name);
        let type_access = match ty {
            Some(ty) => ty.access(),
            None if ns.access() == Access::Allowed => Access::Allowed,
            None => Access::Denied,
        };
        if type_access == Access::Denied {
            return Decision::Denied;
        }
        let Some(member) = member else {
            return Decision::Allowed(&[]);
        };
        match ty.and_then(|ty| ty.get_member(member)) {
            Some(rule) if rule.access() == MemberAccess::Allowed => {
                Decision::Allowed(rule.rewriters())
            }
            Some(_) => Decision::Denied,
            None if type_access == Access::Allowed => Decision::Allowed(&[]),
            None => Decision::Denied,
        }
    }
}

fn is_reserved(namespace: &str) -> bool {
    namespace == GUARD_NAMESPACE
        || namespace
            .strip_prefix(GUARD_NAMESPACE)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Resolves the references one program makes, producing errors that name the symbol and
/// the place it was used.
pub(crate) struct SymbolResolver<'a> {
    policy: &'a AccessPolicy,
}

impl<'a> SymbolResolver<'a> {
    pub(crate) fn new(policy: &'a AccessPolicy) -> Self {
        Self { policy }
    }

    pub(crate) fn check_type_ref(&self, r: &TypeRef, context: &str) -> Result<(), RewriteError> {
        if is_reserved(&r.namespace) {
            return Err(RewriteError::ReservedNamespace {
                symbol: r.full_name(),
                context: context.to_string(),
            });
        }
        match self.policy.resolve(&r.namespace, &r.name, None) {
            Decision::Allowed(_) => Ok(()),
            Decision::Denied => Err(RewriteError::DeniedType {
                type_name: r.full_name(),
                context: context.to_string(),
            }),
        }
    }

    /// Checks every external type mentioned by a signature. Program-defined types and
    /// primitive keywords are always available.
    pub(crate) fn check_sig(&self, sig: &TypeSig, context: &str) -> Result<(), RewriteError> {
        match sig {
            TypeSig::Named(r) => self.check_type_ref(r, context),
            TypeSig::Inst(base, args) => {
                self.check_sig(base, context)?;
                args.iter().try_for_each(|arg| self.check_sig(arg, context))
            }
            TypeSig::Array(elem) | TypeSig::Ptr(elem) | TypeSig::ByRef(elem) => {
                self.check_sig(elem, context)
            }
            _ => Ok(()),
        }
    }

    /// Resolves a member reference, returning the rewriters its use sites receive.
    pub(crate) fn check_member(
        &self,
        member: &MemberRef,
        context: &str,
    ) -> Result<&'a [MemberRewriter], RewriteError> {
        member
            .params
            .iter()
            .chain(std::iter::once(&member.ret))
            .try_for_each(|sig| self.check_sig(sig, context))?;

        let owner = match &member.owner {
            TypeSig::Array(elem) => {
                // Array members are harmless once the element type is permitted.
                self.check_sig(elem, context)?;
                return Ok(&[]);
            }
            TypeSig::Def(_) => return Ok(&[]),
            TypeSig::Inst(base, args) => {
                args.iter().try_for_each(|arg| self.check_sig(arg, context))?;
                base.as_ref()
            }
            other => other,
        };

        let (namespace, type_name, kind) = match owner {
            TypeSig::Named(r) => (r.namespace.clone(), r.name.clone(), r.kind),
            TypeSig::Def(_) => return Ok(&[]),
            other => match other.primitive_name() {
                Some(full) => {
                    let (ns, name) = full.rsplit_once('.').unwrap_or(("", full));
                    (ns.to_string(), name.to_string(), RefKind::Class)
                }
                None => {
                    return Err(RewriteError::UnsupportedReference {
                        symbol: member.qualified_name(),
                        context: context.to_string(),
                    })
                }
            },
        };

        if is_reserved(&namespace) {
            return Err(RewriteError::ReservedNamespace {
                symbol: member.qualified_name(),
                context: context.to_string(),
            });
        }

        if kind == RefKind::Delegate && (member.is_ctor() || member.name == "Invoke") {
            // Constructing and invoking a delegate only runs code the program already has.
            return match self.policy.resolve(&namespace, &type_name, None) {
                Decision::Allowed(_) => Ok(&[]),
                Decision::Denied => Err(RewriteError::DeniedType {
                    type_name: format!("{namespace}.{type_name}"),
                    context: context.to_string(),
                }),
            };
        }

        match self.policy.resolve(&namespace, &type_name, Some(&member.name)) {
            Decision::Allowed(rewriters) => Ok(rewriters),
            Decision::Denied => Err(RewriteError::DeniedMember {
                member: member.qualified_name(),
                context: context.to_string(),
            }),
        }
    }

    /// Checks the declared types of a program: program types may not pose as the guard
    /// runtime, and their base and field types must be permitted.
    pub(crate) fn check_program_types(&self, program: &Program) -> Result<(), RewriteError> {
        for ty in &program.types {
            let context = format!("type {}", ty.full_name());
            if is_reserved(&ty.namespace) {
                return Err(RewriteError::ReservedNamespace {
                    symbol: ty.full_name(),
                    context,
                });
            }
            if let Some(base) = &ty.base {
                self.check_sig(base, &context)?;
            }
            for field in &ty.fields {
                self.check_sig(&field.ty, &format!("field {}::{}", ty.full_name(), field.name))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MemberAccess;

    fn policy() -> AccessPolicy {
        let mut policy = AccessPolicy::new();
        let system = policy.namespace("System", Access::Neutral).expect("ns");
        system
            .ty("String", Access::Neutral)
            .and_then(|t| t.allow("Concat", vec![MemberRewriter::StringReturnLength]))
            .and_then(|t| t.member("Intern", MemberAccess::Denied, Vec::new()))
            .expect("string");
        system.ty("Math", Access::Allowed).expect("math");
        system.ty("Console", Access::Denied).expect("console");
        system.ty("Func`1", Access::Allowed).expect("func");
        policy.namespace("System.Linq", Access::Allowed).expect("linq");
        policy
    }

    #[test]
    fn resolution_follows_the_hierarchy() {
        let policy = policy();
        assert_eq!(policy.resolve("System.IO", "File", None), Decision::Denied);
        assert_eq!(policy.resolve("System", "Console", None), Decision::Denied);
        assert_eq!(
            policy.resolve("System", "Console", Some("WriteLine")),
            Decision::Denied
        );
        assert!(policy.resolve("System", "String", None).is_allowed());
        assert_eq!(
            policy.resolve("System", "String", Some("Concat")),
            Decision::Allowed(&[MemberRewriter::StringReturnLength])
        );
        assert_eq!(policy.resolve("System", "String", Some("Intern")), Decision::Denied);
        // Neutral type: unlisted members are denied.
        assert_eq!(policy.resolve("System", "String", Some("Format")), Decision::Denied);
        // Allowed type: unlisted members are allowed.
        assert!(policy.resolve("System", "Math", Some("Abs")).is_allowed());
        // Unlisted type under a neutral namespace.
        assert_eq!(policy.resolve("System", "GC", None), Decision::Denied);
        // Unlisted type under an allowed namespace.
        assert!(policy.resolve("System.Linq", "Enumerable", Some("Range")).is_allowed());
    }

    #[test]
    fn member_refs_resolve_through_owner_shape() {
        let policy = policy();
        let resolver = SymbolResolver::new(&policy);
        let concat = MemberRef::method(
            TypeSig::String,
            "Concat",
            true,
            vec![TypeSig::String, TypeSig::String],
            TypeSig::String,
        );
        assert_eq!(
            resolver.check_member(&concat, "test").expect("concat"),
            &[MemberRewriter::StringReturnLength]
        );

        let invoke = MemberRef::method(
            TypeSig::Inst(
                Box::new(TypeSig::Named(TypeRef::delegate("System", "Func`1"))),
                vec![TypeSig::I32],
            ),
            "Invoke",
            false,
            Vec::new(),
            TypeSig::I32,
        );
        assert!(resolver.check_member(&invoke, "test").is_ok());

        let write = MemberRef::method(
            TypeSig::named("System", "Console"),
            "WriteLine",
            true,
            vec![TypeSig::String],
            TypeSig::Void,
        );
        let err = resolver.check_member(&write, "method Demo.Main").unwrap_err();
        assert!(err.to_string().contains("System.Console::WriteLine"));

        let array_len = MemberRef::method(
            TypeSig::array(TypeSig::named("System", "Console")),
            "get_Length",
            false,
            Vec::new(),
            TypeSig::I32,
        );
        assert!(matches!(
            resolver.check_member(&array_len, "test"),
            Err(RewriteError::DeniedType { .. })
        ));
    }

    #[test]
    fn guard_runtime_is_reserved() {
        let policy = policy();
        let resolver = SymbolResolver::new(&policy);
        let spoof = MemberRef::method(
            TypeSig::named("Bastion.Runtime", "RuntimeGuard"),
            "Get",
            true,
            vec![TypeSig::String],
            TypeSig::Object,
        );
        assert!(matches!(
            resolver.check_member(&spoof, "test"),
            Err(RewriteError::ReservedNamespace { .. })
        ));
        assert!(!is_reserved("Bastion.RuntimeExtras"));
        assert!(is_reserved("Bastion.Runtime.Internal"));
    }
}
