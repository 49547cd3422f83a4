//! Read-only view of what a policy decides for the symbols a program uses.

use std::collections::BTreeMap;

use bastion_contracts::POLICY_REPORT_SCHEMA_VERSION;
use bastion_il::{MemberKind, Program, TypeRef, TypeSig};
use serde::Serialize;

use crate::error::RewriteError;
use crate::policy::AccessPolicy;
use crate::resolve::SymbolResolver;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Type,
    Method,
    Field,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolDecision {
    pub symbol: String,
    pub kind: SymbolKind,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rewriters: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyReport {
    pub schema_version: &'static str,
    pub program: String,
    pub symbols: Vec<SymbolDecision>,
}

impl PolicyReport {
    pub fn denied(&self) -> impl Iterator<Item = &SymbolDecision> {
        self.symbols.iter().filter(|s| !s.allowed)
    }
}

fn collect_refs<'a>(sig: &'a TypeSig, out: &mut BTreeMap<String, &'a TypeRef>) {
    match sig {
        TypeSig::Named(r) => {
            out.insert(r.full_name(), r);
        }
        TypeSig::Inst(base, args) => {
            collect_refs(base, out);
            args.iter().for_each(|a| collect_refs(a, out));
        }
        TypeSig::Array(e) | TypeSig::Ptr(e) | TypeSig::ByRef(e) => collect_refs(e, out),
        _ => {}
    }
}

/// Decisions for every external type and member the program names, sorted by symbol.
pub fn report_program(bytes: &[u8], policy: &AccessPolicy) -> Result<PolicyReport, RewriteError> {
    let program = bastion_il::decode(bytes)?;
    Ok(report(&program, policy))
}

pub fn report(program: &Program, policy: &AccessPolicy) -> PolicyReport {
    let resolver = SymbolResolver::new(policy);

    let mut types = BTreeMap::new();
    for ty in &program.types {
        ty.base.iter().for_each(|b| collect_refs(b, &mut types));
        ty.fields.iter().for_each(|f| collect_refs(&f.ty, &mut types));
        for method in &ty.methods {
            method.params.iter().for_each(|p| collect_refs(p, &mut types));
            collect_refs(&method.ret, &mut types);
            if let Some(body) = &method.body {
                body.locals.iter().for_each(|l| collect_refs(l, &mut types));
                body.instructions
                    .iter()
                    .filter_map(|i| i.op.type_operand())
                    .for_each(|t| collect_refs(t, &mut types));
            }
        }
    }
    for member in &program.member_refs {
        collect_refs(&member.owner, &mut types);
    }

    let mut symbols: Vec<SymbolDecision> = types
        .into_iter()
        .map(|(name, r)| {
            let outcome = resolver.check_type_ref(r, "report");
            SymbolDecision {
                symbol: name,
                kind: SymbolKind::Type,
                allowed: outcome.is_ok(),
                rewriters: Vec::new(),
                reason: outcome.err().map(|e| e.to_string()),
            }
        })
        .collect();

    let mut members = BTreeMap::new();
    for member in &program.member_refs {
        members.entry(member.signature()).or_insert(member);
    }
    for (signature, member) in members {
        let outcome = resolver.check_member(member, "report");
        symbols.push(SymbolDecision {
            symbol: signature,
            kind: match member.kind {
                MemberKind::Method { .. } => SymbolKind::Method,
                MemberKind::Field { .. } => SymbolKind::Field,
            },
            allowed: outcome.is_ok(),
            rewriters: outcome
                .as_ref()
                .map(|rs| rs.iter().map(|r| r.name()).collect())
                .unwrap_or_default(),
            reason: outcome.err().map(|e| e.to_string()),
        });
    }

    PolicyReport {
        schema_version: POLICY_REPORT_SCHEMA_VERSION,
        program: program.name.clone(),
        symbols,
    }
}

#[cfg(test)]
mod tests {
    use bastion_il::{MemberRef, ProgramBuilder, TypeKind};

    use super::*;

    #[test]
    fn report_lists_decisions_with_rewriters() {
        let mut b = ProgramBuilder::new("report");
        b.add_type("Demo", "Program", TypeKind::Class);
        b.member(MemberRef::method(
            TypeSig::named("System", "Console"),
            "WriteLine",
            true,
            vec![TypeSig::String],
            TypeSig::Void,
        ));
        b.member(MemberRef::method(
            TypeSig::String,
            "Concat",
            true,
            vec![TypeSig::String, TypeSig::String],
            TypeSig::String,
        ));
        let report = report(&b.build(), &AccessPolicy::safe_default());

        let console = report
            .symbols
            .iter()
            .find(|s| s.symbol == "System.Console")
            .expect("type entry");
        assert!(!console.allowed);

        let concat = report
            .symbols
            .iter()
            .find(|s| s.symbol.starts_with("System.String::Concat"))
            .expect("member entry");
        assert!(concat.allowed);
        assert_eq!(concat.rewriters, vec!["string_return_length"]);
        assert_eq!(report.denied().count(), 2);
    }
}
