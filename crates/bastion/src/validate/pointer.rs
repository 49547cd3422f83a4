//! Typed indirect memory access.
//!
//! Every `Ldind`/`Stind`/`Ldobj`/`Stobj` must read or write through an address whose origin
//! is visible a few instructions earlier in the same straight-line block and whose pointee
//! type agrees with the access type.

use bastion_il::{IndKind, Op, TypeSig};

use crate::error::RewriteError;
use crate::settings::Patterns;
use crate::validate::layout::is_reference;
use crate::validate::stack::stack_effect;
use crate::validate::MethodScope;

/// Instructions examined backwards from the access before giving up.
const LOOKBACK: usize = 16;

#[derive(Debug, Clone, PartialEq)]
enum Access {
    Ind(IndKind),
    Obj(TypeSig),
}

impl Access {
    fn declared(&self) -> TypeSig {
        match self {
            Access::Ind(kind) => kind.as_type(),
            Access::Obj(ty) => ty.clone(),
        }
    }
}

/// Checks the instruction at `offset` when it is an indirect access.
pub(crate) fn check_access(
    scope: &MethodScope<'_>,
    offset: usize,
    patterns: &Patterns,
) -> Result<(), RewriteError> {
    let (access, depth) = match &scope.body.instructions[offset].op {
        Op::Ldind(kind) => (Access::Ind(*kind), 0),
        Op::Stind(kind) => (Access::Ind(*kind), 1),
        Op::Ldobj(ty) => (Access::Obj(ty.clone()), 0),
        Op::Stobj(ty) => (Access::Obj(ty.clone()), 1),
        Op::Localloc => {
            return Err(RewriteError::StackAllocation {
                method: scope.info.qualified.clone(),
                offset,
            })
        }
        _ => return Ok(()),
    };
    let declared = access.declared();
    let declared_name = display_name(&declared, scope);
    if patterns.allows_pointer_operation(&declared_name) {
        return Ok(());
    }
    let Some(pointee) = trace_address(scope, offset, depth) else {
        return Err(RewriteError::PointerUntraceable {
            method: scope.info.qualified.clone(),
            offset,
            declared: declared_name,
        });
    };
    if compatible(&access, &pointee, scope) {
        Ok(())
    } else {
        Err(RewriteError::PointerMismatch {
            method: scope.info.qualified.clone(),
            offset,
            expected: declared_name,
            actual: display_name(&pointee, scope),
        })
    }
}

fn display_name(sig: &TypeSig, scope: &MethodScope<'_>) -> String {
    match sig {
        TypeSig::Def(index) => scope
            .program
            .type_def(*index)
            .map(|t| t.full_name())
            .unwrap_or_else(|| sig.to_string()),
        other => other.to_string(),
    }
}

fn compatible(access: &Access, pointee: &TypeSig, scope: &MethodScope<'_>) -> bool {
    match access {
        Access::Ind(IndKind::Ref) => is_reference(pointee, scope.program),
        Access::Ind(IndKind::I) => matches!(pointee, TypeSig::IntPtr | TypeSig::Ptr(_)),
        Access::Ind(kind) => kind.as_type() == *pointee,
        Access::Obj(ty) => ty == pointee,
    }
}

/// Walks backwards from `offset` to the instruction that produced the stack slot `depth`
/// below the top, returning the pointee type of the address it pushed.
fn trace_address(scope: &MethodScope<'_>, offset: usize, depth: usize) -> Option<TypeSig> {
    let instructions = &scope.body.instructions;
    let mut need = depth;
    for j in (offset.saturating_sub(LOOKBACK)..offset).rev() {
        // Control may enter between j and j + 1 from elsewhere.
        if scope.body.is_referenced(instructions[j + 1].id) {
            return None;
        }
        let op = &instructions[j].op;
        if op.is_branch() || op.ends_flow() {
            return None;
        }
        let (pops, pushes) = stack_effect(op, scope)?;
        if need < pushes {
            if matches!(op, Op::Dup) {
                need = 0;
                continue;
            }
            return origin(op, scope);
        }
        need = need - pushes + pops;
    }
    None
}

fn origin(op: &Op, scope: &MethodScope<'_>) -> Option<TypeSig> {
    let pointee_of = |sig: TypeSig| sig.pointee().cloned();
    match op {
        Op::Ldloca(i) => scope.local_type(*i).cloned(),
        Op::Ldarga(i) => scope.arg_type(*i),
        Op::Ldflda(t) | Op::Ldsflda(t) => scope.field_type(*t).cloned(),
        Op::Ldelema(ty) => Some(ty.clone()),
        Op::Ldloc(i) => scope.local_type(*i).cloned().and_then(pointee_of),
        Op::Ldarg(i) => scope.arg_type(*i).and_then(pointee_of),
        Op::Ldfld(t) | Op::Ldsfld(t) => scope.field_type(*t).cloned().and_then(pointee_of),
        Op::Call(target) | Op::Callvirt(target) => scope
            .call_signature(*target)
            .and_then(|(_, ret, _, _)| pointee_of(ret)),
        _ => None,
    }
}
