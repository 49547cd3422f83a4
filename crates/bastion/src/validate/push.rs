use bastion_il::{Op, TypeSig};

use crate::error::RewriteError;
use crate::validate::frame::size_error;
use crate::validate::layout::size_of;
use crate::validate::MethodScope;

/// Type of the value an instruction pushes, for instructions whose pushed value can be
/// arbitrarily large. Everything else pushes at most a pointer-sized value.
pub(crate) fn pushed_type(op: &Op, scope: &MethodScope<'_>) -> Option<TypeSig> {
    match op {
        Op::Ldarg(i) => scope.arg_type(*i),
        Op::Ldloc(i) => scope.local_type(*i).cloned(),
        Op::Ldfld(t) | Op::Ldsfld(t) => scope.field_type(*t).cloned(),
        Op::Ldelem(t) | Op::Ldobj(t) | Op::UnboxAny(t) => Some(t.clone()),
        Op::Ldind(kind) => Some(kind.as_type()),
        Op::Call(target) | Op::Callvirt(target) => scope
            .call_signature(*target)
            .map(|(_, ret, _, _)| ret)
            .filter(|ret| !ret.is_void()),
        Op::Newobj(target) => scope.program.target_owner(*target),
        _ => None,
    }
}

pub(crate) fn check_push(
    scope: &MethodScope<'_>,
    offset: usize,
    op: &Op,
    limit: u64,
) -> Result<(), RewriteError> {
    let Some(ty) = pushed_type(op, scope) else {
        return Ok(());
    };
    let size = size_of(&ty, scope.program).map_err(|e| size_error(&scope.info.qualified, e))?;
    if size > limit {
        let type_name = match &ty {
            TypeSig::Def(index) => scope
                .program
                .type_def(*index)
                .map(|t| t.full_name())
                .unwrap_or_else(|| ty.to_string()),
            other => other.to_string(),
        };
        return Err(RewriteError::PushTooLarge {
            method: scope.info.qualified.clone(),
            offset,
            type_name,
            size,
            limit,
        });
    }
    Ok(())
}
