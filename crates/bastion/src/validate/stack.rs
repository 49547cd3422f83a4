use bastion_il::Op;

use crate::validate::MethodScope;

/// Number of values an instruction pops and pushes. `None` when the effect cannot be
/// known locally (unresolvable call target).
pub(crate) fn stack_effect(op: &Op, scope: &MethodScope<'_>) -> Option<(usize, usize)> {
    Some(match op {
        Op::Nop | Op::Br(_) | Op::Leave(_) | Op::Endfinally | Op::Rethrow => (0, 0),
        Op::LdNull
        | Op::LdcI4(_)
        | Op::LdcI8(_)
        | Op::LdcR8(_)
        | Op::LdStr(_)
        | Op::Ldarg(_)
        | Op::Ldarga(_)
        | Op::Ldloc(_)
        | Op::Ldloca(_)
        | Op::Ldsfld(_)
        | Op::Ldsflda(_)
        | Op::Ldftn(_) => (0, 1),
        Op::Starg(_)
        | Op::Stloc(_)
        | Op::Pop
        | Op::Brtrue(_)
        | Op::Brfalse(_)
        | Op::Switch(_)
        | Op::Throw
        | Op::Stsfld(_)
        | Op::Initobj(_) => (1, 0),
        Op::Dup => (1, 2),
        Op::Add
        | Op::Sub
        | Op::Mul
        | Op::Div
        | Op::Rem
        | Op::And
        | Op::Or
        | Op::Xor
        | Op::Shl
        | Op::Shr
        | Op::Ceq
        | Op::Cgt
        | Op::Clt
        | Op::Ldelem(_)
        | Op::Ldelema(_) => (2, 1),
        Op::Neg
        | Op::Not
        | Op::ConvI4
        | Op::ConvI8
        | Op::ConvR8
        | Op::ConvU
        | Op::Newarr(_)
        | Op::Ldlen
        | Op::Ldfld(_)
        | Op::Ldflda(_)
        | Op::Ldind(_)
        | Op::Ldobj(_)
        | Op::Box(_)
        | Op::UnboxAny(_)
        | Op::Castclass(_)
        | Op::Isinst(_)
        | Op::Localloc => (1, 1),
        Op::Beq(_) | Op::Bne(_) | Op::Blt(_) | Op::Bge(_) | Op::Bgt(_) | Op::Ble(_) => (2, 0),
        Op::Stfld(_) | Op::Stind(_) | Op::Stobj(_) => (2, 0),
        Op::Stelem(_) => (3, 0),
        Op::Ret => (usize::from(!scope.info.ret.is_void()), 0),
        Op::Call(target) | Op::Callvirt(target) => {
            let (params, ret, is_static, _) = scope.call_signature(*target)?;
            (params.len() + usize::from(!is_static), usize::from(!ret.is_void()))
        }
        Op::Newobj(target) => {
            let (params, _, _, _) = scope.call_signature(*target)?;
            (params.len(), 1)
        }
    })
}
