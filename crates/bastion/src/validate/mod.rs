//! Static checks run over a method before any code is injected.

pub(crate) mod frame;
pub(crate) mod layout;
pub(crate) mod pointer;
pub(crate) mod push;
pub(crate) mod stack;

use bastion_il::{FieldTarget, MethodBody, MethodDef, MethodTarget, Op, Program, TypeSig};

use crate::error::RewriteError;

/// Signature facts about the method being rewritten, detached from its body.
#[derive(Debug, Clone)]
pub(crate) struct MethodInfo {
    pub(crate) qualified: String,
    pub(crate) owner: u32,
    pub(crate) is_static: bool,
    pub(crate) params: Vec<TypeSig>,
    pub(crate) ret: TypeSig,
}

impl MethodInfo {
    pub(crate) fn new(qualified: String, owner: u32, def: &MethodDef) -> Self {
        Self {
            qualified,
            owner,
            is_static: def.is_static,
            params: def.params.clone(),
            ret: def.ret.clone(),
        }
    }
}

/// A method body together with everything needed to type its stack slots.
pub(crate) struct MethodScope<'a> {
    pub(crate) program: &'a Program,
    pub(crate) info: &'a MethodInfo,
    pub(crate) body: &'a MethodBody,
}

impl<'a> MethodScope<'a> {
    /// Type of argument `index`, counting the implicit `this` of instance methods.
    pub(crate) fn arg_type(&self, index: u16) -> Option<TypeSig> {
        let index = usize::from(index);
        if self.info.is_static {
            return self.info.params.get(index).cloned();
        }
        if index == 0 {
            let owner = TypeSig::Def(self.info.owner);
            let is_struct = self
                .program
                .type_def(self.info.owner)
                .is_some_and(|t| t.is_struct());
            return Some(if is_struct { TypeSig::by_ref(owner) } else { owner });
        }
        self.info.params.get(index - 1).cloned()
    }

    pub(crate) fn local_type(&self, index: u16) -> Option<&'a TypeSig> {
        self.body.locals.get(usize::from(index))
    }

    pub(crate) fn field_type(&self, target: FieldTarget) -> Option<&'a TypeSig> {
        self.program.field_type(target)
    }

    pub(crate) fn call_signature(&self, target: MethodTarget) -> Option<(Vec<TypeSig>, TypeSig, bool, bool)> {
        self.program.target_signature(target)
    }

    fn invalid(&self, reason: String) -> RewriteError {
        RewriteError::InvalidBody {
            method: self.info.qualified.clone(),
            reason,
        }
    }

    /// Rejects operands that point outside the method's locals, arguments, or the
    /// program's tables, so later passes can index without re-checking.
    pub(crate) fn check_operands(&self) -> Result<(), RewriteError> {
        let arg_count = self.info.params.len() + usize::from(!self.info.is_static);
        for (offset, instr) in self.body.instructions.iter().enumerate() {
            match &instr.op {
                Op::Ldarg(i) | Op::Ldarga(i) | Op::Starg(i) if usize::from(*i) >= arg_count => {
                    return Err(self.invalid(format!("argument {i} out of range at {offset}")));
                }
                Op::Ldloc(i) | Op::Ldloca(i) | Op::Stloc(i)
                    if usize::from(*i) >= self.body.locals.len() =>
                {
                    return Err(self.invalid(format!("local {i} out of range at {offset}")));
                }
                op => {
                    if let Some(target) = op.method_target() {
                        if self.program.target_signature(target).is_none() {
                            return Err(self.invalid(format!("unknown call target at {offset}")));
                        }
                    }
                    if let Some(target) = op.field_target() {
                        if self.program.field_type(target).is_none() {
                            return Err(self.invalid(format!("unknown field at {offset}")));
                        }
                    }
                    for target in op.branch_targets() {
                        if self.body.index_of(target).is_none() {
                            return Err(self.invalid(format!("dangling branch at {offset}")));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
