use bastion_contracts::{
    GUARD_ARRAY_LENGTH, GUARD_COUNT, GUARD_COUNT_INT32, GUARD_COUNT_INT64, GUARD_ENTER,
    GUARD_ENUMERABLE, GUARD_GET, GUARD_JUMP, GUARD_NAMESPACE, GUARD_STRING_LENGTH,
    GUARD_TIME_UNTIL_LIMIT, GUARD_TRACK_DISPOSABLE, GUARD_TYPE,
};
use bastion_il::{InstrId, MemberRef, MethodTarget, Op, Program, TypeSig};

use crate::error::RewriteError;
use crate::rewrite::editor::BodyEditor;

/// Guard entry points injected code can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GuardEntry {
    Get,
    Enter,
    Jump,
    Count,
    CountInt32,
    CountInt64,
    ArrayLength,
    StringLength,
    Enumerable,
    TrackDisposable,
    TimeUntilLimit,
}

pub(crate) fn guard_type() -> TypeSig {
    TypeSig::named(GUARD_NAMESPACE, GUARD_TYPE)
}

pub(crate) fn enumerable_type() -> TypeSig {
    TypeSig::named("System.Collections", "IEnumerable")
}

pub(crate) fn time_span_type() -> TypeSig {
    TypeSig::named("System", "TimeSpan")
}

impl GuardEntry {
    fn member_ref(self) -> MemberRef {
        let guard = guard_type();
        let (name, params, ret) = match self {
            GuardEntry::Get => (GUARD_GET, vec![TypeSig::String], guard.clone()),
            GuardEntry::Enter => (GUARD_ENTER, vec![guard.clone()], TypeSig::Void),
            GuardEntry::Jump => (GUARD_JUMP, vec![guard.clone()], TypeSig::Void),
            GuardEntry::Count => (GUARD_COUNT, vec![guard.clone(), TypeSig::I64], TypeSig::Void),
            GuardEntry::CountInt32 => (GUARD_COUNT_INT32, vec![TypeSig::I32, guard.clone()], TypeSig::I32),
            GuardEntry::CountInt64 => (GUARD_COUNT_INT64, vec![TypeSig::I64, guard.clone()], TypeSig::I64),
            GuardEntry::ArrayLength => (GUARD_ARRAY_LENGTH, vec![TypeSig::Object, guard.clone()], TypeSig::Object),
            GuardEntry::StringLength => (GUARD_STRING_LENGTH, vec![TypeSig::String, guard.clone()], TypeSig::String),
            GuardEntry::Enumerable => (GUARD_ENUMERABLE, vec![enumerable_type(), guard.clone()], enumerable_type()),
            GuardEntry::TrackDisposable => (GUARD_TRACK_DISPOSABLE, vec![TypeSig::Object, guard.clone()], TypeSig::Object),
            GuardEntry::TimeUntilLimit => (GUARD_TIME_UNTIL_LIMIT, vec![guard.clone()], time_span_type()),
        };
        MemberRef::method(guard, name, true, params, ret)
    }
}

/// A call instruction as seen by member rewriters.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub id: InstrId,
    pub target: MethodTarget,
    pub params: Vec<TypeSig>,
    pub ret: TypeSig,
    pub is_static: bool,
    pub is_ctor: bool,
    /// `Newobj` rather than `Call`/`Callvirt`.
    pub constructs: bool,
}

/// Everything a member rewriter may touch while instrumenting one call site.
pub struct InstrumentationContext<'a> {
    pub(crate) editor: BodyEditor<'a>,
    pub(crate) program: &'a mut Program,
    pub(crate) guard_local: u16,
    pub(crate) method: &'a str,
}

impl<'a> InstrumentationContext<'a> {
    /// Interns the member ref for `entry` and returns a call to it.
    pub(crate) fn call(&mut self, entry: GuardEntry) -> Op {
        let index = self.program.intern_member_ref(entry.member_ref());
        Op::Call(MethodTarget::Ref(index))
    }

    pub(crate) fn load_guard(&self) -> Op {
        Op::Ldloc(self.guard_local)
    }

    /// `Ldloc guard; Call entry`.
    pub(crate) fn guarded(&mut self, entry: GuardEntry) -> Vec<Op> {
        vec![self.load_guard(), self.call(entry)]
    }

    pub(crate) fn call_site(&self, id: InstrId) -> Option<CallSite> {
        let (target, constructs) = match self.editor.op(id)? {
            Op::Call(t) | Op::Callvirt(t) => (*t, false),
            Op::Newobj(t) => (*t, true),
            _ => return None,
        };
        let (params, ret, is_static, is_ctor) = self.program.target_signature(target)?;
        Some(CallSite {
            id,
            target,
            params,
            ret,
            is_static,
            is_ctor,
            constructs,
        })
    }

    pub(crate) fn member(&self, site: &CallSite) -> Option<&MemberRef> {
        match site.target {
            MethodTarget::Ref(index) => self.program.member_ref(index),
            MethodTarget::Def(_) => None,
        }
    }

    pub(crate) fn member_name(&self, site: &CallSite) -> String {
        match site.target {
            MethodTarget::Ref(index) => self
                .program
                .member_ref(index)
                .map(|m| m.signature())
                .unwrap_or_else(|| format!("<member {index}>")),
            MethodTarget::Def(handle) => self.program.method_name(handle),
        }
    }

    pub(crate) fn unsupported(&self, site: &CallSite, reason: impl Into<String>) -> RewriteError {
        RewriteError::UnsupportedOverload {
            member: self.member_name(site),
            method: self.method.to_string(),
            reason: reason.into(),
        }
    }

    fn missing(&self) -> RewriteError {
        RewriteError::InvalidBody {
            method: self.method.to_string(),
            reason: "instrumentation anchor vanished".to_string(),
        }
    }

    pub(crate) fn insert_before(&mut self, anchor: InstrId, ops: Vec<Op>) -> Result<(), RewriteError> {
        match self.editor.insert_before(anchor, ops) {
            Some(_) => Ok(()),
            None => Err(self.missing()),
        }
    }

    pub(crate) fn insert_after(&mut self, anchor: InstrId, ops: Vec<Op>) -> Result<(), RewriteError> {
        match self.editor.insert_after(anchor, ops) {
            Some(_) => Ok(()),
            None => Err(self.missing()),
        }
    }

    pub(crate) fn add_local(&mut self, ty: TypeSig) -> Result<u16, RewriteError> {
        self.editor.add_local(ty).ok_or_else(|| RewriteError::InvalidBody {
            method: self.method.to_string(),
            reason: format!("more than {} locals", u16::MAX),
        })
    }

    pub(crate) fn replace_op(&mut self, id: InstrId, op: Op) -> Result<(), RewriteError> {
        if self.editor.replace_op(id, op) {
            Ok(())
        } else {
            Err(self.missing())
        }
    }
}
