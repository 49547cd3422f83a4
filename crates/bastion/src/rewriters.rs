//! Per-member instrumentation strategies attached to allowed members by the policy.

use bastion_il::{InstrId, MemberRef, MethodTarget, Op, TypeSig};
use serde::{Deserialize, Serialize};

use crate::error::RewriteError;
use crate::rewrite::context::{time_span_type, CallSite, GuardEntry, InstrumentationContext};

fn one() -> i64 {
    1
}

/// How calls to one member are instrumented. Applied in registration order; each one
/// reports whether it recognized the call shape and changed anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemberRewriter {
    /// Charge a fixed number of units after every call.
    CountIncrement {
        #[serde(default = "one")]
        units: i64,
    },
    /// Charge the value of an integer argument (a size or capacity) before the call.
    CountFromArgument { parameter: usize },
    /// Charge the length of the returned array.
    ArrayReturnLength,
    /// Charge the length of the returned string.
    StringReturnLength,
    /// Wrap sequence arguments so every item the callee pulls is charged.
    EnumerableArgument,
    /// Register the returned object for disposal when the scope closes.
    DisposableReturn,
    /// Route pattern-matching calls to the overload that takes a timeout, bounded by the
    /// remaining time budget.
    PatternTimeout,
}

impl MemberRewriter {
    pub fn name(&self) -> &'static str {
        match self {
            MemberRewriter::CountIncrement { .. } => "count_increment",
            MemberRewriter::CountFromArgument { .. } => "count_from_argument",
            MemberRewriter::ArrayReturnLength => "array_return_length",
            MemberRewriter::StringReturnLength => "string_return_length",
            MemberRewriter::EnumerableArgument => "enumerable_argument",
            MemberRewriter::DisposableReturn => "disposable_return",
            MemberRewriter::PatternTimeout => "pattern_timeout",
        }
    }

    pub fn try_rewrite(
        &self,
        site: InstrId,
        ctx: &mut InstrumentationContext<'_>,
    ) -> Result<bool, RewriteError> {
        let Some(call) = ctx.call_site(site) else {
            return Ok(false);
        };
        match self {
            MemberRewriter::CountIncrement { units } => {
                let mut ops = vec![ctx.load_guard(), Op::LdcI8(*units)];
                ops.push(ctx.call(GuardEntry::Count));
                ctx.insert_after(site, ops)?;
                Ok(true)
            }
            MemberRewriter::CountFromArgument { parameter } => count_argument(&call, *parameter, ctx),
            MemberRewriter::ArrayReturnLength => {
                if !matches!(pushed(&call), Some(TypeSig::Array(_))) {
                    return Ok(false);
                }
                let ops = ctx.guarded(GuardEntry::ArrayLength);
                ctx.insert_after(site, ops)?;
                Ok(true)
            }
            MemberRewriter::StringReturnLength => {
                if !matches!(pushed(&call), Some(TypeSig::String)) {
                    return Ok(false);
                }
                let ops = ctx.guarded(GuardEntry::StringLength);
                ctx.insert_after(site, ops)?;
                Ok(true)
            }
            MemberRewriter::EnumerableArgument => wrap_sequences(&call, ctx),
            MemberRewriter::DisposableReturn => {
                if pushed(&call).is_none() {
                    return Ok(false);
                }
                let ops = ctx.guarded(GuardEntry::TrackDisposable);
                ctx.insert_after(site, ops)?;
                Ok(true)
            }
            MemberRewriter::PatternTimeout => pattern_timeout(&call, ctx),
        }
    }
}

/// Type of the value the call leaves on the stack.
fn pushed(call: &CallSite) -> Option<TypeSig> {
    if call.constructs {
        return Some(TypeSig::Object);
    }
    (!call.ret.is_void()).then(|| call.ret.clone())
}

/// Inserts, before the call, code that lifts the arguments above parameter `index` into
/// fresh locals, runs `wrap` on the now-topmost argument, and pushes the lifted arguments
/// back.
fn around_argument(
    call: &CallSite,
    index: usize,
    wrap: Vec<Op>,
    ctx: &mut InstrumentationContext<'_>,
) -> Result<(), RewriteError> {
    let later = &call.params[index + 1..];
    let spill = later
        .iter()
        .map(|ty| ctx.add_local(ty.clone()))
        .collect::<Result<Vec<u16>, _>>()?;
    let mut ops = Vec::with_capacity(spill.len() * 2 + wrap.len());
    ops.extend(spill.iter().rev().map(|slot| Op::Stloc(*slot)));
    ops.extend(wrap);
    ops.extend(spill.iter().map(|slot| Op::Ldloc(*slot)));
    ctx.insert_before(call.id, ops)
}

fn count_argument(
    call: &CallSite,
    parameter: usize,
    ctx: &mut InstrumentationContext<'_>,
) -> Result<bool, RewriteError> {
    let entry = match call.params.get(parameter) {
        Some(TypeSig::I32) => GuardEntry::CountInt32,
        Some(TypeSig::I64) => GuardEntry::CountInt64,
        // Other overloads of the same member take no size argument here.
        _ => return Ok(false),
    };
    let wrap = ctx.guarded(entry);
    around_argument(call, parameter, wrap, ctx)?;
    Ok(true)
}

fn is_sequence(ty: &TypeSig) -> bool {
    ty.as_type_ref().is_some_and(|r| {
        (r.namespace == "System.Collections.Generic" && r.name == "IEnumerable`1")
            || (r.namespace == "System.Collections" && r.name == "IEnumerable")
    })
}

fn wrap_sequences(call: &CallSite, ctx: &mut InstrumentationContext<'_>) -> Result<bool, RewriteError> {
    let positions: Vec<usize> = call
        .params
        .iter()
        .enumerate()
        .filter(|(_, ty)| is_sequence(ty))
        .map(|(i, _)| i)
        .collect();
    for &index in &positions {
        let wrap = ctx.guarded(GuardEntry::Enumerable);
        around_argument(call, index, wrap, ctx)?;
    }
    Ok(!positions.is_empty())
}

fn regex_options_type() -> TypeSig {
    TypeSig::named("System.Text.RegularExpressions", "RegexOptions")
}

fn pattern_timeout(call: &CallSite, ctx: &mut InstrumentationContext<'_>) -> Result<bool, RewriteError> {
    let Some(member) = ctx.member(call).cloned() else {
        return Ok(false);
    };
    if !call.is_static && !call.is_ctor {
        // Instance calls use the timeout their instance was constructed with.
        return Ok(false);
    }
    let time_span = time_span_type();
    if call.params.iter().any(|p| *p == time_span) {
        return Err(RewriteError::TimeoutAlreadySupplied {
            member: member.signature(),
            method: ctx.method.to_string(),
        });
    }

    let options = regex_options_type();
    let has_options = call.params.last() == Some(&options);
    let leading = if has_options {
        &call.params[..call.params.len() - 1]
    } else {
        &call.params[..]
    };
    let strings_needed = if call.is_ctor { 1 } else { 2 };
    if leading.len() < strings_needed || leading.iter().any(|p| *p != TypeSig::String) {
        return Err(ctx.unsupported(call, "no timeout overload for this parameter list"));
    }

    let mut ops = Vec::new();
    let mut params = call.params.clone();
    if !has_options {
        ops.push(Op::LdcI4(0));
        params.push(options);
    }
    ops.extend(ctx.guarded(GuardEntry::TimeUntilLimit));
    params.push(time_span);
    ctx.insert_before(call.id, ops)?;

    let replacement = MemberRef { params, ..member };
    let index = ctx.program.intern_member_ref(replacement);
    let target = MethodTarget::Ref(index);
    let op = match ctx.editor.op(call.id) {
        Some(Op::Newobj(_)) => Op::Newobj(target),
        Some(Op::Callvirt(_)) => Op::Callvirt(target),
        _ => Op::Call(target),
    };
    ctx.replace_op(call.id, op)?;
    Ok(true)
}
