//! Runtime binding of the guard entry points injected by the rewriter.

use std::sync::Arc;

use bastion::{Disposable, GuardToken, ResourceGuard};
use bastion_contracts::{
    GUARD_ARRAY_LENGTH, GUARD_COUNT, GUARD_COUNT_INT32, GUARD_COUNT_INT64, GUARD_ENTER,
    GUARD_ENUMERABLE, GUARD_GET, GUARD_JUMP, GUARD_STRING_LENGTH, GUARD_TIME_UNTIL_LIMIT,
    GUARD_TRACK_DISPOSABLE,
};

use super::ParamKind::{Any, Int, Seq, Str};
use super::{arg, host, int_arg, str_arg, HostMember, HostObject, Sequence};
use crate::error::{fault, Flow};
use crate::value::{lock, Value};

type Ret = Result<Option<Value>, Flow>;

const OWNER: &str = "Bastion.Runtime.RuntimeGuard";

pub(super) static MEMBERS: &[HostMember] = &[
    HostMember { owner: OWNER, name: GUARD_GET, is_static: true, params: &[Str], func: get },
    HostMember { owner: OWNER, name: GUARD_ENTER, is_static: true, params: &[Any], func: enter },
    HostMember { owner: OWNER, name: GUARD_JUMP, is_static: true, params: &[Any], func: jump },
    HostMember { owner: OWNER, name: GUARD_COUNT, is_static: true, params: &[Any, Int], func: count },
    HostMember { owner: OWNER, name: GUARD_COUNT_INT32, is_static: true, params: &[Int, Any], func: count_flow },
    HostMember { owner: OWNER, name: GUARD_COUNT_INT64, is_static: true, params: &[Int, Any], func: count_flow },
    HostMember { owner: OWNER, name: GUARD_ARRAY_LENGTH, is_static: true, params: &[Any, Any], func: array_length },
    HostMember { owner: OWNER, name: GUARD_STRING_LENGTH, is_static: true, params: &[Str, Any], func: string_length },
    HostMember { owner: OWNER, name: GUARD_ENUMERABLE, is_static: true, params: &[Seq, Any], func: enumerable },
    HostMember { owner: OWNER, name: GUARD_TRACK_DISPOSABLE, is_static: true, params: &[Any, Any], func: track_disposable },
    HostMember { owner: OWNER, name: GUARD_TIME_UNTIL_LIMIT, is_static: true, params: &[Any], func: time_until_limit },
];

fn guard_arg(args: &[Value], index: usize) -> Result<&Arc<ResourceGuard>, Flow> {
    match arg(args, index)? {
        Value::Guard(guard) => Ok(guard),
        other => Err(fault(format!("expected a runtime guard, found {other}"))),
    }
}

fn get(args: Vec<Value>) -> Ret {
    let text = str_arg(&args, 0)?;
    let token = GuardToken::parse_hex(&text)
        .ok_or_else(|| fault(format!("malformed guard token {text:?}")))?;
    Ok(Some(Value::Guard(token.guard())))
}

fn enter(args: Vec<Value>) -> Ret {
    guard_arg(&args, 0)?.on_entry()?;
    Ok(None)
}

fn jump(args: Vec<Value>) -> Ret {
    guard_arg(&args, 0)?.on_backward_jump()?;
    Ok(None)
}

fn count(args: Vec<Value>) -> Ret {
    guard_arg(&args, 0)?.charge(int_arg(&args, 1)?)?;
    Ok(None)
}

fn count_flow(mut args: Vec<Value>) -> Ret {
    guard_arg(&args, 1)?.charge(int_arg(&args, 0)?)?;
    Ok(Some(args.swap_remove(0)))
}

fn len_units(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

fn array_length(mut args: Vec<Value>) -> Ret {
    let guard = guard_arg(&args, 1)?;
    match arg(&args, 0)? {
        Value::Array(array) => guard.charge(len_units(lock(&array.items).len()))?,
        Value::Null => {}
        other => return Err(fault(format!("array length charge on {other}"))),
    }
    Ok(Some(args.swap_remove(0)))
}

fn string_length(mut args: Vec<Value>) -> Ret {
    let guard = guard_arg(&args, 1)?;
    if let Value::Str(text) = arg(&args, 0)? {
        guard.charge(len_units(text.chars().count()))?;
    }
    Ok(Some(args.swap_remove(0)))
}

fn enumerable(mut args: Vec<Value>) -> Ret {
    let guard = Arc::clone(guard_arg(&args, 1)?);
    let inner = args.swap_remove(0);
    if inner.is_null() {
        return Ok(Some(Value::Null));
    }
    Ok(host(HostObject::Sequence(Sequence::Charged { inner, guard })))
}

fn track_disposable(mut args: Vec<Value>) -> Ret {
    let guard = guard_arg(&args, 1)?;
    if let Value::Host(object) = arg(&args, 0)? {
        if let HostObject::StringWriter(state) = object.as_ref() {
            let item: Arc<dyn Disposable> = state.clone();
            guard.track(item)?;
        }
    }
    Ok(Some(args.swap_remove(0)))
}

/// Remaining budget as a `TimeSpan`, represented in microseconds.
fn time_until_limit(args: Vec<Value>) -> Ret {
    let remaining = guard_arg(&args, 0)?.time_until_limit()?;
    Ok(Some(Value::I64(i64::try_from(remaining.as_micros()).unwrap_or(i64::MAX))))
}

#[cfg(test)]
mod tests {
    use bastion::{GuardError, ResourceLimits};

    use super::*;
    use crate::error::ExecError;

    fn token(seed: &str) -> GuardToken {
        GuardToken::derive(&[&b"runtime-binding-test"[..], seed.as_bytes()])
    }

    #[test]
    fn count_flows_value_through() {
        let token = token("count");
        let _scope = token.open_scope(ResourceLimits::default());
        let guard = get(vec![Value::str(token.to_hex())]).expect("get").expect("guard");
        let out = count_flow(vec![Value::I32(12), guard]).expect("charge");
        assert!(matches!(out, Some(Value::I32(12))));
        assert_eq!(token.guard().allocated(), 12);
    }

    #[test]
    fn entry_points_need_an_open_scope() {
        let token = token("closed");
        let guard = get(vec![Value::str(token.to_hex())]).expect("get").expect("guard");
        let err = enter(vec![guard]).expect_err("no scope");
        assert!(matches!(err, Flow::Fatal(ExecError::Guard(GuardError::NoActiveScope))));
    }

    #[test]
    fn null_string_is_not_charged() {
        let token = token("null");
        let _scope = token.open_scope(ResourceLimits::default());
        let guard = Value::Guard(token.guard());
        let out = string_length(vec![Value::Null, guard]).expect("null passes");
        assert!(matches!(out, Some(Value::Null)));
        assert_eq!(token.guard().allocated(), 0);
    }
}
