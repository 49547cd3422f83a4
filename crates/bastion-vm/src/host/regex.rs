//! `System.Text.RegularExpressions.Regex` over the backtracking [`Pattern`] matcher.
//!
//! Overloads taking a `TimeSpan` observe it as a deadline; running past it aborts the whole
//! execution with a time-limit failure.

use std::time::{Duration, Instant};

use bastion::GuardError;

use super::pattern::{Pattern, Timeout};
use super::ParamKind::{Options, Str, TimeSpan};
use super::{host, host_arg, int_arg, str_arg, throw, HostMember, HostObject};
use crate::error::{fault, Flow};
use crate::value::Value;

type Ret = Result<Option<Value>, Flow>;

const OWNER: &str = "System.Text.RegularExpressions.Regex";
const IGNORE_CASE: i64 = 1;

pub(super) static MEMBERS: &[HostMember] = &[
    HostMember { owner: OWNER, name: ".ctor", is_static: false, params: &[Str], func: regex_new },
    HostMember { owner: OWNER, name: ".ctor", is_static: false, params: &[Str, Options], func: regex_new },
    HostMember { owner: OWNER, name: ".ctor", is_static: false, params: &[Str, Options, TimeSpan], func: regex_new },
    HostMember { owner: OWNER, name: "IsMatch", is_static: false, params: &[Str], func: regex_is_match },
    HostMember { owner: OWNER, name: "IsMatch", is_static: true, params: &[Str, Str], func: static_is_match },
    HostMember { owner: OWNER, name: "IsMatch", is_static: true, params: &[Str, Str, Options], func: static_is_match },
    HostMember { owner: OWNER, name: "IsMatch", is_static: true, params: &[Str, Str, Options, TimeSpan], func: static_is_match },
    HostMember { owner: OWNER, name: "Replace", is_static: true, params: &[Str, Str, Str], func: static_replace },
    HostMember { owner: OWNER, name: "Replace", is_static: true, params: &[Str, Str, Str, Options], func: static_replace },
    HostMember { owner: OWNER, name: "Replace", is_static: true, params: &[Str, Str, Str, Options, TimeSpan], func: static_replace },
];

/// Timeout argument in microseconds; negative means infinite.
fn timeout_arg(args: &[Value], index: usize) -> Result<Option<Duration>, Flow> {
    if index >= args.len() {
        return Ok(None);
    }
    let micros = int_arg(args, index)?;
    Ok(u64::try_from(micros).ok().map(Duration::from_micros))
}

fn options_arg(args: &[Value], index: usize) -> Result<i64, Flow> {
    if index >= args.len() {
        return Ok(0);
    }
    int_arg(args, index)
}

fn compile(pattern: &str, options: i64) -> Result<Pattern, Flow> {
    Pattern::compile(pattern, options & IGNORE_CASE != 0)
        .map_err(|err| throw("System.ArgumentException", err.to_string()))
}

/// Runs `f` under `timeout`, mapping an overrun to a time-limit failure.
fn timed<T>(timeout: Option<Duration>, f: impl FnOnce(Option<Instant>) -> Result<T, Timeout>) -> Result<T, Flow> {
    let started = Instant::now();
    let deadline = timeout.map(|t| started + t);
    f(deadline).map_err(|Timeout| {
        let limit = timeout.unwrap_or_default();
        tracing::warn!(limit_ms = limit.as_millis() as u64, "pattern match timed out");
        Flow::from(GuardError::TimeLimit {
            elapsed: started.elapsed(),
            limit,
        })
    })
}

fn regex_new(args: Vec<Value>) -> Ret {
    let source = str_arg(&args, 0)?;
    let pattern = compile(&source, options_arg(&args, 1)?)?;
    let timeout = timeout_arg(&args, 2)?;
    Ok(host(HostObject::Regex { pattern, timeout }))
}

fn regex_is_match(args: Vec<Value>) -> Ret {
    let HostObject::Regex { pattern, timeout } = host_arg(&args, 0)? else {
        return Err(fault("IsMatch on a non-regex"));
    };
    let input = str_arg(&args, 1)?;
    let found = timed(*timeout, |deadline| pattern.is_match(&input, deadline))?;
    Ok(Some(Value::Bool(found)))
}

fn static_is_match(args: Vec<Value>) -> Ret {
    let input = str_arg(&args, 0)?;
    let pattern = compile(&str_arg(&args, 1)?, options_arg(&args, 2)?)?;
    let found = timed(timeout_arg(&args, 3)?, |deadline| pattern.is_match(&input, deadline))?;
    Ok(Some(Value::Bool(found)))
}

fn static_replace(args: Vec<Value>) -> Ret {
    let input = str_arg(&args, 0)?;
    let pattern = compile(&str_arg(&args, 1)?, options_arg(&args, 3)?)?;
    let replacement = str_arg(&args, 2)?;
    let timeout = timeout_arg(&args, 4)?;
    let out = timed(timeout, |deadline| pattern.replace_all(&input, &replacement, deadline))?;
    Ok(Some(Value::str(out)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_replace_with_options() {
        let out = static_replace(vec![
            Value::str("Hello hello"),
            Value::str("hello"),
            Value::str("bye"),
            Value::I32(1),
        ])
        .expect("replace");
        assert!(matches!(out, Some(Value::Str(s)) if &*s == "bye bye"));
    }

    #[test]
    fn invalid_pattern_throws_argument_exception() {
        let Err(Flow::Exception(ex)) = static_is_match(vec![Value::str("a"), Value::str("(")]) else {
            panic!("expected an exception");
        };
        assert_eq!(super::super::describe(&ex), "System.ArgumentException");
    }

    #[test]
    fn overrun_is_a_time_limit_failure() {
        let input = format!("{}!", "a".repeat(40));
        let result = static_is_match(vec![
            Value::str(input),
            Value::str("^(a+)+$"),
            Value::I32(0),
            Value::I64(20_000),
        ]);
        assert!(matches!(
            result,
            Err(Flow::Fatal(crate::ExecError::Guard(GuardError::TimeLimit { .. })))
        ));
    }
}
