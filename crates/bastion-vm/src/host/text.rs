//! `System.Object`, strings, numbers, exceptions, `StringBuilder` and `StringWriter`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bastion::Disposable;

use super::ParamKind::{Any, Int, Str};
use super::{
    arg, describe, host, host_arg, int_arg, out_of_range, str_arg, throw, HostMember, HostObject,
};
use crate::error::{fault, Flow};
use crate::value::{lock, Value};

type Ret = Result<Option<Value>, Flow>;

pub(super) static MEMBERS: &[HostMember] = &[
    HostMember { owner: "System.Object", name: "ToString", is_static: false, params: &[], func: object_to_string },
    HostMember { owner: "System.Object", name: "Equals", is_static: false, params: &[Any], func: object_equals },
    HostMember { owner: "System.Object", name: "GetHashCode", is_static: false, params: &[], func: object_hash },
    HostMember { owner: "System.String", name: ".ctor", is_static: false, params: &[Int, Int], func: string_new },
    HostMember { owner: "System.String", name: "get_Length", is_static: false, params: &[], func: string_length },
    HostMember { owner: "System.String", name: "get_Chars", is_static: false, params: &[Int], func: string_char_at },
    HostMember { owner: "System.String", name: "Concat", is_static: true, params: &[Any, Any], func: string_concat },
    HostMember { owner: "System.String", name: "Concat", is_static: true, params: &[Any, Any, Any], func: string_concat },
    HostMember { owner: "System.String", name: "Substring", is_static: false, params: &[Int], func: string_substring },
    HostMember { owner: "System.String", name: "Substring", is_static: false, params: &[Int, Int], func: string_substring },
    HostMember { owner: "System.String", name: "ToUpper", is_static: false, params: &[], func: string_to_upper },
    HostMember { owner: "System.String", name: "PadLeft", is_static: false, params: &[Int], func: string_pad_left },
    HostMember { owner: "System.String", name: "Contains", is_static: false, params: &[Str], func: string_contains },
    HostMember { owner: "System.String", name: "IndexOf", is_static: false, params: &[Str], func: string_index_of },
    HostMember { owner: "System.String", name: "Equals", is_static: false, params: &[Any], func: object_equals },
    HostMember { owner: "System.Int32", name: "Parse", is_static: true, params: &[Str], func: int32_parse },
    HostMember { owner: "System.Convert", name: "ToString", is_static: true, params: &[Any], func: convert_to_string },
    HostMember { owner: "System.Math", name: "Abs", is_static: true, params: &[Any], func: math_abs },
    HostMember { owner: "System.Math", name: "Max", is_static: true, params: &[Any, Any], func: math_max },
    HostMember { owner: "System.Math", name: "Min", is_static: true, params: &[Any, Any], func: math_min },
    HostMember { owner: "System.Exception", name: ".ctor", is_static: false, params: &[], func: exception_new },
    HostMember { owner: "System.Exception", name: ".ctor", is_static: false, params: &[Str], func: exception_new },
    HostMember { owner: "System.Exception", name: "get_Message", is_static: false, params: &[], func: exception_message },
    HostMember { owner: "System.Text.StringBuilder", name: ".ctor", is_static: false, params: &[], func: builder_new },
    HostMember { owner: "System.Text.StringBuilder", name: ".ctor", is_static: false, params: &[Int], func: builder_new },
    HostMember { owner: "System.Text.StringBuilder", name: "Append", is_static: false, params: &[Any], func: builder_append },
    HostMember { owner: "System.Text.StringBuilder", name: "ToString", is_static: false, params: &[], func: object_to_string },
    HostMember { owner: "System.Text.StringBuilder", name: "get_Length", is_static: false, params: &[], func: builder_length },
    HostMember { owner: "System.IO.StringWriter", name: ".ctor", is_static: false, params: &[], func: writer_new },
    HostMember { owner: "System.IO.StringWriter", name: "Write", is_static: false, params: &[Any], func: writer_write },
    HostMember { owner: "System.IO.StringWriter", name: "ToString", is_static: false, params: &[], func: object_to_string },
    HostMember { owner: "System.IO.StringWriter", name: "Dispose", is_static: false, params: &[], func: writer_dispose },
];

const DEFAULT_EXCEPTION_MESSAGE: &str = "Exception of type 'System.Exception' was thrown.";

fn chars(text: &str) -> Vec<char> {
    text.chars().collect()
}

fn len_value(len: usize) -> Value {
    Value::I32(i32::try_from(len).unwrap_or(i32::MAX))
}

fn object_to_string(args: Vec<Value>) -> Ret {
    match arg(&args, 0)? {
        Value::Null => Err(super::null_reference()),
        Value::Obj(obj) => match lock(&obj.message).as_ref() {
            Some(message) => Ok(Some(Value::Str(Arc::clone(message)))),
            None => Ok(Some(Value::str(format!("<object #{}>", obj.type_index)))),
        },
        value => Ok(Some(Value::str(value.to_string()))),
    }
}

fn object_equals(args: Vec<Value>) -> Ret {
    let this = arg(&args, 0)?;
    if this.is_null() {
        return Err(super::null_reference());
    }
    Ok(Some(Value::Bool(this.same(arg(&args, 1)?))))
}

fn object_hash(args: Vec<Value>) -> Ret {
    let mut hasher = DefaultHasher::new();
    match arg(&args, 0)? {
        Value::Null => return Err(super::null_reference()),
        Value::Str(s) => s.hash(&mut hasher),
        Value::Obj(o) => (Arc::as_ptr(o) as usize).hash(&mut hasher),
        Value::Host(h) => (Arc::as_ptr(h) as usize).hash(&mut hasher),
        Value::Array(a) => (Arc::as_ptr(a) as usize).hash(&mut hasher),
        other => other.to_string().hash(&mut hasher),
    }
    Ok(Some(Value::I32(hasher.finish() as i32)))
}

fn string_new(args: Vec<Value>) -> Ret {
    let code = int_arg(&args, 0)?;
    let count = int_arg(&args, 1)?;
    let c = u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| out_of_range("c"))?;
    let count = usize::try_from(count).map_err(|_| out_of_range("count"))?;
    Ok(Some(Value::str(std::iter::repeat(c).take(count).collect::<String>())))
}

fn string_length(args: Vec<Value>) -> Ret {
    let text = str_arg(&args, 0)?;
    Ok(Some(len_value(text.chars().count())))
}

fn string_char_at(args: Vec<Value>) -> Ret {
    let text = str_arg(&args, 0)?;
    let index = int_arg(&args, 1)?;
    let c = usize::try_from(index)
        .ok()
        .and_then(|i| text.chars().nth(i))
        .ok_or_else(|| throw("System.IndexOutOfRangeException", "Index was outside the bounds of the array."))?;
    Ok(Some(Value::I32(c as i32)))
}

fn string_concat(args: Vec<Value>) -> Ret {
    let mut out = String::new();
    for value in &args {
        out.push_str(&value.to_string());
    }
    Ok(Some(Value::str(out)))
}

fn string_substring(args: Vec<Value>) -> Ret {
    let text = chars(&str_arg(&args, 0)?);
    let start = usize::try_from(int_arg(&args, 1)?).map_err(|_| out_of_range("startIndex"))?;
    if start > text.len() {
        return Err(out_of_range("startIndex"));
    }
    let len = match args.get(2) {
        Some(_) => usize::try_from(int_arg(&args, 2)?).map_err(|_| out_of_range("length"))?,
        None => text.len() - start,
    };
    let end = start.checked_add(len).filter(|end| *end <= text.len()).ok_or_else(|| out_of_range("length"))?;
    Ok(Some(Value::str(text[start..end].iter().collect::<String>())))
}

fn string_to_upper(args: Vec<Value>) -> Ret {
    Ok(Some(Value::str(str_arg(&args, 0)?.to_uppercase())))
}

fn string_pad_left(args: Vec<Value>) -> Ret {
    let text = str_arg(&args, 0)?;
    let width = usize::try_from(int_arg(&args, 1)?).map_err(|_| out_of_range("totalWidth"))?;
    let len = text.chars().count();
    let mut out = " ".repeat(width.saturating_sub(len));
    out.push_str(&text);
    Ok(Some(Value::str(out)))
}

fn string_contains(args: Vec<Value>) -> Ret {
    let text = str_arg(&args, 0)?;
    let needle = str_arg(&args, 1)?;
    Ok(Some(Value::Bool(text.contains(&*needle))))
}

fn string_index_of(args: Vec<Value>) -> Ret {
    let text = str_arg(&args, 0)?;
    let needle = str_arg(&args, 1)?;
    let index = match text.find(&*needle) {
        Some(byte) => len_value(text[..byte].chars().count()),
        None => Value::I32(-1),
    };
    Ok(Some(index))
}

fn int32_parse(args: Vec<Value>) -> Ret {
    let text = str_arg(&args, 0)?;
    match text.trim().parse::<i64>() {
        Ok(v) => i32::try_from(v)
            .map(|v| Some(Value::I32(v)))
            .map_err(|_| throw("System.OverflowException", "Value was either too large or too small for an Int32.")),
        Err(_) => Err(throw("System.FormatException", "Input string was not in a correct format.")),
    }
}

fn convert_to_string(args: Vec<Value>) -> Ret {
    Ok(Some(Value::str(arg(&args, 0)?.to_string())))
}

fn overflow() -> Flow {
    throw("System.OverflowException", "Arithmetic operation resulted in an overflow.")
}

fn math_abs(args: Vec<Value>) -> Ret {
    let result = match arg(&args, 0)? {
        Value::I32(v) => Value::I32(v.checked_abs().ok_or_else(overflow)?),
        Value::I64(v) => Value::I64(v.checked_abs().ok_or_else(overflow)?),
        Value::F64(v) => Value::F64(v.abs()),
        other => return Err(fault(format!("Math.Abs on {}", describe(other)))),
    };
    Ok(Some(result))
}

fn pick(args: &[Value], want_max: bool) -> Ret {
    let (a, b) = (arg(args, 0)?, arg(args, 1)?);
    let result = match (a, b) {
        (Value::F64(_), _) | (_, Value::F64(_)) => {
            let x = numeric_f64(a)?;
            let y = numeric_f64(b)?;
            Value::F64(if want_max { x.max(y) } else { x.min(y) })
        }
        _ => {
            let x = a.as_i64().ok_or_else(|| fault("Math on a non-number"))?;
            let y = b.as_i64().ok_or_else(|| fault("Math on a non-number"))?;
            let r = if want_max { x.max(y) } else { x.min(y) };
            match (a, b) {
                (Value::I64(_), _) | (_, Value::I64(_)) => Value::I64(r),
                _ => Value::I32(r as i32),
            }
        }
    };
    Ok(Some(result))
}

fn numeric_f64(value: &Value) -> Result<f64, Flow> {
    match value {
        Value::F64(v) => Ok(*v),
        other => other
            .as_i64()
            .map(|v| v as f64)
            .ok_or_else(|| fault("Math on a non-number")),
    }
}

fn math_max(args: Vec<Value>) -> Ret {
    pick(&args, true)
}

fn math_min(args: Vec<Value>) -> Ret {
    pick(&args, false)
}

fn exception_new(args: Vec<Value>) -> Ret {
    let message = match args.first() {
        Some(_) => str_arg(&args, 0)?,
        None => Arc::from(DEFAULT_EXCEPTION_MESSAGE),
    };
    Ok(host(HostObject::Exception {
        type_name: "System.Exception".to_string(),
        message,
    }))
}

/// Message of a host exception or of a program exception built on `System.Exception`.
pub(crate) fn exception_text(value: &Value) -> Option<Arc<str>> {
    match value {
        Value::Host(h) => match h.as_ref() {
            HostObject::Exception { message, .. } => Some(Arc::clone(message)),
            _ => None,
        },
        Value::Obj(obj) => Some(
            lock(&obj.message)
                .clone()
                .unwrap_or_else(|| Arc::from(DEFAULT_EXCEPTION_MESSAGE)),
        ),
        _ => None,
    }
}

fn exception_message(args: Vec<Value>) -> Ret {
    let this = arg(&args, 0)?;
    if this.is_null() {
        return Err(super::null_reference());
    }
    exception_text(this)
        .map(|m| Some(Value::Str(m)))
        .ok_or_else(|| fault(format!("get_Message on {}", describe(this))))
}

fn builder_new(args: Vec<Value>) -> Ret {
    let capacity = match args.first() {
        Some(_) => usize::try_from(int_arg(&args, 0)?).map_err(|_| out_of_range("capacity"))?,
        None => 16,
    };
    Ok(host(HostObject::StringBuilder(Mutex::new(String::with_capacity(capacity.min(1 << 16))))))
}

fn builder_append(args: Vec<Value>) -> Ret {
    let HostObject::StringBuilder(text) = host_arg(&args, 0)? else {
        return Err(fault("Append on a non-builder"));
    };
    lock(text).push_str(&arg(&args, 1)?.to_string());
    Ok(Some(args[0].clone()))
}

fn builder_length(args: Vec<Value>) -> Ret {
    let HostObject::StringBuilder(text) = host_arg(&args, 0)? else {
        return Err(fault("get_Length on a non-builder"));
    };
    let len = lock(text).chars().count();
    Ok(Some(len_value(len)))
}

/// Backing state of a `StringWriter`; disposal is shared with the guard that tracks it.
#[derive(Debug, Default)]
pub struct WriterState {
    text: Mutex<String>,
    disposed: AtomicBool,
}

impl WriterState {
    pub fn text(&self) -> String {
        lock(&self.text).clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Disposable for WriterState {
    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

fn writer_state(args: &[Value]) -> Result<&Arc<WriterState>, Flow> {
    match host_arg(args, 0)? {
        HostObject::StringWriter(state) => Ok(state),
        _ => Err(fault("StringWriter member on another object")),
    }
}

fn writer_new(_args: Vec<Value>) -> Ret {
    Ok(host(HostObject::StringWriter(Arc::new(WriterState::default()))))
}

fn writer_write(args: Vec<Value>) -> Ret {
    let state = writer_state(&args)?;
    if state.is_disposed() {
        return Err(throw("System.ObjectDisposedException", "Cannot write to a closed TextWriter."));
    }
    lock(&state.text).push_str(&arg(&args, 1)?.to_string());
    Ok(None)
}

fn writer_dispose(args: Vec<Value>) -> Ret {
    writer_state(&args)?.dispose();
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: Option<Value>) -> String {
        match value {
            Some(Value::Str(s)) => s.to_string(),
            other => panic!("expected a string, got {other:?}"),
        }
    }

    #[test]
    fn substring_and_pad() {
        let out = string_substring(vec![Value::str("bastion"), Value::I32(1), Value::I32(3)]).expect("ok");
        assert_eq!(text(out), "ast");
        assert!(string_substring(vec![Value::str("ab"), Value::I32(3)]).is_err());
        let out = string_pad_left(vec![Value::str("7"), Value::I32(3)]).expect("ok");
        assert_eq!(text(out), "  7");
    }

    #[test]
    fn string_ctor_repeats_char() {
        let out = string_new(vec![Value::I32('x' as i32), Value::I32(4)]).expect("ok");
        assert_eq!(text(out), "xxxx");
        assert!(matches!(
            string_new(vec![Value::I32('x' as i32), Value::I32(-1)]),
            Err(Flow::Exception(_))
        ));
    }

    #[test]
    fn parse_reports_format_errors() {
        assert!(matches!(int32_parse(vec![Value::str(" 42 ")]), Ok(Some(Value::I32(42)))));
        let Err(Flow::Exception(ex)) = int32_parse(vec![Value::str("4x")]) else {
            panic!("expected an exception");
        };
        assert_eq!(describe(&ex), "System.FormatException");
    }

    #[test]
    fn writer_rejects_writes_after_dispose() {
        let writer = writer_new(Vec::new()).expect("ok").expect("object");
        writer_write(vec![writer.clone(), Value::str("a")]).expect("write");
        writer_dispose(vec![writer.clone()]).expect("dispose");
        assert!(writer_write(vec![writer.clone(), Value::str("b")]).is_err());
        assert_eq!(writer.to_string(), "a");
    }
}
