//! Reference host library: the external types a program can reach through member refs.
//!
//! Every member ref is bound once at load time to a [`HostFn`] by owner, name, staticness
//! and parameter shape. Instance functions receive `this` as their first argument;
//! constructors receive only their parameters and return the new object.

mod collections;
mod pattern;
mod regex;
mod runtime;
mod text;

use std::fmt;
use std::sync::{Arc, Mutex};

use bastion_il::{MemberKind, MemberRef, MethodHandle, TypeSig};

use crate::error::{fault, Flow};
use crate::value::{lock, Value};

pub use collections::Sequence;
pub(crate) use text::exception_text;
pub use pattern::{Pattern, PatternError, Timeout};
pub use text::WriterState;

/// Object owned by the host library.
#[derive(Debug)]
pub enum HostObject {
    StringBuilder(Mutex<String>),
    List(Mutex<Vec<Value>>),
    Regex {
        pattern: Pattern,
        /// Match timeout supplied at construction; `None` waits forever.
        timeout: Option<std::time::Duration>,
    },
    StringWriter(Arc<WriterState>),
    Sequence(Sequence),
    Exception {
        type_name: String,
        message: Arc<str>,
    },
    Delegate {
        target: Value,
        method: MethodHandle,
    },
}

impl HostObject {
    pub fn type_name(&self) -> &str {
        match self {
            HostObject::StringBuilder(_) => "System.Text.StringBuilder",
            HostObject::List(_) => "System.Collections.Generic.List`1",
            HostObject::Regex { .. } => "System.Text.RegularExpressions.Regex",
            HostObject::StringWriter(_) => "System.IO.StringWriter",
            HostObject::Sequence(_) => "System.Collections.Generic.IEnumerable`1",
            HostObject::Exception { type_name, .. } => type_name,
            HostObject::Delegate { .. } => "System.Delegate",
        }
    }
}

impl fmt::Display for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostObject::StringBuilder(text) => f.write_str(&lock(text)),
            HostObject::StringWriter(state) => f.write_str(&state.text()),
            HostObject::Regex { pattern, .. } => f.write_str(pattern.source()),
            HostObject::Exception { type_name, message } => write!(f, "{type_name}: {message}"),
            other => f.write_str(other.type_name()),
        }
    }
}

/// Shape of one host parameter, matched against the member ref's declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParamKind {
    Any,
    Int,
    Str,
    Seq,
    Options,
    TimeSpan,
}

impl ParamKind {
    fn accepts(self, sig: &TypeSig) -> bool {
        let named = |namespace: &str, name: &str| {
            sig.as_type_ref()
                .is_some_and(|r| r.namespace == namespace && r.name == name)
        };
        match self {
            ParamKind::Any => true,
            ParamKind::Int => matches!(sig, TypeSig::I32 | TypeSig::I64 | TypeSig::Char | TypeSig::Bool),
            ParamKind::Str => *sig == TypeSig::String,
            ParamKind::Seq => {
                named("System.Collections.Generic", "IEnumerable`1")
                    || named("System.Collections", "IEnumerable")
            }
            ParamKind::Options => named("System.Text.RegularExpressions", "RegexOptions"),
            ParamKind::TimeSpan => named("System", "TimeSpan"),
        }
    }
}

pub(crate) type HostFn = fn(Vec<Value>) -> Result<Option<Value>, Flow>;

pub(crate) struct HostMember {
    pub owner: &'static str,
    pub name: &'static str,
    pub is_static: bool,
    pub params: &'static [ParamKind],
    pub func: HostFn,
}

/// Full name the host library knows `owner` by.
pub(crate) fn owner_name(owner: &TypeSig) -> Option<String> {
    if let Some(name) = owner.primitive_name() {
        return Some(name.to_string());
    }
    owner.as_type_ref().map(|r| r.full_name())
}

fn table() -> impl Iterator<Item = &'static HostMember> {
    text::MEMBERS
        .iter()
        .chain(collections::MEMBERS)
        .chain(regex::MEMBERS)
        .chain(runtime::MEMBERS)
}

/// Host function implementing `member`, if the library has one.
pub(crate) fn bind(member: &MemberRef) -> Option<HostFn> {
    let MemberKind::Method { is_static } = member.kind else {
        return None;
    };
    let owner = owner_name(&member.owner)?;
    table()
        .find(|m| {
            m.owner == owner
                && m.name == member.name
                && m.is_static == is_static
                && m.params.len() == member.params.len()
                && m.params.iter().zip(&member.params).all(|(k, p)| k.accepts(p))
        })
        .map(|m| m.func)
}

/// Raises a host exception of type `type_name`.
pub(crate) fn throw(type_name: &str, message: impl Into<Arc<str>>) -> Flow {
    Flow::Exception(Value::Host(Arc::new(HostObject::Exception {
        type_name: type_name.to_string(),
        message: message.into(),
    })))
}

pub(crate) fn null_reference() -> Flow {
    throw(
        "System.NullReferenceException",
        "Object reference not set to an instance of an object.",
    )
}

pub(crate) fn out_of_range(what: &str) -> Flow {
    throw("System.ArgumentOutOfRangeException", format!("{what} is out of range."))
}

pub(crate) fn invalid_cast(value: &Value, wanted: &str) -> Flow {
    throw(
        "System.InvalidCastException",
        format!("Unable to cast {} to {wanted}.", describe(value)),
    )
}

/// Short type description used in messages.
pub(crate) fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "System.Boolean".to_string(),
        Value::I32(_) => "System.Int32".to_string(),
        Value::I64(_) => "System.Int64".to_string(),
        Value::F64(_) => "System.Double".to_string(),
        Value::Str(_) => "System.String".to_string(),
        Value::Host(host) => host.type_name().to_string(),
        other => other.to_string(),
    }
}

// Argument accessors shared by the library modules.

pub(crate) fn arg(args: &[Value], index: usize) -> Result<&Value, Flow> {
    args.get(index)
        .ok_or_else(|| fault(format!("host call is missing argument {index}")))
}

pub(crate) fn int_arg(args: &[Value], index: usize) -> Result<i64, Flow> {
    let value = arg(args, index)?;
    value
        .as_i64()
        .ok_or_else(|| fault(format!("expected an integer argument, found {}", describe(value))))
}

pub(crate) fn str_arg(args: &[Value], index: usize) -> Result<Arc<str>, Flow> {
    match arg(args, index)? {
        Value::Str(s) => Ok(Arc::clone(s)),
        Value::Null => Err(null_reference()),
        other => Err(invalid_cast(other, "System.String")),
    }
}

pub(crate) fn host_arg(args: &[Value], index: usize) -> Result<&HostObject, Flow> {
    match arg(args, index)? {
        Value::Host(host) => Ok(host),
        Value::Null => Err(null_reference()),
        other => Err(fault(format!("expected a host object, found {}", describe(other)))),
    }
}

pub(crate) fn host(object: HostObject) -> Option<Value> {
    Some(Value::Host(Arc::new(object)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(owner: TypeSig, name: &str, is_static: bool, params: Vec<TypeSig>) -> MemberRef {
        MemberRef::method(owner, name, is_static, params, TypeSig::Void)
    }

    #[test]
    fn binds_by_shape() {
        let list = TypeSig::Inst(
            Box::new(TypeSig::named("System.Collections.Generic", "List`1")),
            vec![TypeSig::I32],
        );
        assert!(bind(&member(list.clone(), "Add", false, vec![TypeSig::GenericParam(0)])).is_some());
        assert!(bind(&member(list.clone(), ".ctor", false, vec![TypeSig::I32])).is_some());
        assert!(bind(&member(list, ".ctor", false, vec![TypeSig::String])).is_none());
        assert!(bind(&member(TypeSig::String, "get_Length", false, Vec::new())).is_some());
        assert!(bind(&member(TypeSig::String, "get_Length", true, Vec::new())).is_none());
        assert!(bind(&member(TypeSig::named("System", "Console"), "WriteLine", true, vec![TypeSig::String])).is_none());
    }

    #[test]
    fn fields_never_bind() {
        let field = MemberRef {
            owner: TypeSig::String,
            name: "Empty".to_string(),
            kind: MemberKind::Field { is_static: true },
            params: Vec::new(),
            ret: TypeSig::String,
        };
        assert!(bind(&field).is_none());
    }
}
