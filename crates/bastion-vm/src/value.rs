//! Runtime values. Objects are shared by reference, structs are copied by value, and every
//! storage location is a slot so its address can be taken.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bastion::ResourceGuard;
use bastion_il::{MethodHandle, Program, TypeSig};

use crate::host::HostObject;

/// Shared storage cell: a local, argument, field or static.
pub type Slot = Arc<Mutex<Value>>;

pub fn slot(value: Value) -> Slot {
    Arc::new(Mutex::new(value))
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Instance of a program-defined class.
#[derive(Debug)]
pub struct ObjectData {
    pub type_index: u32,
    /// Instance fields of the whole base chain, base-most type first, each type's fields in
    /// declaration order.
    pub fields: Vec<Slot>,
    /// Message recorded by the `System.Exception` base constructor.
    pub message: Mutex<Option<Arc<str>>>,
}

#[derive(Debug)]
pub struct ArrayData {
    pub elem: TypeSig,
    pub items: Mutex<Vec<Value>>,
}

/// Managed pointer.
#[derive(Debug, Clone)]
pub enum Address {
    Slot(Slot),
    Element(Arc<ArrayData>, usize),
    /// Field of the struct stored at another address.
    StructField(Box<Address>, usize),
}

impl Address {
    pub fn load(&self) -> Option<Value> {
        match self {
            Address::Slot(s) => Some(lock(s).clone()),
            Address::Element(arr, i) => lock(&arr.items).get(*i).cloned(),
            Address::StructField(base, field) => match base.load()? {
                Value::Struct(_, fields) => fields.get(*field).cloned(),
                _ => None,
            },
        }
    }

    pub fn store(&self, value: Value) -> bool {
        match self {
            Address::Slot(s) => {
                *lock(s) = value;
                true
            }
            Address::Element(arr, i) => match lock(&arr.items).get_mut(*i) {
                Some(item) => {
                    *item = value;
                    true
                }
                None => false,
            },
            Address::StructField(base, field) => match base.load() {
                Some(Value::Struct(ty, mut fields)) if *field < fields.len() => {
                    fields[*field] = value;
                    base.store(Value::Struct(ty, fields))
                }
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(Arc<str>),
    Obj(Arc<ObjectData>),
    Struct(u32, Vec<Value>),
    Array(Arc<ArrayData>),
    Addr(Address),
    Method(MethodHandle),
    Guard(Arc<ResourceGuard>),
    Host(Arc<HostObject>),
}

impl Value {
    pub fn str(text: impl Into<Arc<str>>) -> Self {
        Value::Str(text.into())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::I32(v) => Some(i64::from(*v)),
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Bool(b) => Some(i32::from(*b)),
            Value::I32(v) => Some(*v),
            Value::I64(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::I32(v) => *v != 0,
            Value::I64(v) => *v != 0,
            Value::F64(v) => *v != 0.0,
            _ => true,
        }
    }

    /// Identity for references, value equality for scalars and strings.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Host(a), Value::Host(b)) => Arc::ptr_eq(a, b),
            (Value::Guard(a), Value::Guard(b)) => Arc::ptr_eq(a, b),
            (Value::Method(a), Value::Method(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Struct(ta, a), Value::Struct(tb, b)) => {
                ta == tb && a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same(y))
            }
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }

    /// Zero value for a slot of type `sig`.
    pub fn default_for(sig: &TypeSig, program: &Program) -> Value {
        default_in(sig, program, 0)
    }
}

fn default_in(sig: &TypeSig, program: &Program, depth: u32) -> Value {
    match sig {
        TypeSig::Bool => Value::Bool(false),
        TypeSig::Char | TypeSig::I32 => Value::I32(0),
        TypeSig::I64 | TypeSig::IntPtr => Value::I64(0),
        TypeSig::F64 => Value::F64(0.0),
        TypeSig::Def(index) => struct_default(*index, program, depth),
        TypeSig::Inst(base, _) => match base.as_ref() {
            TypeSig::Def(index) => struct_default(*index, program, depth),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn struct_default(index: u32, program: &Program, depth: u32) -> Value {
    match program.type_def(index) {
        Some(def) if def.is_struct() && depth < 16 => Value::Struct(
            index,
            // Indexed like the declaration; static fields keep a dead slot.
            def.fields
                .iter()
                .map(|f| {
                    if f.is_static {
                        Value::Null
                    } else {
                        default_in(&f.ty, program, depth + 1)
                    }
                })
                .collect(),
        ),
        _ => Value::Null,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => f.write_str(if *b { "True" } else { "False" }),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Str(s) => f.write_str(s),
            Value::Obj(o) => write!(f, "<object #{}>", o.type_index),
            Value::Struct(ty, _) => write!(f, "<struct #{ty}>"),
            Value::Array(a) => write!(f, "{}[{}]", a.elem, lock(&a.items).len()),
            Value::Addr(_) => f.write_str("<address>"),
            Value::Method(h) => write!(f, "<method {}:{}>", h.type_index, h.method_index),
            Value::Guard(_) => f.write_str("<guard>"),
            Value::Host(h) => write!(f, "{h}"),
        }
    }
}
