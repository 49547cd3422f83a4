//! Stack-machine interpreter.
//!
//! Each program call recurses natively, so the guard's stack proxy observes real stack
//! growth. Program exceptions unwind through handler tables; guard failures and faults
//! abort the whole run without running handlers.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bastion_il::{FieldTarget, HandlerKind, MethodDef, MethodHandle, MethodTarget, Op, Program, TypeDef, TypeSig};
use tracing::debug;

use crate::error::{fault, ExecError, Flow, LoadError};
use crate::host::{self, describe, exception_text, null_reference, throw, HostObject};
use crate::loader::{self, Binding, Body};
use crate::value::{lock, slot, Address, ArrayData, ObjectData, Slot, Value};

/// Largest array the interpreter will materialize.
const MAX_ARRAY_LEN: usize = 1 << 26;
/// Bound on base-chain walks.
const MAX_DEPTH: usize = 64;

/// A loaded program ready to run.
pub struct Vm {
    program: Program,
    bodies: HashMap<MethodHandle, Body>,
    bindings: Vec<Binding>,
    entry: MethodHandle,
    statics: Mutex<HashMap<(u32, u32), Slot>>,
}

enum Step {
    Next,
    Jump(usize),
    Leave(usize),
    Return(Option<Value>),
    EndFinally,
}

enum Exit {
    Return(Option<Value>),
    EndFinally,
}

struct Frame<'b> {
    body: &'b Body,
    args: Vec<Slot>,
    locals: Vec<Slot>,
    stack: Vec<Value>,
    /// Exception being handled, for `Rethrow`.
    caught: Option<Value>,
}

impl Frame<'_> {
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, Flow> {
        self.stack
            .pop()
            .ok_or_else(|| fault(format!("evaluation stack underflow in {}", self.body.name)))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, Flow> {
        if self.stack.len() < n {
            return Err(fault(format!("evaluation stack underflow in {}", self.body.name)));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn pop_int(&mut self) -> Result<i64, Flow> {
        let value = self.pop()?;
        value
            .as_i64()
            .ok_or_else(|| fault(format!("expected an integer, found {}", describe(&value))))
    }

    fn arg(&self, index: u16) -> Result<&Slot, Flow> {
        self.args
            .get(usize::from(index))
            .ok_or_else(|| fault(format!("argument {index} out of range in {}", self.body.name)))
    }

    fn local(&self, index: u16) -> Result<&Slot, Flow> {
        self.locals
            .get(usize::from(index))
            .ok_or_else(|| fault(format!("local {index} out of range in {}", self.body.name)))
    }
}

#[derive(Clone, Copy)]
enum Num {
    I(i32),
    L(i64),
    F(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Num> {
        match value {
            Value::Bool(b) => Some(Num::I(i32::from(*b))),
            Value::I32(v) => Some(Num::I(*v)),
            Value::I64(v) => Some(Num::L(*v)),
            Value::F64(v) => Some(Num::F(*v)),
            _ => None,
        }
    }

    fn f64(self) -> f64 {
        match self {
            Num::I(v) => f64::from(v),
            Num::L(v) => v as f64,
            Num::F(v) => v,
        }
    }

    fn i64(self) -> i64 {
        match self {
            Num::I(v) => i64::from(v),
            Num::L(v) => v,
            Num::F(v) => v as i64,
        }
    }
}

fn number(value: &Value) -> Result<Num, Flow> {
    Num::of(value).ok_or_else(|| fault(format!("arithmetic on {}", describe(value))))
}

fn division_error(by_zero: bool) -> Flow {
    if by_zero {
        throw("System.DivideByZeroException", "Attempted to divide by zero.")
    } else {
        throw("System.OverflowException", "Arithmetic operation resulted in an overflow.")
    }
}

macro_rules! int_op {
    ($op:expr, $x:expr, $y:expr) => {
        match $op {
            Op::Add => Ok($x.wrapping_add($y)),
            Op::Sub => Ok($x.wrapping_sub($y)),
            Op::Mul => Ok($x.wrapping_mul($y)),
            Op::Div => $x.checked_div($y).ok_or_else(|| division_error($y == 0)),
            Op::Rem => $x.checked_rem($y).ok_or_else(|| division_error($y == 0)),
            Op::And => Ok($x & $y),
            Op::Or => Ok($x | $y),
            Op::Xor => Ok($x ^ $y),
            Op::Shl => Ok($x.wrapping_shl($y as u32)),
            Op::Shr => Ok($x.wrapping_shr($y as u32)),
            _ => Err(fault("not a binary operation")),
        }
    };
}

fn binary(op: &Op, a: &Value, b: &Value) -> Result<Value, Flow> {
    let (x, y) = (number(a)?, number(b)?);
    match (x, y) {
        (Num::F(_), _) | (_, Num::F(_)) => {
            let (x, y) = (x.f64(), y.f64());
            let r = match op {
                Op::Add => x + y,
                Op::Sub => x - y,
                Op::Mul => x * y,
                Op::Div => x / y,
                Op::Rem => x % y,
                _ => return Err(fault("bitwise operation on a floating-point value")),
            };
            Ok(Value::F64(r))
        }
        (Num::L(_), _) | (_, Num::L(_)) => {
            let (x, y) = (x.i64(), y.i64());
            int_op!(op, x, y).map(Value::I64)
        }
        (Num::I(x), Num::I(y)) => int_op!(op, x, y).map(Value::I32),
    }
}

/// Ordering of two operands, with references ordered only against null.
fn compare(a: &Value, b: &Value) -> Result<Option<Ordering>, Flow> {
    match (Num::of(a), Num::of(b)) {
        (Some(Num::F(x)), Some(y)) => Ok(x.partial_cmp(&y.f64())),
        (Some(x), Some(Num::F(y))) => Ok(x.f64().partial_cmp(&y)),
        (Some(x), Some(y)) => Ok(Some(x.i64().cmp(&y.i64()))),
        _ => match (a.is_null(), b.is_null()) {
            (true, true) => Ok(Some(Ordering::Equal)),
            (false, true) => Ok(Some(Ordering::Greater)),
            (true, false) => Ok(Some(Ordering::Less)),
            (false, false) => Err(fault(format!(
                "cannot order {} and {}",
                describe(a),
                describe(b)
            ))),
        },
    }
}

fn flag(b: bool) -> Value {
    Value::I32(i32::from(b))
}

fn is_value_type(sig: &TypeSig) -> bool {
    matches!(
        sig,
        TypeSig::Bool | TypeSig::Char | TypeSig::I32 | TypeSig::I64 | TypeSig::F64 | TypeSig::IntPtr
    )
}

impl Vm {
    /// Decodes and binds a program container.
    pub fn load(bytes: &[u8]) -> Result<Self, LoadError> {
        Self::new(bastion_il::decode(bytes)?)
    }

    pub fn new(program: Program) -> Result<Self, LoadError> {
        let loaded = loader::load(&program)?;
        Ok(Self {
            program,
            bodies: loaded.bodies,
            bindings: loaded.bindings,
            entry: loaded.entry,
            statics: Mutex::new(HashMap::new()),
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Declared parameters of the entry point.
    pub fn entry_params(&self) -> &[TypeSig] {
        self.program
            .method(self.entry)
            .map(|m| m.params.as_slice())
            .unwrap_or(&[])
    }

    /// Runs the entry point. The caller opens the program's guard scope around this call.
    pub fn run(&self, args: Vec<Value>) -> Result<Option<Value>, ExecError> {
        let expected = self.program.method(self.entry).map_or(0, MethodDef::arg_count);
        if args.len() != expected {
            return Err(ExecError::Fault(format!(
                "entry point expects {expected} arguments, got {}",
                args.len()
            )));
        }
        debug!(program = %self.program.name, entry = %self.program.method_name(self.entry), "running");
        let outcome = match self.invoke(self.entry, args) {
            Ok(value) => Ok(value),
            Err(Flow::Exception(ex)) => Err(self.unhandled(&ex)),
            Err(Flow::Fatal(err)) => Err(err),
        };
        if let Err(err) = &outcome {
            debug!(program = %self.program.name, error = %err, "run failed");
        }
        outcome
    }

    fn unhandled(&self, ex: &Value) -> ExecError {
        let type_name = match ex {
            Value::Obj(obj) => self
                .program
                .type_def(obj.type_index)
                .map(TypeDef::full_name)
                .unwrap_or_else(|| describe(ex)),
            other => describe(other),
        };
        let message = exception_text(ex)
            .map(|m| m.to_string())
            .unwrap_or_else(|| ex.to_string());
        ExecError::Thrown { type_name, message }
    }

    fn method(&self, handle: MethodHandle) -> Result<&MethodDef, Flow> {
        self.program
            .method(handle)
            .ok_or_else(|| fault(format!("unknown method {}:{}", handle.type_index, handle.method_index)))
    }

    fn binding(&self, index: u32) -> Result<&Binding, Flow> {
        self.bindings
            .get(index as usize)
            .ok_or_else(|| fault(format!("unbound member ref {index}")))
    }

    /// `start` and its program-defined base types, most derived first.
    fn ancestry(&self, start: u32) -> impl Iterator<Item = u32> + '_ {
        std::iter::successors(Some(start), move |index| {
            match self.program.type_def(*index)?.base.as_ref()? {
                TypeSig::Def(base) => Some(*base),
                TypeSig::Inst(base, _) => match base.as_ref() {
                    TypeSig::Def(base) => Some(*base),
                    _ => None,
                },
                _ => None,
            }
        })
        .take(MAX_DEPTH)
    }

    /// Whether the base chain of `start` ends in the host type named `name`.
    fn inherits_host(&self, start: u32, name: &str) -> bool {
        self.ancestry(start).any(|index| {
            self.program
                .type_def(index)
                .and_then(|t| t.base.as_ref())
                .and_then(host::owner_name)
                .is_some_and(|base| base == name)
        })
    }

    fn instance_of(&self, value: &Value, ty: &TypeSig) -> bool {
        let def = match ty {
            TypeSig::Def(index) => Some(*index),
            TypeSig::Inst(base, _) => match base.as_ref() {
                TypeSig::Def(index) => Some(*index),
                _ => None,
            },
            _ => None,
        };
        if let Some(index) = def {
            return match value {
                Value::Obj(obj) => self.ancestry(obj.type_index).any(|t| t == index),
                Value::Struct(t, _) => *t == index,
                _ => false,
            };
        }
        match ty {
            TypeSig::Object => true,
            TypeSig::String => matches!(value, Value::Str(_)),
            TypeSig::Bool => matches!(value, Value::Bool(_)),
            TypeSig::I32 | TypeSig::Char => matches!(value, Value::I32(_)),
            TypeSig::I64 | TypeSig::IntPtr => matches!(value, Value::I64(_)),
            TypeSig::F64 => matches!(value, Value::F64(_)),
            TypeSig::Array(_) => matches!(value, Value::Array(_)),
            TypeSig::Named(_) | TypeSig::Inst(..) => {
                let Some(name) = host::owner_name(ty) else {
                    return false;
                };
                match value {
                    _ if name == "System.Object" => true,
                    Value::Obj(obj) => self.inherits_host(obj.type_index, &name),
                    Value::Host(object) => {
                        object.type_name() == name
                            || (name == "System.Exception"
                                && matches!(object.as_ref(), HostObject::Exception { .. }))
                    }
                    Value::Str(_) => name == "System.String",
                    _ => false,
                }
            }
            _ => false,
        }
    }

    fn catches(&self, catch_type: Option<&TypeSig>, ex: &Value) -> bool {
        match catch_type {
            None | Some(TypeSig::Object) => true,
            Some(ty) => {
                host::owner_name(ty).is_some_and(|n| n == "System.Exception") || self.instance_of(ex, ty)
            }
        }
    }

    /// Most-derived virtual override of `name`/`arity` for the runtime type of `this`.
    fn override_of(&self, this: &Value, name: &str, arity: usize) -> Option<MethodHandle> {
        let Value::Obj(obj) = this else {
            return None;
        };
        self.ancestry(obj.type_index).find_map(|type_index| {
            let ty = self.program.type_def(type_index)?;
            ty.methods
                .iter()
                .position(|m| m.is_virtual && !m.is_static && m.name == name && m.params.len() == arity)
                .map(|method_index| MethodHandle {
                    type_index,
                    method_index: method_index as u32,
                })
        })
    }

    fn field_count(&self, type_index: u32) -> usize {
        self.program
            .type_def(type_index)
            .map_or(0, |t| t.fields.len())
    }

    fn allocate(&self, type_index: u32) -> ObjectData {
        let chain: Vec<u32> = self.ancestry(type_index).collect();
        let mut fields = Vec::new();
        for index in chain.iter().rev() {
            if let Some(ty) = self.program.type_def(*index) {
                fields.extend(ty.fields.iter().map(|f| {
                    if f.is_static {
                        slot(Value::Null)
                    } else {
                        slot(Value::default_for(&f.ty, &self.program))
                    }
                }));
            }
        }
        ObjectData {
            type_index,
            fields,
            message: Mutex::new(None),
        }
    }

    fn field_address(&self, target: &Value, type_index: u32, field_index: u32) -> Result<Address, Flow> {
        match target {
            Value::Null => Err(null_reference()),
            Value::Obj(obj) => {
                let chain: Vec<u32> = self.ancestry(obj.type_index).collect();
                let pos = chain
                    .iter()
                    .position(|t| *t == type_index)
                    .ok_or_else(|| host::invalid_cast(target, "the field's declaring type"))?;
                let offset: usize = chain[pos + 1..].iter().map(|t| self.field_count(*t)).sum();
                obj.fields
                    .get(offset + field_index as usize)
                    .map(|s| Address::Slot(Arc::clone(s)))
                    .ok_or_else(|| fault("field index out of range"))
            }
            Value::Addr(addr) => Ok(Address::StructField(Box::new(addr.clone()), field_index as usize)),
            other => Err(fault(format!("field access on {}", describe(other)))),
        }
    }

    fn static_slot(&self, type_index: u32, field_index: u32) -> Slot {
        let mut statics = lock(&self.statics);
        Arc::clone(statics.entry((type_index, field_index)).or_insert_with(|| {
            let ty = self
                .program
                .field(type_index, field_index)
                .map(|f| Value::default_for(&f.ty, &self.program))
                .unwrap_or(Value::Null);
            slot(ty)
        }))
    }

    fn invoke(&self, handle: MethodHandle, args: Vec<Value>) -> Result<Option<Value>, Flow> {
        let body = self
            .bodies
            .get(&handle)
            .ok_or_else(|| fault(format!("{} has no body", self.program.method_name(handle))))?;
        let mut frame = Frame {
            body,
            args: args.into_iter().map(slot).collect(),
            locals: body
                .locals
                .iter()
                .map(|ty| slot(Value::default_for(ty, &self.program)))
                .collect(),
            stack: Vec::with_capacity(8),
            caught: None,
        };
        match self.exec(&mut frame, 0, false)? {
            Exit::Return(value) => Ok(value),
            Exit::EndFinally => Err(fault("endfinally outside a finally block")),
        }
    }

    fn exec(&self, frame: &mut Frame<'_>, mut pc: usize, in_finally: bool) -> Result<Exit, Flow> {
        let body = frame.body;
        loop {
            let Some(op) = body.ops.get(pc) else {
                return Err(fault(format!("control fell off the end of {}", body.name)));
            };
            match self.step(frame, op) {
                Ok(Step::Next) => pc += 1,
                Ok(Step::Jump(to)) => pc = to,
                Ok(Step::Leave(to)) => {
                    frame.stack.clear();
                    match self.leave(frame, pc, to) {
                        Ok(()) => pc = to,
                        Err(flow) => pc = self.unwind(frame, pc, flow)?,
                    }
                }
                Ok(Step::Return(value)) => return Ok(Exit::Return(value)),
                Ok(Step::EndFinally) if in_finally => return Ok(Exit::EndFinally),
                Ok(Step::EndFinally) => return Err(fault("endfinally outside a finally block")),
                Err(flow) => pc = self.unwind(frame, pc, flow)?,
            }
        }
    }

    /// Runs the finally blocks a `Leave` at `pc` exits on its way to `to`.
    fn leave(&self, frame: &mut Frame<'_>, pc: usize, to: usize) -> Result<(), Flow> {
        let body = frame.body;
        for handler in body.handlers_at(pc) {
            if matches!(handler.kind, HandlerKind::Finally) && !handler.try_range.contains(&to) {
                self.exec(frame, handler.handler_start, true)?;
                frame.stack.clear();
            }
        }
        Ok(())
    }

    /// Finds the handler for a program exception thrown at `pc`, running finally blocks on
    /// the way out. Returns where execution resumes.
    fn unwind(&self, frame: &mut Frame<'_>, pc: usize, flow: Flow) -> Result<usize, Flow> {
        let Flow::Exception(mut ex) = flow else {
            return Err(flow);
        };
        let body = frame.body;
        for handler in body.handlers_at(pc) {
            match &handler.kind {
                HandlerKind::Catch(catch_type) => {
                    if self.catches(catch_type.as_ref(), &ex) {
                        frame.stack.clear();
                        frame.stack.push(ex.clone());
                        frame.caught = Some(ex);
                        return Ok(handler.handler_start);
                    }
                }
                HandlerKind::Finally => {
                    frame.stack.clear();
                    match self.exec(frame, handler.handler_start, true) {
                        Ok(_) => {}
                        Err(Flow::Exception(next)) => ex = next,
                        Err(fatal) => return Err(fatal),
                    }
                }
            }
        }
        Err(Flow::Exception(ex))
    }

    fn call(&self, frame: &mut Frame<'_>, target: MethodTarget, dispatch: bool) -> Result<Step, Flow> {
        let result = match target {
            MethodTarget::Def(handle) => {
                let method = self.method(handle)?;
                let args = frame.pop_n(method.arg_count())?;
                let mut callee = handle;
                if dispatch && !method.is_static {
                    if args[0].is_null() {
                        return Err(null_reference());
                    }
                    if method.is_virtual {
                        callee = self
                            .override_of(&args[0], &method.name, method.params.len())
                            .unwrap_or(handle);
                    }
                }
                self.invoke(callee, args)?
            }
            MethodTarget::Ref(index) => {
                let member = self
                    .program
                    .member_ref(index)
                    .ok_or_else(|| fault(format!("unknown member ref {index}")))?;
                let is_static = member.is_static();
                let args = frame.pop_n(member.params.len() + usize::from(!is_static))?;
                match self.binding(index)? {
                    Binding::Host { owner, ctor: true, .. } => {
                        self.base_ctor(owner, &args)?;
                        None
                    }
                    Binding::Host { func, .. } => {
                        if !is_static && args[0].is_null() {
                            return Err(null_reference());
                        }
                        let overridden = if dispatch && !is_static {
                            self.override_of(&args[0], &member.name, member.params.len())
                        } else {
                            None
                        };
                        match overridden {
                            Some(handle) => self.invoke(handle, args)?,
                            None => func(args)?,
                        }
                    }
                    Binding::DelegateInvoke => self.invoke_delegate(args)?,
                    Binding::DelegateCtor => {
                        return Err(fault("delegate constructor called without newobj"))
                    }
                }
            }
        };
        if let Some(value) = result {
            frame.push(value);
        }
        Ok(Step::Next)
    }

    /// A derived constructor chaining to a host base constructor.
    fn base_ctor(&self, owner: &str, args: &[Value]) -> Result<(), Flow> {
        match (args.first(), owner) {
            (Some(Value::Obj(obj)), "System.Exception") => {
                if let Some(Value::Str(message)) = args.get(1) {
                    *lock(&obj.message) = Some(Arc::clone(message));
                }
                Ok(())
            }
            (Some(Value::Obj(_) | Value::Addr(_)), "System.Object") => Ok(()),
            _ => Err(fault(format!("cannot chain to the {owner} constructor"))),
        }
    }

    fn invoke_delegate(&self, mut args: Vec<Value>) -> Result<Option<Value>, Flow> {
        let rest = args.split_off(1);
        let (target, method) = match &args[0] {
            Value::Host(object) => match object.as_ref() {
                HostObject::Delegate { target, method } => (target.clone(), *method),
                _ => return Err(fault("Invoke on a non-delegate")),
            },
            Value::Null => return Err(null_reference()),
            other => return Err(fault(format!("Invoke on {}", describe(other)))),
        };
        let mut call_args = Vec::with_capacity(rest.len() + 1);
        if !self.method(method)?.is_static {
            call_args.push(target);
        }
        call_args.extend(rest);
        self.invoke(method, call_args)
    }

    fn new_object(&self, frame: &mut Frame<'_>, target: MethodTarget) -> Result<Step, Flow> {
        match target {
            MethodTarget::Def(ctor) => {
                let method = self.method(ctor)?;
                let params = frame.pop_n(method.params.len())?;
                let is_struct = self
                    .program
                    .type_def(ctor.type_index)
                    .is_some_and(TypeDef::is_struct);
                if is_struct {
                    let temp = slot(Value::default_for(&TypeSig::Def(ctor.type_index), &self.program));
                    let mut args = vec![Value::Addr(Address::Slot(Arc::clone(&temp)))];
                    args.extend(params);
                    self.invoke(ctor, args)?;
                    let value = lock(&temp).clone();
                    frame.push(value);
                } else {
                    let object = Value::Obj(Arc::new(self.allocate(ctor.type_index)));
                    let mut args = vec![object.clone()];
                    args.extend(params);
                    self.invoke(ctor, args)?;
                    frame.push(object);
                }
            }
            MethodTarget::Ref(index) => {
                let member = self
                    .program
                    .member_ref(index)
                    .ok_or_else(|| fault(format!("unknown member ref {index}")))?;
                let params = frame.pop_n(member.params.len())?;
                let object = match self.binding(index)? {
                    Binding::Host { func, ctor: true, .. } => func(params)?
                        .ok_or_else(|| fault(format!("{} produced no object", member.signature())))?,
                    Binding::DelegateCtor => match params.as_slice() {
                        [target, Value::Method(method)] => Value::Host(Arc::new(HostObject::Delegate {
                            target: target.clone(),
                            method: *method,
                        })),
                        _ => return Err(fault("delegate constructed without a function pointer")),
                    },
                    _ => return Err(fault(format!("{} is not a constructor", member.signature()))),
                };
                frame.push(object);
            }
        }
        Ok(Step::Next)
    }

    fn pop_array(&self, frame: &mut Frame<'_>) -> Result<Arc<ArrayData>, Flow> {
        match frame.pop()? {
            Value::Array(array) => Ok(array),
            Value::Null => Err(null_reference()),
            other => Err(host::invalid_cast(&other, "System.Array")),
        }
    }

    fn element(&self, array: &ArrayData, index: i64) -> Result<usize, Flow> {
        let len = lock(&array.items).len();
        usize::try_from(index)
            .ok()
            .filter(|i| *i < len)
            .ok_or_else(|| throw("System.IndexOutOfRangeException", "Index was outside the bounds of the array."))
    }

    fn pop_address(&self, frame: &mut Frame<'_>) -> Result<Address, Flow> {
        match frame.pop()? {
            Value::Addr(addr) => Ok(addr),
            Value::Null => Err(null_reference()),
            other => Err(fault(format!(
                "unmanaged memory access through {} is not supported",
                describe(&other)
            ))),
        }
    }

    fn step(&self, frame: &mut Frame<'_>, op: &Op) -> Result<Step, Flow> {
        let body = frame.body;
        match op {
            Op::Nop => {}
            Op::LdNull => frame.push(Value::Null),
            Op::LdcI4(v) => frame.push(Value::I32(*v)),
            Op::LdcI8(v) => frame.push(Value::I64(*v)),
            Op::LdcR8(v) => frame.push(Value::F64(*v)),
            Op::LdStr(s) => frame.push(Value::str(s.as_str())),

            Op::Ldarg(i) => {
                let value = lock(frame.arg(*i)?).clone();
                frame.push(value);
            }
            Op::Ldarga(i) => {
                let addr = Address::Slot(Arc::clone(frame.arg(*i)?));
                frame.push(Value::Addr(addr));
            }
            Op::Starg(i) => {
                let value = frame.pop()?;
                *lock(frame.arg(*i)?) = value;
            }
            Op::Ldloc(i) => {
                let value = lock(frame.local(*i)?).clone();
                frame.push(value);
            }
            Op::Ldloca(i) => {
                let addr = Address::Slot(Arc::clone(frame.local(*i)?));
                frame.push(Value::Addr(addr));
            }
            Op::Stloc(i) => {
                let value = frame.pop()?;
                *lock(frame.local(*i)?) = value;
            }

            Op::Dup => {
                let value = frame.pop()?;
                frame.push(value.clone());
                frame.push(value);
            }
            Op::Pop => {
                frame.pop()?;
            }

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Rem | Op::And | Op::Or | Op::Xor | Op::Shl | Op::Shr => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(binary(op, &a, &b)?);
            }
            Op::Neg => {
                let value = match number(&frame.pop()?)? {
                    Num::I(v) => Value::I32(v.wrapping_neg()),
                    Num::L(v) => Value::I64(v.wrapping_neg()),
                    Num::F(v) => Value::F64(-v),
                };
                frame.push(value);
            }
            Op::Not => {
                let value = match number(&frame.pop()?)? {
                    Num::I(v) => Value::I32(!v),
                    Num::L(v) => Value::I64(!v),
                    Num::F(_) => return Err(fault("bitwise not on a floating-point value")),
                };
                frame.push(value);
            }
            Op::Ceq | Op::Cgt | Op::Clt => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                let result = match op {
                    Op::Ceq => a.same(&b),
                    Op::Cgt => compare(&a, &b)? == Some(Ordering::Greater),
                    _ => compare(&a, &b)? == Some(Ordering::Less),
                };
                frame.push(flag(result));
            }
            Op::ConvI4 => {
                let value = number(&frame.pop()?)?;
                let v = match value {
                    Num::I(v) => v,
                    Num::L(v) => v as i32,
                    Num::F(v) => v as i32,
                };
                frame.push(Value::I32(v));
            }
            Op::ConvI8 => {
                let value = number(&frame.pop()?)?;
                frame.push(Value::I64(value.i64()));
            }
            Op::ConvR8 => {
                let value = number(&frame.pop()?)?;
                frame.push(Value::F64(value.f64()));
            }
            Op::ConvU => {
                let value = frame.pop()?;
                let converted = match Num::of(&value) {
                    Some(Num::I(v)) => Value::I64(i64::from(v as u32)),
                    Some(Num::L(v)) => Value::I64(v),
                    Some(Num::F(v)) => Value::I64(v as u64 as i64),
                    None => value,
                };
                frame.push(converted);
            }

            Op::Br(t) => return Ok(Step::Jump(body.target(*t)?)),
            Op::Brtrue(t) | Op::Brfalse(t) => {
                let truthy = frame.pop()?.truthy();
                if truthy == matches!(op, Op::Brtrue(_)) {
                    return Ok(Step::Jump(body.target(*t)?));
                }
            }
            Op::Beq(t) | Op::Bne(t) | Op::Blt(t) | Op::Bge(t) | Op::Bgt(t) | Op::Ble(t) => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                let taken = match op {
                    Op::Beq(_) => a.same(&b),
                    Op::Bne(_) => !a.same(&b),
                    _ => {
                        let ord = compare(&a, &b)?;
                        match op {
                            Op::Blt(_) => ord == Some(Ordering::Less),
                            Op::Bge(_) => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
                            Op::Bgt(_) => ord == Some(Ordering::Greater),
                            _ => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
                        }
                    }
                };
                if taken {
                    return Ok(Step::Jump(body.target(*t)?));
                }
            }
            Op::Switch(targets) => {
                let selector = frame.pop_int()?;
                if let Some(t) = usize::try_from(selector).ok().and_then(|i| targets.get(i)) {
                    return Ok(Step::Jump(body.target(*t)?));
                }
            }
            Op::Leave(t) => return Ok(Step::Leave(body.target(*t)?)),
            Op::Endfinally => return Ok(Step::EndFinally),
            Op::Ret => {
                let value = if body.returns { Some(frame.pop()?) } else { None };
                return Ok(Step::Return(value));
            }
            Op::Throw => {
                let ex = frame.pop()?;
                if ex.is_null() {
                    return Err(null_reference());
                }
                return Err(Flow::Exception(ex));
            }
            Op::Rethrow => {
                let ex = frame
                    .caught
                    .clone()
                    .ok_or_else(|| fault("rethrow outside a catch handler"))?;
                return Err(Flow::Exception(ex));
            }

            Op::Call(target) => return self.call(frame, *target, false),
            Op::Callvirt(target) => return self.call(frame, *target, true),
            Op::Newobj(target) => return self.new_object(frame, *target),
            Op::Ldftn(MethodTarget::Def(handle)) => frame.push(Value::Method(*handle)),
            Op::Ldftn(MethodTarget::Ref(_)) => return Err(fault("function pointer to a host method")),

            Op::Newarr(elem) => {
                let count = frame.pop_int()?;
                let len = usize::try_from(count)
                    .map_err(|_| throw("System.OverflowException", "Arithmetic operation resulted in an overflow."))?;
                if len > MAX_ARRAY_LEN {
                    return Err(throw("System.OutOfMemoryException", "Array dimensions exceeded supported range."));
                }
                let item = Value::default_for(elem, &self.program);
                frame.push(Value::Array(Arc::new(ArrayData {
                    elem: elem.clone(),
                    items: Mutex::new(vec![item; len]),
                })));
            }
            Op::Ldlen => {
                let array = self.pop_array(frame)?;
                let len = lock(&array.items).len();
                frame.push(Value::I32(i32::try_from(len).unwrap_or(i32::MAX)));
            }
            Op::Ldelem(_) => {
                let index = frame.pop_int()?;
                let array = self.pop_array(frame)?;
                let at = self.element(&array, index)?;
                let value = lock(&array.items)[at].clone();
                frame.push(value);
            }
            Op::Ldelema(_) => {
                let index = frame.pop_int()?;
                let array = self.pop_array(frame)?;
                let at = self.element(&array, index)?;
                frame.push(Value::Addr(Address::Element(array, at)));
            }
            Op::Stelem(_) => {
                let value = frame.pop()?;
                let index = frame.pop_int()?;
                let array = self.pop_array(frame)?;
                let at = self.element(&array, index)?;
                lock(&array.items)[at] = value;
            }

            Op::Ldfld(FieldTarget::Def { type_index, field_index }) => {
                let target = frame.pop()?;
                let value = match &target {
                    Value::Struct(_, fields) => fields.get(*field_index as usize).cloned(),
                    other => self.field_address(other, *type_index, *field_index)?.load(),
                };
                frame.push(value.ok_or_else(|| fault("field load through a dangling address"))?);
            }
            Op::Ldflda(FieldTarget::Def { type_index, field_index }) => {
                let target = frame.pop()?;
                let addr = self.field_address(&target, *type_index, *field_index)?;
                frame.push(Value::Addr(addr));
            }
            Op::Stfld(FieldTarget::Def { type_index, field_index }) => {
                let value = frame.pop()?;
                let target = frame.pop()?;
                if !self.field_address(&target, *type_index, *field_index)?.store(value) {
                    return Err(fault("field store through a dangling address"));
                }
            }
            Op::Ldsfld(FieldTarget::Def { type_index, field_index }) => {
                let value = lock(&self.static_slot(*type_index, *field_index)).clone();
                frame.push(value);
            }
            Op::Ldsflda(FieldTarget::Def { type_index, field_index }) => {
                let addr = Address::Slot(self.static_slot(*type_index, *field_index));
                frame.push(Value::Addr(addr));
            }
            Op::Stsfld(FieldTarget::Def { type_index, field_index }) => {
                let value = frame.pop()?;
                *lock(&self.static_slot(*type_index, *field_index)) = value;
            }
            Op::Ldfld(FieldTarget::Ref(_))
            | Op::Ldflda(FieldTarget::Ref(_))
            | Op::Stfld(FieldTarget::Ref(_))
            | Op::Ldsfld(FieldTarget::Ref(_))
            | Op::Ldsflda(FieldTarget::Ref(_))
            | Op::Stsfld(FieldTarget::Ref(_)) => return Err(fault("host fields are not supported")),

            Op::Ldind(_) | Op::Ldobj(_) => {
                let addr = self.pop_address(frame)?;
                let value = addr.load().ok_or_else(|| fault("load through a dangling address"))?;
                frame.push(value);
            }
            Op::Stind(_) | Op::Stobj(_) => {
                let value = frame.pop()?;
                let addr = self.pop_address(frame)?;
                if !addr.store(value) {
                    return Err(fault("store through a dangling address"));
                }
            }
            Op::Initobj(ty) => {
                let addr = self.pop_address(frame)?;
                if !addr.store(Value::default_for(ty, &self.program)) {
                    return Err(fault("initobj through a dangling address"));
                }
            }

            Op::Box(_) => {}
            Op::UnboxAny(ty) => {
                let value = frame.pop()?;
                if value.is_null() && is_value_type(ty) {
                    return Err(null_reference());
                }
                frame.push(value);
            }
            Op::Castclass(ty) => {
                let value = frame.pop()?;
                if !value.is_null() && !self.instance_of(&value, ty) {
                    return Err(host::invalid_cast(&value, &ty.to_string()));
                }
                frame.push(value);
            }
            Op::Isinst(ty) => {
                let value = frame.pop()?;
                let result = if self.instance_of(&value, ty) { value } else { Value::Null };
                frame.push(result);
            }

            Op::Localloc => return Err(fault("dynamic stack allocation is not supported")),
        }
        Ok(Step::Next)
    }
}
