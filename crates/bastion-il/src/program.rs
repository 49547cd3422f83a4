use serde::{Deserialize, Serialize};

use crate::types::TypeSig;

/// Stable identity of an instruction within one method body.
///
/// Branch operands and exception-handler boundaries refer to instructions by id, so inserting
/// or removing instructions never shifts what they point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrId(pub u32);

/// Reference to a method defined by the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodHandle {
    pub type_index: u32,
    pub method_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodTarget {
    Def(MethodHandle),
    /// Index into `Program::member_refs`.
    Ref(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTarget {
    Def { type_index: u32, field_index: u32 },
    /// Index into `Program::member_refs`.
    Ref(u32),
}

/// Operand type of `Ldind`/`Stind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndKind {
    Bool,
    Char,
    I4,
    I8,
    R8,
    /// Native-width integer or unmanaged pointer.
    I,
    /// Object reference.
    Ref,
}

impl IndKind {
    pub fn as_type(self) -> TypeSig {
        match self {
            IndKind::Bool => TypeSig::Bool,
            IndKind::Char => TypeSig::Char,
            IndKind::I4 => TypeSig::I32,
            IndKind::I8 => TypeSig::I64,
            IndKind::R8 => TypeSig::F64,
            IndKind::I => TypeSig::IntPtr,
            IndKind::Ref => TypeSig::Object,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum Op {
    Nop,

    LdNull,
    LdcI4(i32),
    LdcI8(i64),
    LdcR8(f64),
    LdStr(String),

    Ldarg(u16),
    Ldarga(u16),
    Starg(u16),
    Ldloc(u16),
    Ldloca(u16),
    Stloc(u16),

    Dup,
    Pop,

    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Ceq,
    Cgt,
    Clt,
    ConvI4,
    ConvI8,
    ConvR8,
    /// Conversion to native-width unsigned integer.
    ConvU,

    Br(InstrId),
    Brtrue(InstrId),
    Brfalse(InstrId),
    Beq(InstrId),
    Bne(InstrId),
    Blt(InstrId),
    Bge(InstrId),
    Bgt(InstrId),
    Ble(InstrId),
    Switch(Vec<InstrId>),
    Leave(InstrId),
    Endfinally,
    Ret,
    Throw,
    Rethrow,

    Call(MethodTarget),
    Callvirt(MethodTarget),
    Newobj(MethodTarget),
    Ldftn(MethodTarget),

    Newarr(TypeSig),
    Ldlen,
    Ldelem(TypeSig),
    Ldelema(TypeSig),
    Stelem(TypeSig),

    Ldfld(FieldTarget),
    Ldflda(FieldTarget),
    Stfld(FieldTarget),
    Ldsfld(FieldTarget),
    Ldsflda(FieldTarget),
    Stsfld(FieldTarget),

    Ldind(IndKind),
    Stind(IndKind),
    Ldobj(TypeSig),
    Stobj(TypeSig),
    Initobj(TypeSig),

    Box(TypeSig),
    UnboxAny(TypeSig),
    Castclass(TypeSig),
    Isinst(TypeSig),

    /// Dynamic stack allocation.
    Localloc,
}

impl Op {
    /// Instructions this one may transfer control to, other than falling through.
    pub fn branch_targets(&self) -> Vec<InstrId> {
        match self {
            Op::Br(t)
            | Op::Brtrue(t)
            | Op::Brfalse(t)
            | Op::Beq(t)
            | Op::Bne(t)
            | Op::Blt(t)
            | Op::Bge(t)
            | Op::Bgt(t)
            | Op::Ble(t)
            | Op::Leave(t) => vec![*t],
            Op::Switch(ts) => ts.clone(),
            _ => Vec::new(),
        }
    }

    pub fn branch_targets_mut(&mut self) -> Vec<&mut InstrId> {
        match self {
            Op::Br(t)
            | Op::Brtrue(t)
            | Op::Brfalse(t)
            | Op::Beq(t)
            | Op::Bne(t)
            | Op::Blt(t)
            | Op::Bge(t)
            | Op::Bgt(t)
            | Op::Ble(t)
            | Op::Leave(t) => vec![t],
            Op::Switch(ts) => ts.iter_mut().collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_branch(&self) -> bool {
        !self.branch_targets().is_empty() || matches!(self, Op::Switch(_))
    }

    /// True when execution never falls through to the next instruction.
    pub fn ends_flow(&self) -> bool {
        matches!(
            self,
            Op::Br(_) | Op::Leave(_) | Op::Ret | Op::Throw | Op::Rethrow | Op::Endfinally
        )
    }

    pub fn method_target(&self) -> Option<MethodTarget> {
        match self {
            Op::Call(t) | Op::Callvirt(t) | Op::Newobj(t) | Op::Ldftn(t) => Some(*t),
            _ => None,
        }
    }

    pub fn field_target(&self) -> Option<FieldTarget> {
        match self {
            Op::Ldfld(t)
            | Op::Ldflda(t)
            | Op::Stfld(t)
            | Op::Ldsfld(t)
            | Op::Ldsflda(t)
            | Op::Stsfld(t) => Some(*t),
            _ => None,
        }
    }

    /// Type operand carried by the instruction, if any.
    pub fn type_operand(&self) -> Option<&TypeSig> {
        match self {
            Op::Newarr(t)
            | Op::Ldelem(t)
            | Op::Ldelema(t)
            | Op::Stelem(t)
            | Op::Ldobj(t)
            | Op::Stobj(t)
            | Op::Initobj(t)
            | Op::Box(t)
            | Op::UnboxAny(t)
            | Op::Castclass(t)
            | Op::Isinst(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: InstrId,
    pub op: Op,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "catch_type", rename_all = "snake_case")]
pub enum HandlerKind {
    /// Catches program exceptions; `None` catches every program exception.
    Catch(Option<TypeSig>),
    Finally,
}

/// Protected region and its handler. Ends are exclusive; `None` means end of body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    pub kind: HandlerKind,
    pub try_start: InstrId,
    pub try_end: Option<InstrId>,
    pub handler_start: InstrId,
    pub handler_end: Option<InstrId>,
}

impl ExceptionHandler {
    pub fn boundaries_mut(&mut self) -> [Option<&mut InstrId>; 4] {
        [
            Some(&mut self.try_start),
            self.try_end.as_mut(),
            Some(&mut self.handler_start),
            self.handler_end.as_mut(),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    pub locals: Vec<TypeSig>,
    pub instructions: Vec<Instruction>,
    #[serde(default)]
    pub handlers: Vec<ExceptionHandler>,
    pub next_id: u32,
}

impl MethodBody {
    pub fn new(locals: Vec<TypeSig>, ops: Vec<Op>) -> Self {
        let mut body = MethodBody {
            locals,
            instructions: Vec::with_capacity(ops.len()),
            handlers: Vec::new(),
            next_id: 0,
        };
        for op in ops {
            let id = body.fresh_id();
            body.instructions.push(Instruction { id, op });
        }
        body
    }

    pub fn fresh_id(&mut self) -> InstrId {
        let id = InstrId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn index_of(&self, id: InstrId) -> Option<usize> {
        self.instructions.iter().position(|i| i.id == id)
    }

    pub fn get(&self, id: InstrId) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.id == id)
    }

    /// Whether any branch or handler boundary refers to `id`.
    pub fn is_referenced(&self, id: InstrId) -> bool {
        self.instructions
            .iter()
            .any(|i| i.op.branch_targets().contains(&id))
            || self.handlers.iter().any(|h| {
                h.try_start == id
                    || h.try_end == Some(id)
                    || h.handler_start == id
                    || h.handler_end == Some(id)
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MethodImpl {
    Managed,
    /// Call into a native library (platform interop).
    ForeignCall { library: String, symbol: String },
    /// Implementation supplied by the runtime itself.
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub is_static: bool,
    #[serde(default)]
    pub is_virtual: bool,
    pub implementation: MethodImpl,
    pub params: Vec<TypeSig>,
    pub ret: TypeSig,
    #[serde(default)]
    pub generic_params: u16,
    pub body: Option<MethodBody>,
}

impl MethodDef {
    /// Instance `Finalize()` override: runs on a collector thread outside any scope.
    pub fn is_finalizer(&self) -> bool {
        self.name == "Finalize" && !self.is_static && self.params.is_empty() && self.ret.is_void()
    }

    /// Number of stack arguments including the implicit `this`.
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(!self.is_static)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    #[default]
    Class,
    Struct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    #[default]
    Auto,
    Sequential,
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: TypeSig,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub kind: TypeKind,
    #[serde(default)]
    pub layout: Layout,
    #[serde(default)]
    pub base: Option<TypeSig>,
    #[serde(default)]
    pub generic_params: u16,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
}

impl TypeDef {
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    pub fn is_struct(&self) -> bool {
        self.kind == TypeKind::Struct
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemberKind {
    Method { is_static: bool },
    Field { is_static: bool },
}

/// External member reached by the program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRef {
    pub owner: TypeSig,
    pub name: String,
    pub kind: MemberKind,
    #[serde(default)]
    pub params: Vec<TypeSig>,
    pub ret: TypeSig,
}

impl MemberRef {
    pub fn method(owner: TypeSig, name: &str, is_static: bool, params: Vec<TypeSig>, ret: TypeSig) -> Self {
        Self {
            owner,
            name: name.to_string(),
            kind: MemberKind::Method { is_static },
            params,
            ret,
        }
    }

    pub fn is_static(&self) -> bool {
        match self.kind {
            MemberKind::Method { is_static } | MemberKind::Field { is_static } => is_static,
        }
    }

    pub fn is_ctor(&self) -> bool {
        self.name == ".ctor"
    }

    /// `Namespace.Type::Member`.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.owner, self.name)
    }

    /// Qualified name including the parameter list, identifying one overload.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
        match self.kind {
            MemberKind::Method { .. } => format!("{}({})", self.qualified_name(), params.join(", ")),
            MemberKind::Field { .. } => self.qualified_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Program {
    pub name: String,
    pub types: Vec<TypeDef>,
    #[serde(default)]
    pub member_refs: Vec<MemberRef>,
    #[serde(default)]
    pub entry: Option<MethodHandle>,
}

impl Program {
    pub fn type_def(&self, index: u32) -> Option<&TypeDef> {
        self.types.get(index as usize)
    }

    pub fn method(&self, handle: MethodHandle) -> Option<&MethodDef> {
        self.types
            .get(handle.type_index as usize)?
            .methods
            .get(handle.method_index as usize)
    }

    pub fn member_ref(&self, index: u32) -> Option<&MemberRef> {
        self.member_refs.get(index as usize)
    }

    pub fn field(&self, type_index: u32, field_index: u32) -> Option<&FieldDef> {
        self.types
            .get(type_index as usize)?
            .fields
            .get(field_index as usize)
    }

    /// `Namespace.Type::Method` for a program-defined method.
    pub fn method_name(&self, handle: MethodHandle) -> String {
        match (self.type_def(handle.type_index), self.method(handle)) {
            (Some(t), Some(m)) => format!("{}::{}", t.full_name(), m.name),
            _ => format!("<method {}:{}>", handle.type_index, handle.method_index),
        }
    }

    /// Returns the index of an equal member ref, appending it when absent.
    pub fn intern_member_ref(&mut self, member: MemberRef) -> u32 {
        if let Some(pos) = self.member_refs.iter().position(|m| *m == member) {
            return pos as u32;
        }
        self.member_refs.push(member);
        (self.member_refs.len() - 1) as u32
    }

    /// Signature of a method target: (params, ret, is_static, is_ctor).
    pub fn target_signature(&self, target: MethodTarget) -> Option<(Vec<TypeSig>, TypeSig, bool, bool)> {
        match target {
            MethodTarget::Def(h) => {
                let m = self.method(h)?;
                Some((m.params.clone(), m.ret.clone(), m.is_static, m.name == ".ctor"))
            }
            MethodTarget::Ref(idx) => {
                let m = self.member_ref(idx)?;
                Some((m.params.clone(), m.ret.clone(), m.is_static(), m.is_ctor()))
            }
        }
    }

    /// Declared type of a field target.
    pub fn field_type(&self, target: FieldTarget) -> Option<&TypeSig> {
        match target {
            FieldTarget::Def {
                type_index,
                field_index,
            } => self.field(type_index, field_index).map(|f| &f.ty),
            FieldTarget::Ref(idx) => self.member_ref(idx).map(|m| &m.ret),
        }
    }

    /// Owner type of a method target as a signature.
    pub fn target_owner(&self, target: MethodTarget) -> Option<TypeSig> {
        match target {
            MethodTarget::Def(h) => Some(TypeSig::Def(h.type_index)),
            MethodTarget::Ref(idx) => self.member_ref(idx).map(|m| m.owner.clone()),
        }
    }
}
