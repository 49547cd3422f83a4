//! Binary container for programs.
//!
//! Layout (big-endian): magic `BSTN`, format version, three reserved bytes, then the program.
//! Strings are u32-length-prefixed UTF-8. Branch targets and handler boundaries are encoded as
//! instruction indices; a boundary equal to the instruction count means "end of body".
//!
//! Decoding assigns instruction ids in stream order, so `encode(decode(bytes))` reproduces the
//! input exactly for any canonical container.

use std::fmt;

use bastion_contracts::{PROGRAM_FORMAT_VERSION, PROGRAM_MAGIC};

use crate::program::{
    ExceptionHandler, FieldDef, FieldTarget, HandlerKind, IndKind, InstrId, Instruction, Layout,
    MemberKind, MemberRef, MethodBody, MethodDef, MethodHandle, MethodImpl, MethodTarget, Op,
    Program, TypeDef, TypeKind,
};
use crate::types::{RefKind, TypeRef, TypeSig};

const MAX_SIG_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof { offset: usize },
    BadMagic,
    UnsupportedVersion(u8),
    InvalidTag { what: &'static str, tag: u8, offset: usize },
    InvalidUtf8 { offset: usize },
    SignatureTooDeep { offset: usize },
    BranchOutOfRange { method: String, target: u32 },
    DanglingReference { what: &'static str, index: u32 },
    TrailingBytes { offset: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEof { offset } => {
                write!(f, "unexpected end of program at byte {offset}")
            }
            DecodeError::BadMagic => f.write_str("not a program container (bad magic)"),
            DecodeError::UnsupportedVersion(v) => {
                write!(f, "unsupported program format version {v}")
            }
            DecodeError::InvalidTag { what, tag, offset } => {
                write!(f, "invalid {what} tag 0x{tag:02x} at byte {offset}")
            }
            DecodeError::InvalidUtf8 { offset } => {
                write!(f, "invalid UTF-8 string at byte {offset}")
            }
            DecodeError::SignatureTooDeep { offset } => {
                write!(f, "type signature nested deeper than {MAX_SIG_DEPTH} at byte {offset}")
            }
            DecodeError::BranchOutOfRange { method, target } => {
                write!(f, "branch target {target} out of range in {method}")
            }
            DecodeError::DanglingReference { what, index } => {
                write!(f, "reference to missing {what} #{index}")
            }
            DecodeError::TrailingBytes { offset } => {
                write!(f, "trailing bytes after program at byte {offset}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

pub fn encode(program: &Program) -> Vec<u8> {
    let mut w = Writer::default();
    w.buf.extend_from_slice(PROGRAM_MAGIC);
    w.u8(PROGRAM_FORMAT_VERSION);
    w.buf.extend_from_slice(&[0, 0, 0]);

    w.str(&program.name);
    match program.entry {
        Some(h) => {
            w.u8(1);
            w.u32(h.type_index);
            w.u32(h.method_index);
        }
        None => w.u8(0),
    }
    w.u32(program.types.len() as u32);
    for t in &program.types {
        w.type_def(t);
    }
    w.u32(program.member_refs.len() as u32);
    for m in &program.member_refs {
        w.member_ref(m);
    }
    w.buf
}

pub fn decode(bytes: &[u8]) -> Result<Program, DecodeError> {
    let mut r = Reader { bytes, pos: 0 };
    let magic = r.take(4)?;
    if magic != PROGRAM_MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = r.u8()?;
    if version != PROGRAM_FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    r.take(3)?;

    let name = r.str()?;
    let entry = match r.u8()? {
        0 => None,
        1 => Some(MethodHandle {
            type_index: r.u32()?,
            method_index: r.u32()?,
        }),
        tag => return Err(r.bad_tag("entry", tag)),
    };
    let type_count = r.count()?;
    let mut types = Vec::with_capacity(type_count);
    for _ in 0..type_count {
        types.push(r.type_def()?);
    }
    let ref_count = r.count()?;
    let mut member_refs = Vec::with_capacity(ref_count);
    for _ in 0..ref_count {
        member_refs.push(r.member_ref()?);
    }
    if r.pos != bytes.len() {
        return Err(DecodeError::TrailingBytes { offset: r.pos });
    }

    let program = Program {
        name,
        types,
        member_refs,
        entry,
    };
    check_references(&program)?;
    Ok(program)
}

fn check_references(program: &Program) -> Result<(), DecodeError> {
    let type_count = program.types.len() as u32;
    let check_sig = |sig: &TypeSig| check_sig_refs(sig, type_count);

    if let Some(h) = program.entry {
        if program.method(h).is_none() {
            return Err(DecodeError::DanglingReference {
                what: "entry method",
                index: h.method_index,
            });
        }
    }
    for m in &program.member_refs {
        check_sig(&m.owner)?;
        m.params.iter().try_for_each(check_sig)?;
        check_sig(&m.ret)?;
    }
    for t in &program.types {
        if let Some(base) = &t.base {
            check_sig(base)?;
        }
        for f in &t.fields {
            check_sig(&f.ty)?;
        }
        for m in &t.methods {
            m.params.iter().try_for_each(check_sig)?;
            check_sig(&m.ret)?;
            let Some(body) = &m.body else { continue };
            body.locals.iter().try_for_each(check_sig)?;
            for instr in &body.instructions {
                if let Some(t) = instr.op.type_operand() {
                    check_sig(t)?;
                }
                match instr.op.method_target() {
                    Some(MethodTarget::Def(h)) if program.method(h).is_none() => {
                        return Err(DecodeError::DanglingReference {
                            what: "method",
                            index: h.method_index,
                        });
                    }
                    Some(MethodTarget::Ref(idx)) if program.member_ref(idx).is_none() => {
                        return Err(DecodeError::DanglingReference {
                            what: "member ref",
                            index: idx,
                        });
                    }
                    _ => {}
                }
                match instr.op.field_target() {
                    Some(FieldTarget::Def {
                        type_index,
                        field_index,
                    }) if program.field(type_index, field_index).is_none() => {
                        return Err(DecodeError::DanglingReference {
                            what: "field",
                            index: field_index,
                        });
                    }
                    Some(FieldTarget::Ref(idx)) if program.member_ref(idx).is_none() => {
                        return Err(DecodeError::DanglingReference {
                            what: "member ref",
                            index: idx,
                        });
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

fn check_sig_refs(sig: &TypeSig, type_count: u32) -> Result<(), DecodeError> {
    match sig {
        TypeSig::Def(idx) if *idx >= type_count => Err(DecodeError::DanglingReference {
            what: "type",
            index: *idx,
        }),
        TypeSig::Inst(base, args) => {
            check_sig_refs(base, type_count)?;
            args.iter().try_for_each(|a| check_sig_refs(a, type_count))
        }
        TypeSig::Array(e) | TypeSig::Ptr(e) | TypeSig::ByRef(e) => check_sig_refs(e, type_count),
        _ => Ok(()),
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn opt_u32(&mut self, v: Option<u32>) {
        match v {
            Some(v) => {
                self.u8(1);
                self.u32(v);
            }
            None => self.u8(0),
        }
    }

    fn sig(&mut self, sig: &TypeSig) {
        match sig {
            TypeSig::Void => self.u8(0),
            TypeSig::Bool => self.u8(1),
            TypeSig::Char => self.u8(2),
            TypeSig::I32 => self.u8(3),
            TypeSig::I64 => self.u8(4),
            TypeSig::F64 => self.u8(5),
            TypeSig::IntPtr => self.u8(6),
            TypeSig::String => self.u8(7),
            TypeSig::Object => self.u8(8),
            TypeSig::Named(r) => {
                self.u8(9);
                self.str(&r.namespace);
                self.str(&r.name);
                self.u8(match r.kind {
                    RefKind::Class => 0,
                    RefKind::Delegate => 1,
                });
            }
            TypeSig::Def(idx) => {
                self.u8(10);
                self.u32(*idx);
            }
            TypeSig::Inst(base, args) => {
                self.u8(11);
                self.sig(base);
                self.sigs(args);
            }
            TypeSig::Array(e) => {
                self.u8(12);
                self.sig(e);
            }
            TypeSig::Ptr(e) => {
                self.u8(13);
                self.sig(e);
            }
            TypeSig::ByRef(e) => {
                self.u8(14);
                self.sig(e);
            }
            TypeSig::GenericParam(n) => {
                self.u8(15);
                self.u16(*n);
            }
            TypeSig::MethodGenericParam(n) => {
                self.u8(16);
                self.u16(*n);
            }
        }
    }

    fn opt_sig(&mut self, sig: Option<&TypeSig>) {
        match sig {
            Some(s) => {
                self.u8(1);
                self.sig(s);
            }
            None => self.u8(0),
        }
    }

    fn sigs(&mut self, sigs: &[TypeSig]) {
        self.u32(sigs.len() as u32);
        for s in sigs {
            self.sig(s);
        }
    }

    fn type_def(&mut self, t: &TypeDef) {
        self.str(&t.namespace);
        self.str(&t.name);
        self.u8(match t.kind {
            TypeKind::Class => 0,
            TypeKind::Struct => 1,
        });
        self.u8(match t.layout {
            Layout::Auto => 0,
            Layout::Sequential => 1,
            Layout::Explicit => 2,
        });
        self.opt_sig(t.base.as_ref());
        self.u16(t.generic_params);
        self.u32(t.fields.len() as u32);
        for f in &t.fields {
            self.str(&f.name);
            self.sig(&f.ty);
            self.bool(f.is_static);
            self.opt_u32(f.offset);
        }
        self.u32(t.methods.len() as u32);
        for m in &t.methods {
            self.method(m);
        }
    }

    fn method(&mut self, m: &MethodDef) {
        self.str(&m.name);
        self.bool(m.is_static);
        self.bool(m.is_virtual);
        match &m.implementation {
            MethodImpl::Managed => self.u8(0),
            MethodImpl::ForeignCall { library, symbol } => {
                self.u8(1);
                self.str(library);
                self.str(symbol);
            }
            MethodImpl::Runtime => self.u8(2),
        }
        self.sigs(&m.params);
        self.sig(&m.ret);
        self.u16(m.generic_params);
        match &m.body {
            Some(body) => {
                self.u8(1);
                self.body(body);
            }
            None => self.u8(0),
        }
    }

    fn body(&mut self, body: &MethodBody) {
        self.sigs(&body.locals);
        let len = body.instructions.len() as u32;
        let index = |id: InstrId| -> u32 {
            body.index_of(id).map(|i| i as u32).unwrap_or(len)
        };
        self.u32(len);
        for instr in &body.instructions {
            self.op(&instr.op, &index);
        }
        self.u32(body.handlers.len() as u32);
        for h in &body.handlers {
            match &h.kind {
                HandlerKind::Catch(ty) => {
                    self.u8(0);
                    self.opt_sig(ty.as_ref());
                }
                HandlerKind::Finally => self.u8(1),
            }
            self.u32(index(h.try_start));
            self.u32(h.try_end.map(index).unwrap_or(len));
            self.u32(index(h.handler_start));
            self.u32(h.handler_end.map(index).unwrap_or(len));
        }
    }

    fn method_target(&mut self, t: &MethodTarget) {
        match t {
            MethodTarget::Def(h) => {
                self.u8(0);
                self.u32(h.type_index);
                self.u32(h.method_index);
            }
            MethodTarget::Ref(idx) => {
                self.u8(1);
                self.u32(*idx);
            }
        }
    }

    fn field_target(&mut self, t: &FieldTarget) {
        match t {
            FieldTarget::Def {
                type_index,
                field_index,
            } => {
                self.u8(0);
                self.u32(*type_index);
                self.u32(*field_index);
            }
            FieldTarget::Ref(idx) => {
                self.u8(1);
                self.u32(*idx);
            }
        }
    }

    fn op(&mut self, op: &Op, index: &dyn Fn(InstrId) -> u32) {
        self.u8(opcode(op));
        match op {
            Op::LdcI4(v) => self.i32(*v),
            Op::LdcI8(v) => self.i64(*v),
            Op::LdcR8(v) => self.f64(*v),
            Op::LdStr(s) => self.str(s),
            Op::Ldarg(n) | Op::Ldarga(n) | Op::Starg(n) | Op::Ldloc(n) | Op::Ldloca(n) | Op::Stloc(n) => {
                self.u16(*n)
            }
            Op::Br(t)
            | Op::Brtrue(t)
            | Op::Brfalse(t)
            | Op::Beq(t)
            | Op::Bne(t)
            | Op::Blt(t)
            | Op::Bge(t)
            | Op::Bgt(t)
            | Op::Ble(t)
            | Op::Leave(t) => self.u32(index(*t)),
            Op::Switch(ts) => {
                self.u32(ts.len() as u32);
                for t in ts {
                    self.u32(index(*t));
                }
            }
            Op::Call(t) | Op::Callvirt(t) | Op::Newobj(t) | Op::Ldftn(t) => self.method_target(t),
            Op::Ldfld(t) | Op::Ldflda(t) | Op::Stfld(t) | Op::Ldsfld(t) | Op::Ldsflda(t) | Op::Stsfld(t) => {
                self.field_target(t)
            }
            Op::Ldind(k) | Op::Stind(k) => self.u8(ind_code(*k)),
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
            | Op::Isinst(t) => self.sig(t),
            _ => {}
        }
    }

    fn member_ref(&mut self, m: &MemberRef) {
        self.sig(&m.owner);
        self.str(&m.name);
        match m.kind {
            MemberKind::Method { is_static } => {
                self.u8(0);
                self.bool(is_static);
            }
            MemberKind::Field { is_static } => {
                self.u8(1);
                self.bool(is_static);
            }
        }
        self.sigs(&m.params);
        self.sig(&m.ret);
    }
}

fn ind_code(k: IndKind) -> u8 {
    match k {
        IndKind::Bool => 0,
        IndKind::Char => 1,
        IndKind::I4 => 2,
        IndKind::I8 => 3,
        IndKind::R8 => 4,
        IndKind::I => 5,
        IndKind::Ref => 6,
    }
}

fn opcode(op: &Op) -> u8 {
    match op {
        Op::Nop => 0x00,
        Op::LdNull => 0x01,
        Op::LdcI4(_) => 0x02,
        Op::LdcI8(_) => 0x03,
        Op::LdcR8(_) => 0x04,
        Op::LdStr(_) => 0x05,
        Op::Ldarg(_) => 0x10,
        Op::Ldarga(_) => 0x11,
        Op::Starg(_) => 0x12,
        Op::Ldloc(_) => 0x13,
        Op::Ldloca(_) => 0x14,
        Op::Stloc(_) => 0x15,
        Op::Dup => 0x16,
        Op::Pop => 0x17,
        Op::Add => 0x20,
        Op::Sub => 0x21,
        Op::Mul => 0x22,
        Op::Div => 0x23,
        Op::Rem => 0x24,
        Op::Neg => 0x25,
        Op::And => 0x26,
        Op::Or => 0x27,
        Op::Xor => 0x28,
        Op::Not => 0x29,
        Op::Shl => 0x2a,
        Op::Shr => 0x2b,
        Op::Ceq => 0x2c,
        Op::Cgt => 0x2d,
        Op::Clt => 0x2e,
        Op::ConvI4 => 0x30,
        Op::ConvI8 => 0x31,
        Op::ConvR8 => 0x32,
        Op::ConvU => 0x33,
        Op::Br(_) => 0x40,
        Op::Brtrue(_) => 0x41,
        Op::Brfalse(_) => 0x42,
        Op::Beq(_) => 0x43,
        Op::Bne(_) => 0x44,
        Op::Blt(_) => 0x45,
        Op::Bge(_) => 0x46,
        Op::Bgt(_) => 0x47,
        Op::Ble(_) => 0x48,
        Op::Switch(_) => 0x49,
        Op::Leave(_) => 0x4a,
        Op::Endfinally => 0x4b,
        Op::Ret => 0x4c,
        Op::Throw => 0x4d,
        Op::Rethrow => 0x4e,
        Op::Call(_) => 0x50,
        Op::Callvirt(_) => 0x51,
        Op::Newobj(_) => 0x52,
        Op::Ldftn(_) => 0x53,
        Op::Newarr(_) => 0x60,
        Op::Ldlen => 0x61,
        Op::Ldelem(_) => 0x62,
        Op::Ldelema(_) => 0x63,
        Op::Stelem(_) => 0x64,
        Op::Ldfld(_) => 0x70,
        Op::Ldflda(_) => 0x71,
        Op::Stfld(_) => 0x72,
        Op::Ldsfld(_) => 0x73,
        Op::Ldsflda(_) => 0x74,
        Op::Stsfld(_) => 0x75,
        Op::Ldind(_) => 0x80,
        Op::Stind(_) => 0x81,
        Op::Ldobj(_) => 0x82,
        Op::Stobj(_) => 0x83,
        Op::Initobj(_) => 0x84,
        Op::Box(_) => 0x90,
        Op::UnboxAny(_) => 0x91,
        Op::Castclass(_) => 0x92,
        Op::Isinst(_) => 0x93,
        Op::Localloc => 0xa0,
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

/// Branch operands before ids are assigned.
enum RawOp {
    Ready(Op),
    Branch(fn(InstrId) -> Op, u32),
    Switch(Vec<u32>),
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.bytes.len() - self.pos < n {
            return Err(DecodeError::UnexpectedEof { offset: self.pos });
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn bad_tag(&self, what: &'static str, tag: u8) -> DecodeError {
        DecodeError::InvalidTag {
            what,
            tag,
            offset: self.pos.saturating_sub(1),
        }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(self.bad_tag("bool", tag)),
        }
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u32()? as i32)
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_be_bytes(raw))
    }

    fn f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(self.i64()? as u64))
    }

    /// Element count, bounded by the remaining input so a forged count cannot
    /// force a huge allocation.
    fn count(&mut self) -> Result<usize, DecodeError> {
        let n = self.u32()? as usize;
        if n > self.bytes.len() - self.pos {
            return Err(DecodeError::UnexpectedEof { offset: self.pos });
        }
        Ok(n)
    }

    fn str(&mut self) -> Result<String, DecodeError> {
        let len = self.count()?;
        let offset = self.pos;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { offset })
    }

    fn opt_u32(&mut self) -> Result<Option<u32>, DecodeError> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.u32()?)),
            tag => Err(self.bad_tag("option", tag)),
        }
    }

    fn sig(&mut self) -> Result<TypeSig, DecodeError> {
        self.sig_at(0)
    }

    fn sig_at(&mut self, depth: usize) -> Result<TypeSig, DecodeError> {
        if depth > MAX_SIG_DEPTH {
            return Err(DecodeError::SignatureTooDeep { offset: self.pos });
        }
        let tag = self.u8()?;
        Ok(match tag {
            0 => TypeSig::Void,
            1 => TypeSig::Bool,
            2 => TypeSig::Char,
            3 => TypeSig::I32,
            4 => TypeSig::I64,
            5 => TypeSig::F64,
            6 => TypeSig::IntPtr,
            7 => TypeSig::String,
            8 => TypeSig::Object,
            9 => {
                let namespace = self.str()?;
                let name = self.str()?;
                let kind = match self.u8()? {
                    0 => RefKind::Class,
                    1 => RefKind::Delegate,
                    tag => return Err(self.bad_tag("type ref kind", tag)),
                };
                TypeSig::Named(TypeRef {
                    namespace,
                    name,
                    kind,
                })
            }
            10 => TypeSig::Def(self.u32()?),
            11 => {
                let base = self.sig_at(depth + 1)?;
                let n = self.count()?;
                let mut args = Vec::with_capacity(n);
                for _ in 0..n {
                    args.push(self.sig_at(depth + 1)?);
                }
                TypeSig::Inst(Box::new(base), args)
            }
            12 => TypeSig::Array(Box::new(self.sig_at(depth + 1)?)),
            13 => TypeSig::Ptr(Box::new(self.sig_at(depth + 1)?)),
            14 => TypeSig::ByRef(Box::new(self.sig_at(depth + 1)?)),
            15 => TypeSig::GenericParam(self.u16()?),
            16 => TypeSig::MethodGenericParam(self.u16()?),
            _ => return Err(self.bad_tag("type signature", tag)),
        })
    }

    fn opt_sig(&mut self) -> Result<Option<TypeSig>, DecodeError> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.sig()?)),
            tag => Err(self.bad_tag("option", tag)),
        }
    }

    fn sigs(&mut self) -> Result<Vec<TypeSig>, DecodeError> {
        let n = self.count()?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.sig()?);
        }
        Ok(out)
    }

    fn type_def(&mut self) -> Result<TypeDef, DecodeError> {
        let namespace = self.str()?;
        let name = self.str()?;
        let kind = match self.u8()? {
            0 => TypeKind::Class,
            1 => TypeKind::Struct,
            tag => return Err(self.bad_tag("type kind", tag)),
        };
        let layout = match self.u8()? {
            0 => Layout::Auto,
            1 => Layout::Sequential,
            2 => Layout::Explicit,
            tag => return Err(self.bad_tag("layout", tag)),
        };
        let base = self.opt_sig()?;
        let generic_params = self.u16()?;
        let field_count = self.count()?;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(FieldDef {
                name: self.str()?,
                ty: self.sig()?,
                is_static: self.bool()?,
                offset: self.opt_u32()?,
            });
        }
        let method_count = self.count()?;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            methods.push(self.method(&namespace, &name)?);
        }
        Ok(TypeDef {
            namespace,
            name,
            kind,
            layout,
            base,
            generic_params,
            fields,
            methods,
        })
    }

    fn method(&mut self, namespace: &str, type_name: &str) -> Result<MethodDef, DecodeError> {
        let name = self.str()?;
        let is_static = self.bool()?;
        let is_virtual = self.bool()?;
        let implementation = match self.u8()? {
            0 => MethodImpl::Managed,
            1 => MethodImpl::ForeignCall {
                library: self.str()?,
                symbol: self.str()?,
            },
            2 => MethodImpl::Runtime,
            tag => return Err(self.bad_tag("method implementation", tag)),
        };
        let params = self.sigs()?;
        let ret = self.sig()?;
        let generic_params = self.u16()?;
        let body = match self.u8()? {
            0 => None,
            1 => {
                let qualified = format!("{namespace}.{type_name}::{name}");
                Some(self.body(&qualified)?)
            }
            tag => return Err(self.bad_tag("option", tag)),
        };
        Ok(MethodDef {
            name,
            is_static,
            is_virtual,
            implementation,
            params,
            ret,
            generic_params,
            body,
        })
    }

    fn body(&mut self, method: &str) -> Result<MethodBody, DecodeError> {
        let locals = self.sigs()?;
        let len = self.count()?;
        let mut raw = Vec::with_capacity(len);
        for _ in 0..len {
            raw.push(self.op()?);
        }
        let target = |idx: u32| -> Result<InstrId, DecodeError> {
            if (idx as usize) < len {
                Ok(InstrId(idx))
            } else {
                Err(DecodeError::BranchOutOfRange {
                    method: method.to_string(),
                    target: idx,
                })
            }
        };
        let mut instructions = Vec::with_capacity(len);
        for (i, r) in raw.into_iter().enumerate() {
            let op = match r {
                RawOp::Ready(op) => op,
                RawOp::Branch(make, idx) => make(target(idx)?),
                RawOp::Switch(idxs) => Op::Switch(
                    idxs.into_iter()
                        .map(target)
                        .collect::<Result<Vec<_>, _>>()?,
                ),
            };
            instructions.push(Instruction {
                id: InstrId(i as u32),
                op,
            });
        }

        let boundary = |idx: u32| -> Result<Option<InstrId>, DecodeError> {
            if idx as usize == len {
                Ok(None)
            } else {
                target(idx).map(Some)
            }
        };
        let handler_count = self.count()?;
        let mut handlers = Vec::with_capacity(handler_count);
        for _ in 0..handler_count {
            let kind = match self.u8()? {
                0 => HandlerKind::Catch(self.opt_sig()?),
                1 => HandlerKind::Finally,
                tag => return Err(self.bad_tag("handler kind", tag)),
            };
            let try_start = target(self.u32()?)?;
            let try_end = boundary(self.u32()?)?;
            let handler_start = target(self.u32()?)?;
            let handler_end = boundary(self.u32()?)?;
            handlers.push(ExceptionHandler {
                kind,
                try_start,
                try_end,
                handler_start,
                handler_end,
            });
        }

        Ok(MethodBody {
            locals,
            instructions,
            handlers,
            next_id: len as u32,
        })
    }

    fn method_target(&mut self) -> Result<MethodTarget, DecodeError> {
        match self.u8()? {
            0 => Ok(MethodTarget::Def(MethodHandle {
                type_index: self.u32()?,
                method_index: self.u32()?,
            })),
            1 => Ok(MethodTarget::Ref(self.u32()?)),
            tag => Err(self.bad_tag("method target", tag)),
        }
    }

    fn field_target(&mut self) -> Result<FieldTarget, DecodeError> {
        match self.u8()? {
            0 => Ok(FieldTarget::Def {
                type_index: self.u32()?,
                field_index: self.u32()?,
            }),
            1 => Ok(FieldTarget::Ref(self.u32()?)),
            tag => Err(self.bad_tag("field target", tag)),
        }
    }

    fn ind_kind(&mut self) -> Result<IndKind, DecodeError> {
        Ok(match self.u8()? {
            0 => IndKind::Bool,
            1 => IndKind::Char,
            2 => IndKind::I4,
            3 => IndKind::I8,
            4 => IndKind::R8,
            5 => IndKind::I,
            6 => IndKind::Ref,
            tag => return Err(self.bad_tag("indirect kind", tag)),
        })
    }

    fn op(&mut self) -> Result<RawOp, DecodeError> {
        let code = self.u8()?;
        let op = match code {
            0x00 => Op::Nop,
            0x01 => Op::LdNull,
            0x02 => Op::LdcI4(self.i32()?),
            0x03 => Op::LdcI8(self.i64()?),
            0x04 => Op::LdcR8(self.f64()?),
            0x05 => Op::LdStr(self.str()?),
            0x10 => Op::Ldarg(self.u16()?),
            0x11 => Op::Ldarga(self.u16()?),
            0x12 => Op::Starg(self.u16()?),
            0x13 => Op::Ldloc(self.u16()?),
            0x14 => Op::Ldloca(self.u16()?),
            0x15 => Op::Stloc(self.u16()?),
            0x16 => Op::Dup,
            0x17 => Op::Pop,
            0x20 => Op::Add,
            0x21 => Op::Sub,
            0x22 => Op::Mul,
            0x23 => Op::Div,
            0x24 => Op::Rem,
            0x25 => Op::Neg,
            0x26 => Op::And,
            0x27 => Op::Or,
            0x28 => Op::Xor,
            0x29 => Op::Not,
            0x2a => Op::Shl,
            0x2b => Op::Shr,
            0x2c => Op::Ceq,
            0x2d => Op::Cgt,
            0x2e => Op::Clt,
            0x30 => Op::ConvI4,
            0x31 => Op::ConvI8,
            0x32 => Op::ConvR8,
            0x33 => Op::ConvU,
            0x40 => return Ok(RawOp::Branch(Op::Br, self.u32()?)),
            0x41 => return Ok(RawOp::Branch(Op::Brtrue, self.u32()?)),
            0x42 => return Ok(RawOp::Branch(Op::Brfalse, self.u32()?)),
            0x43 => return Ok(RawOp::Branch(Op::Beq, self.u32()?)),
            0x44 => return Ok(RawOp::Branch(Op::Bne, self.u32()?)),
            0x45 => return Ok(RawOp::Branch(Op::Blt, self.u32()?)),
            0x46 => return Ok(RawOp::Branch(Op::Bge, self.u32()?)),
            0x47 => return Ok(RawOp::Branch(Op::Bgt, self.u32()?)),
            0x48 => return Ok(RawOp::Branch(Op::Ble, self.u32()?)),
            0x49 => {
                let n = self.count()?;
                let mut targets = Vec::with_capacity(n);
                for _ in 0..n {
                    targets.push(self.u32()?);
                }
                return Ok(RawOp::Switch(targets));
            }
            0x4a => return Ok(RawOp::Branch(Op::Leave, self.u32()?)),
            0x4b => Op::Endfinally,
            0x4c => Op::Ret,
            0x4d => Op::Throw,
            0x4e => Op::Rethrow,
            0x50 => Op::Call(self.method_target()?),
            0x51 => Op::Callvirt(self.method_target()?),
            0x52 => Op::Newobj(self.method_target()?),
            0x53 => Op::Ldftn(self.method_target()?),
            0x60 => Op::Newarr(self.sig()?),
            0x61 => Op::Ldlen,
            0x62 => Op::Ldelem(self.sig()?),
            0x63 => Op::Ldelema(self.sig()?),
            0x64 => Op::Stelem(self.sig()?),
            0x70 => Op::Ldfld(self.field_target()?),
            0x71 => Op::Ldflda(self.field_target()?),
            0x72 => Op::Stfld(self.field_target()?),
            0x73 => Op::Ldsfld(self.field_target()?),
            0x74 => Op::Ldsflda(self.field_target()?),
            0x75 => Op::Stsfld(self.field_target()?),
            0x80 => Op::Ldind(self.ind_kind()?),
            0x81 => Op::Stind(self.ind_kind()?),
            0x82 => Op::Ldobj(self.sig()?),
            0x83 => Op::Stobj(self.sig()?),
            0x84 => Op::Initobj(self.sig()?),
            0x90 => Op::Box(self.sig()?),
            0x91 => Op::UnboxAny(self.sig()?),
            0x92 => Op::Castclass(self.sig()?),
            0x93 => Op::Isinst(self.sig()?),
            0xa0 => Op::Localloc,
            _ => return Err(self.bad_tag("opcode", code)),
        };
        Ok(RawOp::Ready(op))
    }

    fn member_ref(&mut self) -> Result<MemberRef, DecodeError> {
        let owner = self.sig()?;
        let name = self.str()?;
        let kind = match self.u8()? {
            0 => MemberKind::Method {
                is_static: self.bool()?,
            },
            1 => MemberKind::Field {
                is_static: self.bool()?,
            },
            tag => return Err(self.bad_tag("member kind", tag)),
        };
        Ok(MemberRef {
            owner,
            name,
            kind,
            params: self.sigs()?,
            ret: self.sig()?,
        })
    }
}
