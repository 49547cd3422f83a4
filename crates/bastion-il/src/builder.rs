//! In-memory construction of programs, used by hosts and tests to author bytecode without
//! hand-assembling containers.

use crate::program::{
    ExceptionHandler, FieldDef, FieldTarget, HandlerKind, InstrId, Instruction, Layout, MemberRef,
    MethodBody, MethodDef, MethodHandle, MethodImpl, MethodTarget, Op, Program, TypeDef, TypeKind,
};
use crate::types::TypeSig;

/// Forward-referencable position in a body under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

enum Pending {
    Ready(Op),
    Branch(fn(InstrId) -> Op, Label),
    Switch(Vec<Label>),
}

struct PendingHandler {
    kind: HandlerKind,
    try_start: Label,
    try_end: Label,
    handler_start: Label,
    handler_end: Label,
}

pub struct BodyBuilder {
    locals: Vec<TypeSig>,
    ops: Vec<Pending>,
    labels: Vec<Option<usize>>,
    handlers: Vec<PendingHandler>,
}

impl BodyBuilder {
    pub fn new(locals: Vec<TypeSig>) -> Self {
        Self {
            locals,
            ops: Vec::new(),
            labels: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next emitted instruction.
    pub fn mark(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.ops.len());
        self
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        self.ops.push(Pending::Ready(op));
        self
    }

    pub fn ops(&mut self, ops: impl IntoIterator<Item = Op>) -> &mut Self {
        for op in ops {
            self.op(op);
        }
        self
    }

    /// Emits a branch such as `Op::Br` to `label`.
    pub fn branch(&mut self, make: fn(InstrId) -> Op, label: Label) -> &mut Self {
        self.ops.push(Pending::Branch(make, label));
        self
    }

    pub fn switch(&mut self, labels: Vec<Label>) -> &mut Self {
        self.ops.push(Pending::Switch(labels));
        self
    }

    /// Registers a protected region. End labels bound past the last instruction mean end of body.
    pub fn handler(
        &mut self,
        kind: HandlerKind,
        try_start: Label,
        try_end: Label,
        handler_start: Label,
        handler_end: Label,
    ) -> &mut Self {
        self.handlers.push(PendingHandler {
            kind,
            try_start,
            try_end,
            handler_start,
            handler_end,
        });
        self
    }

    pub fn finish(self) -> Result<MethodBody, String> {
        let len = self.ops.len();
        let resolve = |label: Label| -> Result<usize, String> {
            self.labels
                .get(label.0)
                .copied()
                .flatten()
                .ok_or_else(|| format!("label {} was never marked", label.0))
        };
        let target = |label: Label| -> Result<InstrId, String> {
            let idx = resolve(label)?;
            if idx >= len {
                return Err(format!("label {} marks the end of the body", label.0));
            }
            Ok(InstrId(idx as u32))
        };
        let boundary = |label: Label| -> Result<Option<InstrId>, String> {
            let idx = resolve(label)?;
            Ok((idx < len).then_some(InstrId(idx as u32)))
        };

        let mut instructions = Vec::with_capacity(len);
        for (i, pending) in self.ops.iter().enumerate() {
            let op = match pending {
                Pending::Ready(op) => op.clone(),
                Pending::Branch(make, label) => make(target(*label)?),
                Pending::Switch(labels) => Op::Switch(
                    labels
                        .iter()
                        .map(|l| target(*l))
                        .collect::<Result<Vec<_>, _>>()?,
                ),
            };
            instructions.push(Instruction {
                id: InstrId(i as u32),
                op,
            });
        }

        let mut handlers = Vec::with_capacity(self.handlers.len());
        for h in &self.handlers {
            handlers.push(ExceptionHandler {
                kind: h.kind.clone(),
                try_start: target(h.try_start)?,
                try_end: boundary(h.try_end)?,
                handler_start: target(h.handler_start)?,
                handler_end: boundary(h.handler_end)?,
            });
        }

        Ok(MethodBody {
            locals: self.locals,
            instructions,
            handlers,
            next_id: len as u32,
        })
    }
}

pub struct ProgramBuilder {
    program: Program,
}

impl ProgramBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            program: Program {
                name: name.to_string(),
                ..Program::default()
            },
        }
    }

    pub fn add_type(&mut self, namespace: &str, name: &str, kind: TypeKind) -> u32 {
        self.program.types.push(TypeDef {
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind,
            layout: Layout::Auto,
            base: None,
            generic_params: 0,
            fields: Vec::new(),
            methods: Vec::new(),
        });
        (self.program.types.len() - 1) as u32
    }

    pub fn type_mut(&mut self, index: u32) -> &mut TypeDef {
        &mut self.program.types[index as usize]
    }

    pub fn add_field(&mut self, type_index: u32, name: &str, ty: TypeSig, is_static: bool) -> FieldTarget {
        let fields = &mut self.program.types[type_index as usize].fields;
        fields.push(FieldDef {
            name: name.to_string(),
            ty,
            is_static,
            offset: None,
        });
        FieldTarget::Def {
            type_index,
            field_index: (fields.len() - 1) as u32,
        }
    }

    /// Declares a managed method without a body; attach one with [`ProgramBuilder::set_body`].
    pub fn declare_method(
        &mut self,
        type_index: u32,
        name: &str,
        is_static: bool,
        params: Vec<TypeSig>,
        ret: TypeSig,
    ) -> MethodHandle {
        self.add_method(
            type_index,
            MethodDef {
                name: name.to_string(),
                is_static,
                is_virtual: false,
                implementation: MethodImpl::Managed,
                params,
                ret,
                generic_params: 0,
                body: None,
            },
        )
    }

    pub fn add_method(&mut self, type_index: u32, method: MethodDef) -> MethodHandle {
        let methods = &mut self.program.types[type_index as usize].methods;
        methods.push(method);
        MethodHandle {
            type_index,
            method_index: (methods.len() - 1) as u32,
        }
    }

    pub fn method_mut(&mut self, handle: MethodHandle) -> &mut MethodDef {
        &mut self.program.types[handle.type_index as usize].methods[handle.method_index as usize]
    }

    pub fn set_body(&mut self, handle: MethodHandle, body: MethodBody) {
        self.method_mut(handle).body = Some(body);
    }

    pub fn member(&mut self, member: MemberRef) -> MethodTarget {
        MethodTarget::Ref(self.program.intern_member_ref(member))
    }

    pub fn field_ref(&mut self, member: MemberRef) -> FieldTarget {
        FieldTarget::Ref(self.program.intern_member_ref(member))
    }

    pub fn set_entry(&mut self, handle: MethodHandle) {
        self.program.entry = Some(handle);
    }

    pub fn build(self) -> Program {
        self.program
    }

    pub fn encode(self) -> Vec<u8> {
        crate::codec::encode(&self.program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_resolve_forward_and_backward() {
        let mut b = BodyBuilder::new(vec![TypeSig::I32]);
        let head = b.label();
        let exit = b.label();
        b.mark(head)
            .op(Op::Ldloc(0))
            .branch(Op::Brtrue, exit)
            .branch(Op::Br, head);
        b.mark(exit).op(Op::Ret);
        let body = b.finish().expect("finish");
        assert_eq!(body.instructions[1].op, Op::Brtrue(InstrId(3)));
        assert_eq!(body.instructions[2].op, Op::Br(InstrId(0)));
    }

    #[test]
    fn unmarked_label_is_an_error() {
        let mut b = BodyBuilder::new(Vec::new());
        let nowhere = b.label();
        b.branch(Op::Br, nowhere);
        assert!(b.finish().is_err());
    }

    #[test]
    fn handler_end_may_be_end_of_body() {
        let mut b = BodyBuilder::new(Vec::new());
        let (ts, te, hs, he) = (b.label(), b.label(), b.label(), b.label());
        b.mark(ts).op(Op::Nop);
        b.mark(te).mark(hs).op(Op::Endfinally);
        b.mark(he);
        b.handler(HandlerKind::Finally, ts, te, hs, he);
        let body = b.finish().expect("finish");
        assert_eq!(body.handlers[0].try_end, Some(InstrId(1)));
        assert_eq!(body.handlers[0].handler_end, None);
    }
}
