//! In-place instruction insertion that keeps branches and handler regions consistent.

use bastion_il::{InstrId, Instruction, MethodBody, Op, TypeSig};

/// Mutable view over one method body.
pub(crate) struct BodyEditor<'a> {
    body: &'a mut MethodBody,
}

impl<'a> BodyEditor<'a> {
    pub(crate) fn new(body: &'a mut MethodBody) -> Self {
        Self { body }
    }

    pub(crate) fn op(&self, id: InstrId) -> Option<&Op> {
        self.body.get(id).map(|i| &i.op)
    }

    /// Appends a local and returns its slot, or `None` once the slot space is exhausted.
    pub(crate) fn add_local(&mut self, ty: TypeSig) -> Option<u16> {
        let slot = u16::try_from(self.body.locals.len()).ok()?;
        self.body.locals.push(ty);
        Some(slot)
    }

    fn materialize(&mut self, ops: Vec<Op>) -> Vec<Instruction> {
        ops.into_iter()
            .map(|op| Instruction {
                id: self.body.fresh_id(),
                op,
            })
            .collect()
    }

    /// Inserts `ops` at `index` without touching any branch or handler boundary.
    pub(crate) fn insert_at(&mut self, index: usize, ops: Vec<Op>) -> Option<InstrId> {
        let new = self.materialize(ops);
        let first = new.first().map(|i| i.id);
        self.body.instructions.splice(index..index, new);
        first
    }

    /// Inserts `ops` immediately before `anchor`. Every branch or handler boundary that
    /// referred to `anchor` is moved to the first inserted instruction, so control that
    /// used to arrive at `anchor` runs the inserted code first.
    pub(crate) fn insert_before(&mut self, anchor: InstrId, ops: Vec<Op>) -> Option<InstrId> {
        let index = self.body.index_of(anchor)?;
        let first = self.insert_at(index, ops)?;
        self.retarget(anchor, first);
        Some(first)
    }

    /// Inserts `ops` right after `anchor`. Nothing is retargeted: a branch to the next
    /// instruction still skips the inserted code, as it skipped `anchor`.
    pub(crate) fn insert_after(&mut self, anchor: InstrId, ops: Vec<Op>) -> Option<InstrId> {
        let index = self.body.index_of(anchor)?;
        let new = self.materialize(ops);
        let last = new.last().map(|i| i.id);
        self.body.instructions.splice(index + 1..index + 1, new);
        last
    }

    /// Points every reference to `from` at `to`.
    pub(crate) fn retarget(&mut self, from: InstrId, to: InstrId) {
        for instr in &mut self.body.instructions {
            for target in instr.op.branch_targets_mut() {
                if *target == from {
                    *target = to;
                }
            }
        }
        for handler in &mut self.body.handlers {
            for boundary in handler.boundaries_mut().into_iter().flatten() {
                if *boundary == from {
                    *boundary = to;
                }
            }
        }
    }

    pub(crate) fn replace_op(&mut self, id: InstrId, op: Op) -> bool {
        match self.body.instructions.iter_mut().find(|i| i.id == id) {
            Some(instr) => {
                instr.op = op;
                true
            }
            None => false,
        }
    }

    /// True when some branch target of `id` sits at or before it.
    pub(crate) fn is_backward_branch(&self, id: InstrId) -> bool {
        let Some(at) = self.body.index_of(id) else {
            return false;
        };
        self.body.instructions[at]
            .op
            .branch_targets()
            .into_iter()
            .filter_map(|target| self.body.index_of(target))
            .any(|target| target <= at)
    }
}

#[cfg(test)]
mod tests {
    use bastion_il::{BodyBuilder, ExceptionHandler, HandlerKind};

    use super::*;

    fn looping_body() -> MethodBody {
        let mut b = BodyBuilder::new(vec![TypeSig::I32]);
        let head = b.label();
        b.mark(head)
            .op(Op::Ldloc(0))
            .op(Op::LdcI4(1))
            .op(Op::Add)
            .op(Op::Stloc(0))
            .branch(Op::Br, head);
        b.finish().expect("body")
    }

    #[test]
    fn insert_before_moves_branches_to_new_code() {
        let mut body = looping_body();
        let head = body.instructions[0].id;
        let back = body.instructions[4].id;
        let mut editor = BodyEditor::new(&mut body);
        assert!(editor.is_backward_branch(back));
        let first = editor.insert_before(head, vec![Op::Nop]).expect("anchor");
        assert_eq!(body.instructions[0].id, first);
        assert_eq!(body.instructions[5].op, Op::Br(first));
    }

    #[test]
    fn insert_at_keeps_targets() {
        let mut body = looping_body();
        let head = body.instructions[0].id;
        BodyEditor::new(&mut body).insert_at(0, vec![Op::Nop, Op::Nop]);
        assert_eq!(body.instructions.len(), 7);
        assert_eq!(body.instructions[6].op, Op::Br(head));
    }

    #[test]
    fn handler_boundaries_follow_insertions() {
        let mut body = MethodBody::new(Vec::new(), vec![Op::Nop, Op::Leave(InstrId(3)), Op::Endfinally, Op::Ret]);
        body.handlers.push(ExceptionHandler {
            kind: HandlerKind::Finally,
            try_start: InstrId(0),
            try_end: Some(InstrId(2)),
            handler_start: InstrId(2),
            handler_end: Some(InstrId(3)),
        });
        let mut editor = BodyEditor::new(&mut body);
        let first = editor.insert_before(InstrId(0), vec![Op::Nop]).expect("anchor");
        let tail = editor.insert_before(InstrId(3), vec![Op::Nop]).expect("anchor");
        assert_eq!(body.handlers[0].try_start, first);
        assert_eq!(body.handlers[0].handler_end, Some(tail));
        assert_eq!(body.instructions[2].op, Op::Leave(tail));
    }

    #[test]
    fn insert_after_leaves_fallthrough_targets() {
        let mut body = looping_body();
        let add = body.instructions[2].id;
        let mut editor = BodyEditor::new(&mut body);
        let last = editor
            .insert_after(add, vec![Op::Dup, Op::Pop])
            .expect("anchor");
        assert_eq!(body.instructions[4].id, last);
        assert_eq!(body.instructions.len(), 7);
    }

    #[test]
    fn local_slots_never_wrap() {
        let mut body = MethodBody::new(vec![TypeSig::I32; usize::from(u16::MAX)], vec![Op::Ret]);
        let mut editor = BodyEditor::new(&mut body);
        assert_eq!(editor.add_local(TypeSig::Object), Some(u16::MAX));
        assert_eq!(editor.add_local(TypeSig::Object), None);
        assert_eq!(body.locals.len(), usize::from(u16::MAX) + 1);
    }
}
