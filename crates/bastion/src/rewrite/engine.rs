//! The rewrite pass: decode, validate and instrument every method, encode.

use bastion_il::{FieldTarget, InstrId, MethodHandle, MethodImpl, MethodTarget, Op, Program};
use tracing::{debug, info};

use crate::error::RewriteError;
use crate::registry::GuardToken;
use crate::resolve::SymbolResolver;
use crate::rewrite::context::{guard_type, GuardEntry, InstrumentationContext};
use crate::rewrite::editor::BodyEditor;
use crate::rewriters::MemberRewriter;
use crate::settings::{Patterns, RewriteSettings};
use crate::validate::{frame, pointer, push, MethodInfo, MethodScope};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub methods: usize,
    pub injected: usize,
}

/// Output of a successful rewrite.
#[derive(Debug, Clone)]
pub struct RewrittenProgram {
    pub bytes: Vec<u8>,
    pub token: GuardToken,
    pub stats: RewriteStats,
}

/// Rewrites a program container so every method reports to the guard of the returned
/// token. Either the whole program is rewritten or nothing is returned.
pub fn rewrite(source: &[u8], settings: &RewriteSettings) -> Result<RewrittenProgram, RewriteError> {
    let mut settings = settings.clone();
    settings.validate()?;
    let patterns = settings.patterns()?;
    let token = settings.token_for(source)?;
    let mut program = bastion_il::decode(source)?;

    let engine = Engine {
        settings: &settings,
        patterns: &patterns,
        resolver: SymbolResolver::new(&settings.policy),
        token,
    };
    let stats = engine.run(&mut program)?;
    let bytes = bastion_il::encode(&program);
    info!(
        program = %program.name,
        token = %token,
        methods = stats.methods,
        injected = stats.injected,
        "rewrote program"
    );
    Ok(RewrittenProgram {
        bytes,
        token,
        stats,
    })
}

/// Planned work for one original instruction.
struct Site {
    id: InstrId,
    rewriters: Vec<MemberRewriter>,
    counts_array: bool,
}

struct Engine<'a> {
    settings: &'a RewriteSettings,
    patterns: &'a Patterns,
    resolver: SymbolResolver<'a>,
    token: GuardToken,
}

impl Engine<'_> {
    fn run(&self, program: &mut Program) -> Result<RewriteStats, RewriteError> {
        self.resolver.check_program_types(program)?;
        for ty in &program.types {
            if ty.layout == bastion_il::Layout::Explicit
                && !self.patterns.allows_explicit_layout(&ty.full_name())
            {
                return Err(RewriteError::ExplicitLayout {
                    type_name: ty.full_name(),
                });
            }
        }

        let mut stats = RewriteStats::default();
        for type_index in 0..program.types.len() {
            for method_index in 0..program.types[type_index].methods.len() {
                let handle = MethodHandle {
                    type_index: type_index as u32,
                    method_index: method_index as u32,
                };
                if let Some(injected) = self.instrument(program, handle)? {
                    stats.methods += 1;
                    stats.injected += injected;
                }
            }
        }
        Ok(stats)
    }

    /// Validates and instruments one method. Returns the number of injected instructions,
    /// or `None` for methods without a body.
    fn instrument(&self, program: &mut Program, handle: MethodHandle) -> Result<Option<usize>, RewriteError> {
        let qualified = program.method_name(handle);
        let Some(def) = program.method(handle) else {
            return Ok(None);
        };
        match def.implementation {
            MethodImpl::Managed => {}
            MethodImpl::ForeignCall { .. } => {
                return Err(RewriteError::ForeignCall { method: qualified })
            }
            MethodImpl::Runtime => {
                return Err(RewriteError::RuntimeImplementation { method: qualified })
            }
        }
        if def.is_finalizer() {
            return Err(RewriteError::Finalizer { method: qualified });
        }
        let info = MethodInfo::new(qualified, handle.type_index, def);
        let context = format!("method {}", info.qualified);
        for sig in info.params.iter().chain(std::iter::once(&info.ret)) {
            self.resolver.check_sig(sig, &context)?;
        }

        let Some(mut body) = body_mut(program, handle).and_then(|b| b.take()) else {
            return Ok(None);
        };
        let plan = {
            let scope = MethodScope {
                program: &*program,
                info: &info,
                body: &body,
            };
            self.plan(&scope, &context)
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(err) => {
                restore(program, handle, body);
                return Err(err);
            }
        };

        let original_len = body.instructions.len();
        let result = self.inject(program, &info, &mut body, plan);
        let injected = body.instructions.len() - original_len;
        restore(program, handle, body);
        result?;
        debug!(method = %info.qualified, injected, "instrumented method");
        Ok(Some(injected))
    }

    /// Validates every original instruction and resolves the symbols it uses, before the
    /// body is touched.
    fn plan(&self, scope: &MethodScope<'_>, context: &str) -> Result<Vec<Site>, RewriteError> {
        scope.check_operands()?;
        for local in &scope.body.locals {
            self.resolver.check_sig(local, context)?;
        }
        frame::check_locals(scope, self.settings.max_locals_size)?;
        for handler in &scope.body.handlers {
            if let bastion_il::HandlerKind::Catch(Some(ty)) = &handler.kind {
                self.resolver.check_sig(ty, context)?;
            }
        }

        let mut plan = Vec::with_capacity(scope.body.instructions.len());
        for (offset, instr) in scope.body.instructions.iter().enumerate() {
            pointer::check_access(scope, offset, self.patterns)?;
            push::check_push(scope, offset, &instr.op, self.settings.max_push_size)?;
            if let Some(ty) = instr.op.type_operand() {
                self.resolver.check_sig(ty, context)?;
            }
            if let Some(FieldTarget::Ref(index)) = instr.op.field_target() {
                if let Some(member) = scope.program.member_ref(index) {
                    self.resolver.check_member(member, context)?;
                }
            }
            let mut rewriters = Vec::new();
            if let Some(MethodTarget::Ref(index)) = instr.op.method_target() {
                if let Some(member) = scope.program.member_ref(index) {
                    let found = self.resolver.check_member(member, context)?;
                    if !matches!(instr.op, Op::Ldftn(_)) {
                        rewriters.extend_from_slice(found);
                    }
                }
            }
            plan.push(Site {
                id: instr.id,
                rewriters,
                counts_array: matches!(instr.op, Op::Newarr(_)),
            });
        }
        Ok(plan)
    }

    fn inject(
        &self,
        program: &mut Program,
        info: &MethodInfo,
        body: &mut bastion_il::MethodBody,
        plan: Vec<Site>,
    ) -> Result<(), RewriteError> {
        let mut ctx = InstrumentationContext {
            editor: BodyEditor::new(body),
            program,
            guard_local: 0,
            method: &info.qualified,
        };
        ctx.guard_local = ctx.add_local(guard_type())?;

        // Prologue. Inserted without retargeting so branches to the first original
        // instruction do not re-run it.
        let mut prologue = vec![Op::LdStr(self.token.to_hex()), ctx.call(GuardEntry::Get), Op::Dup];
        prologue.push(Op::Stloc(ctx.guard_local));
        prologue.push(ctx.call(GuardEntry::Enter));
        ctx.editor.insert_at(0, prologue);

        for site in plan {
            if site.counts_array {
                let ops = ctx.guarded(GuardEntry::CountInt32);
                ctx.insert_before(site.id, ops)?;
            }
            for rewriter in &site.rewriters {
                let applied = rewriter.try_rewrite(site.id, &mut ctx)?;
                tracing::trace!(
                    method = %info.qualified,
                    rewriter = rewriter.name(),
                    applied,
                    "member rewriter"
                );
            }
            if ctx.editor.is_backward_branch(site.id) {
                let ops = ctx.guarded(GuardEntry::Jump);
                ctx.insert_before(site.id, ops)?;
            }
        }
        Ok(())
    }
}

fn body_mut(program: &mut Program, handle: MethodHandle) -> Option<&mut Option<bastion_il::MethodBody>> {
    program
        .types
        .get_mut(handle.type_index as usize)?
        .methods
        .get_mut(handle.method_index as usize)
        .map(|m| &mut m.body)
}

fn restore(program: &mut Program, handle: MethodHandle, body: bastion_il::MethodBody) {
    if let Some(slot) = body_mut(program, handle) {
        *slot = Some(body);
    }
}
