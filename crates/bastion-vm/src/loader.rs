//! Binds a decoded program for execution: member refs to host functions, branch ids to
//! positions and handler regions to index ranges.

use std::collections::HashMap;
use std::ops::Range;

use bastion_il::{
    FieldTarget, HandlerKind, InstrId, MemberKind, MethodHandle, MethodImpl, MethodTarget, Op,
    Program, RefKind, TypeSig,
};

use crate::error::{fault, Flow, LoadError};
use crate::host::{self, HostFn};

pub(crate) enum Binding {
    Host {
        func: HostFn,
        owner: String,
        ctor: bool,
    },
    DelegateCtor,
    DelegateInvoke,
}

pub(crate) struct Handler {
    pub kind: HandlerKind,
    pub try_range: Range<usize>,
    pub handler_start: usize,
}

pub(crate) struct Body {
    pub name: String,
    pub ops: Vec<Op>,
    pub locals: Vec<TypeSig>,
    /// Innermost protected region first.
    pub handlers: Vec<Handler>,
    pub returns: bool,
    positions: HashMap<InstrId, usize>,
}

impl Body {
    pub fn target(&self, id: InstrId) -> Result<usize, Flow> {
        self.positions
            .get(&id)
            .copied()
            .ok_or_else(|| fault(format!("branch to unknown instruction {} in {}", id.0, self.name)))
    }

    pub fn handlers_at(&self, pc: usize) -> impl Iterator<Item = &Handler> {
        self.handlers.iter().filter(move |h| h.try_range.contains(&pc))
    }
}

pub(crate) struct Loaded {
    pub bodies: HashMap<MethodHandle, Body>,
    pub bindings: Vec<Binding>,
    pub entry: MethodHandle,
}

fn bind_member(program: &Program, index: usize) -> Result<Binding, LoadError> {
    let member = &program.member_refs[index];
    let unknown = || LoadError::UnknownHostMember(member.signature());
    if !matches!(member.kind, MemberKind::Method { .. }) {
        return Err(unknown());
    }
    let delegate = member
        .owner
        .as_type_ref()
        .is_some_and(|r| r.kind == RefKind::Delegate);
    if delegate {
        return match member.name.as_str() {
            ".ctor" => Ok(Binding::DelegateCtor),
            "Invoke" => Ok(Binding::DelegateInvoke),
            _ => Err(unknown()),
        };
    }
    let func = host::bind(member).ok_or_else(unknown)?;
    Ok(Binding::Host {
        func,
        owner: host::owner_name(&member.owner).unwrap_or_default(),
        ctor: member.is_ctor(),
    })
}

fn check_ops(program: &Program, name: &str, ops: &[Op], positions: &HashMap<InstrId, usize>) -> Result<(), LoadError> {
    let invalid = |reason: String| LoadError::InvalidBody {
        method: name.to_string(),
        reason,
    };
    for (index, op) in ops.iter().enumerate() {
        for target in op.branch_targets() {
            if !positions.contains_key(&target) {
                return Err(invalid(format!("instruction {index} branches to unknown id {}", target.0)));
            }
        }
        if let Some(target) = op.method_target() {
            let known = match target {
                MethodTarget::Def(handle) => program.method(handle).is_some(),
                MethodTarget::Ref(i) => program.member_ref(i).is_some(),
            };
            if !known {
                return Err(invalid(format!("instruction {index} calls an unknown method")));
            }
            if matches!(op, Op::Ldftn(MethodTarget::Ref(_))) {
                return Err(LoadError::Unsupported {
                    what: "function pointer to a host method".to_string(),
                    method: name.to_string(),
                });
            }
        }
        match op.field_target() {
            Some(FieldTarget::Def { type_index, field_index }) => {
                if program.field(type_index, field_index).is_none() {
                    return Err(invalid(format!("instruction {index} names an unknown field")));
                }
            }
            Some(FieldTarget::Ref(i)) => {
                let sig = program
                    .member_ref(i)
                    .map(|m| m.signature())
                    .unwrap_or_else(|| format!("<member {i}>"));
                return Err(LoadError::UnknownHostMember(sig));
            }
            None => {}
        }
    }
    Ok(())
}

fn load_body(program: &Program, handle: MethodHandle) -> Result<Option<Body>, LoadError> {
    let name = program.method_name(handle);
    let Some(method) = program.method(handle) else {
        return Ok(None);
    };
    match &method.implementation {
        MethodImpl::Managed => {}
        MethodImpl::ForeignCall { library, symbol } => {
            return Err(LoadError::Unsupported {
                what: format!("foreign call {library}!{symbol}"),
                method: name,
            })
        }
        MethodImpl::Runtime => {
            return Err(LoadError::Unsupported {
                what: "runtime-implemented method".to_string(),
                method: name,
            })
        }
    }
    let Some(body) = &method.body else {
        return Ok(None);
    };

    let positions: HashMap<InstrId, usize> = body
        .instructions
        .iter()
        .enumerate()
        .map(|(i, instr)| (instr.id, i))
        .collect();
    let ops: Vec<Op> = body.instructions.iter().map(|i| i.op.clone()).collect();
    check_ops(program, &name, &ops, &positions)?;

    let position = |id: Option<InstrId>| -> Result<usize, LoadError> {
        match id {
            None => Ok(ops.len()),
            Some(id) => positions.get(&id).copied().ok_or_else(|| LoadError::InvalidBody {
                method: name.clone(),
                reason: format!("handler boundary names unknown id {}", id.0),
            }),
        }
    };
    let mut handlers = Vec::with_capacity(body.handlers.len());
    for h in &body.handlers {
        handlers.push(Handler {
            kind: h.kind.clone(),
            try_range: position(Some(h.try_start))?..position(h.try_end)?,
            handler_start: position(Some(h.handler_start))?,
        });
    }
    // Stable: clauses of one region keep their declared order.
    handlers.sort_by_key(|h| h.try_range.len());

    Ok(Some(Body {
        name,
        ops,
        locals: body.locals.clone(),
        handlers,
        returns: !method.ret.is_void(),
        positions,
    }))
}

pub(crate) fn load(program: &Program) -> Result<Loaded, LoadError> {
    let entry = program.entry.ok_or(LoadError::NoEntryPoint)?;
    if program.method(entry).is_none() {
        return Err(LoadError::NoEntryPoint);
    }
    let bindings = (0..program.member_refs.len())
        .map(|i| bind_member(program, i))
        .collect::<Result<Vec<_>, _>>()?;

    let mut bodies = HashMap::new();
    for (type_index, ty) in program.types.iter().enumerate() {
        for method_index in 0..ty.methods.len() {
            let handle = MethodHandle {
                type_index: type_index as u32,
                method_index: method_index as u32,
            };
            if let Some(body) = load_body(program, handle)? {
                bodies.insert(handle, body);
            }
        }
    }
    Ok(Loaded {
        bodies,
        bindings,
        entry,
    })
}
