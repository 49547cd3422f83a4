//! Value sizes as the frame and push checks see them.

use bastion_il::{Layout, Program, TypeSig};

use crate::settings::POINTER_SIZE;

const MAX_NESTING: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SizeError {
    /// Size depends on a generic parameter that is not bound.
    Generic(String),
    Recursive(String),
}

/// Size in bytes of a value of type `sig` on the stack or in a frame slot.
pub(crate) fn size_of(sig: &TypeSig, program: &Program) -> Result<u64, SizeError> {
    size_in(sig, program, &[], 0)
}

fn size_in(sig: &TypeSig, program: &Program, args: &[TypeSig], depth: u32) -> Result<u64, SizeError> {
    if depth > MAX_NESTING {
        return Err(SizeError::Recursive(sig.to_string()));
    }
    Ok(match sig {
        TypeSig::Void => 0,
        TypeSig::Bool => 1,
        TypeSig::Char => 2,
        TypeSig::I32 => 4,
        TypeSig::I64 | TypeSig::F64 => 8,
        TypeSig::IntPtr
        | TypeSig::Ptr(_)
        | TypeSig::ByRef(_)
        | TypeSig::String
        | TypeSig::Object
        | TypeSig::Named(_)
        | TypeSig::Array(_) => POINTER_SIZE,
        TypeSig::GenericParam(n) => match args.get(usize::from(*n)) {
            Some(bound) => size_in(bound, program, &[], depth + 1)?,
            None => return Err(SizeError::Generic(sig.to_string())),
        },
        TypeSig::MethodGenericParam(_) => return Err(SizeError::Generic(sig.to_string())),
        TypeSig::Def(index) => struct_size(*index, program, &[], depth)?,
        TypeSig::Inst(base, inst_args) => match base.as_ref() {
            TypeSig::Def(index) => {
                let bound: Vec<TypeSig> = inst_args.iter().map(|a| substitute(a, args)).collect();
                struct_size(*index, program, &bound, depth)?
            }
            _ => POINTER_SIZE,
        },
    })
}

fn struct_size(index: u32, program: &Program, args: &[TypeSig], depth: u32) -> Result<u64, SizeError> {
    let Some(def) = program.type_def(index) else {
        return Ok(POINTER_SIZE);
    };
    if !def.is_struct() {
        return Ok(POINTER_SIZE);
    }
    let mut size = 0u64;
    for field in def.fields.iter().filter(|f| !f.is_static) {
        let field_size = size_in(&field.ty, program, args, depth + 1).map_err(|err| match err {
            SizeError::Recursive(_) => SizeError::Recursive(def.full_name()),
            other => other,
        })?;
        size = match def.layout {
            Layout::Explicit => size.max(u64::from(field.offset.unwrap_or(0)) + field_size),
            _ => size + field_size,
        };
    }
    Ok(size.max(1))
}

/// Replaces bound generic parameters in `sig` with `args`.
fn substitute(sig: &TypeSig, args: &[TypeSig]) -> TypeSig {
    match sig {
        TypeSig::GenericParam(n) => args.get(usize::from(*n)).cloned().unwrap_or_else(|| sig.clone()),
        TypeSig::Inst(base, inner) => TypeSig::Inst(
            Box::new(substitute(base, args)),
            inner.iter().map(|a| substitute(a, args)).collect(),
        ),
        TypeSig::Array(e) => TypeSig::array(substitute(e, args)),
        TypeSig::Ptr(e) => TypeSig::ptr(substitute(e, args)),
        TypeSig::ByRef(e) => TypeSig::by_ref(substitute(e, args)),
        other => other.clone(),
    }
}

/// True for types whose values are object references.
pub(crate) fn is_reference(sig: &TypeSig, program: &Program) -> bool {
    match sig {
        TypeSig::String | TypeSig::Object | TypeSig::Named(_) | TypeSig::Array(_) => true,
        TypeSig::Def(index) => program.type_def(*index).is_some_and(|t| !t.is_struct()),
        TypeSig::Inst(base, _) => is_reference(base, program),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use bastion_il::{ProgramBuilder, TypeKind};

    use super::*;

    #[test]
    fn struct_sizes_follow_fields_and_generics() {
        let mut b = ProgramBuilder::new("sizes");
        let pair = b.add_type("Demo", "Pair", TypeKind::Struct);
        b.add_field(pair, "a", TypeSig::I64, false);
        b.add_field(pair, "b", TypeSig::I32, false);
        b.add_field(pair, "shared", TypeSig::I64, true);

        let boxed = b.add_type("Demo", "Box`1", TypeKind::Struct);
        b.type_mut(boxed).generic_params = 1;
        b.add_field(boxed, "value", TypeSig::GenericParam(0), false);
        b.add_field(boxed, "tag", TypeSig::Bool, false);

        let node = b.add_type("Demo", "Node", TypeKind::Class);
        b.add_field(node, "next", TypeSig::Def(node), false);
        let program = b.build();

        assert_eq!(size_of(&TypeSig::Def(pair), &program), Ok(12));
        assert_eq!(size_of(&TypeSig::Def(node), &program), Ok(POINTER_SIZE));
        let inst = TypeSig::Inst(Box::new(TypeSig::Def(boxed)), vec![TypeSig::Def(pair)]);
        assert_eq!(size_of(&inst, &program), Ok(13));
        assert!(matches!(
            size_of(&TypeSig::Def(boxed), &program),
            Err(SizeError::Generic(_))
        ));
    }

    #[test]
    fn explicit_layout_uses_furthest_field_end() {
        let mut b = ProgramBuilder::new("explicit");
        let overlay = b.add_type("Demo", "Overlay", TypeKind::Struct);
        b.type_mut(overlay).layout = Layout::Explicit;
        b.add_field(overlay, "whole", TypeSig::I64, false);
        b.add_field(overlay, "high", TypeSig::I32, false);
        b.type_mut(overlay).fields[1].offset = Some(4);
        let program = b.build();
        assert_eq!(size_of(&TypeSig::Def(overlay), &program), Ok(8));
    }

    #[test]
    fn self_containing_struct_is_reported() {
        let mut b = ProgramBuilder::new("recursive");
        let s = b.add_type("Demo", "Loop", TypeKind::Struct);
        b.add_field(s, "inner", TypeSig::Def(s), false);
        let program = b.build();
        assert_eq!(
            size_of(&TypeSig::Def(s), &program),
            Err(SizeError::Recursive("Demo.Loop".to_string()))
        );
    }
}
