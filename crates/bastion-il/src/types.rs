use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of an external (host) type. External types are always reference types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    #[default]
    Class,
    Delegate,
}

/// Reference to a type provided by the host, named by namespace and type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeRef {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub kind: RefKind,
}

impl TypeRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind: RefKind::Class,
        }
    }

    pub fn delegate(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind: RefKind::Delegate,
        }
    }

    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

/// Type signature as it appears in fields, locals, parameters and type operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "of", rename_all = "snake_case")]
pub enum TypeSig {
    Void,
    Bool,
    Char,
    I32,
    I64,
    F64,
    IntPtr,
    String,
    Object,
    /// External host type.
    Named(TypeRef),
    /// Type defined by the program, by index into `Program::types`.
    Def(u32),
    /// Generic instantiation of `Named` or `Def`.
    Inst(Box<TypeSig>, Vec<TypeSig>),
    Array(Box<TypeSig>),
    Ptr(Box<TypeSig>),
    ByRef(Box<TypeSig>),
    /// Generic parameter of the enclosing type.
    GenericParam(u16),
    /// Generic parameter of the enclosing method.
    MethodGenericParam(u16),
}

impl TypeSig {
    pub fn named(namespace: &str, name: &str) -> Self {
        TypeSig::Named(TypeRef::new(namespace, name))
    }

    pub fn array(elem: TypeSig) -> Self {
        TypeSig::Array(Box::new(elem))
    }

    pub fn ptr(elem: TypeSig) -> Self {
        TypeSig::Ptr(Box::new(elem))
    }

    pub fn by_ref(elem: TypeSig) -> Self {
        TypeSig::ByRef(Box::new(elem))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeSig::Void)
    }

    /// Element type of a pointer or managed reference.
    pub fn pointee(&self) -> Option<&TypeSig> {
        match self {
            TypeSig::Ptr(e) | TypeSig::ByRef(e) => Some(e),
            _ => None,
        }
    }

    /// Host type this signature ultimately names, looking through instantiations.
    pub fn as_type_ref(&self) -> Option<&TypeRef> {
        match self {
            TypeSig::Named(r) => Some(r),
            TypeSig::Inst(base, _) => base.as_type_ref(),
            _ => None,
        }
    }

    /// Name of the host type a primitive keyword stands for.
    pub fn primitive_name(&self) -> Option<&'static str> {
        Some(match self {
            TypeSig::Void => "System.Void",
            TypeSig::Bool => "System.Boolean",
            TypeSig::Char => "System.Char",
            TypeSig::I32 => "System.Int32",
            TypeSig::I64 => "System.Int64",
            TypeSig::F64 => "System.Double",
            TypeSig::IntPtr => "System.IntPtr",
            TypeSig::String => "System.String",
            TypeSig::Object => "System.Object",
            _ => return None,
        })
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.primitive_name() {
            return f.write_str(name);
        }
        match self {
            TypeSig::Named(r) => f.write_str(&r.full_name()),
            TypeSig::Def(idx) => write!(f, "<def#{idx}>"),
            TypeSig::Inst(base, args) => {
                write!(f, "{base}<")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(">")
            }
            TypeSig::Array(e) => write!(f, "{e}[]"),
            TypeSig::Ptr(e) => write!(f, "{e}*"),
            TypeSig::ByRef(e) => write!(f, "{e}&"),
            TypeSig::GenericParam(n) => write!(f, "!{n}"),
            TypeSig::MethodGenericParam(n) => write!(f, "!!{n}"),
            _ => unreachable!("primitive handled above"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_renders_nested_signatures() {
        let sig = TypeSig::Inst(
            Box::new(TypeSig::named("System.Collections.Generic", "List`1")),
            vec![TypeSig::array(TypeSig::I32)],
        );
        assert_eq!(
            sig.to_string(),
            "System.Collections.Generic.List`1<System.Int32[]>"
        );
        assert_eq!(TypeSig::by_ref(TypeSig::Char).to_string(), "System.Char&");
    }

    #[test]
    fn as_type_ref_looks_through_instantiations() {
        let sig = TypeSig::Inst(Box::new(TypeSig::named("System", "Func`2")), vec![]);
        assert_eq!(sig.as_type_ref().map(|r| r.name.as_str()), Some("Func`2"));
        assert!(TypeSig::I32.as_type_ref().is_none());
    }
}
