//! Typed stack-machine bytecode: program model, binary container and builders.

pub mod builder;
pub mod codec;
pub mod program;
pub mod types;

pub use builder::{BodyBuilder, Label, ProgramBuilder};
pub use codec::{decode, encode, DecodeError};
pub use program::{
    ExceptionHandler, FieldDef, FieldTarget, HandlerKind, IndKind, InstrId, Instruction, Layout,
    MemberKind, MemberRef, MethodBody, MethodDef, MethodHandle, MethodImpl, MethodTarget, Op,
    Program, TypeDef, TypeKind,
};
pub use types::{RefKind, TypeRef, TypeSig};
