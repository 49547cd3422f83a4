use std::fmt;

use bastion_il::DecodeError;

use crate::policy::PolicyError;

/// Why a program could not be rewritten. Every variant names the offending symbol or method.
#[derive(Debug, Clone, PartialEq)]
pub enum RewriteError {
    Decode(DecodeError),
    Config(PolicyError),
    DeniedType {
        type_name: String,
        context: String,
    },
    DeniedMember {
        member: String,
        context: String,
    },
    /// Program refers to, or defines types inside, the guard runtime namespace.
    ReservedNamespace {
        symbol: String,
        context: String,
    },
    UnsupportedReference {
        symbol: String,
        context: String,
    },
    ForeignCall {
        method: String,
    },
    RuntimeImplementation {
        method: String,
    },
    Finalizer {
        method: String,
    },
    ExplicitLayout {
        type_name: String,
    },
    LocalsTooLarge {
        method: String,
        size: u64,
        limit: u64,
    },
    PushTooLarge {
        method: String,
        offset: usize,
        type_name: String,
        size: u64,
        limit: u64,
    },
    /// A size depends on generic arguments that are not known statically.
    GenericSize {
        method: String,
        type_name: String,
    },
    RecursiveLayout {
        type_name: String,
    },
    PointerMismatch {
        method: String,
        offset: usize,
        expected: String,
        actual: String,
    },
    PointerUntraceable {
        method: String,
        offset: usize,
        declared: String,
    },
    StackAllocation {
        method: String,
        offset: usize,
    },
    TimeoutAlreadySupplied {
        member: String,
        method: String,
    },
    UnsupportedOverload {
        member: String,
        method: String,
        reason: String,
    },
    InvalidBody {
        method: String,
        reason: String,
    },
}

impl fmt::Display for RewriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteError::Decode(err) => write!(f, "{err}"),
            RewriteError::Config(err) => write!(f, "{err}"),
            RewriteError::DeniedType { type_name, context } => {
                write!(f, "type {type_name} is not allowed (used in {context})")
            }
            RewriteError::DeniedMember { member, context } => {
                write!(f, "member {member} is not allowed (used in {context})")
            }
            RewriteError::ReservedNamespace { symbol, context } => write!(
                f,
                "{symbol} is reserved for the sandbox runtime (used in {context})"
            ),
            RewriteError::UnsupportedReference { symbol, context } => {
                write!(f, "cannot resolve reference {symbol} (used in {context})")
            }
            RewriteError::ForeignCall { method } => {
                write!(f, "method {method} calls into a native library")
            }
            RewriteError::RuntimeImplementation { method } => {
                write!(f, "method {method} has a runtime-supplied implementation")
            }
            RewriteError::Finalizer { method } => write!(
                f,
                "finalizer {method} would run outside any guard scope"
            ),
            RewriteError::ExplicitLayout { type_name } => {
                write!(f, "type {type_name} has explicit layout")
            }
            RewriteError::LocalsTooLarge {
                method,
                size,
                limit,
            } => write!(
                f,
                "locals of {method} take {size} bytes, above the limit of {limit}"
            ),
            RewriteError::PushTooLarge {
                method,
                offset,
                type_name,
                size,
                limit,
            } => write!(
                f,
                "instruction {offset} in {method} pushes {type_name} ({size} bytes), above the limit of {limit}"
            ),
            RewriteError::GenericSize { method, type_name } => write!(
                f,
                "size of {type_name} in {method} depends on generic arguments"
            ),
            RewriteError::RecursiveLayout { type_name } => {
                write!(f, "type {type_name} contains itself by value")
            }
            RewriteError::PointerMismatch {
                method,
                offset,
                expected,
                actual,
            } => write!(
                f,
                "instruction {offset} in {method} accesses {expected} through a pointer to {actual}"
            ),
            RewriteError::PointerUntraceable {
                method,
                offset,
                declared,
            } => write!(
                f,
                "instruction {offset} in {method} accesses {declared} through a pointer of unknown origin"
            ),
            RewriteError::StackAllocation { method, offset } => write!(
                f,
                "instruction {offset} in {method} allocates on the stack"
            ),
            RewriteError::TimeoutAlreadySupplied { member, method } => write!(
                f,
                "call to {member} in {method} already supplies a timeout"
            ),
            RewriteError::UnsupportedOverload {
                member,
                method,
                reason,
            } => write!(
                f,
                "cannot instrument call to {member} in {method}: {reason}"
            ),
            RewriteError::InvalidBody { method, reason } => {
                write!(f, "invalid body in {method}: {reason}")
            }
        }
    }
}

impl std::error::Error for RewriteError {}

impl From<DecodeError> for RewriteError {
    fn from(err: DecodeError) -> Self {
        RewriteError::Decode(err)
    }
}

impl From<PolicyError> for RewriteError {
    fn from(err: PolicyError) -> Self {
        RewriteError::Config(err)
    }
}
