use std::fmt;

use bastion::GuardError;
use bastion_il::DecodeError;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    Decode(DecodeError),
    /// Member ref with no host implementation.
    UnknownHostMember(String),
    Unsupported { what: String, method: String },
    NoEntryPoint,
    InvalidBody { method: String, reason: String },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Decode(err) => write!(f, "{err}"),
            LoadError::UnknownHostMember(sig) => write!(f, "no host implementation for {sig}"),
            LoadError::Unsupported { what, method } => {
                write!(f, "{what} is not supported (in {method})")
            }
            LoadError::NoEntryPoint => f.write_str("program has no entry point"),
            LoadError::InvalidBody { method, reason } => {
                write!(f, "invalid body in {method}: {reason}")
            }
        }
    }
}

impl std::error::Error for LoadError {}

impl From<DecodeError> for LoadError {
    fn from(err: DecodeError) -> Self {
        LoadError::Decode(err)
    }
}

/// Why execution stopped without returning.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecError {
    /// A guard check failed. Never catchable by the program.
    Guard(GuardError),
    /// An exception escaped the entry method.
    Thrown { type_name: String, message: String },
    /// The program did something the interpreter cannot continue from.
    Fault(String),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Guard(err) => write!(f, "{err}"),
            ExecError::Thrown { type_name, message } => {
                write!(f, "unhandled exception {type_name}: {message}")
            }
            ExecError::Fault(msg) => write!(f, "execution fault: {msg}"),
        }
    }
}

impl std::error::Error for ExecError {}

impl From<GuardError> for ExecError {
    fn from(err: GuardError) -> Self {
        ExecError::Guard(err)
    }
}

/// Non-local exit while interpreting.
#[derive(Debug, Clone)]
pub(crate) enum Flow {
    /// Program exception, subject to handlers.
    Exception(Value),
    /// Aborts the whole execution.
    Fatal(ExecError),
}

impl From<GuardError> for Flow {
    fn from(err: GuardError) -> Self {
        Flow::Fatal(ExecError::Guard(err))
    }
}

impl From<ExecError> for Flow {
    fn from(err: ExecError) -> Self {
        Flow::Fatal(err)
    }
}

pub(crate) fn fault(msg: impl Into<String>) -> Flow {
    Flow::Fatal(ExecError::Fault(msg.into()))
}
