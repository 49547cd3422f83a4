//! Reference host runtime: loads a rewritten program and interprets it against a small host
//! library, with the guard entry points bound to the program's [`bastion::ResourceGuard`].
//!
//! ```no_run
//! # fn demo(bytes: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
//! use bastion::{rewrite, ResourceLimits, RewriteSettings};
//! use bastion_vm::Vm;
//!
//! let rewritten = rewrite(bytes, &RewriteSettings::default())?;
//! let vm = Vm::load(&rewritten.bytes)?;
//! let _scope = rewritten.token.open_scope(ResourceLimits::default());
//! let result = vm.run(Vec::new())?;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```

mod error;
mod host;
mod interp;
mod loader;
mod value;

pub use error::{ExecError, LoadError};
pub use host::{HostObject, Pattern, PatternError, Sequence, Timeout, WriterState};
pub use interp::Vm;
pub use value::{slot, Address, ArrayData, ObjectData, Slot, Value};
