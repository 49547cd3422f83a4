//! Policy-driven sandboxing of bytecode programs.
//!
//! [`rewrite`] checks a program against an [`AccessPolicy`] and static limits and injects
//! calls to the program's [`ResourceGuard`]. At run time the host opens a [`GuardScope`]
//! for the returned [`GuardToken`] around execution.

mod defaults;
mod error;
mod guard;
mod policy;
mod registry;
mod report;
mod resolve;
pub mod rewrite;
mod rewriters;
mod settings;
mod validate;

pub use error::RewriteError;
pub use guard::{Charged, Disposable, GuardError, ResourceGuard, ResourceLimits};
pub use policy::{
    Access, AccessPolicy, MemberAccess, MemberPolicy, NamespacePolicy, PolicyError, TypePolicy,
};
pub use registry::{GuardScope, GuardToken};
pub use report::{report, report_program, PolicyReport, SymbolDecision, SymbolKind};
pub use resolve::Decision;
pub use rewrite::{rewrite, RewriteStats, RewrittenProgram};
pub use rewriters::MemberRewriter;
pub use settings::{RewriteSettings, POINTER_SIZE};
