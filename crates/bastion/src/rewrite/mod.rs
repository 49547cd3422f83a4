pub(crate) mod context;
pub(crate) mod editor;
mod engine;

pub use context::{CallSite, InstrumentationContext};
pub use engine::{rewrite, RewriteStats, RewrittenProgram};
