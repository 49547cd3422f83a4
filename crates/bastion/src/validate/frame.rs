use crate::error::RewriteError;
use crate::validate::layout::{size_of, SizeError};
use crate::validate::MethodScope;

pub(crate) fn size_error(method: &str, err: SizeError) -> RewriteError {
    match err {
        SizeError::Generic(type_name) => RewriteError::GenericSize {
            method: method.to_string(),
            type_name,
        },
        SizeError::Recursive(type_name) => RewriteError::RecursiveLayout { type_name },
    }
}

/// Sum of local slot sizes must stay within `limit`.
pub(crate) fn check_locals(scope: &MethodScope<'_>, limit: u64) -> Result<u64, RewriteError> {
    let mut total = 0u64;
    for local in &scope.body.locals {
        let size = size_of(local, scope.program).map_err(|e| size_error(&scope.info.qualified, e))?;
        total = total.saturating_add(size);
    }
    if total > limit {
        return Err(RewriteError::LocalsTooLarge {
            method: scope.info.qualified.clone(),
            size: total,
            limit,
        });
    }
    Ok(total)
}
