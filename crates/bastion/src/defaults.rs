//! Whitelist for the reference host library.

use crate::policy::{Access, AccessPolicy, MemberAccess, PolicyError};
use crate::rewriters::MemberRewriter::{
    self, ArrayReturnLength, CountFromArgument, CountIncrement, DisposableReturn,
    EnumerableArgument, PatternTimeout, StringReturnLength,
};

fn none() -> Vec<MemberRewriter> {
    Vec::new()
}

impl AccessPolicy {
    /// Policy allowing the reference host surface with the rewriters each member needs,
    /// and denying file, console, environment, threading and interop access.
    pub fn safe_default() -> Self {
        match build_safe_default() {
            Ok(policy) => policy,
            Err(err) => unreachable!("safe default policy is inconsistent: {err}"),
        }
    }
}

fn build_safe_default() -> Result<AccessPolicy, PolicyError> {
    let mut policy = AccessPolicy::new();

    let system = policy.namespace("System", Access::Neutral)?;
    system
        .ty("Object", Access::Neutral)?
        .allow(".ctor", none())?
        .allow("ToString", vec![StringReturnLength])?
        .allow("Equals", none())?
        .allow("GetHashCode", none())?;
    system
        .ty("String", Access::Neutral)?
        .allow(".ctor", vec![CountFromArgument { parameter: 1 }])?
        .allow("get_Length", none())?
        .allow("get_Chars", none())?
        .allow("Concat", vec![StringReturnLength])?
        .allow("Substring", vec![StringReturnLength])?
        .allow("ToUpper", vec![StringReturnLength])?
        .allow("PadLeft", vec![StringReturnLength])?
        .allow("Contains", none())?
        .allow("IndexOf", none())?
        .allow("Equals", none())?
        .member("Intern", MemberAccess::Denied, none())?;
    system
        .ty("Int32", Access::Neutral)?
        .allow("Parse", none())?;
    system
        .ty("Convert", Access::Neutral)?
        .allow("ToString", vec![StringReturnLength])?;
    system.ty("Math", Access::Allowed)?;
    system
        .ty("Exception", Access::Neutral)?
        .allow(".ctor", none())?
        .allow("get_Message", none())?;
    system.ty("Func`1", Access::Allowed)?;
    system.ty("Func`2", Access::Allowed)?;
    for denied in ["Console", "Environment", "GC", "AppDomain", "Activator", "TimeSpan"] {
        system.ty(denied, Access::Denied)?;
    }

    policy
        .namespace("System.Text", Access::Neutral)?
        .ty("StringBuilder", Access::Neutral)?
        .allow(".ctor", vec![CountFromArgument { parameter: 0 }])?
        .allow("Append", vec![CountIncrement { units: 1 }])?
        .allow("ToString", vec![StringReturnLength])?
        .allow("get_Length", none())?;

    let regex = policy.namespace("System.Text.RegularExpressions", Access::Neutral)?;
    regex
        .ty("Regex", Access::Neutral)?
        .allow(".ctor", vec![PatternTimeout])?
        .allow("IsMatch", vec![PatternTimeout])?
        .allow("Replace", vec![PatternTimeout, StringReturnLength])?;
    regex.ty("RegexOptions", Access::Allowed)?;

    policy
        .namespace("System.Collections", Access::Neutral)?
        .ty("IEnumerable", Access::Allowed)?;

    let generic = policy.namespace("System.Collections.Generic", Access::Neutral)?;
    generic.ty("IEnumerable`1", Access::Allowed)?;
    generic
        .ty("List`1", Access::Neutral)?
        .allow(
            ".ctor",
            vec![CountFromArgument { parameter: 0 }, EnumerableArgument],
        )?
        .allow("Add", vec![CountIncrement { units: 1 }])?
        .allow("AddRange", vec![EnumerableArgument])?
        .allow("get_Count", none())?
        .allow("get_Item", none())?
        .allow("set_Item", none())?
        .allow("Contains", none())?
        .allow("Clear", none())?
        .allow("ToArray", vec![ArrayReturnLength])?;

    policy
        .namespace("System.Linq", Access::Neutral)?
        .ty("Enumerable", Access::Neutral)?
        .allow("Range", none())?
        .allow("Repeat", none())?
        .allow("ToList", vec![EnumerableArgument])?
        .allow("ToArray", vec![EnumerableArgument])?
        .allow("Count", vec![EnumerableArgument])?
        .allow("Sum", vec![EnumerableArgument])?;

    let io = policy.namespace("System.IO", Access::Neutral)?;
    io.ty("StringWriter", Access::Neutral)?
        .allow(".ctor", vec![DisposableReturn])?
        .allow("Write", none())?
        .allow("ToString", vec![StringReturnLength])?
        .allow("Dispose", none())?;
    for denied in ["File", "Directory", "FileStream", "Path"] {
        io.ty(denied, Access::Denied)?;
    }

    for denied in [
        "System.Threading",
        "System.Threading.Tasks",
        "System.Runtime.InteropServices",
        "System.Reflection",
        "System.Diagnostics",
        "System.Net",
    ] {
        policy.namespace(denied, Access::Denied)?;
    }
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::Decision;

    #[test]
    fn safe_default_is_consistent_and_serializable() {
        let policy = AccessPolicy::safe_default();
        let text = policy.to_json_pretty().expect("serialize");
        assert_eq!(AccessPolicy::from_json(&text).expect("reload"), policy);
    }

    #[test]
    fn safe_default_decisions() {
        let policy = AccessPolicy::safe_default();
        assert_eq!(policy.resolve("System.IO", "File", Some("ReadAllText")), Decision::Denied);
        assert_eq!(policy.resolve("System", "Console", Some("WriteLine")), Decision::Denied);
        assert_eq!(policy.resolve("System.Threading", "Thread", None), Decision::Denied);
        assert_eq!(
            policy.resolve("System.Collections.Generic", "List`1", Some("Add")),
            Decision::Allowed(&[CountIncrement { units: 1 }])
        );
        assert!(policy.resolve("System", "Math", Some("Max")).is_allowed());
    }
}
