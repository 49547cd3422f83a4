//! Shared, version-pinned identifiers.
//!
//! These constants are the single source of truth for the program container format, the
//! schema strings that appear in machine-readable I/O, and the names of the runtime guard
//! entry points that the rewriter injects and the host runtime binds.

pub const PROGRAM_MAGIC: &[u8; 4] = b"BSTN";
pub const PROGRAM_FORMAT_VERSION: u8 = 1;

pub const POLICY_SCHEMA_VERSION: &str = "bastion.policy@0.1.0";
pub const SETTINGS_SCHEMA_VERSION: &str = "bastion.settings@0.1.0";
pub const POLICY_REPORT_SCHEMA_VERSION: &str = "bastion.policy.report@0.1.0";
pub const RUN_REPORT_SCHEMA_VERSION: &str = "bastion.run.report@0.1.0";

/// Namespace reserved for the runtime guard. Input programs may never reference it.
pub const GUARD_NAMESPACE: &str = "Bastion.Runtime";
pub const GUARD_TYPE: &str = "RuntimeGuard";

pub const GUARD_GET: &str = "Get";
pub const GUARD_ENTER: &str = "GuardEnter";
pub const GUARD_JUMP: &str = "GuardJump";
pub const GUARD_COUNT: &str = "GuardCount";
pub const GUARD_COUNT_INT32: &str = "FlowThroughGuardCountInt32";
pub const GUARD_COUNT_INT64: &str = "FlowThroughGuardCountInt64";
pub const GUARD_ARRAY_LENGTH: &str = "FlowThroughGuardArrayLength";
pub const GUARD_STRING_LENGTH: &str = "FlowThroughGuardStringLength";
pub const GUARD_ENUMERABLE: &str = "FlowThroughGuardEnumerable";
pub const GUARD_TRACK_DISPOSABLE: &str = "FlowThroughTrackDisposable";
pub const GUARD_TIME_UNTIL_LIMIT: &str = "GetTimeUntilLimit";

/// Length in bytes of a guard token.
pub const GUARD_TOKEN_LEN: usize = 16;
