use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use bastion::ResourceLimits;
use bastion_contracts::RUN_REPORT_SCHEMA_VERSION;
use bastion_il::TypeSig;
use bastion_vm::{ExecError, Value, Vm};
use clap::Args;
use serde::Serialize;

use crate::input::{print_json, read_program_bytes, SettingsArgs};

const DEFAULT_THREAD_STACK_MIB: usize = 64;

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Program container or program JSON.
    #[arg(value_name = "PATH")]
    pub input: PathBuf,

    /// Entry point arguments, parsed according to the entry parameter types.
    #[arg(value_name = "ARG", allow_negative_numbers = true)]
    pub args: Vec<String>,

    #[command(flatten)]
    pub settings: SettingsArgs,

    /// Stack budget in bytes.
    #[arg(long, value_name = "BYTES")]
    pub stack_bytes: Option<u64>,

    /// Wall-clock budget in milliseconds.
    #[arg(long, value_name = "MS")]
    pub time_ms: Option<u64>,

    /// Allocation budget in units.
    #[arg(long, value_name = "UNITS")]
    pub allocations: Option<u64>,

    /// Native stack of the execution thread, in MiB. Must exceed the stack budget.
    #[arg(long, value_name = "MIB", default_value_t = DEFAULT_THREAD_STACK_MIB)]
    pub thread_stack_mib: usize,
}

impl RunArgs {
    fn limits(&self) -> ResourceLimits {
        let mut limits = ResourceLimits::default();
        if let Some(bytes) = self.stack_bytes {
            limits.stack_bytes = bytes;
        }
        if let Some(ms) = self.time_ms {
            limits.time = Duration::from_millis(ms);
        }
        if let Some(units) = self.allocations {
            limits.allocations = units;
        }
        limits
    }
}

#[derive(Debug, Serialize)]
struct RunReport {
    schema_version: &'static str,
    program: String,
    token: String,
    methods: usize,
    injected: usize,
    limits: ResourceLimits,
    elapsed_ms: u64,
    outcome: Outcome,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Outcome {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    LimitExceeded { message: String },
    Thrown { type_name: String, message: String },
    Fault { message: String },
}

impl Outcome {
    fn from_result(result: Result<Option<Value>, ExecError>) -> Self {
        match result {
            Ok(value) => Outcome::Ok {
                result: value.map(|v| v.to_string()),
            },
            Err(ExecError::Guard(err)) => Outcome::LimitExceeded {
                message: err.to_string(),
            },
            Err(ExecError::Thrown { type_name, message }) => Outcome::Thrown { type_name, message },
            Err(ExecError::Fault(message)) => Outcome::Fault { message },
        }
    }

    fn exit_code(&self) -> std::process::ExitCode {
        match self {
            Outcome::Ok { .. } => std::process::ExitCode::SUCCESS,
            _ => std::process::ExitCode::from(1),
        }
    }
}

pub fn cmd_run(args: RunArgs) -> Result<std::process::ExitCode> {
    let source = read_program_bytes(&args.input)?;
    let settings = args.settings.load()?;
    let rewritten = bastion::rewrite(&source, &settings)
        .with_context(|| format!("rewrite: {}", args.input.display()))?;
    let vm = Vm::load(&rewritten.bytes).context("load rewritten program")?;
    let entry_args = parse_args(vm.entry_params(), &args.args)?;
    let limits = args.limits();
    let program = vm.program().name.clone();
    let token = rewritten.token;

    tracing::debug!(%token, ?limits, "running");
    let started = Instant::now();
    let result = std::thread::Builder::new()
        .name("bastion-run".to_string())
        .stack_size(args.thread_stack_mib << 20)
        .spawn(move || {
            let _scope = token.open_scope(limits);
            vm.run(entry_args)
        })
        .context("spawn execution thread")?
        .join()
        .map_err(|_| anyhow!("execution thread panicked"))?;
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let outcome = Outcome::from_result(result);
    let code = outcome.exit_code();
    print_json(&RunReport {
        schema_version: RUN_REPORT_SCHEMA_VERSION,
        program,
        token: token.to_hex(),
        methods: rewritten.stats.methods,
        injected: rewritten.stats.injected,
        limits,
        elapsed_ms,
        outcome,
    })?;
    Ok(code)
}

fn parse_args(params: &[TypeSig], raw: &[String]) -> Result<Vec<Value>> {
    if params.len() != raw.len() {
        bail!(
            "entry point takes {} arguments, {} given",
            params.len(),
            raw.len()
        );
    }
    params
        .iter()
        .zip(raw)
        .enumerate()
        .map(|(i, (ty, text))| parse_arg(ty, text).with_context(|| format!("argument {i}")))
        .collect()
}

fn parse_arg(ty: &TypeSig, text: &str) -> Result<Value> {
    Ok(match ty {
        TypeSig::I32 => Value::I32(text.parse().with_context(|| format!("not an int32: {text:?}"))?),
        TypeSig::I64 => Value::I64(text.parse().with_context(|| format!("not an int64: {text:?}"))?),
        TypeSig::F64 => Value::F64(text.parse().with_context(|| format!("not a float: {text:?}"))?),
        TypeSig::Bool => match text {
            "true" | "True" => Value::Bool(true),
            "false" | "False" => Value::Bool(false),
            _ => bail!("not a bool: {text:?}"),
        },
        TypeSig::String | TypeSig::Object => Value::str(text),
        other => bail!("entry parameters of type {other} cannot be given on the command line"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_follow_entry_parameter_types() {
        let params = [TypeSig::I32, TypeSig::Bool, TypeSig::String];
        let raw = ["42", "true", "hi"].map(String::from);
        let values = parse_args(&params, &raw).expect("parse");
        assert_eq!(values[0].as_i64(), Some(42));
        assert!(matches!(values[1], Value::Bool(true)));
        assert!(matches!(&values[2], Value::Str(s) if &**s == "hi"));
    }

    #[test]
    fn arity_and_format_errors_are_reported() {
        assert!(parse_args(&[TypeSig::I32], &[]).is_err());
        let err = parse_args(&[TypeSig::I32], &["x".to_string()]).expect_err("bad int");
        assert!(format!("{err:#}").contains("not an int32"));
        assert!(parse_arg(&TypeSig::Array(Box::new(TypeSig::I32)), "1").is_err());
    }

    #[test]
    fn guard_failures_are_reported_as_limit_exceeded() {
        let outcome = Outcome::from_result(Err(ExecError::Guard(bastion::GuardError::MemoryLimit {
            total: 11,
            limit: 10,
        })));
        let json = serde_json::to_value(&outcome).expect("json");
        assert_eq!(json["status"], "limit_exceeded");
        assert_eq!(outcome.exit_code(), std::process::ExitCode::from(1));
    }
}
