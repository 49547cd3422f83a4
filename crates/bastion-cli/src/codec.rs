use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::input::{print_json, read_program_bytes, write_output};

#[derive(Debug, Clone, Args)]
pub struct EncodeArgs {
    /// Program JSON (a binary container is re-encoded as-is).
    #[arg(value_name = "PATH")]
    pub input: PathBuf,

    /// Output container path (default: stdout).
    #[arg(long, short, value_name = "PATH")]
    pub out: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct DecodeArgs {
    /// Program container.
    #[arg(value_name = "PATH")]
    pub input: PathBuf,
}

pub fn cmd_encode(args: EncodeArgs) -> Result<std::process::ExitCode> {
    let bytes = read_program_bytes(&args.input)?;
    // Round-trip through the strict decoder so malformed input never leaves this command.
    let program = bastion_il::decode(&bytes)
        .with_context(|| format!("invalid program: {}", args.input.display()))?;
    write_output(args.out.as_deref(), &bastion_il::encode(&program))?;
    Ok(std::process::ExitCode::SUCCESS)
}

pub fn cmd_decode(args: DecodeArgs) -> Result<std::process::ExitCode> {
    let bytes = std::fs::read(&args.input)
        .with_context(|| format!("read program: {}", args.input.display()))?;
    let program = bastion_il::decode(&bytes)
        .with_context(|| format!("decode program: {}", args.input.display()))?;
    print_json(&program)?;
    Ok(std::process::ExitCode::SUCCESS)
}
