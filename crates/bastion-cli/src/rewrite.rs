use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::input::{read_program_bytes, write_output, SettingsArgs};

#[derive(Debug, Clone, Args)]
pub struct RewriteArgs {
    /// Program container or program JSON.
    #[arg(value_name = "PATH")]
    pub input: PathBuf,

    /// Rewritten container path (default: stdout).
    #[arg(long, short, value_name = "PATH")]
    pub out: Option<PathBuf>,

    #[command(flatten)]
    pub settings: SettingsArgs,
}

pub fn cmd_rewrite(args: RewriteArgs) -> Result<std::process::ExitCode> {
    let source = read_program_bytes(&args.input)?;
    let settings = args.settings.load()?;
    let rewritten = bastion::rewrite(&source, &settings)
        .with_context(|| format!("rewrite: {}", args.input.display()))?;
    write_output(args.out.as_deref(), &rewritten.bytes)?;
    // The host needs the token to open the scope, so it goes to stderr alongside the output.
    eprintln!(
        "token {} ({} methods, {} injected instructions)",
        rewritten.token, rewritten.stats.methods, rewritten.stats.injected
    );
    Ok(std::process::ExitCode::SUCCESS)
}
