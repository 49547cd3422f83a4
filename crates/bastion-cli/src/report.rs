use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::input::{print_json, read_program_bytes, SettingsArgs};

#[derive(Debug, Clone, Args)]
pub struct ReportArgs {
    /// Program container or program JSON.
    #[arg(value_name = "PATH")]
    pub input: PathBuf,

    #[command(flatten)]
    pub settings: SettingsArgs,

    /// Exit with status 1 when any symbol is denied.
    #[arg(long)]
    pub strict: bool,
}

pub fn cmd_report(args: ReportArgs) -> Result<std::process::ExitCode> {
    let bytes = read_program_bytes(&args.input)?;
    let policy = args.settings.load_policy()?;
    let report = bastion::report_program(&bytes, &policy)
        .with_context(|| format!("report: {}", args.input.display()))?;
    print_json(&report)?;
    if args.strict && report.denied().next().is_some() {
        return Ok(std::process::ExitCode::from(1));
    }
    Ok(std::process::ExitCode::SUCCESS)
}
