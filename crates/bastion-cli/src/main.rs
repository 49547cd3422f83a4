use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod codec;
mod input;
mod report;
mod rewrite;
mod run;

#[derive(Parser, Debug)]
#[command(name = "bastion")]
#[command(about = "Policy-driven sandboxing of bytecode programs.", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Check a program against a policy and inject resource guards.
    Rewrite(rewrite::RewriteArgs),
    /// Rewrite a program and execute it under resource limits.
    Run(Box<run::RunArgs>),
    /// Print what a policy decides for every external symbol a program uses.
    Report(report::ReportArgs),
    /// Convert a JSON program into the binary container.
    Encode(codec::EncodeArgs),
    /// Convert a binary container into JSON.
    Decode(codec::DecodeArgs),
}

fn main() -> std::process::ExitCode {
    init_logging();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("BASTION_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::Rewrite(args) => rewrite::cmd_rewrite(args),
        Command::Run(args) => run::cmd_run(*args),
        Command::Report(args) => report::cmd_report(args),
        Command::Encode(args) => codec::cmd_encode(args),
        Command::Decode(args) => codec::cmd_decode(args),
    }
}
