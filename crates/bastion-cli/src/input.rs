//! Loading programs and settings from disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bastion::{AccessPolicy, RewriteSettings};
use bastion_contracts::PROGRAM_MAGIC;
use bastion_il::Program;
use clap::Args;

/// Container bytes for `path`, which may hold either the binary container or its JSON form.
pub fn read_program_bytes(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("read program: {}", path.display()))?;
    if bytes.starts_with(PROGRAM_MAGIC) {
        return Ok(bytes);
    }
    let program: Program = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse program JSON: {}", path.display()))?;
    Ok(bastion_il::encode(&program))
}

pub fn write_output(path: Option<&Path>, bytes: &[u8]) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, bytes).with_context(|| format!("write: {}", path.display()))
        }
        None => {
            use std::io::Write as _;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(bytes).context("write stdout")?;
            stdout.flush().context("flush stdout")
        }
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut text = serde_json::to_string_pretty(value).context("serialize JSON")?;
    text.push('\n');
    write_output(None, text.as_bytes())
}

/// Where rewrite settings come from. Without either flag the safe default policy applies.
#[derive(Debug, Clone, Args)]
pub struct SettingsArgs {
    /// Rewrite settings JSON (policy plus static limits).
    #[arg(long, value_name = "PATH", conflicts_with = "policy")]
    pub settings: Option<PathBuf>,

    /// Access policy JSON, combined with default static limits.
    #[arg(long, value_name = "PATH")]
    pub policy: Option<PathBuf>,

    /// Extra input mixed into the guard token, to separate concurrent runs of one program.
    #[arg(long, value_name = "TEXT")]
    pub token_salt: Option<String>,
}

impl SettingsArgs {
    pub fn load(&self) -> Result<RewriteSettings> {
        let mut settings = match (&self.settings, &self.policy) {
            (Some(path), _) => {
                let text = read_text(path)?;
                RewriteSettings::from_json(&text)
                    .with_context(|| format!("load settings: {}", path.display()))?
            }
            (None, Some(path)) => RewriteSettings::new(load_policy(path)?),
            (None, None) => RewriteSettings::default(),
        };
        if let Some(salt) = &self.token_salt {
            settings.token_salt = Some(salt.clone());
        }
        Ok(settings)
    }

    /// Only the access policy, for reporting.
    pub fn load_policy(&self) -> Result<AccessPolicy> {
        Ok(self.load()?.policy)
    }
}

fn load_policy(path: &Path) -> Result<AccessPolicy> {
    let text = read_text(path)?;
    AccessPolicy::from_json(&text).with_context(|| format!("load policy: {}", path.display()))
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("read: {}", path.display()))
}
