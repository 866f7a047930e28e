//! Post-issuance hooks.
//!
//! Every regular, user-executable file in the hooks directory runs once per
//! certificate change, in name order, with an environment describing the
//! event. A failing hook is logged and the rest still run.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{bail, Result};
use tracing::error;

/// What a certificate change looked like, passed to hooks via environment.
#[derive(Debug, Clone)]
pub struct HookInfo {
    pub server: String,
    pub email: String,
    pub domains: Vec<String>,
}

/// Run every hook in `hooks_dir` for `info`.
pub async fn call_hooks(hooks_dir: &Path, info: &HookInfo) -> io::Result<()> {
    let mut entries = std::fs::read_dir(hooks_dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        if let Err(e) = run_hook(&entry, info).await {
            error!(name = %entry.file_name().to_string_lossy(), error = %e, "failed to run hook");
        }
    }
    Ok(())
}

async fn run_hook(entry: &std::fs::DirEntry, info: &HookInfo) -> Result<()> {
    let meta = entry.metadata()?;
    if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
        return Ok(());
    }
    let status = tokio::process::Command::new(entry.path())
        .env_clear()
        .env("ACME_SERVER", &info.server)
        .env("ACME_EMAIL", &info.email)
        .env("ACME_DOMAIN", info.domains.join(" "))
        .status()
        .await?;
    if !status.success() {
        bail!("hook exited with {status}");
    }
    Ok(())
}
