//! DNS-01 provider seam.
//!
//! Providers publish and withdraw the `_acme-challenge` TXT record for a
//! domain. Selection is by name from the configuration; provider-specific
//! settings arrive as environment variables, applied by the handler before
//! the provider is constructed.

use std::path::PathBuf;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Publish `value` as a TXT record at `fqdn`.
    async fn present(&self, fqdn: &str, value: &str) -> Result<()>;

    /// Withdraw the record at `fqdn`.
    async fn cleanup(&self, fqdn: &str) -> Result<()>;
}

/// Instantiate a provider by its configured name.
pub fn provider_by_name(name: &str) -> Result<Box<dyn DnsProvider>> {
    match name {
        "exec" => Ok(Box::new(ExecProvider::from_env()?)),
        _ => bail!("unknown dns provider: {name}"),
    }
}

/// Shells out to an external updater: `$EXEC_PATH present <fqdn> <value>`
/// and `$EXEC_PATH cleanup <fqdn>`.
pub struct ExecProvider {
    path: PathBuf,
}

impl ExecProvider {
    fn from_env() -> Result<Self> {
        match std::env::var_os("EXEC_PATH") {
            Some(path) => Ok(ExecProvider { path: path.into() }),
            None => bail!("the exec dns provider requires EXEC_PATH"),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        debug!(path = %self.path.display(), ?args, "running dns updater");
        let status = tokio::process::Command::new(&self.path)
            .args(args)
            .status()
            .await?;
        if !status.success() {
            bail!("dns updater exited with {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for ExecProvider {
    async fn present(&self, fqdn: &str, value: &str) -> Result<()> {
        self.run(&["present", fqdn, value]).await
    }

    async fn cleanup(&self, fqdn: &str) -> Result<()> {
        self.run(&["cleanup", fqdn]).await
    }
}
