//! ACME issuance for the config rewriter: account store, per-CA issuer,
//! the pluggable protocol handler, and the hook runner.
//!
//! The protocol itself lives entirely behind the [`Handler`] trait; the
//! rest of this crate is filesystem layout, key management, skip-or-renew
//! decisions, and publication of the issued files.

pub mod error;
pub mod handler;
pub mod hook;
pub mod issuer;
pub mod key;

mod dns;

pub use error::AcmeError;
pub use handler::{AcmeHandler, Handler, HandlerAccount};
pub use hook::{call_hooks, HookInfo};
pub use issuer::{
    Account, Cert, CertPaths, ChallengeType, DnsConfig, IssueInfo, IssueOptions, Issuer, Issuers,
    DEFAULT_DAYS, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING,
};
pub use key::{load_or_create_key, KeyType, PrivateKey};

use std::path::PathBuf;

/// Root of the daemon's mutable state.
pub const STATE_DIR: &str = "/var/lib/acmehugger";

/// The filesystem layout everything in this crate writes under.
///
/// Defaults are the installed locations; tests point the fields at
/// temporary directories.
#[derive(Debug, Clone)]
pub struct Dirs {
    /// HTTP-01 webroot served at `/.well-known/acme-challenge/`.
    pub challenge: PathBuf,
    /// One subdirectory per CA account.
    pub accounts: PathBuf,
    /// Stable symlinks to the current key/cert/chain per domain.
    pub live_certs: PathBuf,
    /// Executables run after every certificate change.
    pub hooks: PathBuf,
}

impl Default for Dirs {
    fn default() -> Self {
        Dirs {
            challenge: PathBuf::from(STATE_DIR).join("acme/challenge"),
            accounts: PathBuf::from(STATE_DIR).join("acme/accounts"),
            live_certs: PathBuf::from("/etc/ssl/acme"),
            hooks: PathBuf::from("/usr/share/acmehugger/hook.d"),
        }
    }
}
