//! Accounts, certificate paths, and the per-CA issuer.
//!
//! One [`Issuer`] exists per resolved directory URL for the life of the
//! process; [`Issuers`] is the registry that enforces that, constructed
//! once at startup with the handler, the clock, and the filesystem layout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info};

use acmehugger_common::clock::{self, Clock, Timer};
use acmehugger_common::fsutil;
use acmehugger_common::sets::equal_sets;

use crate::error::AcmeError;
use crate::handler::{Handler, HandlerAccount};
use crate::key::{load_or_create_key, KeyType};
use crate::Dirs;

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Days before expiry at which a certificate is renewed, when `acme_days`
/// is not set.
pub const DEFAULT_DAYS: i64 = 30;

/// The account settings collected from the configuration.
#[derive(Debug, Clone, Default)]
pub struct Account {
    pub email: String,
    /// Directory URL; empty means derive from `staging`.
    pub server: String,
    pub staging: bool,
    pub key_type: KeyType,
}

impl Account {
    /// The directory URL this account talks to.
    pub fn resolve_server(&self) -> String {
        if !self.server.is_empty() {
            return self.server.clone();
        }
        if self.staging {
            LETS_ENCRYPT_STAGING.to_string()
        } else {
            LETS_ENCRYPT_PRODUCTION.to_string()
        }
    }

    /// On-disk directory of this account, derived from the directory URL.
    pub fn dir(&self, dirs: &Dirs) -> PathBuf {
        let server = self.resolve_server();
        let stem = server
            .strip_prefix("https://")
            .unwrap_or(&server)
            .replace([':', '/'], "_");
        dirs.accounts.join(stem)
    }

    /// Certificate paths this account would use for `domain`.
    pub fn cert_paths(&self, dirs: &Dirs, domain: &str) -> Result<CertPaths, AcmeError> {
        let cert_dir = self.dir(dirs).join("certificates");
        CertPaths::new(&cert_dir, &dirs.live_certs, domain)
    }
}

/// The seven paths belonging to one domain's certificate material: per-CA
/// working files plus the public symlinks in the live directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub key: PathBuf,
    pub key_live: PathBuf,
    pub full_chain: PathBuf,
    pub full_chain_live: PathBuf,
    pub chain: PathBuf,
    pub chain_live: PathBuf,
    pub info: PathBuf,
}

impl CertPaths {
    fn new(cert_dir: &Path, live_dir: &Path, domain: &str) -> Result<Self, AcmeError> {
        let name = idna::domain_to_ascii(&domain.replace('*', "_")).map_err(|e| {
            AcmeError::InvalidDomain {
                domain: domain.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(CertPaths {
            key: cert_dir.join(format!("{name}.key")),
            key_live: live_dir.join(format!("{name}.key")),
            full_chain: cert_dir.join(format!("{name}.fullchain.crt")),
            full_chain_live: live_dir.join(format!("{name}.fullchain.crt")),
            chain: cert_dir.join(format!("{name}.chain.crt")),
            chain_live: live_dir.join(format!("{name}.chain.crt")),
            info: cert_dir.join(format!("{name}.json")),
        })
    }

    /// Whether the full chain, key, and chain all exist.
    pub fn exist(&self) -> Result<bool, AcmeError> {
        for path in [&self.full_chain, &self.key, &self.chain] {
            if !fsutil::file_exists(path)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChallengeType {
    #[default]
    Http,
    Dns,
}

impl ChallengeType {
    pub fn parse(s: &str) -> Result<Self, AcmeError> {
        match s {
            "http" => Ok(ChallengeType::Http),
            "dns" => Ok(ChallengeType::Dns),
            _ => Err(AcmeError::InvalidChallengeType(s.to_string())),
        }
    }
}

/// DNS-01 provider selection plus its options.
#[derive(Debug, Clone, Default)]
pub struct DnsConfig {
    pub name: String,
    pub options: HashMap<String, String>,
}

/// Per-issuance settings inherited through the configuration scopes.
///
/// `Clone` is a deep copy; pushing a scope never aliases the parent's
/// DNS option map.
#[derive(Debug, Clone, Default)]
pub struct IssueOptions {
    pub key_type: KeyType,
    pub days: Option<i64>,
    pub challenge: ChallengeType,
    pub dns: DnsConfig,
}

/// What the handler returns for one obtain call.
#[derive(Debug, Clone)]
pub struct Cert {
    pub key: Vec<u8>,
    pub full_chain: Vec<u8>,
    pub chain: Vec<u8>,
    pub url: String,
}

/// Result of one [`Issuer::issue`] call.
pub struct IssueInfo {
    /// Fires when the certificate enters its renewal window.
    pub renew_timer: Timer,
    /// Whether a new certificate was obtained.
    pub changed: bool,
    pub paths: CertPaths,
}

/// Registry handing out the per-CA issuers.
pub struct Issuers {
    handler: Arc<dyn Handler>,
    clock: Arc<dyn Clock>,
    dirs: Dirs,
    cache: DashMap<String, Arc<Issuer>>,
    create_lock: tokio::sync::Mutex<()>,
}

impl Issuers {
    pub fn new(handler: Arc<dyn Handler>, clock: Arc<dyn Clock>, dirs: Dirs) -> Self {
        Issuers {
            handler,
            clock,
            dirs,
            cache: DashMap::new(),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dirs(&self) -> &Dirs {
        &self.dirs
    }

    /// The issuer for this account's CA, created and registered with the CA
    /// on first use.
    pub async fn get(&self, acct: &Account) -> anyhow::Result<Arc<Issuer>> {
        let server = acct.resolve_server();
        if let Some(issuer) = self.cache.get(&server) {
            return Ok(issuer.clone());
        }

        // Creation talks to the CA; serialize it so concurrent plans for
        // the same CA cannot double-register.
        let _guard = self.create_lock.lock().await;
        if let Some(issuer) = self.cache.get(&server) {
            return Ok(issuer.clone());
        }
        let (hacct, cert_dir) =
            load_handler_account(acct, &self.dirs, self.handler.as_ref()).await?;
        let issuer = Arc::new(Issuer {
            hacct,
            cert_dir,
            live_dir: self.dirs.live_certs.clone(),
            handler: self.handler.clone(),
            clock: self.clock.clone(),
            lock: tokio::sync::Mutex::new(()),
        });
        self.cache.insert(server, issuer.clone());
        Ok(issuer)
    }
}

/// Materialize the on-disk account for `acct`, registering, recovering, or
/// updating it with the CA as needed. Returns the handler account and the
/// account's certificate directory.
async fn load_handler_account(
    acct: &Account,
    dirs: &Dirs,
    handler: &dyn Handler,
) -> anyhow::Result<(HandlerAccount, PathBuf)> {
    let dir = acct.dir(dirs);
    let cert_dir = dir.join("certificates");
    std::fs::create_dir_all(&cert_dir)?;

    let key_path = dir.join("account.key");
    let (key, created) = load_or_create_key(acct.key_type, &key_path)?;
    let server = acct.resolve_server();
    let acct_path = dir.join("account.json");

    if created {
        let mut hacct = HandlerAccount {
            server,
            email: acct.email.clone(),
            url: String::new(),
            key: Some(key.clone()),
        };
        debug!(account = ?hacct, "new key created, creating acme account");
        handler.create_account(&mut hacct).await?;
        persist_key_if_changed(&hacct, &key, &key_path)?;
        fsutil::write_json(&acct_path, &hacct, 0o644)?;
        return Ok((hacct, cert_dir));
    }

    match fsutil::read_json::<HandlerAccount>(&acct_path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut hacct = HandlerAccount {
                server,
                email: acct.email.clone(),
                url: String::new(),
                key: Some(key.clone()),
            };
            debug!(account = ?hacct, "key exists, but account json not found, recovering acme account");
            handler.recover_account(&mut hacct).await?;
            persist_key_if_changed(&hacct, &key, &key_path)?;
            fsutil::write_json(&acct_path, &hacct, 0o644)?;
            Ok((hacct, cert_dir))
        }
        Err(e) => Err(e.into()),
        Ok(mut hacct) => {
            hacct.server = server;
            hacct.key = Some(key);
            if acct.email != hacct.email {
                hacct.email = acct.email.clone();
                debug!(account = ?hacct, "acme email changed, updating account");
                handler.update_account(&mut hacct).await?;
            }
            Ok((hacct, cert_dir))
        }
    }
}

/// The built-in handler owns account key material; when registration
/// replaced the key, keep `account.key` in sync with it.
fn persist_key_if_changed(
    hacct: &HandlerAccount,
    loaded: &crate::key::PrivateKey,
    key_path: &Path,
) -> std::io::Result<()> {
    if let Some(key) = &hacct.key {
        if key.der() != loaded.der() {
            fsutil::write_with_mode(key_path, key.der(), 0o600)?;
        }
    }
    Ok(())
}

/// Issues and renews certificates for one CA. All handler issuance for the
/// CA is serialized by the issuer's lock.
pub struct Issuer {
    hacct: HandlerAccount,
    cert_dir: PathBuf,
    live_dir: PathBuf,
    handler: Arc<dyn Handler>,
    clock: Arc<dyn Clock>,
    lock: tokio::sync::Mutex<()>,
}

impl Issuer {
    pub fn handler_account(&self) -> &HandlerAccount {
        &self.hacct
    }

    /// Obtain or renew the certificate for `domains`.
    ///
    /// When a certificate for exactly this domain set already exists and is
    /// outside its renewal window, no handler call is made and `changed` is
    /// false; the returned timer fires when the window opens.
    pub async fn issue(
        &self,
        domains: &[String],
        opts: &IssueOptions,
    ) -> anyhow::Result<IssueInfo> {
        let days = opts.days.unwrap_or(DEFAULT_DAYS);
        let days_dur = Duration::days(days);
        let main_domain = &domains[0];
        let paths = CertPaths::new(&self.cert_dir, &self.live_dir, main_domain)?;

        match fsutil::read_cert(&paths.full_chain) {
            Err(fsutil::CertError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(domain = %main_domain, "issuing");
            }
            Err(e) => return Err(e.into()),
            Ok(cert) => {
                if equal_sets(&cert.dns_names, domains) {
                    let left = clock::until(self.clock.as_ref(), cert.not_after - days_dur);
                    if left > Duration::zero() {
                        info!(
                            time_left = %left,
                            ?domains,
                            "hasn't reached renew time, renewal skipped"
                        );
                        return Ok(IssueInfo {
                            renew_timer: self.clock.timer(left),
                            changed: false,
                            paths,
                        });
                    }
                    info!(domain = %main_domain, "renewing");
                } else {
                    info!(domain = %main_domain, "issuing");
                }
            }
        }

        let _guard = self.lock.lock().await;
        let crt = self.handler.issue(&self.hacct, domains, opts).await?;
        info!(?domains, "acme certificates issued");

        let cert = fsutil::parse_cert(&crt.full_chain)
            .map_err(|e| anyhow::anyhow!("failed to parse issued certificate for {main_domain}: {e}"))?;
        let dur = clock::until(self.clock.as_ref(), cert.not_after - days_dur);
        let renew_timer = self.clock.timer(dur);

        fsutil::write_with_mode(&paths.key, &crt.key, 0o600)?;
        fsutil::force_symlink(&paths.key, &paths.key_live)?;
        fsutil::write_with_mode(&paths.full_chain, &crt.full_chain, 0o644)?;
        fsutil::force_symlink(&paths.full_chain, &paths.full_chain_live)?;
        fsutil::write_with_mode(&paths.chain, &crt.chain, 0o644)?;
        fsutil::force_symlink(&paths.chain, &paths.chain_live)?;
        fsutil::write_json(&paths.info, &json!({ "certUrl": crt.url }), 0o644)?;

        Ok(IssueInfo {
            renew_timer,
            changed: true,
            paths,
        })
    }
}
