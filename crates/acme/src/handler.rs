//! The pluggable ACME protocol adapter.
//!
//! Everything that actually speaks RFC 8555 sits behind [`Handler`]; the
//! issuer only ever calls its four operations. The default implementation,
//! [`AcmeHandler`], drives `instant-acme`: HTTP-01 answers are published as
//! files under the shared challenge webroot, DNS-01 goes through a provider
//! chosen by name after the configured options have been applied to the
//! process environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use instant_acme::{
    Account as ProtoAccount, AccountCredentials, AuthorizationStatus, ChallengeType as ProtoChallenge,
    Identifier, NewAccount, NewOrder, Order, OrderStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::dns::{self, DnsProvider};
use crate::issuer::{Cert, ChallengeType, IssueOptions};
use crate::key::{KeyType, PrivateKey};

/// The account as the handler sees it. `email` and `url` are what
/// `account.json` persists; the directory URL and the key are attached in
/// memory by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerAccount {
    #[serde(skip)]
    pub server: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub url: String,
    #[serde(skip)]
    pub key: Option<PrivateKey>,
}

/// The four operations the issuer needs from an ACME implementation.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Register a new account; fills in `acct.url` (and may replace
    /// `acct.key` when the backend owns key generation).
    async fn create_account(&self, acct: &mut HandlerAccount) -> Result<()>;

    /// Push a changed contact email to the CA.
    async fn update_account(&self, acct: &mut HandlerAccount) -> Result<()>;

    /// Re-establish `acct.url` for an account whose key exists but whose
    /// `account.json` was lost.
    async fn recover_account(&self, acct: &mut HandlerAccount) -> Result<()>;

    /// Obtain a certificate for `domains`, bundling the issuer chain.
    async fn issue(
        &self,
        acct: &HandlerAccount,
        domains: &[String],
        opts: &IssueOptions,
    ) -> Result<Cert>;
}

/// Production handler speaking ACME via `instant-acme`.
pub struct AcmeHandler {
    challenge_dir: PathBuf,
}

/// How often and how long to poll authorization and order states.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_ATTEMPTS: usize = 30;

impl AcmeHandler {
    pub fn new(challenge_dir: impl Into<PathBuf>) -> Self {
        AcmeHandler {
            challenge_dir: challenge_dir.into(),
        }
    }

    /// Rebuild the protocol account from our stored url + key.
    async fn account(&self, acct: &HandlerAccount) -> Result<ProtoAccount> {
        let key = acct
            .key
            .as_ref()
            .ok_or_else(|| anyhow!("account key not loaded"))?;
        let credentials: AccountCredentials = serde_json::from_value(json!({
            "id": acct.url,
            "key_pkcs8": URL_SAFE_NO_PAD.encode(key.der()),
            "directory": acct.server,
        }))
        .context("building account credentials")?;
        Ok(ProtoAccount::from_credentials(credentials).await?)
    }

    fn challenge_file(&self, token: &str) -> PathBuf {
        self.challenge_dir
            .join(".well-known/acme-challenge")
            .join(token)
    }
}

#[async_trait]
impl Handler for AcmeHandler {
    async fn create_account(&self, acct: &mut HandlerAccount) -> Result<()> {
        let contact = format!("mailto:{}", acct.email);
        let new = NewAccount {
            contact: &[&contact],
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let (_, credentials) = ProtoAccount::create(&new, &acct.server, None).await?;

        // instant-acme generates the account key during registration; adopt
        // its key and URL as ours.
        let creds = serde_json::to_value(&credentials)?;
        let url = creds
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("account credentials carry no id"))?;
        let key_b64 = creds
            .get("key_pkcs8")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("account credentials carry no key"))?;
        acct.url = url.to_string();
        acct.key = Some(PrivateKey::from_der(
            KeyType::Ec256,
            URL_SAFE_NO_PAD.decode(key_b64)?,
        ));
        debug!(url = %acct.url, "acme account created");
        Ok(())
    }

    async fn update_account(&self, acct: &mut HandlerAccount) -> Result<()> {
        // The backend has no contact-update call; the new email still lands
        // in account.json and is used for future registrations.
        warn!(email = %acct.email, "contact update not supported by the ACME backend, keeping registered contact");
        Ok(())
    }

    async fn recover_account(&self, acct: &mut HandlerAccount) -> Result<()> {
        // The backend cannot resolve an account by key alone; register a
        // fresh account instead.
        warn!("account file missing, registering a new acme account");
        self.create_account(acct).await
    }

    async fn issue(
        &self,
        acct: &HandlerAccount,
        domains: &[String],
        opts: &IssueOptions,
    ) -> Result<Cert> {
        let account = self.account(acct).await?;
        let identifiers: Vec<Identifier> =
            domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let provider = match opts.challenge {
            ChallengeType::Http => {
                debug!(?domains, account = ?acct, "HTTP01 issuance");
                None
            }
            ChallengeType::Dns => {
                for (k, v) in &opts.dns.options {
                    let k = k.to_uppercase();
                    debug!(key = %k, "setting env for DNS01 issuance");
                    std::env::set_var(k, v);
                }
                debug!(?domains, account = ?acct, "DNS01 issuance");
                Some(dns::provider_by_name(&opts.dns.name)?)
            }
        };

        let authorizations = order.authorizations().await?;
        let mut cleanup: Vec<Cleanup> = Vec::new();
        let result = self
            .solve_authorizations(&mut order, &authorizations, opts, provider.as_deref(), &mut cleanup)
            .await;
        let result = match result {
            Ok(()) => self.finalize(&mut order, domains, opts).await,
            Err(e) => Err(e),
        };
        for c in cleanup {
            c.run(provider.as_deref()).await;
        }
        result
    }
}

/// A challenge answer to withdraw once validation is over.
enum Cleanup {
    File(PathBuf),
    Record(String),
}

impl Cleanup {
    async fn run(self, provider: Option<&dyn DnsProvider>) {
        match self {
            Cleanup::File(path) => {
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!(path = %path.display(), error = %e, "challenge file cleanup failed");
                }
            }
            Cleanup::Record(fqdn) => {
                if let Some(p) = provider {
                    if let Err(e) = p.cleanup(&fqdn).await {
                        debug!(fqdn = %fqdn, error = %e, "dns record cleanup failed");
                    }
                }
            }
        }
    }
}

impl AcmeHandler {
    async fn solve_authorizations(
        &self,
        order: &mut Order,
        authorizations: &[instant_acme::Authorization],
        opts: &IssueOptions,
        provider: Option<&dyn DnsProvider>,
        cleanup: &mut Vec<Cleanup>,
    ) -> Result<()> {
        let want = match opts.challenge {
            ChallengeType::Http => ProtoChallenge::Http01,
            ChallengeType::Dns => ProtoChallenge::Dns01,
        };
        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }
            let Identifier::Dns(domain) = &authz.identifier;
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == want)
                .ok_or_else(|| anyhow!("no {want:?} challenge available for {domain}"))?;
            let key_auth = order.key_authorization(challenge);

            match opts.challenge {
                ChallengeType::Http => {
                    let path = self.challenge_file(&challenge.token);
                    if let Some(dir) = path.parent() {
                        std::fs::create_dir_all(dir)?;
                    }
                    std::fs::write(&path, key_auth.as_str())?;
                    cleanup.push(Cleanup::File(path));
                }
                ChallengeType::Dns => {
                    let provider =
                        provider.ok_or_else(|| anyhow!("dns provider not configured"))?;
                    let fqdn = format!("_acme-challenge.{domain}");
                    provider.present(&fqdn, &key_auth.dns_value()).await?;
                    cleanup.push(Cleanup::Record(fqdn));
                }
            }
            order.set_challenge_ready(&challenge.url).await?;

            self.wait_for_authorization(order, &authz.identifier).await?;
        }
        Ok(())
    }

    async fn wait_for_authorization(
        &self,
        order: &mut Order,
        identifier: &Identifier,
    ) -> Result<()> {
        for _ in 0..POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            let authorizations = order.authorizations().await?;
            let authz = authorizations
                .iter()
                .find(|a| &a.identifier == identifier)
                .ok_or_else(|| anyhow!("authorization disappeared"))?;
            match authz.status {
                AuthorizationStatus::Valid => return Ok(()),
                AuthorizationStatus::Invalid => {
                    let Identifier::Dns(domain) = identifier;
                    bail!("authorization failed for {domain}");
                }
                _ => {}
            }
        }
        bail!("authorization timed out")
    }

    async fn finalize(
        &self,
        order: &mut Order,
        domains: &[String],
        opts: &IssueOptions,
    ) -> Result<Cert> {
        let cert_key = PrivateKey::generate(opts.key_type)?;
        let key_pair = rcgen::KeyPair::try_from(cert_key.der())
            .map_err(|e| anyhow!("certificate key rejected: {e}"))?;
        let mut params = rcgen::CertificateParams::new(domains.to_vec())?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        let csr = params.serialize_request(&key_pair)?;
        order.finalize(csr.der()).await?;

        let mut cert_chain = None;
        for _ in 0..POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            let status = order.refresh().await?.status;
            match status {
                OrderStatus::Valid => {
                    cert_chain = order.certificate().await?;
                    if cert_chain.is_some() {
                        break;
                    }
                }
                OrderStatus::Invalid => bail!("order became invalid"),
                _ => {}
            }
        }
        let full_chain =
            cert_chain.ok_or_else(|| anyhow!("certificate was not issued in time"))?;
        let url = order.state().certificate.clone().unwrap_or_default();
        let chain = issuer_chain(&full_chain)?;
        let key_pem = pem::encode(&pem::Pem::new("PRIVATE KEY", cert_key.der().to_vec()));

        Ok(Cert {
            key: key_pem.into_bytes(),
            full_chain: full_chain.into_bytes(),
            chain,
            url,
        })
    }
}

/// Everything after the leaf certificate in a PEM bundle.
fn issuer_chain(full_chain: &str) -> Result<Vec<u8>> {
    let blocks = pem::parse_many(full_chain.as_bytes())?;
    let rest = blocks.into_iter().skip(1).collect::<Vec<_>>();
    Ok(pem::encode_many(&rest).into_bytes())
}
