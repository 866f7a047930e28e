//! The ACME extractor pass.
//!
//! A visitor walks the parsed tree, interprets the `acme_*` directives
//! (removing them as it goes), classifies `server` blocks as plaintext
//! and/or TLS, and collects one issuance plan per HTTPS server block and
//! per `acme` block. Account and issuance settings inherit downwards
//! through `http`/`server`/`acme` scopes via clone-on-push stacks.
//!
//! After the walk, [`prepare`] injects the HTTP-01 challenge location into
//! every plaintext server, patches in certificate paths where the files
//! already exist, and defers whole server blocks whose certificates have
//! yet to be issued so the dumped config stays loadable.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::debug;

use acmehugger_acme::{Account, CertPaths, ChallengeType, Dirs, IssueOptions, KeyType};
use acmehugger_conf::{Flow, NodeId, Tree, TreeData, Visitor};

/// Everything the orchestrator needs to keep one HTTPS server block
/// certified: the domain set, the resolved scopes, and the AST sites to
/// patch after issuance.
pub struct ServerPlan {
    pub block: NodeId,
    pub domains: Vec<String>,
    pub acct: Account,
    pub opts: IssueOptions,
    /// Whether the block also listens in plaintext (dual stack).
    pub http: bool,
    sites: Mutex<SslSites>,
}

#[derive(Default)]
struct SslSites {
    certificate: Option<NodeId>,
    certificate_key: Option<NodeId>,
    trusted_certificate: Option<NodeId>,
    deferred_block: Option<NodeId>,
}

impl ServerPlan {
    /// Un-defer everything in the block and point the ssl directives at
    /// the live certificate paths. Called under the tree lock.
    pub fn apply_certificate(&self, data: &mut TreeData, paths: &CertPaths) {
        let mut sites = self.sites.lock();
        if let Some(wrapper) = sites.deferred_block.take() {
            data.undefer(wrapper);
        }
        if let Some(block) = data.as_block(self.block) {
            let children = block.children.clone();
            for child in children {
                if data.is_deferred(child) {
                    data.undefer(child);
                }
            }
        }
        ensure_ssl(
            data,
            &mut sites.certificate,
            self.block,
            "ssl_certificate",
            &paths.full_chain_live.to_string_lossy(),
        );
        ensure_ssl(
            data,
            &mut sites.certificate_key,
            self.block,
            "ssl_certificate_key",
            &paths.key_live.to_string_lossy(),
        );
        ensure_ssl(
            data,
            &mut sites.trusted_certificate,
            self.block,
            "ssl_trusted_certificate",
            &paths.chain_live.to_string_lossy(),
        );
    }

    /// Hide the whole block from the serializer until the first
    /// certificate arrives.
    fn defer_block(&self, data: &mut TreeData) {
        let wrapper = data.defer_as_is(self.block);
        self.sites.lock().deferred_block = Some(wrapper);
    }
}

fn ensure_ssl(
    data: &mut TreeData,
    site: &mut Option<NodeId>,
    block: NodeId,
    name: &str,
    value: &str,
) {
    match *site {
        Some(id) => data.set_arg(id, 0, value),
        None => {
            let d = data.new_simple(name, &[value]);
            data.push_child(block, d);
            *site = Some(d);
        }
    }
}

/// A standalone `acme { ... }` block: certificates are obtained for its
/// domains but no server block is patched.
pub struct AcmePlan {
    pub domains: Vec<String>,
    pub acct: Account,
    pub opts: IssueOptions,
}

/// The extractor's output: the plans plus the injected challenge state.
pub struct AcmeMaterial {
    pub server_plans: Vec<Arc<ServerPlan>>,
    pub acme_plans: Vec<Arc<AcmePlan>>,
}

/// Per-`server`-block scratch state while the visitor is inside it.
#[derive(Default)]
struct ServerScope {
    http: bool,
    https: bool,
    domains: Vec<String>,
    domains_from_acme: bool,
    ssl_certificate: Option<NodeId>,
    ssl_certificate_key: Option<NodeId>,
    ssl_trusted_certificate: Option<NodeId>,
}

#[derive(Default)]
struct AcmeScope {
    domains: Vec<String>,
}

struct PlanDraft {
    block: NodeId,
    scope: ServerScope,
    acct: Account,
    opts: IssueOptions,
}

#[derive(Default)]
struct AcmeExtractor {
    block_depth: usize,
    /// Blocks that pushed a scope, so end hooks pop exactly what begin
    /// hooks pushed.
    scoped_blocks: Vec<NodeId>,
    acct_stack: Vec<Account>,
    opts_stack: Vec<IssueOptions>,
    server: Option<ServerScope>,
    acme: Option<AcmeScope>,
    http_block: Option<NodeId>,
    http_servers: Vec<NodeId>,
    https_servers: Vec<PlanDraft>,
    acme_plans: Vec<AcmePlan>,
    has_http01: bool,
}

impl AcmeExtractor {
    /// Top of the inherited account scope. The stacks are seeded in
    /// `tree_begin` and popped only by the block that pushed them.
    fn acct(&mut self) -> &mut Account {
        self.acct_stack.last_mut().expect("scope stack")
    }

    fn opts(&mut self) -> &mut IssueOptions {
        self.opts_stack.last_mut().expect("scope stack")
    }
}

impl Visitor for AcmeExtractor {
    fn tree_begin(&mut self, _data: &mut TreeData) -> Result<Flow> {
        self.acct_stack = vec![Account::default()];
        self.opts_stack = vec![IssueOptions::default()];
        Ok(Flow::Continue)
    }

    fn block_begin(&mut self, data: &mut TreeData, block: NodeId) -> Result<Flow> {
        self.block_depth += 1;
        if self.block_depth >= 3 {
            return Ok(Flow::SkipLevel);
        }
        let name = data.name(block).to_string();
        match name.as_str() {
            "http" | "server" | "acme" => {
                let acct = self.acct_stack.last().expect("scope stack").clone();
                self.acct_stack.push(acct);
                let opts = self.opts_stack.last().expect("scope stack").clone();
                self.opts_stack.push(opts);
                self.scoped_blocks.push(block);
            }
            _ => return Ok(Flow::SkipLevel),
        }
        match name.as_str() {
            "server" => self.server = Some(ServerScope::default()),
            "acme" => self.acme = Some(AcmeScope::default()),
            _ => {}
        }
        Ok(Flow::Continue)
    }

    fn block_end(&mut self, data: &mut TreeData, block: NodeId) -> Result<Flow> {
        self.block_depth -= 1;
        if self.scoped_blocks.last() != Some(&block) {
            return Ok(Flow::Continue);
        }
        self.scoped_blocks.pop();
        let acct = self.acct_stack.pop().expect("scope stack");
        let opts = self.opts_stack.pop().expect("scope stack");
        let name = data.name(block).to_string();
        match name.as_str() {
            "http" => {
                self.http_block = Some(block);
            }
            "server" => {
                let scope = self.server.take().unwrap_or_default();
                if scope.http {
                    self.http_servers.push(block);
                }
                if scope.https && !scope.domains.is_empty() {
                    if opts.challenge == ChallengeType::Http {
                        self.has_http01 = true;
                    }
                    self.https_servers.push(PlanDraft {
                        block,
                        scope,
                        acct,
                        opts,
                    });
                }
            }
            "acme" => {
                let scope = self.acme.take().unwrap_or_default();
                if opts.challenge == ChallengeType::Http {
                    self.has_http01 = true;
                }
                self.acme_plans.push(AcmePlan {
                    domains: scope.domains,
                    acct,
                    opts,
                });
                data.delete(block);
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }

    fn directive(&mut self, data: &mut TreeData, id: NodeId) -> Result<Flow> {
        let (name, args) = match data.as_simple(id) {
            Some(d) => (d.name.clone(), d.args.clone()),
            None => return Ok(Flow::Continue),
        };
        match name.as_str() {
            "listen" => {
                if let Some(server) = &mut self.server {
                    if has_ssl_arg(&args) {
                        server.https = true;
                    } else {
                        server.http = true;
                    }
                }
            }
            "server_name" => {
                let Some(server) = &mut self.server else {
                    return Ok(Flow::Continue);
                };
                if server.domains_from_acme {
                    return Ok(Flow::Continue);
                }
                let args = data.one_plus_args(id)?;
                let mut domains = Vec::with_capacity(args.len());
                for domain in args {
                    if domain.is_empty() {
                        continue;
                    }
                    if domain.starts_with('~') {
                        return Ok(Flow::Continue);
                    }
                    domains.push(domain);
                }
                server.domains = domains;
            }
            "acme_email" => {
                let email = data.one_arg(id)?;
                self.acct().email = email;
                data.delete(id);
            }
            "acme_server" => {
                let server = data.one_arg(id)?;
                self.acct().server = server;
                data.delete(id);
            }
            "acme_staging" => {
                let on = data.bool_arg(id)?;
                self.acct().staging = on;
                data.delete(id);
            }
            "acme_challenge" => {
                let s = data.one_arg(id)?;
                let challenge = ChallengeType::parse(&s)?;
                self.opts().challenge = challenge;
                data.delete(id);
            }
            "acme_days" => {
                let days = data.int_arg(id)?;
                self.opts().days = Some(days);
                data.delete(id);
            }
            "acme_key" => {
                let s = data.one_arg(id)?;
                let key_type = KeyType::parse(&s)?;
                self.acct().key_type = key_type;
                self.opts().key_type = key_type;
                data.delete(id);
            }
            "acme_dns" => {
                let name = data.one_arg(id)?;
                self.opts().dns.name = name;
                data.delete(id);
            }
            "acme_dns_option" => {
                let (k, v) = data.two_args(id)?;
                self.opts().dns.options.insert(k, v);
                data.delete(id);
            }
            "acme_domain" => {
                if self.acme.is_none() && self.server.is_none() {
                    return Ok(Flow::Continue);
                }
                let domains = data.one_plus_args(id)?;
                if let Some(acme) = &mut self.acme {
                    acme.domains = domains;
                } else if let Some(server) = &mut self.server {
                    server.domains = domains;
                    server.domains_from_acme = true;
                }
                data.delete(id);
            }
            "acme_defer" => {
                data.one_plus_args(id)?;
                let wrapper = data.defer(id);
                if data.name(wrapper) == "listen" {
                    match &mut self.server {
                        Some(server) => {
                            if has_ssl_arg(data.args(wrapper)) {
                                server.https = true;
                            } else {
                                server.http = true;
                            }
                        }
                        None => {
                            debug!(location = %data.location(wrapper), "deferred listen outside a server block, ignored");
                        }
                    }
                }
            }
            "ssl_certificate" => {
                if let Some(server) = &mut self.server {
                    server.ssl_certificate = Some(id);
                }
            }
            "ssl_certificate_key" => {
                if let Some(server) = &mut self.server {
                    server.ssl_certificate_key = Some(id);
                }
            }
            "ssl_trusted_certificate" => {
                if let Some(server) = &mut self.server {
                    server.ssl_trusted_certificate = Some(id);
                }
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }
}

fn has_ssl_arg(args: &[String]) -> bool {
    args.iter().skip(1).any(|a| a == "ssl")
}

/// Run the extractor over `tree` and apply the post-visit fixups.
pub fn prepare(tree: &Tree, dirs: &Dirs) -> Result<AcmeMaterial> {
    let mut extractor = AcmeExtractor::default();
    tree.accept(&mut extractor)?;

    if extractor.has_http01 {
        tree.change(|data| {
            let http_block = match extractor.http_block {
                Some(block) => block,
                None => {
                    let block = data.new_block("http", &[], Vec::new());
                    let root = data.root();
                    data.push_config_child(root, block);
                    block
                }
            };
            if extractor.http_servers.is_empty() {
                let block = data.new_block("server", &[], Vec::new());
                data.push_child(http_block, block);
                extractor.http_servers.push(block);
            }
            let challenge_dir = dirs.challenge.to_string_lossy().into_owned();
            for &server in &extractor.http_servers {
                let root_d = data.new_simple("root", &[challenge_dir.as_str()]);
                let location = data.new_block(
                    "location",
                    &["/.well-known/acme-challenge/"],
                    vec![root_d],
                );
                data.push_child(server, location);
            }
        });
    }

    let mut server_plans = Vec::with_capacity(extractor.https_servers.len());
    for draft in extractor.https_servers {
        let paths = draft.acct.cert_paths(dirs, &draft.scope.domains[0])?;
        let exist = paths.exist()?;
        let plan = ServerPlan {
            block: draft.block,
            domains: draft.scope.domains.clone(),
            acct: draft.acct,
            opts: draft.opts,
            http: draft.scope.http,
            sites: Mutex::new(SslSites {
                certificate: draft.scope.ssl_certificate,
                certificate_key: draft.scope.ssl_certificate_key,
                trusted_certificate: draft.scope.ssl_trusted_certificate,
                deferred_block: None,
            }),
        };
        tree.change(|data| {
            if exist {
                plan.apply_certificate(data, &paths);
            } else if !plan.http {
                plan.defer_block(data);
            }
        });
        server_plans.push(Arc::new(plan));
    }

    debug!(
        has_http01 = extractor.has_http01,
        http_servers_len = extractor.http_servers.len(),
        https_servers_len = server_plans.len(),
        "server blocks collected for acme issuing"
    );
    Ok(AcmeMaterial {
        server_plans,
        acme_plans: extractor.acme_plans.into_iter().map(Arc::new).collect(),
    })
}
