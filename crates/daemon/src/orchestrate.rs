//! The issuance/renewal orchestrator.
//!
//! One task per plan keeps its domain set certified: acquire the CA's
//! issuer, issue or renew, patch the tree on the first success, publish a
//! change event, then sleep until the renewal timer fires. Failures retry
//! after an hour. Change events fan in over an unbounded channel so a
//! slow consumer can never wedge a renewal task; the stop signal
//! terminates every task at its next wait.

use std::sync::Arc;

use chrono::Duration;
use tokio::sync::{mpsc, watch};
use tracing::error;

use acmehugger_acme::{Account, Issuer, Issuers};
use acmehugger_common::clock::Clock;
use acmehugger_conf::Tree;

use crate::extract::{AcmeMaterial, AcmePlan, ServerPlan};

/// Which kind of block a change event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Server,
    Acme,
}

/// One certificate change, as seen by the supervisor.
#[derive(Debug, Clone)]
pub struct AcmeChangeInfo {
    pub kind: PlanKind,
    /// Whether the tree was mutated and must be re-dumped before reload.
    pub tree_changed: bool,
    pub server: String,
    pub email: String,
    pub domains: Vec<String>,
}

pub struct AcmeProcessor {
    tree: Arc<Tree>,
    issuers: Arc<Issuers>,
    clock: Arc<dyn Clock>,
    server_plans: Vec<Arc<ServerPlan>>,
    acme_plans: Vec<Arc<AcmePlan>>,
    stop_tx: watch::Sender<bool>,
}

impl AcmeProcessor {
    pub fn new(
        tree: Arc<Tree>,
        material: AcmeMaterial,
        issuers: Arc<Issuers>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        AcmeProcessor {
            tree,
            issuers,
            clock,
            server_plans: material.server_plans,
            acme_plans: material.acme_plans,
            stop_tx,
        }
    }

    /// Spawn one renewal task per plan. The receiver closes once every
    /// task has terminated after [`stop`](Self::stop).
    pub fn process(&self) -> mpsc::UnboundedReceiver<AcmeChangeInfo> {
        let (tx, rx) = mpsc::unbounded_channel();
        for plan in &self.server_plans {
            tokio::spawn(run_server_plan(
                self.tree.clone(),
                plan.clone(),
                self.issuers.clone(),
                self.clock.clone(),
                tx.clone(),
                self.stop_tx.subscribe(),
            ));
        }
        for plan in &self.acme_plans {
            tokio::spawn(run_acme_plan(
                plan.clone(),
                self.issuers.clone(),
                self.clock.clone(),
                tx.clone(),
                self.stop_tx.subscribe(),
            ));
        }
        rx
    }

    /// Terminate every plan task at its next wait. An in-flight issuance
    /// is not interrupted; its result is discarded.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

async fn run_server_plan(
    tree: Arc<Tree>,
    plan: Arc<ServerPlan>,
    issuers: Arc<Issuers>,
    clock: Arc<dyn Clock>,
    tx: mpsc::UnboundedSender<AcmeChangeInfo>,
    mut stop: watch::Receiver<bool>,
) {
    let Some(issuer) = acquire_issuer(&issuers, &plan.acct, &clock, &mut stop).await else {
        return;
    };
    let mut first_run = true;
    loop {
        let info = match issuer.issue(&plan.domains, &plan.opts).await {
            Ok(info) => info,
            Err(e) => {
                error!(error = %e, "failed to issue, retry in an hour");
                if !hour_passed(&clock, &mut stop).await {
                    return;
                }
                continue;
            }
        };
        if info.changed {
            let tree_changed = first_run;
            if first_run {
                tree.change(|data| plan.apply_certificate(data, &info.paths));
            }
            let hacct = issuer.handler_account();
            let _ = tx.send(AcmeChangeInfo {
                kind: PlanKind::Server,
                tree_changed,
                server: hacct.server.clone(),
                email: hacct.email.clone(),
                domains: plan.domains.clone(),
            });
        }
        first_run = false;

        tokio::select! {
            _ = stop.changed() => return,
            _ = info.renew_timer.wait() => {}
        }
    }
}

async fn run_acme_plan(
    plan: Arc<AcmePlan>,
    issuers: Arc<Issuers>,
    clock: Arc<dyn Clock>,
    tx: mpsc::UnboundedSender<AcmeChangeInfo>,
    mut stop: watch::Receiver<bool>,
) {
    let Some(issuer) = acquire_issuer(&issuers, &plan.acct, &clock, &mut stop).await else {
        return;
    };
    loop {
        let info = match issuer.issue(&plan.domains, &plan.opts).await {
            Ok(info) => info,
            Err(e) => {
                error!(error = %e, "failed to issue, retry in an hour");
                if !hour_passed(&clock, &mut stop).await {
                    return;
                }
                continue;
            }
        };
        if info.changed {
            let hacct = issuer.handler_account();
            let _ = tx.send(AcmeChangeInfo {
                kind: PlanKind::Acme,
                tree_changed: false,
                server: hacct.server.clone(),
                email: hacct.email.clone(),
                domains: plan.domains.clone(),
            });
        }

        tokio::select! {
            _ = stop.changed() => return,
            _ = info.renew_timer.wait() => {}
        }
    }
}

/// Retry [`Issuers::get`] hourly until it succeeds or the stop signal
/// fires.
async fn acquire_issuer(
    issuers: &Issuers,
    acct: &Account,
    clock: &Arc<dyn Clock>,
    stop: &mut watch::Receiver<bool>,
) -> Option<Arc<Issuer>> {
    loop {
        match issuers.get(acct).await {
            Ok(issuer) => return Some(issuer),
            Err(e) => {
                error!(error = %e, "failed to prepare issuing, retry in an hour");
                if !hour_passed(clock, stop).await {
                    return None;
                }
            }
        }
    }
}

/// Wait out the hourly retry delay. False means the stop signal fired
/// first.
async fn hour_passed(clock: &Arc<dyn Clock>, stop: &mut watch::Receiver<bool>) -> bool {
    let timer = clock.timer(Duration::hours(1));
    tokio::select! {
        _ = stop.changed() => false,
        _ = timer.wait() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicI32, Ordering};

    use acmehugger_acme::{
        Cert, Dirs, Handler, HandlerAccount, IssueOptions, DEFAULT_DAYS,
    };
    use acmehugger_common::clock::MockClock;

    use crate::extract::prepare;

    /// Mints certificates that live `DEFAULT_DAYS + 1` days from the mock
    /// clock's now, and can be told to fail the next N issue calls.
    struct MintingHandler {
        clock: Arc<MockClock>,
        fail_next: AtomicI32,
        issue_calls: AtomicI32,
    }

    impl MintingHandler {
        fn new(clock: Arc<MockClock>) -> Arc<Self> {
            Arc::new(MintingHandler {
                clock,
                fail_next: AtomicI32::new(0),
                issue_calls: AtomicI32::new(0),
            })
        }
    }

    #[async_trait]
    impl Handler for MintingHandler {
        async fn create_account(&self, acct: &mut HandlerAccount) -> anyhow::Result<()> {
            acct.url = "acct-url".into();
            Ok(())
        }

        async fn update_account(&self, _acct: &mut HandlerAccount) -> anyhow::Result<()> {
            Ok(())
        }

        async fn recover_account(&self, _acct: &mut HandlerAccount) -> anyhow::Result<()> {
            Ok(())
        }

        async fn issue(
            &self,
            _acct: &HandlerAccount,
            domains: &[String],
            _opts: &IssueOptions,
        ) -> anyhow::Result<Cert> {
            self.issue_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.fetch_sub(1, Ordering::SeqCst) > 0 {
                anyhow::bail!("the CA is unhappy");
            }
            self.fail_next.store(0, Ordering::SeqCst);
            let not_after = self.clock.now() + Duration::days(DEFAULT_DAYS + 1);
            let key = rcgen::KeyPair::generate().unwrap();
            let mut params = rcgen::CertificateParams::new(domains.to_vec()).unwrap();
            params.not_after =
                time::OffsetDateTime::from_unix_timestamp(not_after.timestamp()).unwrap();
            let cert = params.self_signed(&key).unwrap();
            Ok(Cert {
                key: b"key".to_vec(),
                full_chain: cert.pem().into_bytes(),
                chain: b"chain".to_vec(),
                url: "https://ca/cert/1".into(),
            })
        }
    }

    struct Harness {
        _conf_dir: tempfile::TempDir,
        _state: tempfile::TempDir,
        tree: Arc<Tree>,
        dirs: Dirs,
        clock: Arc<MockClock>,
        handler: Arc<MintingHandler>,
        processor: AcmeProcessor,
    }

    fn harness(config: &str) -> Harness {
        let conf_dir = tempfile::TempDir::new().unwrap();
        let state = tempfile::TempDir::new().unwrap();
        let dirs = Dirs {
            challenge: state.path().join("challenge"),
            accounts: state.path().join("accounts"),
            live_certs: state.path().join("live"),
            hooks: state.path().join("hook.d"),
        };
        fs::create_dir_all(&dirs.live_certs).unwrap();

        let main = conf_dir.path().join("nginx.conf");
        fs::write(&main, config).unwrap();
        let tree = Arc::new(acmehugger_conf::parse(&main, conf_dir.path()).unwrap());

        let clock = MockClock::new(DateTime::<Utc>::UNIX_EPOCH);
        let handler = MintingHandler::new(clock.clone());
        let issuers = Arc::new(Issuers::new(handler.clone(), clock.clone(), dirs.clone()));

        let material = prepare(&tree, &dirs).unwrap();
        let processor = AcmeProcessor::new(tree.clone(), material, issuers, clock.clone());
        Harness {
            _conf_dir: conf_dir,
            _state: state,
            tree,
            dirs,
            clock,
            handler,
            processor,
        }
    }

    fn dump_str(tree: &Tree) -> String {
        let out = tempfile::TempDir::new().unwrap();
        let name = tree.dump(out.path()).unwrap();
        fs::read_to_string(name).unwrap()
    }

    async fn wait_for_pending_timer(clock: &MockClock) {
        for _ in 0..2000 {
            if clock.pending_timers() > 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        panic!("no timer was registered");
    }

    const SERVER_CONF: &str = "server {\n\
        \tlisten 443 ssl;\n\
        \tserver_name a.com b.com;\n\
        \tacme_email foo@bar;\n\
        \tacme_server https://example.com/dir;\n\
        \tacme_challenge dns;\n\
        }\n";

    #[tokio::test]
    async fn test_cold_start_issues_patches_and_renews() {
        let h = harness(SERVER_CONF);
        assert_eq!(dump_str(&h.tree), "");

        let mut changed = h.processor.process();
        let info = changed.recv().await.unwrap();
        assert_eq!(info.kind, PlanKind::Server);
        assert!(info.tree_changed);
        assert_eq!(info.server, "https://example.com/dir");
        assert_eq!(info.email, "foo@bar");
        assert_eq!(info.domains, ["a.com", "b.com"]);
        assert_eq!(h.handler.issue_calls.load(Ordering::SeqCst), 1);

        // The account landed on disk.
        let acct_dir = h.dirs.accounts.join("example.com_dir");
        assert!(acct_dir.join("account.key").exists());
        let hacct: HandlerAccount = acmehugger_common::fsutil::read_json(
            &acct_dir.join("account.json"),
        )
        .unwrap();
        assert_eq!(hacct.email, "foo@bar");
        assert_eq!(hacct.url, "acct-url");

        // Certificates and live symlinks exist, named after the first
        // domain.
        let certs = acct_dir.join("certificates");
        for name in ["a.com.key", "a.com.fullchain.crt", "a.com.chain.crt"] {
            assert!(certs.join(name).exists(), "missing {name}");
            assert_eq!(
                fs::read_link(h.dirs.live_certs.join(name)).unwrap(),
                certs.join(name)
            );
        }

        // The re-dumped config now carries the server block with the live
        // certificate paths.
        let got = dump_str(&h.tree);
        assert!(got.contains("listen 443 ssl;"), "got: {got}");
        assert!(
            got.contains(&format!(
                "ssl_certificate {};",
                h.dirs.live_certs.join("a.com.fullchain.crt").display()
            )),
            "got: {got}"
        );
        assert!(
            got.contains(&format!(
                "ssl_certificate_key {};",
                h.dirs.live_certs.join("a.com.key").display()
            )),
            "got: {got}"
        );
        assert!(
            got.contains(&format!(
                "ssl_trusted_certificate {};",
                h.dirs.live_certs.join("a.com.chain.crt").display()
            )),
            "got: {got}"
        );

        // A renewal fires after the window opens; the follow-up event does
        // not claim a tree change.
        h.clock.tick(Duration::days(2));
        let info = changed.recv().await.unwrap();
        assert!(!info.tree_changed);
        assert_eq!(h.handler.issue_calls.load(Ordering::SeqCst), 2);

        h.processor.stop();
        assert!(changed.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_issuance_failures_retry_hourly() {
        let h = harness(SERVER_CONF);
        h.handler.fail_next.store(3, Ordering::SeqCst);

        let mut changed = h.processor.process();
        for _ in 0..3 {
            wait_for_pending_timer(&h.clock).await;
            h.clock.tick(Duration::hours(2));
        }
        let info = changed.recv().await.unwrap();
        assert!(info.tree_changed);
        assert_eq!(h.handler.issue_calls.load(Ordering::SeqCst), 4);

        h.processor.stop();
        assert!(changed.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_acme_blocks_issue_without_tree_changes() {
        let h = harness(
            "http {\n\
             \tserver {\n\
             \t\tlisten 80;\n\
             \t\tserver_name s.com;\n\
             \t}\n\
             }\n\
             acme {\n\
             \tacme_email e@x;\n\
             \tacme_server https://example.com/dir;\n\
             \tacme_domain c.com;\n\
             }\n",
        );
        let mut changed = h.processor.process();
        let info = changed.recv().await.unwrap();
        assert_eq!(info.kind, PlanKind::Acme);
        assert!(!info.tree_changed);
        assert_eq!(info.domains, ["c.com"]);

        h.processor.stop();
        assert!(changed.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_terminates_waiting_tasks() {
        let h = harness(SERVER_CONF);
        let mut changed = h.processor.process();
        let _ = changed.recv().await.unwrap();

        h.processor.stop();
        // The task was parked on its renewal timer; the channel closing
        // proves it exited.
        assert!(changed.recv().await.is_none());
    }
}
