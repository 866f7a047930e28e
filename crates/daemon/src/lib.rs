//! The `nginxh` daemon: parse nginx's config, keep its certificates
//! issued, and supervise the server across reloads.
//!
//! The render cycle is: parse (or reparse) the config tree, run the ACME
//! extractor over it, start or reload nginx against the dumped tree, then
//! sit in the event loop reloading and running hooks as certificates
//! change. SIGHUP stops the orchestrator and starts the cycle over.

use std::env;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use acmehugger_acme::{call_hooks, AcmeHandler, Dirs, HookInfo, Issuers};
use acmehugger_common::clock::{Clock, SystemClock};
use acmehugger_conf::Tree;

pub mod cli;
pub mod extract;
pub mod instance;
pub mod orchestrate;

use instance::Instance;
use orchestrate::{AcmeProcessor, PlanKind};

/// Config used when `-c` is absent.
pub const DEFAULT_CONF: &str = "/etc/nginx/nginx.conf";
/// Directory relative include targets resolve against.
pub const CONF_DIR: &str = "/etc/nginx";
/// Where rewritten configs are dumped.
pub const CONF_OUT_DIR: &str = "/var/lib/acmehugger/nginx";

/// Run the wrapper until the nginx child exits (which exits the process)
/// or startup fails.
pub async fn run() -> Result<()> {
    init_logging();

    let argv: Vec<String> = env::args().skip(1).collect();
    let parsed = cli::parse_args(&env::var("NGINXBIN").unwrap_or_default(), &argv)?;
    if parsed.args.len() == 1 && parsed.args[0] == "-h" {
        print!(
            "nginxh version: {} {}/{}\n\
             Usage: nginxh [nginx option] ...\n\
             \n\
             Run 'nginx -h' for more information on nginx options.\n",
            env!("CARGO_PKG_VERSION"),
            env::consts::OS,
            env::consts::ARCH,
        );
        return Ok(());
    }
    debug!(conf = %parsed.conf.display(), bin = %parsed.bin, args = ?parsed.args, "nginx args parsed");

    let dirs = Dirs::default();
    let handler = Arc::new(AcmeHandler::new(&dirs.challenge));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let issuers = Arc::new(Issuers::new(handler, clock.clone(), dirs.clone()));

    let mut hup = signal(SignalKind::hangup())?;
    let mut tree: Option<Arc<Tree>> = None;
    let mut inst: Option<Instance> = None;
    loop {
        let cycle = render(
            &mut tree,
            &mut inst,
            &parsed,
            &dirs,
            &issuers,
            &clock,
            &mut hup,
        )
        .await;
        if let Err(e) = cycle {
            error!(error = %e, "failed to reload config");
            hup.recv().await;
        }
    }
}

/// One render cycle: (re)parse, extract, start or reload nginx, then
/// drain change events until SIGHUP asks for the next cycle.
async fn render(
    tree_slot: &mut Option<Arc<Tree>>,
    inst_slot: &mut Option<Instance>,
    parsed: &cli::NginxArgs,
    dirs: &Dirs,
    issuers: &Arc<Issuers>,
    clock: &Arc<dyn Clock>,
    hup: &mut tokio::signal::unix::Signal,
) -> Result<()> {
    let tree = match tree_slot {
        None => {
            let tree = Arc::new(acmehugger_conf::parse(&parsed.conf, CONF_DIR)?);
            *tree_slot = Some(tree.clone());
            tree
        }
        Some(tree) => {
            tree.reparse()?;
            tree.clone()
        }
    };
    let material = extract::prepare(&tree, dirs)?;
    let processor = AcmeProcessor::new(tree.clone(), material, issuers.clone(), clock.clone());

    let out_dir = Path::new(CONF_OUT_DIR);
    let inst: &Instance = match inst_slot {
        Some(inst) => {
            inst.reload(Some(&tree), out_dir)?;
            inst
        }
        None => {
            let (inst, mut child) = Instance::start(&tree, out_dir, &parsed.bin, &parsed.args)?;
            tokio::spawn(async move {
                let status = child.wait().await;
                let code = match &status {
                    Ok(status) => {
                        if status.success() {
                            error!(
                                "nginx exited unexpectedly, did you forget to specify -g \"daemon off;\"?"
                            );
                        } else {
                            error!(%status, "nginx exited unexpectedly");
                        }
                        instance::exit_code(status)
                    }
                    Err(e) => {
                        error!(error = %e, "failed to wait for nginx");
                        1
                    }
                };
                std::process::exit(if code == 0 { 1 } else { code });
            });
            inst_slot.insert(inst)
        }
    };

    let mut changed = processor.process();
    loop {
        tokio::select! {
            Some(info) = changed.recv() => {
                if info.kind == PlanKind::Server {
                    let reloaded = if info.tree_changed {
                        inst.reload(Some(&tree), out_dir)
                    } else {
                        inst.reload(None, out_dir)
                    };
                    if let Err(e) = reloaded {
                        error!(error = %e, "failed to reload nginx");
                        continue;
                    }
                }
                let hook_info = HookInfo {
                    server: info.server,
                    email: info.email,
                    domains: info.domains,
                };
                if let Err(e) = call_hooks(&dirs.hooks, &hook_info).await {
                    error!(error = %e, "failed to run hooks");
                }
            }
            _ = hup.recv() => {
                debug!("SIGHUP received, reloading config");
                processor.stop();
                return Ok(());
            }
        }
    }
}

fn init_logging() {
    let default_level = if env::var_os("ACMEHUGGER_DEBUG").is_some_and(|v| !v.is_empty()) {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
