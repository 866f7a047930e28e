//! Control of the wrapped nginx process.
//!
//! nginx is started against the dumped config and reloaded with SIGHUP.
//! Only the supervisor owns the instance; renewal tasks ask it to reload
//! through the change-event loop.

use std::path::Path;

use anyhow::{anyhow, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::debug;

use acmehugger_conf::Tree;

/// A running nginx. The child handle is surrendered to the exit watcher;
/// reloads go by pid.
pub struct Instance {
    pid: i32,
}

impl Instance {
    /// Dump `tree` into `out_dir` and start `bin` against the dumped
    /// entry config. Returns the instance and the child to wait on.
    pub fn start(
        tree: &Tree,
        out_dir: &Path,
        bin: &str,
        args: &[String],
    ) -> Result<(Instance, Child)> {
        let name = tree.dump(out_dir)?;
        let child = Command::new(bin).args(args).arg("-c").arg(&name).spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("nginx exited before it could be tracked"))? as i32;
        debug!(pid, bin, ?args, "nginx started");
        Ok((Instance { pid }, child))
    }

    /// Signal nginx to reload, re-dumping the tree first when given one.
    pub fn reload(&self, tree: Option<&Tree>, out_dir: &Path) -> Result<()> {
        if let Some(tree) = tree {
            tree.dump(out_dir)?;
        }
        kill(Pid::from_raw(self.pid), Signal::SIGHUP)?;
        debug!("SIGHUP sent to nginx");
        Ok(())
    }
}

/// Map the child's exit status to the wrapper's exit code. Death by
/// signal counts as failure.
pub fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
