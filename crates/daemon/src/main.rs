//! `nginxh` entry point.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match acmehugger::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
