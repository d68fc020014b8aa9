//! ptyhost-console-list - report the processes attached to a console
//!
//! Usage: `ptyhost-console-list <pid>`. Prints one JSON line of the form
//! `{"consoleProcessList":[...],"processName":"..."}` (or `{"error":"..."}`)
//! and always exits with status 0.

use std::io::{self, Write};
use std::process::ExitCode;

use ptyhost::console_list::{run_agent, ConsoleListReply};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    // Stdout carries the reply, so logs go to stderr and default to warnings only
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let reply = match std::env::args().nth(1).map(|arg| arg.parse::<u32>()) {
        Some(Ok(pid)) => run_agent(pid),
        Some(Err(e)) => ConsoleListReply::failed(format!("invalid pid: {}", e)),
        None => ConsoleListReply::failed("usage: ptyhost-console-list <pid>"),
    };

    if let Some(error) = &reply.error {
        tracing::warn!("console list query failed: {}", error);
    }

    match serde_json::to_string(&reply) {
        Ok(line) => {
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout, "{}", line);
            let _ = stdout.flush();
        },
        Err(e) => tracing::error!("failed to encode reply: {}", e),
    }
    ExitCode::SUCCESS
}
