//! Console process list queries
//!
//! A process can be attached to at most one console, and the host process
//! usually owns its own. Listing the processes attached to a pseudo-console
//! therefore happens in a short-lived helper process (`ptyhost-console-list`)
//! that attaches to the target console, prints one JSON line and exits.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{ChildStdout, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PtyError, PtyResult};

/// Overrides the helper location
pub const AGENT_ENV_VAR: &str = "PTYHOST_CONSOLE_LIST_AGENT";

/// File name of the helper binary, without the platform suffix
pub const AGENT_NAME: &str = "ptyhost-console-list";

/// How long to wait for the helper's reply before giving up on it
pub const AGENT_TIMEOUT: Duration = Duration::from_secs(5);

/// The single message the helper prints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleListReply {
    /// Process ids attached to the console, as the console reports them
    #[serde(default)]
    pub console_process_list: Vec<u32>,
    /// Image name of the most recently attached process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConsoleListReply {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// How to start the helper
#[derive(Debug, Clone)]
pub struct ConsoleListAgent {
    program: PathBuf,
    leading_args: Vec<String>,
    timeout: Duration,
}

impl ConsoleListAgent {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            timeout: AGENT_TIMEOUT,
        }
    }

    /// Helper started as `program leading_args... <pid>`
    pub fn with_args(program: impl Into<PathBuf>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
            timeout: AGENT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Find the helper: `$PTYHOST_CONSOLE_LIST_AGENT`, else next to the current executable
    pub fn locate() -> PtyResult<Self> {
        if let Some(program) = std::env::var_os(AGENT_ENV_VAR) {
            return Ok(Self::new(program));
        }
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| PtyError::ConsoleQuery("cannot locate helper directory".to_string()))?;
        let mut candidates = vec![dir.to_path_buf()];
        // Test and example binaries live one level below the build directory
        if let Some(parent) = dir.parent() {
            candidates.push(parent.to_path_buf());
        }
        let name = format!("{}{}", AGENT_NAME, std::env::consts::EXE_SUFFIX);
        candidates
            .into_iter()
            .map(|dir| dir.join(&name))
            .find(|path| path.is_file())
            .map(Self::new)
            .ok_or_else(|| {
                PtyError::ConsoleQuery(format!("helper {} not found next to {}", name, exe.display()))
            })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run the helper against `pid` and return its reply
    ///
    /// The helper is always waited for, also when its reply is missing or
    /// malformed. A helper that stays silent past the timeout is killed.
    pub fn query(&self, pid: u32) -> PtyResult<ConsoleListReply> {
        let mut child = Command::new(&self.program)
            .args(&self.leading_args)
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                PtyError::ConsoleQuery(format!(
                    "failed to start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let line = match child.stdout.take() {
            Some(stdout) => self.read_reply(stdout, pid),
            None => Err(PtyError::ConsoleQuery("helper stdout unavailable".to_string())),
        };
        if line.is_err() {
            let _ = child.kill();
        }
        match child.wait() {
            Ok(status) if !status.success() => {
                tracing::warn!(pid, %status, "console list helper exited abnormally");
            },
            Ok(_) => {},
            Err(e) => tracing::warn!(pid, "failed to reap console list helper: {}", e),
        }

        let line = line?;
        let reply: ConsoleListReply = serde_json::from_str(line.trim())
            .map_err(|e| PtyError::ConsoleQuery(format!("malformed helper reply: {}", e)))?;
        match reply.error {
            Some(reason) => Err(PtyError::ConsoleQuery(reason)),
            None => Ok(reply),
        }
    }

    /// Name of the program in the foreground of the console `pid` belongs to
    pub fn foreground_process_name(&self, pid: u32) -> PtyResult<String> {
        self.query(pid)?
            .process_name
            .ok_or_else(|| PtyError::ConsoleQuery(format!("no process attached to console of {}", pid)))
    }
}

impl ConsoleListAgent {
    /// Read the reply line on a side thread so the wait can be bounded
    fn read_reply(&self, stdout: ChildStdout, pid: u32) -> PtyResult<String> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("console-list-{}", pid))
            .spawn(move || {
                let _ = tx.send(read_reply_line(stdout));
            })?;
        match rx.recv_timeout(self.timeout) {
            Ok(line) => line,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(PtyError::ConsoleQuery(format!(
                "helper did not reply within {:?}",
                self.timeout
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(PtyError::ConsoleQuery("helper reply reader stopped".to_string()))
            },
        }
    }
}

fn read_reply_line(stdout: ChildStdout) -> PtyResult<String> {
    let mut line = String::new();
    let n = BufReader::new(stdout)
        .read_line(&mut line)
        .map_err(|e| PtyError::ConsoleQuery(format!("failed to read helper reply: {}", e)))?;
    if n == 0 {
        return Err(PtyError::ConsoleQuery("helper exited without a reply".to_string()));
    }
    Ok(line)
}

/// `queryForegroundProcessName` with the default helper
pub fn query_foreground_process_name(pid: u32) -> PtyResult<String> {
    ConsoleListAgent::locate()?.foreground_process_name(pid)
}

/// Body of the helper binary: list the processes on `pid`'s console
pub fn run_agent(pid: u32) -> ConsoleListReply {
    #[cfg(windows)]
    {
        match crate::backend::windows::console_process_list(pid) {
            Ok(list) => {
                let list = without_pid(list, std::process::id());
                let process_name = list
                    .first()
                    .and_then(|&p| crate::backend::windows::process_image_name(p));
                ConsoleListReply {
                    console_process_list: list,
                    process_name,
                    error: None,
                }
            },
            Err(e) => ConsoleListReply::failed(e.to_string()),
        }
    }
    #[cfg(not(windows))]
    {
        ConsoleListReply::failed(format!(
            "console process lists are not available on {} (pid {})",
            std::env::consts::OS,
            pid
        ))
    }
}

/// Drop `own` from a console list; attaching to read the list puts the
/// helper itself on it, usually in first place
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn without_pid(mut list: Vec<u32>, own: u32) -> Vec<u32> {
    list.retain(|&p| p != own);
    list
}
