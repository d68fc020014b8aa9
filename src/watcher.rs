//! Exit watcher
//!
//! One thread per PTY blocks in the backend's `wait` and forwards the decoded
//! result to the reader thread, which emits the exit event once the
//! remaining output has been delivered.

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::backend::PtyBackend;
use crate::events::ExitResult;

/// Start waiting for the child; the result is sent exactly once
pub fn spawn_exit_watcher(
    backend: Arc<dyn PtyBackend>,
    tx: Sender<ExitResult>,
) -> std::io::Result<JoinHandle<()>> {
    let pid = backend.pid();
    thread::Builder::new()
        .name(format!("pty-exit-{}", pid))
        .spawn(move || {
            let result = match backend.wait() {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(pid, "waiting for child failed: {}", e);
                    ExitResult::code(-1)
                },
            };
            tracing::debug!(pid, ?result, "child terminated");
            // The reader may already be gone if the session was torn down
            let _ = tx.send(result);
        })
}
