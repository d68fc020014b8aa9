//! Platform backends
//!
//! Each platform provides one [`PtyBackend`] implementation: the fork-oriented
//! one in `unix` and the ConPTY one in `windows`. [`launch`] picks the variant
//! for the running OS; nothing above this module branches on the platform.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PtyResult;
use crate::events::ExitResult;
use crate::size::WindowSize;

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

/// Outcome of one bounded read from the controlling side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were placed at the start of the buffer
    Data(usize),
    /// Nothing arrived before the timeout
    Idle,
    /// The subordinate side is gone; no more data will arrive
    Closed,
}

/// Everything a backend needs to start the child
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Name the caller asked for, used in error messages
    pub file: String,
    /// Resolved path of the executable
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub size: WindowSize,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Mark the terminal as UTF-8 capable (fork platform)
    pub utf8: bool,
    /// Keep cursor state across the pseudo-console attach (console platform)
    pub inherit_cursor: bool,
}

/// Capabilities of one live PTY session
///
/// All methods take `&self`; the reader, writer and exit-watcher threads
/// share a backend through an `Arc`.
pub trait PtyBackend: Send + Sync {
    /// Process id of the spawned program
    fn pid(&self) -> u32;

    /// Read available output, waiting at most `timeout` for some to arrive
    fn read(&self, buf: &mut [u8], timeout: Duration) -> PtyResult<ReadOutcome>;

    /// Write some of `data`; `Ok(0)` means the device would block
    fn write(&self, data: &[u8]) -> PtyResult<usize>;

    /// Wait until a write could make progress
    fn wait_writable(&self, timeout: Duration) -> PtyResult<bool>;

    fn resize(&self, size: WindowSize) -> PtyResult<()>;

    fn clear(&self) -> PtyResult<()>;

    /// Terminate the child; `signal` is a name such as `"SIGTERM"`
    fn kill(&self, signal: Option<&str>) -> PtyResult<()>;

    /// Block until the child terminates and decode how it ended
    fn wait(&self) -> PtyResult<ExitResult>;

    /// Name of the program in the foreground of the terminal, if known
    fn foreground_process(&self) -> Option<String>;

    /// Release OS resources that would otherwise keep the session open
    fn release(&self) {}
}

/// Create the PTY and start the child on the native backend
pub fn launch(spec: &LaunchSpec) -> PtyResult<Arc<dyn PtyBackend>> {
    #[cfg(unix)]
    {
        Ok(Arc::new(unix::UnixBackend::spawn(spec)?))
    }
    #[cfg(windows)]
    {
        Ok(Arc::new(windows::ConptyBackend::spawn(spec)?))
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = spec;
        Err(crate::error::PtyError::platform_unsupported())
    }
}
