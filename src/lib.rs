//! ptyhost - pseudoterminal engine
//!
//! Spawns a program attached to a pseudoterminal (a POSIX PTY pair on Unix,
//! a ConPTY pseudo-console on Windows) and exposes its output as data events
//! and its termination as a single exit event.
//!
//! - `backend`: platform PTY creation, process launch and control
//! - `io`: reader and writer threads
//! - `watcher`: child exit detection
//! - `events`: ordered subscriptions for data and exit
//! - `console_list`: console process list helper (Windows)
//!
//! ```no_run
//! use ptyhost::{PtyData, SpawnOptions};
//!
//! let pty = ptyhost::spawn("echo", &["hello"], &SpawnOptions::default())?;
//! pty.on_data(|data: &PtyData| print!("{}", data.as_text().unwrap_or_default()));
//! pty.on_exit(|exit| println!("exited with {}", exit.exit_code));
//! # Ok::<(), ptyhost::PtyError>(())
//! ```

pub mod backend;
pub mod console_list;
pub mod encoding;
pub mod error;
pub mod events;
pub mod flow;
pub mod io;
pub mod options;
pub mod pty;
pub mod resolve;
pub mod size;
pub mod watcher;

pub use encoding::{Decoder, Encoding};
pub use error::{PtyError, PtyResult, SpawnStage};
pub use events::{Disposable, ExitResult, PtyData};
pub use flow::FlowState;
pub use options::SpawnOptions;
pub use pty::{Pty, PtyCommand};
pub use size::WindowSize;

/// Spawn `file` with `args` on a new pseudoterminal
pub fn spawn<S: AsRef<str>>(file: &str, args: &[S], options: &SpawnOptions) -> PtyResult<Pty> {
    Pty::spawn(file, args, options)
}
