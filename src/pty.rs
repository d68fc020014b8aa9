//! The PTY handle
//!
//! [`Pty`] owns one session: the platform backend plus the reader, writer
//! and exit-watcher threads that serve it. Control calls (`resize`, `clear`,
//! `kill`) are serialized per handle.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use crate::backend::{self, LaunchSpec, PtyBackend};
use crate::encoding::Encoding;
use crate::error::PtyResult;
use crate::events::{Disposable, EventHub, ExitResult, PtyData};
use crate::flow::{FlowAction, FlowControl, FlowState};
use crate::io::{spawn_reader, spawn_writer, ReaderContext, WriteQueue};
use crate::options::{inherited_env, SpawnOptions};
use crate::resolve::resolve_executable;
use crate::size::WindowSize;
use crate::watcher::spawn_exit_watcher;

/// A program running on a pseudoterminal
pub struct Pty {
    backend: Arc<dyn PtyBackend>,
    hub: Arc<EventHub>,
    queue: Arc<WriteQueue>,
    flow: FlowControl,
    file: String,
    encoding: Option<Encoding>,
    /// Current geometry; the lock also serializes control operations
    control: Mutex<WindowSize>,
    created_at: SystemTime,
}

impl Pty {
    /// Spawn `file` with `args` on a new PTY
    pub fn spawn<S: AsRef<str>>(file: &str, args: &[S], options: &SpawnOptions) -> PtyResult<Self> {
        let size = options.size();
        size.validate()?;

        let cwd = options.resolve_cwd()?;
        let env = options.child_env();
        let program = resolve_executable(file, &cwd, search_path(&env).as_deref())?;

        let spec = LaunchSpec {
            file: file.to_string(),
            program,
            args: args.iter().map(|a| a.as_ref().to_string()).collect(),
            env,
            cwd,
            size,
            uid: options.uid,
            gid: options.gid,
            utf8: options.encoding == Some(Encoding::Utf8),
            inherit_cursor: options.conpty_inherit_cursor,
        };
        let backend = backend::launch(&spec)?;
        Self::start(backend, file, options, size)
    }

    /// Wire the threads around a running backend
    pub(crate) fn start(
        backend: Arc<dyn PtyBackend>,
        file: &str,
        options: &SpawnOptions,
        size: WindowSize,
    ) -> PtyResult<Self> {
        let hub = EventHub::new();
        let queue = WriteQueue::new();
        let (exit_tx, exit_rx) = mpsc::channel();

        let started = spawn_exit_watcher(backend.clone(), exit_tx)
            .and_then(|_| {
                spawn_reader(ReaderContext {
                    backend: backend.clone(),
                    hub: hub.clone(),
                    encoding: options.encoding,
                    exit_rx,
                    queue: queue.clone(),
                })
            })
            .and_then(|_| spawn_writer(backend.clone(), queue.clone()));
        if let Err(e) = started {
            tracing::warn!(pid = backend.pid(), "failed to start PTY threads: {}", e);
            let _ = backend.kill(None);
            queue.close();
            return Err(e.into());
        }

        Ok(Self {
            backend,
            hub,
            queue,
            flow: FlowControl::new(
                options.handle_flow_control,
                options.flow_control_pause.as_bytes(),
                options.flow_control_resume.as_bytes(),
            ),
            file: file.to_string(),
            encoding: options.encoding,
            control: Mutex::new(size),
            created_at: SystemTime::now(),
        })
    }

    fn control(&self) -> MutexGuard<'_, WindowSize> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Process id of the spawned program
    pub fn pid(&self) -> u32 {
        self.backend.pid()
    }

    pub fn cols(&self) -> u16 {
        self.control().cols
    }

    pub fn rows(&self) -> u16 {
        self.control().rows
    }

    pub fn size(&self) -> WindowSize {
        *self.control()
    }

    /// Name of the program currently in the foreground of the terminal
    ///
    /// Queried on every call; falls back to the spawned file name.
    pub fn process(&self) -> String {
        self.backend
            .foreground_process()
            .unwrap_or_else(|| self.file.clone())
    }

    /// The file name passed to spawn
    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    pub fn handle_flow_control(&self) -> bool {
        self.flow.is_enabled()
    }

    pub fn set_handle_flow_control(&self, enabled: bool) {
        self.flow.set_enabled(enabled);
    }

    pub fn flow_state(&self) -> FlowState {
        self.queue.state()
    }

    /// How the child ended, once the exit event has fired
    pub fn exit_status(&self) -> Option<ExitResult> {
        self.hub.exit_result()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    pub fn on_data<F>(&self, listener: F) -> Disposable
    where
        F: Fn(&PtyData) + Send + Sync + 'static,
    {
        self.hub.on_data(listener)
    }

    pub fn on_exit<F>(&self, listener: F) -> Disposable
    where
        F: Fn(&ExitResult) + Send + Sync + 'static,
    {
        self.hub.on_exit(listener)
    }

    /// Change the terminal geometry
    ///
    /// Zero dimensions fail and leave the current size in place.
    pub fn resize(&self, cols: u16, rows: u16) -> PtyResult<()> {
        let new_size = WindowSize::checked(cols, rows)?;
        let mut size = self.control();
        if size.same_cells(&new_size) {
            return Ok(());
        }
        self.backend.resize(new_size)?;
        *size = new_size;
        Ok(())
    }

    /// Reset the terminal's screen buffer (console platform only)
    pub fn clear(&self) -> PtyResult<()> {
        let _control = self.control();
        self.backend.clear()
    }

    /// Send text to the child, encoded with the configured encoding
    pub fn write(&self, data: &str) {
        match self.encoding {
            Some(encoding) => self.write_bytes(&encoding.encode(data)),
            None => self.write_bytes(data.as_bytes()),
        }
    }

    /// Send raw bytes to the child
    ///
    /// With flow control enabled, a write that is exactly the pause or resume
    /// sequence toggles forwarding and is not sent.
    pub fn write_bytes(&self, data: &[u8]) {
        match self.flow.classify(data) {
            FlowAction::Pause => self.queue.pause(),
            FlowAction::Resume => self.queue.resume(),
            FlowAction::Forward => {
                if !self.queue.push(data.to_vec()) {
                    tracing::debug!(pid = self.pid(), "dropping write after exit");
                }
            },
        }
    }

    /// Terminate the child; a no-op once it has exited
    ///
    /// On the fork platform `signal` names the signal sent to the child's
    /// process group (default `SIGHUP`). The console platform only supports
    /// unconditional termination.
    pub fn kill(&self, signal: Option<&str>) -> PtyResult<()> {
        let _control = self.control();
        self.backend.kill(signal)
    }

    /// Stop forwarding queued writes
    pub fn pause(&self) {
        self.queue.pause();
    }

    /// Resume forwarding queued writes
    pub fn resume(&self) {
        self.queue.resume();
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        if !self.has_exited() {
            if let Err(e) = self.backend.kill(None) {
                tracing::debug!(pid = self.pid(), "kill on drop failed: {}", e);
            }
        }
        self.queue.close();
    }
}

impl std::fmt::Debug for Pty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pty")
            .field("pid", &self.pid())
            .field("file", &self.file)
            .field("size", &self.size())
            .field("exit", &self.exit_status())
            .finish()
    }
}

/// `PATH` as the child will see it
fn search_path(env: &[(String, String)]) -> Option<OsString> {
    env.iter()
        .find(|(k, _)| {
            if cfg!(windows) {
                k.eq_ignore_ascii_case("PATH")
            } else {
                k == "PATH"
            }
        })
        .map(|(_, v)| OsString::from(v))
}

/// Builder for spawning a program on a PTY
#[derive(Debug, Clone)]
pub struct PtyCommand {
    file: String,
    args: Vec<String>,
    options: SpawnOptions,
}

impl PtyCommand {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            args: Vec::new(),
            options: SpawnOptions::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replace all options at once
    pub fn options(mut self, options: SpawnOptions) -> Self {
        self.options = options;
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.options = self.options.with_size(cols, rows);
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.options = self.options.with_cwd(dir);
        self
    }

    /// Set one variable, starting from the inherited environment
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options
            .env
            .get_or_insert_with(inherited_env)
            .insert(key.into(), value.into());
        self
    }

    /// Use exactly these variables (plus `TERM`)
    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.options = self.options.with_env(env);
        self
    }

    pub fn term_name(mut self, name: impl Into<String>) -> Self {
        self.options.name = name.into();
        self
    }

    pub fn encoding(mut self, encoding: Option<Encoding>) -> Self {
        self.options = self.options.with_encoding(encoding);
        self
    }

    pub fn flow_control(mut self, enabled: bool) -> Self {
        self.options = self.options.with_flow_control(enabled);
        self
    }

    pub fn spawn(&self) -> PtyResult<Pty> {
        Pty::spawn(&self.file, &self.args, &self.options)
    }
}
