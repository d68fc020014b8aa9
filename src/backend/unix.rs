//! Unix PTY implementation
//!
//! Allocates the terminal pair with `openpty`, forks, makes the subordinate
//! side the child's controlling terminal and executes the target. Failures
//! that happen in the child between fork and exec (chdir, setgid, setuid,
//! exec) are reported back over a close-on-exec pipe, so `spawn` only
//! returns once the target program is actually running.

use std::ffi::{CString, OsStr};
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc::{self, c_char};
use nix::poll::{poll, PollFd, PollFlags};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{killpg, SigSet, SigmaskHow, Signal};
use nix::sys::termios::{
    self, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices,
};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, read, write, ForkResult, Pid};

use super::{LaunchSpec, PtyBackend, ReadOutcome};
use crate::error::{PtyError, PtyResult, SpawnStage};
use crate::events::ExitResult;
use crate::size::WindowSize;

/// Held from the creation of descriptors the child must not inherit until
/// they are marked close-on-exec and the fork is done, so a concurrent spawn
/// never forks while they are still inheritable
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

fn spawn_lock() -> MutexGuard<'static, ()> {
    SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// A controlling/subordinate descriptor pair without a process attached
#[derive(Debug)]
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
    /// Device path of the subordinate side
    pub path: Option<String>,
}

/// Allocate a non-blocking terminal pair of the given size
pub fn open_pty(size: WindowSize) -> PtyResult<PtyPair> {
    size.validate()?;
    let winsize: Winsize = size.into();
    let pair = {
        let _guard = spawn_lock();
        let pair = openpty(Some(&winsize), None).map_err(PtyError::creation)?;
        set_cloexec(pair.master.as_raw_fd())?;
        set_cloexec(pair.slave.as_raw_fd())?;
        pair
    };
    for fd in [&pair.master, &pair.slave] {
        set_nonblocking(fd.as_raw_fd())?;
    }
    let path = tty_name(pair.slave.as_raw_fd());
    Ok(PtyPair {
        master: pair.master,
        slave: pair.slave,
        path,
    })
}

#[derive(Debug, Default)]
struct ChildState {
    /// Set by the exit watcher just before the pid is reaped
    reaped: bool,
}

/// A pseudoterminal with a spawned child process
pub struct UnixBackend {
    /// The PTY master file descriptor
    master: OwnedFd,
    /// The child process ID (also its process group and session id)
    pid: Pid,
    tty_path: Option<String>,
    child: Mutex<ChildState>,
}

impl UnixBackend {
    /// Create the PTY, fork and exec the program described by `spec`
    pub fn spawn(spec: &LaunchSpec) -> PtyResult<Self> {
        spec.size.validate()?;

        // Everything the child touches is prepared before fork
        let program = cstring(spec.program.as_os_str())?;
        let mut argv = vec![cstring(OsStr::new(&spec.file))?];
        for arg in &spec.args {
            argv.push(cstring(OsStr::new(arg))?);
        }
        let envp = spec
            .env
            .iter()
            .map(|(k, v)| cstring(OsStr::new(&format!("{}={}", k, v))))
            .collect::<PtyResult<Vec<_>>>()?;
        let cwd = cstring(spec.cwd.as_os_str())?;
        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);

        let winsize: Winsize = spec.size.into();
        let guard = spawn_lock();
        let pair = openpty(Some(&winsize), None).map_err(PtyError::creation)?;
        set_cloexec(pair.master.as_raw_fd())?;
        set_cloexec(pair.slave.as_raw_fd())?;
        configure_terminal(pair.slave.as_fd(), spec.utf8)?;
        let tty_path = tty_name(pair.slave.as_raw_fd());

        let (report_read, report_write) = report_pipe()?;

        // Block signals so no handler runs in the child before exec
        let old_mask = SigSet::all()
            .thread_swap_mask(SigmaskHow::SIG_SETMASK)
            .map_err(PtyError::creation)?;

        // SAFETY: the child only calls async-signal-safe functions before exec
        let forked = unsafe { fork() };
        if let Ok(ForkResult::Child) = forked {
            unsafe {
                exec_child(&ChildLaunch {
                    master: pair.master.as_raw_fd(),
                    slave: pair.slave.as_raw_fd(),
                    report: report_write.as_raw_fd(),
                    program: &program,
                    argv: &argv_ptrs,
                    envp: &envp_ptrs,
                    cwd: &cwd,
                    uid: spec.uid,
                    gid: spec.gid,
                })
            }
        }

        let _ = old_mask.thread_set_mask();
        drop(guard);
        let child = match forked {
            Ok(ForkResult::Parent { child }) => child,
            Ok(ForkResult::Child) => unreachable!("child never returns from exec_child"),
            Err(e) => return Err(PtyError::creation(format!("fork failed: {}", e))),
        };

        // Parent keeps only the controlling side
        drop(pair.slave);
        drop(report_write);

        if let Some((stage, errno)) = read_launch_report(report_read.as_raw_fd()) {
            reap(child);
            if stage == SpawnStage::Exec && errno == libc::ENOENT {
                return Err(PtyError::not_found(spec.file.clone()));
            }
            return Err(PtyError::Spawn {
                file: spec.file.clone(),
                stage,
                source: std::io::Error::from_raw_os_error(errno),
            });
        }

        if let Err(e) = set_nonblocking(pair.master.as_raw_fd()) {
            let _ = killpg(child, Signal::SIGKILL);
            reap(child);
            return Err(e);
        }

        tracing::debug!(pid = child.as_raw(), tty = ?tty_path, "spawned {}", spec.file);

        Ok(Self {
            master: pair.master,
            pid: child,
            tty_path,
            child: Mutex::new(ChildState::default()),
        })
    }

    /// Get the raw file descriptor of the PTY master
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Device path of the subordinate side
    pub fn tty_path(&self) -> Option<&str> {
        self.tty_path.as_deref()
    }

    /// Current window size as seen by the terminal driver
    pub fn window_size(&self) -> PtyResult<WindowSize> {
        get_window_size(self.master.as_raw_fd())
    }

    fn state(&self) -> MutexGuard<'_, ChildState> {
        self.child.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn poll_master(&self, flags: PollFlags, timeout: Duration) -> PtyResult<bool> {
        let mut fds = [PollFd::new(&self.master, flags)];
        match poll(&mut fds, timeout_ms(timeout)) {
            Ok(0) | Err(Errno::EINTR) => Ok(false),
            Ok(_) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

impl PtyBackend for UnixBackend {
    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> PtyResult<ReadOutcome> {
        if !self.poll_master(PollFlags::POLLIN, timeout)? {
            return Ok(ReadOutcome::Idle);
        }
        match read(self.master.as_raw_fd(), buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(ReadOutcome::Idle),
            // Linux reports EIO once every subordinate descriptor is closed
            Err(Errno::EIO) => Ok(ReadOutcome::Closed),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, data: &[u8]) -> PtyResult<usize> {
        match write(self.master.as_raw_fd(), data) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn wait_writable(&self, timeout: Duration) -> PtyResult<bool> {
        self.poll_master(PollFlags::POLLOUT, timeout)
    }

    fn resize(&self, size: WindowSize) -> PtyResult<()> {
        set_window_size(self.master.as_raw_fd(), size)
    }

    fn clear(&self) -> PtyResult<()> {
        Ok(())
    }

    fn kill(&self, signal: Option<&str>) -> PtyResult<()> {
        let signal = match signal {
            Some(name) => parse_signal(name)?,
            None => Signal::SIGHUP,
        };
        let state = self.state();
        if state.reaped {
            return Ok(());
        }
        match killpg(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn wait(&self) -> PtyResult<ExitResult> {
        // Wait without reaping so the pid cannot be recycled while kill() may still use it
        loop {
            // SAFETY: siginfo_t is plain data and waitid only writes into it
            let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
            let ret = unsafe {
                libc::waitid(
                    libc::P_PID,
                    self.pid.as_raw() as libc::id_t,
                    &mut info,
                    libc::WEXITED | libc::WNOWAIT,
                )
            };
            if ret == 0 {
                break;
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ECHILD => break,
                e => return Err(e.into()),
            }
        }

        let mut state = self.state();
        state.reaped = true;
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(ExitResult::code(code)),
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    return Ok(ExitResult::signaled(signal as i32))
                },
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    tracing::warn!(pid = self.pid.as_raw(), "child was reaped elsewhere");
                    return Ok(ExitResult::default());
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn foreground_process(&self) -> Option<String> {
        // SAFETY: tcgetpgrp only reads the descriptor's terminal state
        let pgrp = unsafe { libc::tcgetpgrp(self.master.as_raw_fd()) };
        if pgrp <= 0 {
            return None;
        }
        process_name(pgrp)
    }
}

/// Arguments for the post-fork half of the launch
struct ChildLaunch<'a> {
    master: RawFd,
    slave: RawFd,
    report: RawFd,
    program: &'a CString,
    argv: &'a [*const c_char],
    envp: &'a [*const c_char],
    cwd: &'a CString,
    uid: Option<u32>,
    gid: Option<u32>,
}

/// Runs in the forked child. Never returns.
unsafe fn exec_child(launch: &ChildLaunch<'_>) -> ! {
    libc::close(launch.master);
    libc::setsid();

    // Set controlling terminal
    if libc::ioctl(launch.slave, libc::TIOCSCTTY as _, 0) < 0 {
        // Non-fatal on some systems
    }

    libc::dup2(launch.slave, libc::STDIN_FILENO);
    libc::dup2(launch.slave, libc::STDOUT_FILENO);
    libc::dup2(launch.slave, libc::STDERR_FILENO);
    if launch.slave > libc::STDERR_FILENO {
        libc::close(launch.slave);
    }

    if let Some(gid) = launch.gid {
        if libc::setgid(gid as libc::gid_t) != 0 {
            child_fail(launch.report, SpawnStage::Setgid);
        }
    }
    if let Some(uid) = launch.uid {
        if libc::setuid(uid as libc::uid_t) != 0 {
            child_fail(launch.report, SpawnStage::Setuid);
        }
    }
    if libc::chdir(launch.cwd.as_ptr()) != 0 {
        child_fail(launch.report, SpawnStage::Chdir);
    }

    for sig in 1..32 {
        libc::signal(sig, libc::SIG_DFL);
    }
    let mut empty: libc::sigset_t = mem::zeroed();
    libc::sigemptyset(&mut empty);
    libc::pthread_sigmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());

    libc::execve(
        launch.program.as_ptr(),
        launch.argv.as_ptr(),
        launch.envp.as_ptr(),
    );
    child_fail(launch.report, SpawnStage::Exec)
}

unsafe fn child_fail(report: RawFd, stage: SpawnStage) -> ! {
    let errno = Errno::last() as i32;
    let mut msg = [0u8; 8];
    msg[..4].copy_from_slice(&stage.to_code().to_ne_bytes());
    msg[4..].copy_from_slice(&errno.to_ne_bytes());
    libc::write(report, msg.as_ptr() as *const libc::c_void, msg.len());
    libc::_exit(127)
}

/// Close-on-exec pipe the child uses to report launch failures
#[cfg(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "illumos",
    target_os = "linux",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "solaris"
))]
fn report_pipe() -> PtyResult<(OwnedFd, OwnedFd)> {
    let (r, w) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(PtyError::creation)?;
    // SAFETY: both descriptors were just created and are owned here
    Ok(unsafe { (OwnedFd::from_raw_fd(r), OwnedFd::from_raw_fd(w)) })
}

/// Close-on-exec pipe the child uses to report launch failures
///
/// No `pipe2` here; the caller holds the spawn lock until the flags are set.
#[cfg(not(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "illumos",
    target_os = "linux",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "solaris"
)))]
fn report_pipe() -> PtyResult<(OwnedFd, OwnedFd)> {
    let (r, w) = nix::unistd::pipe().map_err(PtyError::creation)?;
    // SAFETY: both descriptors were just created and are owned here
    let (r, w) = unsafe { (OwnedFd::from_raw_fd(r), OwnedFd::from_raw_fd(w)) };
    set_cloexec(r.as_raw_fd())?;
    set_cloexec(w.as_raw_fd())?;
    Ok((r, w))
}

/// `None` when the pipe closed without a message, i.e. exec succeeded
fn read_launch_report(fd: RawFd) -> Option<(SpawnStage, i32)> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        match read(fd, &mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    if filled < buf.len() {
        return None;
    }
    let stage = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let errno = i32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Some((SpawnStage::from_code(stage)?, errno))
}

fn reap(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            _ => break,
        }
    }
}

/// Apply the standard interactive terminal profile to the subordinate side
fn configure_terminal(fd: BorrowedFd<'_>, utf8: bool) -> PtyResult<()> {
    let mut t = termios::tcgetattr(fd)?;

    t.input_flags = InputFlags::ICRNL
        | InputFlags::IXON
        | InputFlags::IXANY
        | InputFlags::IMAXBEL
        | InputFlags::BRKINT;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if utf8 {
        t.input_flags |= InputFlags::IUTF8;
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = utf8;

    t.output_flags = OutputFlags::OPOST | OutputFlags::ONLCR;
    t.control_flags = ControlFlags::CREAD | ControlFlags::CS8 | ControlFlags::HUPCL;
    t.local_flags = LocalFlags::ICANON
        | LocalFlags::ISIG
        | LocalFlags::IEXTEN
        | LocalFlags::ECHO
        | LocalFlags::ECHOE
        | LocalFlags::ECHOK
        | LocalFlags::ECHOKE
        | LocalFlags::ECHOCTL;

    use SpecialCharacterIndices as Cc;
    let cc = &mut t.control_chars;
    cc[Cc::VEOF as usize] = 4;
    cc[Cc::VEOL as usize] = 0xff;
    cc[Cc::VEOL2 as usize] = 0xff;
    cc[Cc::VERASE as usize] = 0x7f;
    cc[Cc::VWERASE as usize] = 23;
    cc[Cc::VKILL as usize] = 21;
    cc[Cc::VREPRINT as usize] = 18;
    cc[Cc::VINTR as usize] = 3;
    cc[Cc::VQUIT as usize] = 0x1c;
    cc[Cc::VSUSP as usize] = 26;
    cc[Cc::VSTART as usize] = 17;
    cc[Cc::VSTOP as usize] = 19;
    cc[Cc::VLNEXT as usize] = 22;
    cc[Cc::VDISCARD as usize] = 15;
    cc[Cc::VMIN as usize] = 1;
    cc[Cc::VTIME as usize] = 0;

    termios::cfsetispeed(&mut t, BaudRate::B38400)?;
    termios::cfsetospeed(&mut t, BaudRate::B38400)?;
    termios::tcsetattr(fd, SetArg::TCSANOW, &t)?;
    Ok(())
}

/// Set the window size on a PTY file descriptor
fn set_window_size(fd: RawFd, size: WindowSize) -> PtyResult<()> {
    let winsize: libc::winsize = size.into();

    // SAFETY: TIOCSWINSZ is a valid ioctl for setting window size
    let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &winsize) };

    if result < 0 {
        Err(PtyError::Nix(Errno::last()))
    } else {
        Ok(())
    }
}

/// Get the window size from a PTY file descriptor
pub fn get_window_size(fd: RawFd) -> PtyResult<WindowSize> {
    // SAFETY: winsize is plain data
    let mut winsize: libc::winsize = unsafe { mem::zeroed() };

    // SAFETY: TIOCGWINSZ is a valid ioctl for getting window size
    let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut winsize) };

    if result < 0 {
        Err(PtyError::Nix(Errno::last()))
    } else {
        Ok(winsize.into())
    }
}

fn set_nonblocking(fd: RawFd) -> PtyResult<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn set_cloexec(fd: RawFd) -> PtyResult<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn tty_name(fd: RawFd) -> Option<String> {
    let mut buf = [0 as c_char; 256];
    // SAFETY: ttyname_r writes a NUL-terminated name into the buffer
    let ret = unsafe { libc::ttyname_r(fd, buf.as_mut_ptr(), buf.len()) };
    if ret != 0 {
        return None;
    }
    // SAFETY: on success the buffer holds a NUL-terminated string
    let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}

/// Accepts `SIGTERM` as well as `TERM`
fn parse_signal(name: &str) -> PtyResult<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&full).map_err(|_| PtyError::InvalidSignal(name.to_string()))
}

fn cstring(s: &OsStr) -> PtyResult<CString> {
    CString::new(s.as_bytes()).map_err(|_| {
        PtyError::InvalidArgument(format!("{:?} contains a NUL byte", s))
    })
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

fn timeout_ms(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn process_name(pid: libc::pid_t) -> Option<String> {
    let cmdline = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    let argv0 = cmdline.split(|&b| b == 0).next()?;
    if argv0.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(argv0).into_owned())
}

#[cfg(target_os = "macos")]
fn process_name(pid: libc::pid_t) -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: proc_name writes at most buf.len() bytes
    let len = unsafe {
        libc::proc_name(pid, buf.as_mut_ptr() as *mut libc::c_void, buf.len() as u32)
    };
    if len <= 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&buf[..len as usize]).into_owned())
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
fn process_name(_pid: libc::pid_t) -> Option<String> {
    None
}
