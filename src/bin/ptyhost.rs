//! ptyhost - run a program on a pseudoterminal and relay its I/O
//!
//! Standard input is forwarded to the program, its output is copied to
//! standard output, and ptyhost exits with the program's exit code.

use std::io::{self, IsTerminal, Read, Write};
use std::process::ExitCode;
use std::sync::{mpsc, Arc};
use std::thread;

use ptyhost::{ExitResult, Pty, PtyData, SpawnOptions};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let (host_cols, host_rows) = host_terminal_size().unwrap_or((80, 24));
    let mut options = SpawnOptions::default().with_size(host_cols, host_rows);
    let mut command: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--cols" => {
                i += 1;
                if let Some(value) = args.get(i) {
                    options.cols = value.parse().unwrap_or(options.cols);
                }
            },
            "-r" | "--rows" => {
                i += 1;
                if let Some(value) = args.get(i) {
                    options.rows = value.parse().unwrap_or(options.rows);
                }
            },
            "--cwd" => {
                i += 1;
                if let Some(value) = args.get(i) {
                    options = options.with_cwd(value);
                }
            },
            "--raw" => {
                options = options.with_encoding(None);
            },
            "--flow-control" => {
                options = options.with_flow_control(true);
            },
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            },
            "--" => {
                command.extend(args[i + 1..].iter().cloned());
                break;
            },
            _ => {
                command.extend(args[i..].iter().cloned());
                break;
            },
        }
        i += 1;
    }

    let (file, program_args) = match command.split_first() {
        Some((file, rest)) => (file.clone(), rest.to_vec()),
        None => (default_shell(), Vec::new()),
    };

    tracing::info!("Spawning {} on a {}x{} terminal", file, options.cols, options.rows);

    let pty = match Pty::spawn(&file, &program_args, &options) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            eprintln!("ptyhost: {}", e);
            return ExitCode::FAILURE;
        },
    };

    tracing::debug!("PTY spawned, child PID: {}", pty.pid());

    let raw_guard = if io::stdin().is_terminal() {
        match RawModeGuard::new() {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::warn!("Could not enable raw mode: {}", e);
                None
            },
        }
    } else {
        None
    };

    let (exit_tx, exit_rx) = mpsc::channel::<ExitResult>();

    let _output = pty.on_data(|data: &PtyData| {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(data.as_bytes());
        let _ = stdout.flush();
    });
    let _exit = pty.on_exit(move |result| {
        let _ = exit_tx.send(*result);
    });

    // Forward stdin until EOF; the thread is abandoned when the child exits
    let input = pty.clone();
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => input.write_bytes(&buf[..n]),
                Err(_) => break,
            }
        }
    });

    let result = exit_rx.recv().unwrap_or(ExitResult::code(1));
    drop(raw_guard);

    tracing::info!("Child exited with code {} (signal {:?})", result.exit_code, result.signal);
    match result.signal {
        Some(signal) => ExitCode::from((128 + signal).clamp(0, 255) as u8),
        None => ExitCode::from(result.exit_code.clamp(0, 255) as u8),
    }
}

fn default_shell() -> String {
    if cfg!(windows) {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

fn print_help() {
    println!("ptyhost - run a program on a pseudoterminal");
    println!();
    println!("Usage: ptyhost [OPTIONS] [--] [PROGRAM [ARGS...]]");
    println!();
    println!("Options:");
    println!("  -c, --cols <N>     Set terminal width (default: current terminal or 80)");
    println!("  -r, --rows <N>     Set terminal height (default: current terminal or 24)");
    println!("      --cwd <DIR>    Working directory for the program");
    println!("      --raw          Relay raw bytes instead of UTF-8 text");
    println!("      --flow-control Treat XOFF/XON written to the program as pause/resume");
    println!("  -h, --help         Show this help message");
    println!();
    println!("Without PROGRAM the shell from $SHELL (or %COMSPEC%) is started.");
}

#[cfg(unix)]
fn host_terminal_size() -> Option<(u16, u16)> {
    use nix::libc;

    // SAFETY: winsize is plain data
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };

    let result = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };

    if result == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        Some((ws.ws_col, ws.ws_row))
    } else {
        None
    }
}

#[cfg(not(unix))]
fn host_terminal_size() -> Option<(u16, u16)> {
    None
}

/// RAII guard for raw terminal mode
#[cfg(unix)]
struct RawModeGuard {
    original: nix::sys::termios::Termios,
}

#[cfg(unix)]
impl RawModeGuard {
    fn new() -> io::Result<Self> {
        use nix::sys::termios::{self, InputFlags, LocalFlags, OutputFlags, SetArg};

        let original =
            termios::tcgetattr(io::stdin()).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let mut raw = original.clone();

        // The program's own terminal does the line editing and echo
        raw.local_flags.remove(LocalFlags::ICANON);
        raw.local_flags.remove(LocalFlags::ECHO);
        raw.local_flags.remove(LocalFlags::ISIG);
        raw.local_flags.remove(LocalFlags::IEXTEN);
        raw.input_flags.remove(InputFlags::ICRNL);
        raw.input_flags.remove(InputFlags::IXON);
        raw.output_flags.remove(OutputFlags::OPOST);

        raw.control_chars[nix::sys::termios::SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[nix::sys::termios::SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &raw)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        Ok(Self { original })
    }
}

#[cfg(unix)]
impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use nix::sys::termios::{self, SetArg};
        let _ = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &self.original);
    }
}

#[cfg(not(unix))]
struct RawModeGuard;

#[cfg(not(unix))]
impl RawModeGuard {
    fn new() -> io::Result<Self> {
        Ok(RawModeGuard)
    }
}
