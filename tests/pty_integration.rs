//! Integration tests for spawning programs on a real PTY
//!
//! These tests verify end-to-end behavior of the public API against real
//! child processes.

#![cfg(unix)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ptyhost::{ExitResult, FlowState, Pty, PtyCommand, PtyData, PtyError, SpawnOptions};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Collects everything a PTY emits
struct Capture {
    data: Arc<Mutex<Vec<u8>>>,
    binary: Arc<AtomicBool>,
    exit: Arc<Mutex<Option<ExitResult>>>,
    exits: Arc<AtomicUsize>,
    data_after_exit: Arc<AtomicBool>,
}

impl Capture {
    fn attach(pty: &Pty) -> Self {
        let capture = Capture {
            data: Arc::new(Mutex::new(Vec::new())),
            binary: Arc::new(AtomicBool::new(false)),
            exit: Arc::new(Mutex::new(None)),
            exits: Arc::new(AtomicUsize::new(0)),
            data_after_exit: Arc::new(AtomicBool::new(false)),
        };

        let (data, binary, exit, late) = (
            capture.data.clone(),
            capture.binary.clone(),
            capture.exit.clone(),
            capture.data_after_exit.clone(),
        );
        pty.on_data(move |d: &PtyData| {
            if exit.lock().unwrap().is_some() {
                late.store(true, Ordering::SeqCst);
            }
            if matches!(d, PtyData::Binary(_)) {
                binary.store(true, Ordering::SeqCst);
            }
            data.lock().unwrap().extend_from_slice(d.as_bytes());
        });

        let (exit, exits) = (capture.exit.clone(), capture.exits.clone());
        pty.on_exit(move |r| {
            exits.fetch_add(1, Ordering::SeqCst);
            *exit.lock().unwrap() = Some(*r);
        });
        capture
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.data.lock().unwrap()).into_owned()
    }

    fn bytes(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    /// Wait until the output contains `needle`
    fn wait_for(&self, needle: &str) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if self.text().contains(needle) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn wait_exit(&self) -> ExitResult {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if let Some(result) = *self.exit.lock().unwrap() {
                return result;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("child did not exit; output so far: {:?}", self.text());
    }
}

/// A shell running `cat` with the terminal in raw mode, ready for input
fn spawn_raw_cat(options: &SpawnOptions) -> (Pty, Capture) {
    let pty = Pty::spawn(
        "/bin/sh",
        &["-c", "stty raw -echo; echo READY; exec cat"],
        options,
    )
    .expect("Failed to spawn PTY");
    let capture = Capture::attach(&pty);
    assert!(capture.wait_for("READY\n"), "shell never became ready");
    (pty, capture)
}

// ============================================================================
// Spawn Tests
// ============================================================================

#[test]
fn test_echo_hello() {
    let pty = ptyhost::spawn("echo", &["hello"], &SpawnOptions::default().with_size(80, 24))
        .expect("Failed to spawn PTY");
    let capture = Capture::attach(&pty);

    let exit = capture.wait_exit();
    assert_eq!(exit, ExitResult::code(0));
    // The terminal turns \n into \r\n
    assert_eq!(capture.text(), "hello\r\n");
}

#[test]
fn test_nonexistent_binary() {
    let err = ptyhost::spawn("/nonexistent/binary", &[] as &[&str], &SpawnOptions::default())
        .unwrap_err();
    match err {
        PtyError::ExecutableNotFound { file, platform, arch } => {
            assert_eq!(file, "/nonexistent/binary");
            assert_eq!(platform, std::env::consts::OS);
            assert_eq!(arch, std::env::consts::ARCH);
        },
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_exit_code_reported() {
    let pty = Pty::spawn("sh", &["-c", "exit 3"], &SpawnOptions::default()).unwrap();
    let capture = Capture::attach(&pty);
    assert_eq!(capture.wait_exit(), ExitResult::code(3));
    assert_eq!(pty.exit_status(), Some(ExitResult::code(3)));
}

#[test]
fn test_dimensions_reported() {
    for (cols, rows) in [(1u16, 1u16), (123, 45), (300, 100)] {
        let options = SpawnOptions::default().with_size(cols, rows);
        let pty = Pty::spawn("stty", &["size"], &options).unwrap();
        assert_eq!((pty.cols(), pty.rows()), (cols, rows));

        let capture = Capture::attach(&pty);
        capture.wait_exit();
        assert_eq!(capture.text().trim_end(), format!("{} {}", rows, cols));
    }
}

#[test]
fn test_cwd_and_env() {
    let dir = tempfile::tempdir().unwrap();
    let pty = PtyCommand::new("sh")
        .args(["-c", "echo \"$PTYHOST_VALUE:$TERM\"; pwd -P"])
        .cwd(dir.path())
        .env("PTYHOST_VALUE", "x42")
        .spawn()
        .unwrap();
    let capture = Capture::attach(&pty);
    capture.wait_exit();

    let expected_dir = std::fs::canonicalize(dir.path()).unwrap();
    let text = capture.text();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0].trim_end(), "x42:xterm-256color");
    assert_eq!(lines[1].trim_end(), expected_dir.to_str().unwrap());
}

#[test]
fn test_invalid_spawn_size() {
    let options = SpawnOptions::default().with_size(80, 0);
    assert!(matches!(
        Pty::spawn("sh", &[] as &[&str], &options),
        Err(PtyError::InvalidDimensions { cols: 80, rows: 0 })
    ));
}

// ============================================================================
// I/O Tests
// ============================================================================

#[test]
fn test_cat_is_identity() {
    let (pty, capture) = spawn_raw_cat(&SpawnOptions::default());
    let payload = "plain text, 12345 and unicode: héllo € ✓";
    pty.write(payload);
    assert!(capture.wait_for(payload));
    assert_eq!(capture.text(), format!("READY\n{}", payload));

    pty.kill(Some("SIGKILL")).unwrap();
    assert_eq!(capture.wait_exit().signal, Some(9));
}

#[test]
fn test_raw_mode_delivers_bytes() {
    let options = SpawnOptions::default().with_encoding(None);
    let pty = Pty::spawn("sh", &["-c", "printf 'a\\377b'"], &options).unwrap();
    let capture = Capture::attach(&pty);
    capture.wait_exit();
    assert!(capture.binary.load(Ordering::SeqCst));
    assert_eq!(capture.bytes(), vec![b'a', 0xff, b'b']);
}

#[test]
fn test_invalid_utf8_is_replaced() {
    let pty = Pty::spawn("sh", &["-c", "printf 'a\\377b'"], &SpawnOptions::default()).unwrap();
    let capture = Capture::attach(&pty);
    capture.wait_exit();
    assert_eq!(capture.text(), "a\u{fffd}b");
}

#[test]
fn test_single_exit_and_no_late_data() {
    let pty = Pty::spawn("sh", &["-c", "echo one; echo two"], &SpawnOptions::default()).unwrap();
    let capture = Capture::attach(&pty);
    capture.wait_exit();
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(capture.exits.load(Ordering::SeqCst), 1);
    assert!(!capture.data_after_exit.load(Ordering::SeqCst));
    assert_eq!(capture.text(), "one\r\ntwo\r\n");

    // Late listeners get the exit replayed
    let replayed = Arc::new(Mutex::new(None));
    let r = replayed.clone();
    pty.on_exit(move |e| *r.lock().unwrap() = Some(*e));
    assert_eq!(*replayed.lock().unwrap(), Some(ExitResult::code(0)));
}

#[test]
fn test_flow_control_gates_writes() {
    let options = SpawnOptions::default().with_flow_control(true);
    let (pty, capture) = spawn_raw_cat(&options);
    assert!(pty.handle_flow_control());

    pty.write("\x13");
    assert_eq!(pty.flow_state(), FlowState::Paused);
    pty.write("queued");
    std::thread::sleep(Duration::from_millis(300));
    assert!(!capture.text().contains("queued"));

    pty.write("\x11");
    assert_eq!(pty.flow_state(), FlowState::Running);
    assert!(capture.wait_for("queued"));
    // Neither control sequence reached the child
    assert_eq!(capture.text(), "READY\nqueued");

    pty.kill(None).unwrap();
    assert_eq!(capture.wait_exit().signal, Some(1));
}

#[test]
fn test_pause_does_not_hold_output() {
    let pty = Pty::spawn(
        "sh",
        &["-c", "echo READY; sleep 0.3; echo LATE"],
        &SpawnOptions::default(),
    )
    .unwrap();
    let capture = Capture::attach(&pty);
    assert!(capture.wait_for("READY"));
    pty.pause();
    assert!(capture.wait_for("LATE"));
    assert_eq!(capture.wait_exit(), ExitResult::code(0));
}

// ============================================================================
// Control Tests
// ============================================================================

#[test]
fn test_resize() {
    let pty = Pty::spawn("sh", &["-c", "sleep 0.5; stty size"], &SpawnOptions::default()).unwrap();
    let capture = Capture::attach(&pty);

    assert!(matches!(
        pty.resize(0, 5),
        Err(PtyError::InvalidDimensions { .. })
    ));
    assert_eq!((pty.cols(), pty.rows()), (80, 24));

    pty.resize(100, 40).unwrap();
    pty.resize(100, 40).unwrap();
    assert_eq!((pty.cols(), pty.rows()), (100, 40));

    capture.wait_exit();
    assert_eq!(capture.text().trim_end(), "40 100");
}

#[test]
fn test_kill_with_signal() {
    let pty = Pty::spawn("sleep", &["30"], &SpawnOptions::default()).unwrap();
    let capture = Capture::attach(&pty);
    pty.kill(Some("SIGTERM")).unwrap();
    assert_eq!(capture.wait_exit(), ExitResult::signaled(15));
}

#[test]
fn test_default_kill_is_hangup() {
    let pty = Pty::spawn("sleep", &["30"], &SpawnOptions::default()).unwrap();
    let capture = Capture::attach(&pty);
    pty.kill(None).unwrap();
    assert_eq!(capture.wait_exit().signal, Some(1));
}

#[test]
fn test_kill_after_exit_is_noop() {
    let pty = Pty::spawn("true", &[] as &[&str], &SpawnOptions::default()).unwrap();
    let capture = Capture::attach(&pty);
    capture.wait_exit();
    assert!(pty.kill(None).is_ok());
    assert!(pty.kill(Some("SIGKILL")).is_ok());
    assert_eq!(capture.exits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unknown_signal() {
    let pty = Pty::spawn("sleep", &["30"], &SpawnOptions::default()).unwrap();
    assert!(matches!(
        pty.kill(Some("SIGBOGUS")),
        Err(PtyError::InvalidSignal(_))
    ));
    pty.kill(Some("SIGKILL")).unwrap();
}

#[test]
fn test_clear_is_noop() {
    let pty = Pty::spawn("sleep", &["30"], &SpawnOptions::default()).unwrap();
    assert!(pty.clear().is_ok());
    pty.kill(Some("SIGKILL")).unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn test_foreground_process_name() {
    let pty = Pty::spawn("sleep", &["30"], &SpawnOptions::default()).unwrap();
    assert!(pty.process().contains("sleep"));
    pty.kill(Some("SIGKILL")).unwrap();
}
