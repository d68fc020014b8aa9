//! Background I/O for one PTY
//!
//! The reader thread turns output from the controlling side into data events
//! and owns exit emission: the exit watcher hands it the result over a
//! channel, and the exit event fires only after the output already buffered
//! in the device has been drained and delivered.
//!
//! The writer thread forwards the outbound queue in submission order. While
//! the queue is paused nothing is forwarded; queued writes stay queued.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::backend::{PtyBackend, ReadOutcome};
use crate::encoding::{Decoder, Encoding};
use crate::error::PtyResult;
use crate::events::{EventHub, ExitResult, PtyData};
use crate::flow::FlowState;

/// Size of one read from the controlling side
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on how long a background thread blocks before re-checking state
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Vec<u8>>,
    flow: FlowState,
    closed: bool,
}

/// Ordered outbound queue shared by the façade and the writer thread
#[derive(Debug, Default)]
pub struct WriteQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl WriteQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a write; returns false once the queue is closed
    pub fn push(&self, data: Vec<u8>) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        if !data.is_empty() {
            state.items.push_back(data);
            self.ready.notify_all();
        }
        true
    }

    pub fn pause(&self) {
        self.lock().flow = FlowState::Paused;
    }

    pub fn resume(&self) {
        let mut state = self.lock();
        state.flow = FlowState::Running;
        self.ready.notify_all();
    }

    pub fn state(&self) -> FlowState {
        self.lock().flow
    }

    /// Number of writes waiting to be forwarded
    pub fn pending(&self) -> usize {
        self.lock().items.len()
    }

    /// Stop accepting writes and wake the writer so it can exit
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.items.clear();
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Block until a write may be forwarded; `None` once closed
    fn next(&self) -> Option<Vec<u8>> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if state.flow == FlowState::Running {
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
            }
            state = self.ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Start the thread that forwards queued writes to the backend
pub fn spawn_writer(
    backend: Arc<dyn PtyBackend>,
    queue: Arc<WriteQueue>,
) -> std::io::Result<JoinHandle<()>> {
    let pid = backend.pid();
    thread::Builder::new()
        .name(format!("pty-writer-{}", pid))
        .spawn(move || {
            while let Some(chunk) = queue.next() {
                if let Err(e) = write_all(backend.as_ref(), &chunk, &queue) {
                    tracing::debug!(pid, "write failed, dropping queued input: {}", e);
                    queue.close();
                    break;
                }
            }
            tracing::trace!(pid, "writer finished");
        })
}

/// Retry partial writes until the chunk is flushed or the queue closes
fn write_all(backend: &dyn PtyBackend, data: &[u8], queue: &WriteQueue) -> PtyResult<()> {
    let mut offset = 0;
    while offset < data.len() {
        if queue.is_closed() {
            return Ok(());
        }
        match backend.write(&data[offset..])? {
            0 => {
                backend.wait_writable(POLL_INTERVAL)?;
            },
            n => offset += n,
        }
    }
    Ok(())
}

/// Everything the reader thread needs
pub struct ReaderContext {
    pub backend: Arc<dyn PtyBackend>,
    pub hub: Arc<EventHub>,
    /// `None` delivers raw bytes
    pub encoding: Option<Encoding>,
    pub exit_rx: Receiver<ExitResult>,
    pub queue: Arc<WriteQueue>,
}

/// Start the thread that pumps output into data events
pub fn spawn_reader(ctx: ReaderContext) -> std::io::Result<JoinHandle<()>> {
    let pid = ctx.backend.pid();
    thread::Builder::new()
        .name(format!("pty-reader-{}", pid))
        .spawn(move || run_reader(ctx))
}

fn run_reader(ctx: ReaderContext) {
    let pid = ctx.backend.pid();
    let mut decoder = ctx.encoding.map(Decoder::new);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut exit: Option<ExitResult> = None;
    let mut closed = false;

    loop {
        if exit.is_none() {
            exit = check_exit(&ctx.exit_rx, closed);
        }
        if closed {
            // No more output can arrive; only the exit result is missing
            break;
        }

        match ctx.backend.read(&mut buf, POLL_INTERVAL) {
            Ok(ReadOutcome::Data(n)) => {
                tracing::trace!(pid, bytes = n, "read");
                deliver(&ctx.hub, decoder.as_mut(), &buf[..n]);
            },
            Ok(ReadOutcome::Idle) => {
                // Child is gone and the device has been quiet for a full interval
                if exit.is_some() {
                    break;
                }
            },
            Ok(ReadOutcome::Closed) => closed = true,
            Err(e) => {
                tracing::warn!(pid, "read failed: {}", e);
                closed = true;
            },
        }
    }

    if let Some(decoder) = decoder.as_mut() {
        ctx.hub.emit_data(PtyData::Text(decoder.finish()));
    }

    let result = exit.unwrap_or_else(lost_exit);
    tracing::debug!(pid, exit_code = result.exit_code, signal = ?result.signal, "exited");
    ctx.hub.emit_exit(result);
    ctx.queue.close();
    ctx.backend.release();
}

/// Fetch the exit result, blocking for it when `block` is set
fn check_exit(rx: &Receiver<ExitResult>, block: bool) -> Option<ExitResult> {
    if block {
        return Some(rx.recv().unwrap_or_else(|_| lost_exit()));
    }
    match rx.try_recv() {
        Ok(result) => Some(result),
        Err(TryRecvError::Empty) => None,
        Err(TryRecvError::Disconnected) => Some(lost_exit()),
    }
}

/// Result reported when the exit watcher went away without one
fn lost_exit() -> ExitResult {
    tracing::warn!("exit watcher stopped without a result");
    ExitResult::code(-1)
}

fn deliver(hub: &EventHub, decoder: Option<&mut Decoder>, bytes: &[u8]) {
    let data = match decoder {
        Some(decoder) => PtyData::Text(decoder.decode(bytes)),
        None => PtyData::Binary(bytes.to_vec()),
    };
    hub.emit_data(data);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::size::WindowSize;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    /// Scripted backend: serves queued reads and records writes
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub reads: Mutex<VecDeque<ReadOutcome>>,
        pub chunks: Mutex<VecDeque<Vec<u8>>>,
        pub written: Mutex<Vec<u8>>,
        /// Maximum bytes accepted per write call
        pub write_limit: Option<usize>,
        pub released: AtomicBool,
    }

    impl FakeBackend {
        pub fn with_output(chunks: &[&[u8]], then: ReadOutcome) -> Self {
            let fake = Self::default();
            for chunk in chunks {
                fake.chunks.lock().unwrap().push_back(chunk.to_vec());
                fake.reads.lock().unwrap().push_back(ReadOutcome::Data(chunk.len()));
            }
            fake.reads.lock().unwrap().push_back(then);
            fake
        }

        pub fn written(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }
    }

    impl PtyBackend for FakeBackend {
        fn pid(&self) -> u32 {
            4242
        }

        fn read(&self, buf: &mut [u8], timeout: Duration) -> PtyResult<ReadOutcome> {
            let next = self.reads.lock().unwrap().pop_front();
            match next {
                Some(ReadOutcome::Data(n)) => {
                    let chunk = self.chunks.lock().unwrap().pop_front().unwrap();
                    buf[..n].copy_from_slice(&chunk);
                    Ok(ReadOutcome::Data(n))
                },
                Some(other) => Ok(other),
                None => {
                    thread::sleep(timeout.min(Duration::from_millis(5)));
                    Ok(ReadOutcome::Idle)
                },
            }
        }

        fn write(&self, data: &[u8]) -> PtyResult<usize> {
            let n = self.write_limit.map_or(data.len(), |l| l.min(data.len()));
            self.written.lock().unwrap().extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn wait_writable(&self, _timeout: Duration) -> PtyResult<bool> {
            Ok(true)
        }

        fn resize(&self, _size: WindowSize) -> PtyResult<()> {
            Ok(())
        }

        fn clear(&self) -> PtyResult<()> {
            Ok(())
        }

        fn kill(&self, _signal: Option<&str>) -> PtyResult<()> {
            Ok(())
        }

        fn wait(&self) -> PtyResult<ExitResult> {
            Ok(ExitResult::code(0))
        }

        fn foreground_process(&self) -> Option<String> {
            None
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn collect(hub: &Arc<EventHub>) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let _ = hub.on_data(move |d| match d {
            PtyData::Text(s) => l.lock().unwrap().push(s.clone()),
            PtyData::Binary(b) => l.lock().unwrap().push(format!("{:?}", b)),
        });
        let l = log.clone();
        let _ = hub.on_exit(move |r| l.lock().unwrap().push(format!("exit {}", r.exit_code)));
        log
    }

    fn run(fake: Arc<FakeBackend>, encoding: Option<Encoding>, exit: ExitResult) -> Vec<String> {
        let hub = EventHub::new();
        let log = collect(&hub);
        let (tx, rx) = mpsc::channel();
        tx.send(exit).unwrap();
        let queue = WriteQueue::new();
        let handle = spawn_reader(ReaderContext {
            backend: fake,
            hub,
            encoding,
            exit_rx: rx,
            queue: queue.clone(),
        })
        .unwrap();
        handle.join().unwrap();
        assert!(queue.is_closed());
        let out = log.lock().unwrap().clone();
        out
    }

    #[test]
    fn test_data_precedes_exit() {
        let fake = Arc::new(FakeBackend::with_output(
            &[b"hello", b"\r\n"],
            ReadOutcome::Closed,
        ));
        let log = run(fake.clone(), Some(Encoding::Utf8), ExitResult::code(0));
        assert_eq!(log, vec!["hello", "\r\n", "exit 0"]);
        assert!(fake.released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_split_utf8_across_reads() {
        let euro = "€".as_bytes();
        let fake = Arc::new(FakeBackend::with_output(
            &[&euro[..2], &euro[2..]],
            ReadOutcome::Closed,
        ));
        let log = run(fake, Some(Encoding::Utf8), ExitResult::code(0));
        assert_eq!(log, vec!["€", "exit 0"]);
    }

    #[test]
    fn test_dangling_sequence_flushed_before_exit() {
        let fake = Arc::new(FakeBackend::with_output(&[b"ok\xe2"], ReadOutcome::Closed));
        let log = run(fake, Some(Encoding::Utf8), ExitResult::code(2));
        assert_eq!(log, vec!["ok", "\u{fffd}", "exit 2"]);
    }

    #[test]
    fn test_raw_mode_delivers_bytes() {
        let fake = Arc::new(FakeBackend::with_output(&[&[0xff, 0x00]], ReadOutcome::Closed));
        let log = run(fake, None, ExitResult::code(0));
        assert_eq!(log, vec!["[255, 0]", "exit 0"]);
    }

    #[test]
    fn test_exit_after_idle_without_eof() {
        // The device never reports end of stream; the first quiet poll ends the session
        let fake = Arc::new(FakeBackend::with_output(&[b"last"], ReadOutcome::Idle));
        let log = run(fake, Some(Encoding::Utf8), ExitResult::signaled(1));
        assert_eq!(log, vec!["last", "exit 0"]);
    }

    #[test]
    fn test_missing_watcher_reports_failure() {
        let fake = Arc::new(FakeBackend::with_output(&[], ReadOutcome::Closed));
        let hub = EventHub::new();
        let log = collect(&hub);
        let (tx, rx) = mpsc::channel::<ExitResult>();
        drop(tx);
        spawn_reader(ReaderContext {
            backend: fake,
            hub,
            encoding: Some(Encoding::Utf8),
            exit_rx: rx,
            queue: WriteQueue::new(),
        })
        .unwrap()
        .join()
        .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["exit -1"]);
    }

    #[test]
    fn test_writer_preserves_order_and_retries_partial_writes() {
        let fake = Arc::new(FakeBackend {
            write_limit: Some(3),
            ..Default::default()
        });
        let queue = WriteQueue::new();
        let handle = spawn_writer(fake.clone(), queue.clone()).unwrap();

        queue.push(b"first ".to_vec());
        queue.push(b"second ".to_vec());
        queue.push(b"third".to_vec());
        while queue.pending() > 0 || fake.written().len() < 18 {
            thread::sleep(Duration::from_millis(1));
        }
        queue.close();
        handle.join().unwrap();
        assert_eq!(fake.written(), b"first second third");
    }

    #[test]
    fn test_paused_queue_holds_writes() {
        let fake = Arc::new(FakeBackend::default());
        let queue = WriteQueue::new();
        queue.pause();
        let handle = spawn_writer(fake.clone(), queue.clone()).unwrap();

        queue.push(b"held".to_vec());
        thread::sleep(Duration::from_millis(50));
        assert!(fake.written().is_empty());
        assert_eq!(queue.state(), FlowState::Paused);

        queue.resume();
        while fake.written().len() < 4 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(fake.written(), b"held");

        queue.close();
        handle.join().unwrap();
        assert!(!queue.push(b"late".to_vec()));
    }
}
