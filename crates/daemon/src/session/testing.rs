//! In-memory PTY for tests.
//!
//! [`FakeSpawner`] hands out [`FakePty`] processes whose output is driven by
//! the test through a [`FakeControl`]. Each emitted chunk is returned by a
//! separate read, so chunk boundaries are deterministic.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::ServerMessage;
use tokio::sync::mpsc;

use super::lifecycle::ClientSink;
use super::pty::{PtyError, PtyProcess, PtySpawner, SpawnOptions, TerminalSize};

/// Creates a client sink and the receiving end of its channel.
pub(crate) fn sink(
    id: &str,
    identity: Option<&str>,
    capacity: usize,
) -> (ClientSink, mpsc::Receiver<ServerMessage>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ClientSink::new(id.to_string(), identity.map(str::to_string), tx),
        rx,
    )
}

/// Test handle on a spawned fake process.
#[derive(Clone, Default)]
pub(crate) struct FakeControl {
    output: Arc<Mutex<Option<std_mpsc::Sender<Vec<u8>>>>>,
    written: Arc<Mutex<Vec<u8>>>,
    resizes: Arc<Mutex<Vec<TerminalSize>>>,
    exited: Arc<AtomicBool>,
    terminations: Arc<AtomicUsize>,
}

impl FakeControl {
    /// Makes the process print `bytes`.
    pub(crate) fn emit(&self, bytes: &[u8]) {
        if let Some(tx) = self.output.lock().unwrap().as_ref() {
            let _ = tx.send(bytes.to_vec());
        }
    }

    /// Makes the process exit; the reader sees EOF once pending output is
    /// drained.
    pub(crate) fn exit(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.output.lock().unwrap().take();
    }

    /// Everything written to the process so far.
    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    /// Successful resizes, in order.
    pub(crate) fn resizes(&self) -> Vec<TerminalSize> {
        self.resizes.lock().unwrap().clone()
    }

    /// Number of SIGHUP/SIGKILL deliveries.
    pub(crate) fn terminate_calls(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

struct FakeReader {
    rx: std_mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Input side of a [`FakePty`]. With `stall` set, every write blocks like a
/// full kernel buffer until the process exits.
struct FakeWriter {
    control: FakeControl,
    stall: bool,
}

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        while self.stall && !self.control.exited.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        if self.control.exited.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        }
        self.control.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FakePty {
    control: FakeControl,
    reader: Option<FakeReader>,
    writer: Option<FakeWriter>,
}

impl PtyProcess for FakePty {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.reader
            .take()
            .map(|reader| Box::new(reader) as Box<dyn Read + Send>)
            .ok_or_else(|| PtyError::Read("reader already taken".to_string()))
    }

    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.writer
            .take()
            .map(|writer| Box::new(writer) as Box<dyn Write + Send>)
            .ok_or_else(|| PtyError::Write("writer already taken".to_string()))
    }

    fn resize(&mut self, size: TerminalSize) -> Result<(), PtyError> {
        self.control.resizes.lock().unwrap().push(size);
        Ok(())
    }

    fn try_wait(&mut self) -> Result<Option<u32>, PtyError> {
        Ok(self.control.exited.load(Ordering::SeqCst).then_some(0))
    }

    fn hangup(&mut self) -> Result<(), PtyError> {
        self.control.terminations.fetch_add(1, Ordering::SeqCst);
        self.control.exit();
        Ok(())
    }

    fn force_kill(&mut self) -> Result<(), PtyError> {
        self.hangup()
    }
}

#[derive(Default)]
struct SpawnerState {
    fail: bool,
    delay: Duration,
    stall_writes: bool,
    controls: Mutex<Vec<FakeControl>>,
    spawns: AtomicUsize,
}

/// Spawner producing [`FakePty`]s.
#[derive(Clone, Default)]
pub(crate) struct FakeSpawner {
    state: Arc<SpawnerState>,
}

impl FakeSpawner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A spawner whose every spawn fails.
    pub(crate) fn failing() -> Self {
        Self::with(true, Duration::ZERO)
    }

    /// A spawner that takes `delay` to spawn, widening race windows.
    pub(crate) fn slow(delay: Duration) -> Self {
        Self::with(false, delay)
    }

    /// A spawner whose processes never read their input.
    pub(crate) fn stalling() -> Self {
        Self {
            state: Arc::new(SpawnerState {
                stall_writes: true,
                ..SpawnerState::default()
            }),
        }
    }

    pub(crate) fn with(fail: bool, delay: Duration) -> Self {
        Self {
            state: Arc::new(SpawnerState {
                fail,
                delay,
                ..SpawnerState::default()
            }),
        }
    }

    /// Options suitable for this spawner.
    pub(crate) fn options(&self) -> SpawnOptions {
        SpawnOptions {
            shell: "fake-shell".to_string(),
            size: TerminalSize::default(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Number of spawn attempts so far.
    pub(crate) fn spawn_count(&self) -> usize {
        self.state.spawns.load(Ordering::SeqCst)
    }

    /// Control for the `index`-th successfully spawned process.
    pub(crate) fn control(&self, index: usize) -> Option<FakeControl> {
        self.state.controls.lock().unwrap().get(index).cloned()
    }
}

impl PtySpawner for FakeSpawner {
    fn spawn(&self, options: &SpawnOptions) -> Result<Box<dyn PtyProcess>, PtyError> {
        self.state.spawns.fetch_add(1, Ordering::SeqCst);
        if !self.state.delay.is_zero() {
            std::thread::sleep(self.state.delay);
        }
        if self.state.fail {
            return Err(PtyError::Spawn(format!("{}: not found", options.shell)));
        }

        let (tx, rx) = std_mpsc::channel();
        let control = FakeControl {
            output: Arc::new(Mutex::new(Some(tx))),
            ..FakeControl::default()
        };
        self.state.controls.lock().unwrap().push(control.clone());

        Ok(Box::new(FakePty {
            control: control.clone(),
            reader: Some(FakeReader {
                rx,
                pending: Vec::new(),
            }),
            writer: Some(FakeWriter {
                control,
                stall: self.state.stall_writes,
            }),
        }))
    }
}
