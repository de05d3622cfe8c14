//! PTY process wrapper.
//!
//! This module owns the pseudo-terminal and the shell process behind a
//! session. Process creation goes through the [`PtySpawner`] trait so that the
//! session layer can be driven by an in-memory PTY in tests; production uses
//! [`NativePtySpawner`] backed by `portable-pty`.
//!
//! Output is read on a dedicated blocking thread and delivered through a
//! bounded channel as a sequence of [`PtyEvent`]s that always ends with
//! exactly one [`PtyEvent::Eof`] or [`PtyEvent::Error`].
//!
//! Input goes through a separate writer thread fed by a channel. A shell that
//! stops reading stdin can stall that thread indefinitely, so the writer
//! never shares a lock with the process itself: [`PtyHandle::terminate`]
//! only needs the process lock and always completes.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtyPair, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the output event channel. A full channel stalls the reader
/// thread, which in turn lets the kernel PTY buffer apply backpressure.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Queued input writes per PTY.
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// How often `terminate` polls for process exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Upper bound on waiting for the process to be reaped after SIGKILL.
const REAP_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors that can occur during PTY operations.
#[derive(Error, Debug)]
pub enum PtyError {
    /// Failed to spawn the shell or allocate the PTY.
    #[error("failed to spawn PTY: {0}")]
    Spawn(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    Write(String),

    /// Failed to read from the PTY.
    #[error("failed to read from PTY: {0}")]
    Read(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    Resize(String),

    /// Requested dimensions are not usable.
    #[error("invalid terminal size {cols}x{rows}")]
    InvalidSize {
        /// Requested columns.
        cols: u16,
        /// Requested rows.
        rows: u16,
    },

    /// The process has already exited or been terminated.
    #[error("PTY process has exited")]
    Exited,
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    /// Columns.
    pub cols: u16,
    /// Rows.
    pub rows: u16,
}

impl TerminalSize {
    /// Creates a size, rejecting zero in either dimension.
    pub fn new(cols: u16, rows: u16) -> Result<Self, PtyError> {
        if cols == 0 || rows == 0 {
            return Err(PtyError::InvalidSize { cols, rows });
        }
        Ok(Self { cols, rows })
    }

    fn pack(self) -> u32 {
        (u32::from(self.cols) << 16) | u32::from(self.rows)
    }

    fn unpack(packed: u32) -> Self {
        Self {
            cols: (packed >> 16) as u16,
            rows: (packed & 0xffff) as u16,
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Everything needed to start a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Shell executable (absolute path or a name resolved through `PATH`).
    pub shell: String,
    /// Initial terminal size.
    pub size: TerminalSize,
    /// Working directory. Inherits the daemon's when `None`.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

/// Events produced by [`PtyHandle::read_loop`].
#[derive(Debug)]
pub enum PtyEvent {
    /// A chunk of output, in the order the PTY produced it.
    Output(Vec<u8>),
    /// The process exited or the descriptor was closed.
    Eof,
    /// Reading failed.
    Error(PtyError),
}

/// A running process attached to a pseudo-terminal.
///
/// Methods are synchronous; [`PtyHandle`] takes care of calling them from
/// the right context.
pub trait PtyProcess: Send {
    /// OS process id, when known.
    fn pid(&self) -> Option<u32>;

    /// Takes the output reader. Only the first call succeeds.
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, PtyError>;

    /// Takes the input writer. Only the first call succeeds.
    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>, PtyError>;

    /// Changes the PTY window size.
    fn resize(&mut self, size: TerminalSize) -> Result<(), PtyError>;

    /// Returns the exit code if the process has exited.
    fn try_wait(&mut self) -> Result<Option<u32>, PtyError>;

    /// Asks the process to hang up (SIGHUP).
    fn hangup(&mut self) -> Result<(), PtyError>;

    /// Kills the process outright (SIGKILL).
    fn force_kill(&mut self) -> Result<(), PtyError>;
}

/// Factory for [`PtyProcess`]es.
pub trait PtySpawner: Send + Sync {
    /// Spawns a shell according to `options`.
    fn spawn(&self, options: &SpawnOptions) -> Result<Box<dyn PtyProcess>, PtyError>;
}

/// Spawner backed by the operating system's PTY implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtySpawner;

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, options: &SpawnOptions) -> Result<Box<dyn PtyProcess>, PtyError> {
        let pty_system = native_pty_system();

        let PtyPair { master, slave } = pty_system
            .openpty(options.size.into())
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        if let Some(ref dir) = options.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(format!("{}: {}", options.shell, e)))?;

        // The child holds its own copy of the slave side; keeping ours open
        // would prevent EOF on the master when the shell exits.
        drop(slave);

        let reader = master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let writer = master
            .take_writer()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        Ok(Box::new(NativePty {
            pid: child.process_id(),
            master,
            writer: Some(writer),
            child,
            reader: Some(reader),
        }))
    }
}

/// A shell running on a native PTY.
struct NativePty {
    pid: Option<u32>,
    master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    reader: Option<Box<dyn Read + Send>>,
}

impl NativePty {
    fn send_signal(&mut self, sig: Signal) -> Result<(), PtyError> {
        let Some(pid) = self.pid else {
            // No pid to signal; fall back to the portable kill.
            return self
                .child
                .kill()
                .map_err(|e| PtyError::Write(e.to_string()));
        };

        match signal::kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(PtyError::Write(format!("{sig}: {e}"))),
        }
    }
}

impl PtyProcess for NativePty {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.reader
            .take()
            .ok_or_else(|| PtyError::Read("reader already taken".to_string()))
    }

    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.writer
            .take()
            .ok_or_else(|| PtyError::Write("writer already taken".to_string()))
    }

    fn resize(&mut self, size: TerminalSize) -> Result<(), PtyError> {
        self.master
            .resize(size.into())
            .map_err(|e| PtyError::Resize(e.to_string()))
    }

    fn try_wait(&mut self) -> Result<Option<u32>, PtyError> {
        self.child
            .try_wait()
            .map(|status| status.map(|s| s.exit_code()))
            .map_err(|e| PtyError::Read(e.to_string()))
    }

    fn hangup(&mut self) -> Result<(), PtyError> {
        self.send_signal(Signal::SIGHUP)
    }

    fn force_kill(&mut self) -> Result<(), PtyError> {
        self.send_signal(Signal::SIGKILL)
    }
}

struct WriteRequest {
    data: Vec<u8>,
    done: oneshot::Sender<Result<(), PtyError>>,
}

/// Async handle over a [`PtyProcess`].
///
/// The handle tracks liveness and the current window size, and makes
/// [`terminate`](Self::terminate) idempotent and bounded in time.
pub struct PtyHandle {
    process: Mutex<Box<dyn PtyProcess>>,
    input: mpsc::Sender<WriteRequest>,
    size: AtomicU32,
    alive: Arc<AtomicBool>,
    terminated: AtomicBool,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Spawns a process through `spawner`.
    pub fn start(spawner: &dyn PtySpawner, options: &SpawnOptions) -> Result<Self, PtyError> {
        let mut process = spawner.spawn(options)?;
        let pid = process.pid();
        let alive = Arc::new(AtomicBool::new(true));

        let writer = process.take_writer()?;
        let (input, requests) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let writer_alive = Arc::clone(&alive);
        let spawned = std::thread::Builder::new()
            .name("pty-writer".to_string())
            .spawn(move || write_loop(writer, requests, writer_alive));
        if let Err(e) = spawned {
            // Do not leave the shell running without a handle.
            let _ = process.force_kill();
            return Err(PtyError::Spawn(format!("writer thread: {e}")));
        }

        tracing::debug!(
            shell = %options.shell,
            pid = ?pid,
            cols = options.size.cols,
            rows = options.size.rows,
            "Spawned PTY process"
        );

        Ok(Self {
            process: Mutex::new(process),
            input,
            size: AtomicU32::new(options.size.pack()),
            alive,
            terminated: AtomicBool::new(false),
            pid,
        })
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> TerminalSize {
        TerminalSize::unpack(self.size.load(Ordering::SeqCst))
    }

    /// Returns whether the process is believed to be running.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Writes input bytes to the PTY, verbatim.
    ///
    /// Writes are applied in call order. The future resolves once the bytes
    /// were handed to the kernel, or with an error once the process is gone.
    pub async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if !self.is_alive() {
            return Err(PtyError::Exited);
        }

        let (done, result) = oneshot::channel();
        self.input
            .send(WriteRequest {
                data: data.to_vec(),
                done,
            })
            .await
            .map_err(|_| PtyError::Exited)?;
        result.await.map_err(|_| PtyError::Exited)?
    }

    /// Starts reading output on a blocking thread.
    ///
    /// The returned receiver yields output chunks followed by exactly one
    /// terminal event. Can only be called once per handle.
    pub async fn read_loop(&self) -> Result<mpsc::Receiver<PtyEvent>, PtyError> {
        let mut reader = self.process.lock().await.take_reader()?;
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let alive = Arc::clone(&self.alive);

        tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        alive.store(false, Ordering::SeqCst);
                        let _ = tx.blocking_send(PtyEvent::Eof);
                        break;
                    }
                    Ok(n) => {
                        if tx.blocking_send(PtyEvent::Output(buffer[..n].to_vec())).is_err() {
                            // Nobody is listening any more.
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // Linux reports EIO on the master once the slave side is
                    // fully closed, which is how a shell exit shows up.
                    Err(e) if e.raw_os_error() == Some(nix::errno::Errno::EIO as i32) => {
                        alive.store(false, Ordering::SeqCst);
                        let _ = tx.blocking_send(PtyEvent::Eof);
                        break;
                    }
                    Err(e) => {
                        alive.store(false, Ordering::SeqCst);
                        let _ = tx.blocking_send(PtyEvent::Error(PtyError::Read(e.to_string())));
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Resizes the PTY. The stored size only changes on success.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let size = TerminalSize::new(cols, rows)?;
        if !self.is_alive() {
            return Err(PtyError::Exited);
        }

        let mut process = self.process.lock().await;
        process.resize(size)?;
        self.size.store(size.pack(), Ordering::SeqCst);
        Ok(())
    }

    /// Terminates the process.
    ///
    /// Sends SIGHUP, waits up to `grace` for the process to exit, then sends
    /// SIGKILL and waits a short bounded time for it to be reaped. Calling
    /// this more than once is a no-op. Returns the exit code when it was
    /// observed.
    pub async fn terminate(&self, grace: Duration) -> Option<u32> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.alive.store(false, Ordering::SeqCst);

        let mut process = self.process.lock().await;

        if let Ok(Some(code)) = process.try_wait() {
            return Some(code);
        }

        if let Err(e) = process.hangup() {
            tracing::debug!(pid = ?self.pid, error = %e, "SIGHUP failed");
        }
        if let Some(code) = wait_for_exit(process.as_mut(), grace).await {
            return Some(code);
        }

        tracing::debug!(pid = ?self.pid, "Process ignored SIGHUP, sending SIGKILL");
        if let Err(e) = process.force_kill() {
            tracing::warn!(pid = ?self.pid, error = %e, "SIGKILL failed");
        }
        let code = wait_for_exit(process.as_mut(), REAP_TIMEOUT).await;
        if code.is_none() {
            tracing::warn!(pid = ?self.pid, "Process was not reaped after SIGKILL");
        }
        code
    }
}

/// Body of the writer thread. Exits when the handle is dropped.
fn write_loop(
    mut writer: Box<dyn Write + Send>,
    mut requests: mpsc::Receiver<WriteRequest>,
    alive: Arc<AtomicBool>,
) {
    while let Some(request) = requests.blocking_recv() {
        let result = if alive.load(Ordering::SeqCst) {
            writer
                .write_all(&request.data)
                .and_then(|()| writer.flush())
                .map_err(|e| PtyError::Write(e.to_string()))
        } else {
            Err(PtyError::Exited)
        };
        let _ = request.done.send(result);
    }
}

async fn wait_for_exit(process: &mut dyn PtyProcess, limit: Duration) -> Option<u32> {
    let deadline = Instant::now() + limit;
    loop {
        match process.try_wait() {
            Ok(Some(code)) => return Some(code),
            Ok(None) => {}
            Err(_) => return None,
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Detects the shell to use.
///
/// Returns `$SHELL` when set, otherwise `/bin/sh`.
pub fn detect_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FakeSpawner;
    use tokio::time::timeout;

    fn sh_options() -> SpawnOptions {
        SpawnOptions {
            shell: "/bin/sh".to_string(),
            size: TerminalSize::new(80, 24).unwrap(),
            cwd: None,
            env: vec![],
        }
    }

    async fn read_until(rx: &mut mpsc::Receiver<PtyEvent>, needle: &str) -> bool {
        let mut collected = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(PtyEvent::Output(data))) => {
                    collected.push_str(&String::from_utf8_lossy(&data));
                    if collected.contains(needle) {
                        return true;
                    }
                }
                Ok(Some(_)) | Ok(None) => return false,
                Err(_) => {}
            }
        }
        false
    }

    #[test]
    fn test_terminal_size_rejects_zero() {
        assert!(TerminalSize::new(80, 24).is_ok());
        assert!(matches!(
            TerminalSize::new(0, 24),
            Err(PtyError::InvalidSize { cols: 0, rows: 24 })
        ));
        assert!(TerminalSize::new(80, 0).is_err());
    }

    #[test]
    fn test_terminal_size_pack_roundtrip() {
        let size = TerminalSize::new(u16::MAX, 1).unwrap();
        assert_eq!(TerminalSize::unpack(size.pack()), size);
    }

    #[test]
    fn test_detect_shell() {
        assert!(!detect_shell().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let mut options = sh_options();
        options.shell = "/nonexistent/shell-binary".to_string();
        let result = PtyHandle::start(&NativePtySpawner, &options);
        assert!(matches!(result, Err(PtyError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_write_and_read_output() {
        let pty = PtyHandle::start(&NativePtySpawner, &sh_options()).unwrap();
        assert!(pty.is_alive());
        let mut rx = pty.read_loop().await.unwrap();

        pty.write(b"echo test_output_marker\n").await.unwrap();
        assert!(read_until(&mut rx, "test_output_marker").await);

        pty.terminate(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn test_env_vars_reach_shell() {
        let mut options = sh_options();
        options.env = vec![("TEST_VAR".to_string(), "test_value".to_string())];
        let pty = PtyHandle::start(&NativePtySpawner, &options).unwrap();
        let mut rx = pty.read_loop().await.unwrap();

        pty.write(b"echo $TEST_VAR\n").await.unwrap();
        assert!(read_until(&mut rx, "test_value").await);

        pty.terminate(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn test_read_loop_only_once() {
        let pty = PtyHandle::start(&NativePtySpawner, &sh_options()).unwrap();
        let _rx = pty.read_loop().await.unwrap();
        assert!(matches!(pty.read_loop().await, Err(PtyError::Read(_))));
        pty.terminate(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn test_resize() {
        let pty = PtyHandle::start(&NativePtySpawner, &sh_options()).unwrap();
        assert_eq!(pty.size(), TerminalSize { cols: 80, rows: 24 });

        pty.resize(120, 40).await.unwrap();
        assert_eq!(pty.size(), TerminalSize { cols: 120, rows: 40 });

        let result = pty.resize(0, 40).await;
        assert!(matches!(result, Err(PtyError::InvalidSize { .. })));
        assert_eq!(pty.size(), TerminalSize { cols: 120, rows: 40 });

        pty.terminate(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn test_exit_produces_single_eof() {
        let pty = PtyHandle::start(&NativePtySpawner, &sh_options()).unwrap();
        let mut rx = pty.read_loop().await.unwrap();

        pty.write(b"exit 3\n").await.unwrap();

        let mut eof_count = 0;
        while let Ok(Some(event)) = timeout(Duration::from_secs(5), rx.recv()).await {
            match event {
                PtyEvent::Output(_) => {}
                PtyEvent::Eof => eof_count += 1,
                PtyEvent::Error(e) => panic!("unexpected read error: {e}"),
            }
        }
        assert_eq!(eof_count, 1);
        assert!(!pty.is_alive());
        assert!(matches!(pty.write(b"x").await, Err(PtyError::Exited)));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_bounded() {
        let pty = PtyHandle::start(&NativePtySpawner, &sh_options()).unwrap();
        let _rx = pty.read_loop().await.unwrap();

        let started = std::time::Instant::now();
        pty.terminate(Duration::from_millis(500)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!pty.is_alive());

        assert_eq!(pty.terminate(Duration::from_millis(500)).await, None);
        assert!(matches!(pty.write(b"x").await, Err(PtyError::Exited)));
    }

    #[tokio::test]
    async fn test_terminate_escalates_when_hangup_ignored() {
        let pty = PtyHandle::start(&NativePtySpawner, &sh_options()).unwrap();
        let mut rx = pty.read_loop().await.unwrap();

        pty.write(b"trap '' HUP; echo trap_ready\n").await.unwrap();
        assert!(read_until(&mut rx, "trap_ready").await);

        let started = std::time::Instant::now();
        pty.terminate(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_terminate_completes_while_write_is_stalled() {
        let spawner = FakeSpawner::stalling();
        let pty = Arc::new(PtyHandle::start(&spawner, &spawner.options()).unwrap());

        let writer = {
            let pty = Arc::clone(&pty);
            tokio::spawn(async move { pty.write(b"never read").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        timeout(Duration::from_secs(2), pty.terminate(Duration::from_millis(50)))
            .await
            .expect("terminate blocked behind a pending write");
        assert_eq!(spawner.control(0).unwrap().terminate_calls(), 1);

        let result = timeout(Duration::from_secs(2), writer)
            .await
            .expect("write never returned")
            .unwrap();
        assert!(result.is_err());
        assert!(spawner.control(0).unwrap().written().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_unblocks_write_to_shell_not_reading_input() {
        let pty = Arc::new(PtyHandle::start(&NativePtySpawner, &sh_options()).unwrap());
        let mut rx = pty.read_loop().await.unwrap();

        pty.write(b"stty raw -echo; echo raw_$((40+2)); exec sleep 30\n")
            .await
            .unwrap();
        assert!(read_until(&mut rx, "raw_42").await);

        let writer = {
            let pty = Arc::clone(&pty);
            tokio::spawn(async move { pty.write(&vec![b'x'; 1 << 20]).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        timeout(Duration::from_secs(5), pty.terminate(Duration::from_millis(200)))
            .await
            .expect("terminate blocked behind a pending write");
        assert!(started.elapsed() < Duration::from_secs(3));

        let result = timeout(Duration::from_secs(5), writer)
            .await
            .expect("write never returned")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_writes_apply_in_order() {
        let spawner = FakeSpawner::new();
        let pty = PtyHandle::start(&spawner, &spawner.options()).unwrap();

        for chunk in [&b"one "[..], b"two ", b"three"] {
            pty.write(chunk).await.unwrap();
        }
        assert_eq!(spawner.control(0).unwrap().written(), b"one two three");

        pty.terminate(Duration::from_millis(50)).await;
        assert!(matches!(pty.write(b"x").await, Err(PtyError::Exited)));
    }
}
