//! Process launching.
//!
//! Starts an external process either attached to a pseudo-terminal
//! (interactive terminals) or with separate stdout/stderr pipes (exec and log
//! follow). Each process is reaped by exactly one waiter, which publishes the
//! exit status on a watch channel; signalling goes to the whole process group
//! so helpers spawned by the target die with it.

use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::ProcessExit;
use thiserror::Error;
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::{mpsc, watch};

/// How long to wait for a process after SIGKILL before giving up on reaping it.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Default read buffer size for pty output.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    /// Terminal height in rows.
    pub rows: u16,
    /// Terminal width in columns.
    pub cols: u16,
}

impl Dimensions {
    /// Creates a new dimension pair.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl From<Dimensions> for PtySize {
    fn from(dims: Dimensions) -> Self {
        PtySize {
            rows: dims.rows,
            cols: dims.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Why a launch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchErrorKind {
    /// The executable is missing or not permitted.
    Spawn,
    /// No pseudo-terminal could be allocated.
    PtyAlloc,
}

impl fmt::Display for LaunchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchErrorKind::Spawn => f.write_str("spawn"),
            LaunchErrorKind::PtyAlloc => f.write_str("pty allocation"),
        }
    }
}

/// Error returned when a process could not be started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} failed: {message}")]
pub struct LaunchError {
    /// Failure category.
    pub kind: LaunchErrorKind,
    /// Underlying error text.
    pub message: String,
}

impl LaunchError {
    fn spawn(err: impl fmt::Display) -> Self {
        Self {
            kind: LaunchErrorKind::Spawn,
            message: err.to_string(),
        }
    }

    fn pty_alloc(err: impl fmt::Display) -> Self {
        Self {
            kind: LaunchErrorKind::PtyAlloc,
            message: err.to_string(),
        }
    }
}

/// What to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable name or path.
    pub program: String,
    /// Arguments, not including the program.
    pub args: Vec<String>,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    /// Creates a spec for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Returns the command line as a single string, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output side of a pseudo-terminal.
///
/// The master is read on a dedicated thread; chunks are handed over through a
/// channel of capacity one so the reader never runs ahead of its consumer by
/// more than a single chunk.
pub struct PtyOutput {
    rx: mpsc::Receiver<std::io::Result<Bytes>>,
}

impl PtyOutput {
    fn spawn(mut reader: Box<dyn Read + Send>, buffer_size: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel(1);

        std::thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || {
                let mut buffer = vec![0u8; buffer_size.max(1)];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = Bytes::copy_from_slice(&buffer[..n]);
                            if tx.blocking_send(Ok(chunk)).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        // Linux reports EIO once every slave descriptor is closed.
                        Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => break,
                        Err(e) => {
                            let _ = tx.blocking_send(Err(e));
                            break;
                        }
                    }
                }
                tracing::trace!("pty reader thread finished");
            })?;

        Ok(Self { rx })
    }

    /// Receives the next chunk; `None` at end of stream.
    pub async fn recv(&mut self) -> Option<std::io::Result<Bytes>> {
        self.rx.recv().await
    }
}

/// Input side of a pseudo-terminal.
#[derive(Clone)]
pub struct PtyInput {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl PtyInput {
    /// Writes all of `data` to the terminal and flushes it.
    ///
    /// The write runs on the blocking pool; concurrent callers are serialized
    /// so writes never interleave.
    pub async fn write_all(&self, data: Bytes) -> std::io::Result<()> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut writer = writer
                .lock()
                .map_err(|_| std::io::Error::other("pty writer lock poisoned"))?;
            writer.write_all(&data)?;
            writer.flush()
        })
        .await
        .map_err(std::io::Error::other)?
    }
}

/// Byte channels of a launched process.
pub enum ProcessIo {
    /// Pseudo-terminal master, split into its two directions.
    Pty {
        /// Process output (stdout and stderr merged by the terminal).
        output: PtyOutput,
        /// Process input.
        input: PtyInput,
    },
    /// Independent output pipes.
    Pipes {
        /// Standard output.
        stdout: ChildStdout,
        /// Standard error.
        stderr: ChildStderr,
    },
}

/// A running (or exited) process owned by a session.
pub struct ProcessHandle {
    pid: Option<u32>,
    command: String,
    io: Option<ProcessIo>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    interactive: bool,
    terminating: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("interactive", &self.interactive)
            .field("exit", &*self.exit_rx.borrow())
            .finish()
    }
}

/// Starts a process.
///
/// With `pty` set, the process gets a fresh pseudo-terminal of that size as
/// its controlling terminal; otherwise stdout and stderr are piped and stdin
/// is closed.
pub fn launch(
    spec: &LaunchSpec,
    pty: Option<Dimensions>,
    read_buffer_size: usize,
) -> Result<ProcessHandle, LaunchError> {
    let handle = match pty {
        Some(dims) => launch_pty(spec, dims, read_buffer_size)?,
        None => launch_piped(spec)?,
    };

    tracing::debug!(
        pid = ?handle.pid,
        interactive = handle.interactive,
        command = %handle.command,
        "Launched process"
    );

    Ok(handle)
}

fn launch_pty(
    spec: &LaunchSpec,
    dims: Dimensions,
    read_buffer_size: usize,
) -> Result<ProcessHandle, LaunchError> {
    let pair = native_pty_system()
        .openpty(dims.into())
        .map_err(LaunchError::pty_alloc)?;

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(LaunchError::pty_alloc)?;
    let writer = pair.master.take_writer().map_err(LaunchError::pty_alloc)?;
    let output = PtyOutput::spawn(reader, read_buffer_size).map_err(LaunchError::pty_alloc)?;

    let mut cmd = CommandBuilder::new(&spec.program);
    cmd.args(&spec.args);
    if let Some(ref dir) = spec.cwd {
        cmd.cwd(dir);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(LaunchError::spawn)?;
    // Only the child may hold the slave, so its exit closes the terminal.
    drop(pair.slave);

    let pid = child.process_id();
    let terminating = Arc::new(AtomicBool::new(false));
    let exit_rx = spawn_pty_waiter(child, Arc::clone(&terminating))
        .map_err(LaunchError::spawn)?;

    Ok(ProcessHandle {
        pid,
        command: spec.command_line(),
        io: Some(ProcessIo::Pty {
            output,
            input: PtyInput {
                writer: Arc::new(Mutex::new(writer)),
            },
        }),
        master: Mutex::new(Some(pair.master)),
        interactive: true,
        terminating,
        exit_rx,
    })
}

fn spawn_pty_waiter(
    mut child: Box<dyn Child + Send + Sync>,
    terminating: Arc<AtomicBool>,
) -> std::io::Result<watch::Receiver<Option<ProcessExit>>> {
    let (exit_tx, exit_rx) = watch::channel(None);
    let pid = child.process_id();

    let spawned = std::thread::Builder::new()
        .name("pty-waiter".to_string())
        .spawn(move || {
            let exit = match child.wait() {
                Ok(status) if status.success() => ProcessExit::Exited { code: 0 },
                Ok(_) if terminating.load(Ordering::SeqCst) => ProcessExit::Killed,
                Ok(status) => ProcessExit::Exited {
                    code: status.exit_code() as i32,
                },
                Err(e) => {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to wait for pty process");
                    ProcessExit::Unknown
                }
            };
            let _ = exit_tx.send(Some(exit));
        });

    if let Err(e) = spawned {
        if let Some(pid) = pid {
            signal_group(pid, Signal::SIGKILL);
        }
        return Err(e);
    }

    Ok(exit_rx)
}

fn launch_piped(spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError> {
    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(ref dir) = spec.cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(LaunchError::spawn)?;
    let pid = child.id();

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(LaunchError::spawn("process pipes unavailable"));
    };

    let terminating = Arc::new(AtomicBool::new(false));
    let (exit_tx, exit_rx) = watch::channel(None);
    let waiter_flag = Arc::clone(&terminating);
    tokio::spawn(async move {
        let exit = match child.wait().await {
            Ok(status) => exit_from_status(status, waiter_flag.load(Ordering::SeqCst)),
            Err(e) => {
                tracing::warn!(pid = ?pid, error = %e, "Failed to wait for process");
                ProcessExit::Unknown
            }
        };
        let _ = exit_tx.send(Some(exit));
    });

    Ok(ProcessHandle {
        pid,
        command: spec.command_line(),
        io: Some(ProcessIo::Pipes { stdout, stderr }),
        master: Mutex::new(None),
        interactive: false,
        terminating,
        exit_rx,
    })
}

fn exit_from_status(status: std::process::ExitStatus, terminating: bool) -> ProcessExit {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => ProcessExit::Exited { code },
        (None, Some(_)) if terminating => ProcessExit::Killed,
        (None, Some(signal)) => ProcessExit::Signaled { signal },
        (None, None) => ProcessExit::Unknown,
    }
}

/// Sends `signal` to the process group led by `pid`.
fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            tracing::warn!(pid = pid, signal = ?signal, error = %e, "Failed to signal process group");
        }
    }
}

impl ProcessHandle {
    /// Returns the process ID, if the platform reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the launched command line.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Returns true for pty-backed processes.
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Takes the byte channels. Returns `None` once they have been taken.
    pub fn take_io(&mut self) -> Option<ProcessIo> {
        self.io.take()
    }

    /// Returns the exit status if the process has already been reaped.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Returns true once the process has been reaped.
    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Waits until the process has been reaped.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        wait_for_exit(&mut rx).await
    }

    /// Resizes the pseudo-terminal.
    ///
    /// Returns `Ok(false)` without doing anything for piped processes and
    /// after the terminal has been released.
    pub fn resize(&self, dims: Dimensions) -> std::io::Result<bool> {
        let master = self
            .master
            .lock()
            .map_err(|_| std::io::Error::other("pty master lock poisoned"))?;
        match master.as_ref() {
            Some(master) => {
                master
                    .resize(dims.into())
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns the current pseudo-terminal size, if any.
    pub fn pty_size(&self) -> Option<Dimensions> {
        let master = self.master.lock().ok()?;
        let size = master.as_ref()?.get_size().ok()?;
        Some(Dimensions::new(size.rows, size.cols))
    }

    /// Terminates the process group and waits for the process to be reaped.
    ///
    /// Interactive processes get SIGHUP (terminal hangup), piped ones SIGTERM;
    /// whatever is still alive after `grace` gets SIGKILL. Calling this on an
    /// exited process returns its recorded status without signalling anything.
    pub async fn terminate(&self, grace: Duration) -> ProcessExit {
        if let Some(exit) = self.exit_status() {
            return exit;
        }

        let Some(pid) = self.pid else {
            return self.wait().await;
        };

        self.terminating.store(true, Ordering::SeqCst);
        let polite = if self.interactive {
            Signal::SIGHUP
        } else {
            Signal::SIGTERM
        };
        signal_group(pid, polite);

        let mut rx = self.exit_rx.clone();
        if let Ok(exit) = tokio::time::timeout(grace, wait_for_exit(&mut rx)).await {
            return exit;
        }

        tracing::debug!(pid = pid, "Process ignored {:?}, sending SIGKILL", polite);
        signal_group(pid, Signal::SIGKILL);

        match tokio::time::timeout(KILL_WAIT, wait_for_exit(&mut rx)).await {
            Ok(exit) => exit,
            Err(_) => {
                tracing::warn!(pid = pid, "Process not reaped after SIGKILL");
                ProcessExit::Unknown
            }
        }
    }

    /// Releases the pseudo-terminal master. Further resizes are no-ops.
    pub fn release(&self) {
        if let Ok(mut master) = self.master.lock() {
            master.take();
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.has_exited() {
            return;
        }
        if let Some(pid) = self.pid {
            tracing::debug!(pid = pid, "Process handle dropped while running, killing");
            self.terminating.store(true, Ordering::SeqCst);
            signal_group(pid, Signal::SIGKILL);
        }
    }
}

async fn wait_for_exit(rx: &mut watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    match rx.wait_for(Option::is_some).await {
        Ok(exit) => {
            let exit: Option<ProcessExit> = *exit;
            exit.unwrap_or(ProcessExit::Unknown)
        }
        Err(_) => ProcessExit::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("/bin/sh").arg("-c").arg(script)
    }

    async fn read_pty_until(output: &mut PtyOutput, marker: &str) -> bool {
        let mut seen = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), output.recv()).await {
                Ok(Some(Ok(chunk))) => {
                    seen.push_str(&String::from_utf8_lossy(&chunk));
                    if seen.contains(marker) {
                        return true;
                    }
                }
                Ok(_) => return seen.contains(marker),
                Err(_) => {}
            }
        }
        false
    }

    #[test]
    fn test_command_line() {
        let spec = LaunchSpec::new("container").args(["exec", "web", "ls"]);
        assert_eq!(spec.command_line(), "container exec web ls");
    }

    #[test]
    fn test_launch_error_display() {
        let err = LaunchError::spawn("No such file or directory");
        assert_eq!(err.kind, LaunchErrorKind::Spawn);
        assert_eq!(err.to_string(), "spawn failed: No such file or directory");

        let err = LaunchError::pty_alloc("out of ptys");
        assert_eq!(err.to_string(), "pty allocation failed: out of ptys");
    }

    #[tokio::test]
    async fn test_launch_missing_executable() {
        let spec = LaunchSpec::new("/nonexistent/streamgate-test-binary");

        let err = launch(&spec, None, DEFAULT_READ_BUFFER_SIZE).unwrap_err();
        assert_eq!(err.kind, LaunchErrorKind::Spawn);

        let err = launch(&spec, Some(Dimensions::new(24, 80)), DEFAULT_READ_BUFFER_SIZE)
            .unwrap_err();
        assert_eq!(err.kind, LaunchErrorKind::Spawn);
    }

    #[tokio::test]
    async fn test_piped_process_output_and_exit() {
        let mut handle = launch(&sh("echo out; echo err >&2; exit 3"), None, 4096).unwrap();
        assert!(!handle.is_interactive());
        assert!(handle.pid().is_some());

        let Some(ProcessIo::Pipes { mut stdout, mut stderr }) = handle.take_io() else {
            panic!("expected pipes");
        };
        assert!(handle.take_io().is_none());

        let mut out = String::new();
        let mut err = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        stderr.read_to_string(&mut err).await.unwrap();
        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");

        let exit = timeout(Duration::from_secs(5), handle.wait()).await.unwrap();
        assert_eq!(exit, ProcessExit::Exited { code: 3 });
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_resize_is_noop_for_piped() {
        let handle = launch(&sh("sleep 5"), None, 4096).unwrap();
        assert!(!handle.resize(Dimensions::new(40, 120)).unwrap());
        assert_eq!(handle.pty_size(), None);
        handle.terminate(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_terminate_piped_process() {
        let handle = launch(&sh("sleep 30"), None, 4096).unwrap();

        let exit = timeout(
            Duration::from_secs(10),
            handle.terminate(Duration::from_secs(2)),
        )
        .await
        .unwrap();
        assert_eq!(exit, ProcessExit::Killed);
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let handle = launch(&sh("trap '' TERM; while true; do sleep 1; done"), None, 4096).unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let exit = timeout(
            Duration::from_secs(10),
            handle.terminate(Duration::from_millis(300)),
        )
        .await
        .unwrap();
        assert_eq!(exit, ProcessExit::Killed);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let handle = launch(&sh("exit 0"), None, 4096).unwrap();
        let first = timeout(Duration::from_secs(5), handle.wait()).await.unwrap();
        assert_eq!(first, ProcessExit::Exited { code: 0 });

        let second = handle.terminate(Duration::from_secs(1)).await;
        let third = handle.terminate(Duration::from_secs(1)).await;
        assert_eq!(second, first);
        assert_eq!(third, first);
    }

    #[tokio::test]
    async fn test_pty_process_echoes_input() {
        let mut handle = launch(
            &LaunchSpec::new("/bin/sh"),
            Some(Dimensions::new(24, 80)),
            4096,
        )
        .unwrap();
        assert!(handle.is_interactive());

        let Some(ProcessIo::Pty { mut output, input }) = handle.take_io() else {
            panic!("expected pty");
        };

        input
            .write_all(Bytes::from_static(b"echo pty_marker_$((40+2))\n"))
            .await
            .unwrap();
        assert!(read_pty_until(&mut output, "pty_marker_42").await);

        let exit = handle.terminate(Duration::from_secs(2)).await;
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_pty_resize_applies() {
        let handle = launch(
            &LaunchSpec::new("/bin/sh"),
            Some(Dimensions::new(24, 80)),
            4096,
        )
        .unwrap();

        assert_eq!(handle.pty_size(), Some(Dimensions::new(24, 80)));
        assert!(handle.resize(Dimensions::new(40, 120)).unwrap());
        assert_eq!(handle.pty_size(), Some(Dimensions::new(40, 120)));

        handle.release();
        assert!(!handle.resize(Dimensions::new(10, 10)).unwrap());

        handle.terminate(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_pty_output_ends_after_exit() {
        let mut handle = launch(
            &sh("echo bye"),
            Some(Dimensions::new(24, 80)),
            4096,
        )
        .unwrap();
        let Some(ProcessIo::Pty { mut output, .. }) = handle.take_io() else {
            panic!("expected pty");
        };

        let drained = timeout(Duration::from_secs(5), async {
            let mut seen = String::new();
            while let Some(Ok(chunk)) = output.recv().await {
                seen.push_str(&String::from_utf8_lossy(&chunk));
            }
            seen
        })
        .await
        .unwrap();
        assert!(drained.contains("bye"));

        let exit = timeout(Duration::from_secs(5), handle.wait()).await.unwrap();
        assert_eq!(exit, ProcessExit::Exited { code: 0 });
    }
}
