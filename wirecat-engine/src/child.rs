//! Child process spawning and I/O pumps
//!
//! Spawns a child with stdin/stdout/stderr piped and starts three pump
//! tasks: a stdin-writer draining a channel into the child, and one reader
//! per output pipe forwarding chunks to the transfer loop.
//!
//! ## Shutdown protocol
//!
//! All three pumps are joined strictly before the child is reaped. Each
//! pump's natural exit condition is "pipe closed", which the OS guarantees
//! once the child exits, so joining never hangs on a live child. The order
//! is fixed: stdin-writer, stdout-reader, stderr-reader, then `wait()`.
//! [`ChildHandle::shutdown`] is the single idempotent entry point; no other
//! code path touches the child handle.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use wirecat_utils::{Result, WirecatError};

use crate::flow::FlowController;

/// Shell used for command-string indirection
pub const SHELL_PROGRAM: &str = "/bin/sh";

/// Flag passed to the shell before the command string
pub const SHELL_FLAG: &str = "-c";

/// Build the two-element argv for shell indirection: `[flag, command]`.
///
/// The returned vector owns both strings; pass it to [`spawn`] with
/// [`SHELL_PROGRAM`].
pub fn shell_command(command: &str) -> Vec<String> {
    vec![SHELL_FLAG.to_string(), command.to_string()]
}

/// Options for spawning a child process
#[derive(Debug, Clone)]
pub struct ChildOptions {
    /// Working directory for the child
    pub cwd: Option<PathBuf>,
    /// Environment variables to set
    pub env: Vec<(String, String)>,
    /// Environment variables to remove
    pub env_remove: Vec<String>,
    /// Bounded read size for the output pumps
    pub read_chunk_bytes: usize,
    /// Channel capacity (in bytes) for data headed to the child's stdin
    pub stdin_capacity: usize,
    /// Channel capacity (in bytes) for data from the child's stdout
    pub stdout_capacity: usize,
    /// Channel capacity (in bytes) for data from the child's stderr
    pub stderr_capacity: usize,
}

impl Default for ChildOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: Vec::new(),
            env_remove: Vec::new(),
            read_chunk_bytes: 4096,
            stdin_capacity: 64 * 1024,
            stdout_capacity: 64 * 1024,
            stderr_capacity: 64 * 1024,
        }
    }
}

/// Which child output pipe a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}

/// One chunk read from a child output pipe, in read order per pipe
#[derive(Debug, Clone)]
pub struct ChildChunk {
    pub stream: ChildStream,
    pub data: Bytes,
}

/// Relay-facing ends of the three pumps
#[derive(Debug)]
pub struct ChildPipes {
    /// Bytes sent here are written to the child's stdin; dropping the sender
    /// closes the child's stdin pipe
    pub stdin_tx: mpsc::Sender<Bytes>,
    /// Chunks from the child's stdout and stderr, closed once both output
    /// pumps have exited
    pub output_rx: mpsc::Receiver<ChildChunk>,
}

/// Lifecycle state of one pump task
#[derive(Debug)]
enum PumpState {
    Running(JoinHandle<()>),
    Joined,
}

impl PumpState {
    /// Join the pump if still running. Safe to call repeatedly.
    async fn join(&mut self, name: &'static str) {
        if let PumpState::Running(handle) = std::mem::replace(self, PumpState::Joined) {
            match handle.await {
                Ok(()) => trace!(pump = name, "pump task joined"),
                Err(e) => warn!(pump = name, error = %e, "pump task join failed"),
            }
        }
    }
}

/// Exclusive owner of the child process and its three pump tasks
#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
    stdin_pump: PumpState,
    stdout_pump: PumpState,
    stderr_pump: PumpState,
    cancel: CancellationToken,
    exit: Option<ExitStatus>,
}

impl ChildHandle {
    /// OS process id, while the child has not been reaped
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status, once [`shutdown`](Self::shutdown) has reaped the child
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Join all pump tasks in the fixed order: stdin-writer, stdout-reader,
    /// stderr-reader. Idempotent; joining an already-joined pump is a no-op.
    pub async fn join_pumps(&mut self) {
        // Unblock any pump parked on a flow-control pause
        self.cancel.cancel();
        self.stdin_pump.join("stdin-writer").await;
        self.stdout_pump.join("stdout-reader").await;
        self.stderr_pump.join("stderr-reader").await;
    }

    /// Join the pumps, then reap the child and interpret its exit status.
    ///
    /// Idempotent: repeated calls return the stored exit status without
    /// touching the child again. A failed `wait()` is reported with the
    /// pumps already safely joined.
    pub async fn shutdown(&mut self) -> Result<ExitStatus> {
        self.join_pumps().await;

        if let Some(status) = self.exit {
            return Ok(status);
        }

        let status = self
            .child
            .wait()
            .await
            .map_err(|e| WirecatError::child_wait(e.to_string()))?;
        self.exit = Some(status);

        match status.code() {
            Some(code) => debug!(code, "child exited"),
            None => debug!("child terminated by signal"),
        }

        Ok(status)
    }

    /// Request child termination without waiting.
    ///
    /// Used when a timeout fires while the child still runs: killing it
    /// closes its pipes, letting the output pumps reach natural EOF before
    /// [`shutdown`](Self::shutdown) joins them.
    pub fn kill(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already exited between our check and the signal
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Spawn a child with all three stdio streams piped and start its pumps.
///
/// Output pumps `record` every chunk against `flow` before forwarding; the
/// relay releases after the peer write completes. The stdin pump releases
/// after writing bytes the relay recorded at peer-read time.
pub fn spawn(
    program: &str,
    args: &[String],
    options: &ChildOptions,
    flow: Arc<FlowController>,
) -> Result<(ChildHandle, ChildPipes)> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &options.env {
        cmd.env(key, value);
    }
    for key in &options.env_remove {
        cmd.env_remove(key);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| WirecatError::spawn(format!("{}: {}", program, e)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| WirecatError::internal("child stdin not piped"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| WirecatError::internal("child stdout not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| WirecatError::internal("child stderr not piped"))?;

    debug!(pid = child.id(), program, "child spawned");

    let chunk = options.read_chunk_bytes.max(1);
    let (stdin_tx, stdin_rx) = mpsc::channel::<Bytes>(channel_bound(options.stdin_capacity, chunk));
    let (output_tx, output_rx) =
        mpsc::channel::<ChildChunk>(channel_bound(options.stdout_capacity, chunk));

    let cancel = CancellationToken::new();

    let stdin_pump = PumpState::Running(spawn_stdin_pump(
        stdin,
        stdin_rx,
        flow.clone(),
        cancel.clone(),
    ));
    let stdout_pump = PumpState::Running(spawn_output_pump(
        ChildStream::Stdout,
        stdout,
        output_tx.clone(),
        flow.clone(),
        cancel.clone(),
        chunk,
    ));
    let stderr_pump = PumpState::Running(spawn_output_pump(
        ChildStream::Stderr,
        stderr,
        output_tx,
        flow,
        cancel.clone(),
        chunk,
    ));

    Ok((
        ChildHandle {
            child,
            stdin_pump,
            stdout_pump,
            stderr_pump,
            cancel,
            exit: None,
        },
        ChildPipes {
            stdin_tx,
            output_rx,
        },
    ))
}

fn channel_bound(capacity_bytes: usize, chunk: usize) -> usize {
    (capacity_bytes / chunk).max(1)
}

/// Writes channel bytes to the child's stdin; exits on channel close (source
/// EOF) or write failure (child stopped reading). Dropping the pipe on exit
/// delivers EOF to the child.
fn spawn_stdin_pump(
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::Receiver<Bytes>,
    flow: Arc<FlowController>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    async fn write_chunk(
        stdin: &mut tokio::process::ChildStdin,
        buf: Bytes,
        flow: &FlowController,
    ) -> bool {
        let n = buf.len();
        let result = stdin.write_all(&buf).await;
        flow.release(n);
        match result {
            Ok(()) => {
                let _ = stdin.flush().await;
                true
            }
            Err(e) => {
                debug!(error = %e, "child stdin write failed, pump exiting");
                false
            }
        }
    }

    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    // Finish writes already queued, then close
                    while let Ok(buf) = rx.try_recv() {
                        if !write_chunk(&mut stdin, buf, &flow).await {
                            break;
                        }
                    }
                    break;
                }
                next = rx.recv() => next,
            };

            let Some(buf) = next else { break };
            if !write_chunk(&mut stdin, buf, &flow).await {
                // Account for chunks the relay already recorded
                while let Ok(buf) = rx.try_recv() {
                    flow.release(buf.len());
                }
                break;
            }
        }
        trace!("stdin-writer pump exiting");
    })
}

/// Reads bounded chunks from one child output pipe and forwards them to the
/// relay; exits on EOF (0-byte read, guaranteed after child exit), read
/// error, or relay-side channel closure.
fn spawn_output_pump(
    stream: ChildStream,
    mut reader: impl AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<ChildChunk>,
    flow: Arc<FlowController>,
    cancel: CancellationToken,
    chunk: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; chunk];
        loop {
            if flow.should_pause() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = flow.wait_until_resumed() => {}
                }
            }

            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                result = reader.read(&mut buf) => match result {
                    Ok(0) => {
                        trace!(stream = ?stream, "child pipe EOF");
                        break;
                    }
                    Ok(n) => n,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::BrokenPipe
                            || e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        trace!(stream = ?stream, "child pipe closed");
                        break;
                    }
                    Err(e) => {
                        warn!(stream = ?stream, error = %e, "child pipe read error");
                        break;
                    }
                },
            };

            flow.record(n);
            let data = Bytes::copy_from_slice(&buf[..n]);
            if tx.send(ChildChunk { stream, data }).await.is_err() {
                // Relay gone; nothing will release this chunk
                flow.release(n);
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_flow() -> Arc<FlowController> {
        Arc::new(FlowController::new(1 << 20, 0.9, 0.5))
    }

    // ==================== Shell Command Tests ====================

    #[test]
    fn test_shell_command_two_elements() {
        let argv = shell_command("echo 'a' | grep a");
        assert_eq!(argv, vec!["-c".to_string(), "echo 'a' | grep a".to_string()]);
    }

    #[test]
    fn test_shell_command_owns_strings() {
        let source = String::from("ls -la");
        let argv = shell_command(&source);
        drop(source);
        assert_eq!(argv[1], "ls -la");
    }

    // ==================== Spawn Tests ====================

    #[tokio::test]
    async fn test_spawn_failure_is_spawn_error() {
        let result = spawn(
            "/nonexistent/binary",
            &[],
            &ChildOptions::default(),
            test_flow(),
        );
        match result {
            Err(WirecatError::Spawn(msg)) => assert!(msg.contains("/nonexistent/binary")),
            other => panic!("expected Spawn error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_echo_delivers_stdout() {
        let (mut handle, mut pipes) = spawn(
            "/bin/echo",
            &["hello".to_string()],
            &ChildOptions::default(),
            test_flow(),
        )
        .unwrap();

        drop(pipes.stdin_tx);

        let mut collected = Vec::new();
        while let Some(chunk) = pipes.output_rx.recv().await {
            assert_eq!(chunk.stream, ChildStream::Stdout);
            collected.extend_from_slice(&chunk.data);
        }
        assert_eq!(collected, b"hello\n");

        let status = handle.shutdown().await.unwrap();
        assert_eq!(status.code(), Some(0));
    }

    #[tokio::test]
    async fn test_fast_exit_shutdown_repeated() {
        // A child exiting in under a millisecond must never double-join or
        // touch a stale handle; run it several times to shake out races.
        for _ in 0..10 {
            let (mut handle, pipes) =
                spawn("/bin/true", &[], &ChildOptions::default(), test_flow()).unwrap();
            drop(pipes);

            let status = handle.shutdown().await.unwrap();
            assert!(status.success());

            // Idempotent: second shutdown reports the same status
            let again = handle.shutdown().await.unwrap();
            assert_eq!(again.code(), status.code());
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported() {
        let (mut handle, pipes) =
            spawn("/bin/false", &[], &ChildOptions::default(), test_flow()).unwrap();
        drop(pipes);

        let status = handle.shutdown().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_stdin_roundtrip_through_cat() {
        let flow = test_flow();
        let (mut handle, mut pipes) =
            spawn("/bin/cat", &[], &ChildOptions::default(), flow.clone()).unwrap();

        flow.record(5);
        pipes
            .stdin_tx
            .send(Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let chunk = tokio::time::timeout(Duration::from_secs(5), pipes.output_rx.recv())
            .await
            .expect("cat output timed out")
            .expect("output channel closed early");
        assert_eq!(&chunk.data[..], b"hello");
        flow.release(chunk.data.len());

        // Closing stdin lets cat exit, which closes its output pipes
        drop(pipes.stdin_tx);
        while pipes.output_rx.recv().await.is_some() {}

        let status = handle.shutdown().await.unwrap();
        assert!(status.success());
        assert_eq!(flow.buffered(), 0);
    }

    #[tokio::test]
    async fn test_stderr_tagged() {
        let (mut handle, mut pipes) = spawn(
            SHELL_PROGRAM,
            &shell_command("echo err >&2"),
            &ChildOptions::default(),
            test_flow(),
        )
        .unwrap();
        drop(pipes.stdin_tx);

        let mut err_bytes = Vec::new();
        while let Some(chunk) = pipes.output_rx.recv().await {
            if chunk.stream == ChildStream::Stderr {
                err_bytes.extend_from_slice(&chunk.data);
            }
        }
        assert_eq!(err_bytes, b"err\n");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_env_injection() {
        let options = ChildOptions {
            env: vec![("WIRECAT_TEST_VAR".into(), "42".into())],
            ..ChildOptions::default()
        };
        let (mut handle, mut pipes) = spawn(
            SHELL_PROGRAM,
            &shell_command("echo $WIRECAT_TEST_VAR"),
            &options,
            test_flow(),
        )
        .unwrap();
        drop(pipes.stdin_tx);

        let mut out = Vec::new();
        while let Some(chunk) = pipes.output_rx.recv().await {
            out.extend_from_slice(&chunk.data);
        }
        assert_eq!(out, b"42\n");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_then_shutdown() {
        // cat with open stdin would run forever; kill must close its pipes
        // so shutdown can join the pumps and reap
        let (mut handle, mut pipes) =
            spawn("/bin/cat", &[], &ChildOptions::default(), test_flow()).unwrap();

        handle.kill().unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown hung after kill")
            .unwrap();
        assert!(!status.success());

        // Pumps are gone, channel drains to closure
        drop(pipes.stdin_tx);
        while pipes.output_rx.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_noop() {
        let (mut handle, pipes) =
            spawn("/bin/true", &[], &ChildOptions::default(), test_flow()).unwrap();
        drop(pipes);
        handle.shutdown().await.unwrap();
        handle.kill().unwrap();
    }

    // ==================== Options Tests ====================

    #[test]
    fn test_default_options() {
        let options = ChildOptions::default();
        assert!(options.cwd.is_none());
        assert!(options.env.is_empty());
        assert_eq!(options.read_chunk_bytes, 4096);
    }

    #[test]
    fn test_channel_bound_at_least_one() {
        assert_eq!(channel_bound(0, 4096), 1);
        assert_eq!(channel_bound(4096, 4096), 1);
        assert_eq!(channel_bound(64 * 1024, 4096), 16);
    }
}
