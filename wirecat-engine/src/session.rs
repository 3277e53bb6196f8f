//! Session lifecycle
//!
//! Owns one transfer session end to end: optional connection phase, target
//! setup (stream or spawned child), the relay, timeout supervision, and the
//! ordered teardown. Teardown in exec mode is strict: pumps are joined
//! before the child is reaped, and the peer endpoint closes only after both.
//!
//! Timeout arbitration: the supervision timer observes the execution
//! deadline and the idle clock; whichever fires first kills the child (if
//! any), cancels the relay, and stamps the outcome. A timeout reason always
//! wins over the relay's own cancellation report.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use wirecat_utils::WirecatError;

use crate::child::{self, ChildHandle};
use crate::config::SessionConfig;
use crate::filter::FilterChain;
use crate::relay::{Direction, Endpoint, RelayEnd, RelaySummary, TransferLoop};

/// Where a session stands in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created; connection and target setup not finished
    Initializing,
    /// Relay running
    Active,
    /// Terminal condition observed; relay winding down
    Draining,
    /// All pump tasks joined (exec mode only)
    PumpsJoined,
    /// Child reaped and exit status recorded (exec mode only)
    ChildReaped,
    /// Everything released
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Initializing => "initializing",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::PumpsJoined => "pumps-joined",
            SessionState::ChildReaped => "child-reaped",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    /// The peer closed its side
    PeerClosed,
    /// The local stream target reached EOF
    LocalClosed,
    /// Both directions reached EOF without either ending the session alone
    BothClosed,
    /// The child exited and its output pipes drained
    ChildExited,
    /// The wall-clock execution ceiling fired
    ExecutionTimeout,
    /// No traffic for the configured idle window
    IdleTimeout,
    /// The connection phase exceeded its ceiling
    ConnectionTimeout,
    /// An I/O failure made a direction terminal
    Io,
    /// A conversion buffer could not be allocated
    OutOfMemory,
    /// The target process could not be started
    SpawnFailed,
    /// Reaping the child failed after the pumps were joined
    ChildWaitFailed,
    /// Stopped through the session's cancel token
    Cancelled,
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TerminalReason::PeerClosed => "peer closed",
            TerminalReason::LocalClosed => "local closed",
            TerminalReason::BothClosed => "both closed",
            TerminalReason::ChildExited => "child exited",
            TerminalReason::ExecutionTimeout => "execution timeout",
            TerminalReason::IdleTimeout => "idle timeout",
            TerminalReason::ConnectionTimeout => "connection timeout",
            TerminalReason::Io => "io error",
            TerminalReason::OutOfMemory => "out of memory",
            TerminalReason::SpawnFailed => "spawn failed",
            TerminalReason::ChildWaitFailed => "child wait failed",
            TerminalReason::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What the session ran the peer against
#[derive(Debug)]
pub enum SessionTarget {
    /// Another byte stream (stdio, a second socket, a test pipe)
    Stream(Endpoint),
    /// A spawned child process
    Exec {
        program: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
        env: Vec<(String, String)>,
    },
}

impl SessionTarget {
    /// Run a program directly
    pub fn exec(program: impl Into<String>, args: Vec<String>) -> Self {
        Self::Exec {
            program: program.into(),
            args,
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Run a command string through the shell
    pub fn shell(command: &str) -> Self {
        Self::exec(child::SHELL_PROGRAM, child::shell_command(command))
    }

    /// Bridge the peer to this process's own standard streams
    pub fn stdio() -> Self {
        Self::Stream(Endpoint::stdio())
    }
}

/// Final report for one session
#[derive(Debug)]
pub struct SessionOutcome {
    pub reason: TerminalReason,
    pub error: Option<WirecatError>,
    /// Child exit status, exec mode only
    pub exit: Option<ExitStatus>,
    pub near_to_far_bytes: u64,
    pub far_to_near_bytes: u64,
    pub final_state: SessionState,
}

impl SessionOutcome {
    /// Process exit code for the caller: the child's own code when it
    /// reported one, otherwise 0 for a clean ending and 1 for anything else.
    pub fn exit_code(&self) -> i32 {
        if let Some(code) = self.exit.and_then(|status| status.code()) {
            return code;
        }
        if self.is_clean() {
            0
        } else {
            1
        }
    }

    /// Ended by an ordinary EOF or child exit, with no error recorded
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
            && matches!(
                self.reason,
                TerminalReason::PeerClosed
                    | TerminalReason::LocalClosed
                    | TerminalReason::BothClosed
                    | TerminalReason::ChildExited
            )
    }
}

/// Supervision tick for the idle and execution clocks
const TIMEOUT_POLL: Duration = Duration::from_millis(25);

/// One transfer session
pub struct Session {
    id: Uuid,
    config: SessionConfig,
    state: SessionState,
    filters_near_to_far: FilterChain,
    filters_far_to_near: FilterChain,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(config: SessionConfig) -> wirecat_utils::Result<Self> {
        config.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            config,
            state: SessionState::Initializing,
            filters_near_to_far: FilterChain::new(),
            filters_far_to_near: FilterChain::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token that stops the session from outside
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Install a filter chain for one relay direction
    pub fn set_filters(&mut self, direction: Direction, chain: FilterChain) {
        match direction {
            Direction::NearToFar => self.filters_near_to_far = chain,
            Direction::FarToNear => self.filters_far_to_near = chain,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session = %self.id, from = %self.state, to = %next, "session state");
        self.state = next;
    }

    /// Connect to a TCP peer under the connection timeout, then run.
    pub async fn run_tcp(self, addr: &str, target: SessionTarget) -> SessionOutcome {
        let connect = tokio::net::TcpStream::connect(addr);
        let connected = match self.config.connection_timeout() {
            Some(limit) => match tokio::time::timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(session = %self.id, %addr, ?limit, "connection timed out");
                    return self.abort(TerminalReason::ConnectionTimeout, None);
                }
            },
            None => connect.await,
        };

        match connected {
            Ok(stream) => self.run(Endpoint::from_tcp(stream), target).await,
            Err(e) => {
                warn!(session = %self.id, %addr, error = %e, "connection failed");
                self.abort(TerminalReason::Io, Some(e.into()))
            }
        }
    }

    /// Run the session to completion over an already-connected peer.
    pub async fn run(mut self, peer: Endpoint, target: SessionTarget) -> SessionOutcome {
        info!(session = %self.id, "session starting");

        let flow = Arc::new(self.config.flow_controller());
        let relay_config = self.config.relay_config();

        // Target setup; spawn failure is terminal before any transfer
        let (mut relay, mut child): (TransferLoop, Option<ChildHandle>) = match target {
            SessionTarget::Stream(near) => (
                TransferLoop::between(near, peer, relay_config, flow),
                None,
            ),
            SessionTarget::Exec {
                program,
                args,
                cwd,
                env,
            } => {
                let mut options = self.config.child_options();
                options.cwd = cwd;
                options.env = env;
                match child::spawn(&program, &args, &options, flow.clone()) {
                    Ok((handle, pipes)) => (
                        TransferLoop::with_child(pipes, peer, relay_config, flow),
                        Some(handle),
                    ),
                    Err(e) => {
                        warn!(session = %self.id, program, error = %e, "spawn failed");
                        return self.abort(TerminalReason::SpawnFailed, Some(e));
                    }
                }
            }
        };

        let exec_mode = child.is_some();
        relay.set_filters(
            Direction::NearToFar,
            std::mem::take(&mut self.filters_near_to_far),
        );
        relay.set_filters(
            Direction::FarToNear,
            std::mem::take(&mut self.filters_far_to_near),
        );
        let activity = relay.activity();
        // Held across teardown; the peer closes only at the Closed state
        let peer_writer = relay.peer_writer();

        self.transition(SessionState::Active);

        let relay_cancel = self.cancel.child_token();
        let mut relay_task = tokio::spawn(relay.run(relay_cancel.clone()));

        let exec_deadline = self
            .config
            .execution_timeout()
            .map(|limit| tokio::time::Instant::now() + limit);
        let idle_limit = self.config.idle_timeout();

        let mut poll = tokio::time::interval(TIMEOUT_POLL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Set once by the first terminal condition the supervisor observes
        let mut supervisor_reason: Option<TerminalReason> = None;

        let summary: RelaySummary = loop {
            tokio::select! {
                result = &mut relay_task => {
                    match result {
                        Ok(summary) => break summary,
                        Err(e) => {
                            warn!(session = %self.id, error = %e, "relay task failed");
                            break RelaySummary {
                                end: RelayEnd::Error {
                                    direction: Direction::NearToFar,
                                    error: WirecatError::internal(format!(
                                        "relay task failed: {}",
                                        e
                                    )),
                                },
                                near_to_far_bytes: 0,
                                far_to_near_bytes: 0,
                            };
                        }
                    }
                }
                _ = poll.tick(), if supervisor_reason.is_none() => {
                    let now = tokio::time::Instant::now();
                    if exec_deadline.is_some_and(|deadline| now >= deadline) {
                        info!(session = %self.id, "execution timeout");
                        supervisor_reason = Some(TerminalReason::ExecutionTimeout);
                    } else if idle_limit.is_some_and(|limit| activity.idle_for() >= limit) {
                        info!(session = %self.id, "idle timeout");
                        supervisor_reason = Some(TerminalReason::IdleTimeout);
                    }
                    if supervisor_reason.is_some() {
                        self.terminate(&mut child, &relay_cancel);
                    }
                }
                _ = self.cancel.cancelled(), if supervisor_reason.is_none() => {
                    info!(session = %self.id, "session cancelled");
                    supervisor_reason = Some(TerminalReason::Cancelled);
                    self.terminate(&mut child, &relay_cancel);
                }
            }
        };

        self.transition(SessionState::Draining);

        // Join-before-reap ordering, exec mode only
        let mut exit = None;
        let mut teardown_error = None;
        if let Some(handle) = child.as_mut() {
            // Any end other than child exit can leave the child running,
            // and a live child blocks the reap. Killing it closes its pipes
            // so the pumps reach EOF; killing an exited child is a no-op.
            if !matches!(summary.end, RelayEnd::Eof(Direction::NearToFar)) {
                if let Err(e) = handle.kill() {
                    warn!(session = %self.id, error = %e, "kill failed");
                }
            }
            handle.join_pumps().await;
            self.transition(SessionState::PumpsJoined);

            match handle.shutdown().await {
                Ok(status) => {
                    exit = Some(status);
                    self.transition(SessionState::ChildReaped);
                }
                Err(e) => {
                    warn!(session = %self.id, error = %e, "child reap failed");
                    teardown_error = Some(e);
                }
            }
        }

        drop(peer_writer);
        self.transition(SessionState::Closed);

        let (mut reason, mut error) = match summary.end {
            RelayEnd::Eof(Direction::NearToFar) if exec_mode => {
                (TerminalReason::ChildExited, None)
            }
            RelayEnd::Eof(Direction::NearToFar) => (TerminalReason::LocalClosed, None),
            RelayEnd::Eof(Direction::FarToNear) => (TerminalReason::PeerClosed, None),
            RelayEnd::BothEof => (TerminalReason::BothClosed, None),
            RelayEnd::Error { error, .. } => {
                let reason = match &error {
                    WirecatError::OutOfMemory(_) => TerminalReason::OutOfMemory,
                    _ => TerminalReason::Io,
                };
                (reason, Some(error))
            }
            RelayEnd::Cancelled => (TerminalReason::Cancelled, None),
        };

        // The supervisor's verdict outranks the relay's cancellation report
        if let Some(timeout_reason) = supervisor_reason {
            reason = timeout_reason;
        }
        // A reap failure outranks everything; the exit status is lost
        if let Some(e) = teardown_error {
            reason = TerminalReason::ChildWaitFailed;
            error = Some(e);
        }

        info!(
            session = %self.id,
            %reason,
            near_to_far_bytes = summary.near_to_far_bytes,
            far_to_near_bytes = summary.far_to_near_bytes,
            "session finished"
        );

        SessionOutcome {
            reason,
            error,
            exit,
            near_to_far_bytes: summary.near_to_far_bytes,
            far_to_near_bytes: summary.far_to_near_bytes,
            final_state: self.state,
        }
    }

    /// Kill the child (so its pipes close and the pumps reach EOF) and stop
    /// the relay.
    fn terminate(&self, child: &mut Option<ChildHandle>, relay_cancel: &CancellationToken) {
        if let Some(handle) = child.as_mut() {
            if let Err(e) = handle.kill() {
                warn!(session = %self.id, error = %e, "kill failed");
            }
        }
        relay_cancel.cancel();
    }

    /// Terminal outcome for failures before any transfer started
    fn abort(mut self, reason: TerminalReason, error: Option<WirecatError>) -> SessionOutcome {
        self.transition(SessionState::Closed);
        SessionOutcome {
            reason,
            error,
            exit: None,
            near_to_far_bytes: 0,
            far_to_near_bytes: 0,
            final_state: self.state,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
