//! Bidirectional transfer loop
//!
//! Relays bytes between a near endpoint (local stdio or a spawned child) and
//! a far endpoint (the network peer). Each direction runs as its own task:
//! bounded read, optional line-ending conversion, filter chain, flow-control
//! accounting, then a complete write to the destination. The controlling
//! loop ends the session on the first terminal condition and lets in-flight
//! writes drain before handing control back to the lifecycle.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex as StateMutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use wirecat_utils::WirecatError;

use crate::child::{ChildChunk, ChildPipes};
use crate::codec::{self, CrlfMode};
use crate::filter::FilterChain;
use crate::flow::FlowController;

/// One of the two relay directions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the local endpoint (stdio or child) toward the peer
    NearToFar,
    /// From the peer toward the local endpoint
    FarToNear,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::NearToFar => write!(f, "near->far"),
            Direction::FarToNear => write!(f, "far->near"),
        }
    }
}

/// A duplex endpoint: independent read and write halves of a byte stream
pub struct Endpoint {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Endpoint {
    /// Wrap arbitrary read/write halves
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// The process's own standard streams
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// A connected TCP stream
    pub fn from_tcp(stream: tokio::net::TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").finish_non_exhaustive()
    }
}

/// Records the time of the last successful read or write, for the idle
/// timeout
#[derive(Debug)]
pub struct ActivityTracker {
    last: StateMutex<Instant>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last: StateMutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Transfer-loop tunables, derived from the session configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bounded read size per cycle
    pub read_chunk_bytes: usize,
    /// Line-ending conversion per direction
    pub crlf: CrlfMode,
    /// EOF on the near source ends the whole session
    pub close_on_eof_near_to_far: bool,
    /// EOF on the far source ends the whole session
    pub close_on_eof_far_to_near: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_chunk_bytes: 4096,
            crlf: CrlfMode::Off,
            close_on_eof_near_to_far: true,
            close_on_eof_far_to_near: true,
        }
    }
}

impl RelayConfig {
    fn close_on_eof(&self, direction: Direction) -> bool {
        match direction {
            Direction::NearToFar => self.close_on_eof_near_to_far,
            Direction::FarToNear => self.close_on_eof_far_to_near,
        }
    }
}

/// Why the relay stopped
#[derive(Debug)]
pub enum RelayEnd {
    /// The named direction's source reached EOF and its close-on-eof policy
    /// ended the session. In exec mode, `Eof(NearToFar)` means the child's
    /// output pipes closed, which follows child exit.
    Eof(Direction),
    /// Both directions reached EOF without either ending the session alone
    BothEof,
    /// An I/O or allocation failure made the named direction terminal
    Error {
        direction: Direction,
        error: WirecatError,
    },
    /// Stopped from outside (timeout or shutdown request)
    Cancelled,
}

/// Relay result plus per-direction byte counts
#[derive(Debug)]
pub struct RelaySummary {
    pub end: RelayEnd,
    pub near_to_far_bytes: u64,
    pub far_to_near_bytes: u64,
}

/// How one direction task finished
#[derive(Debug)]
enum DirectionEnd {
    Eof { ends_session: bool },
    Error(WirecatError),
    Cancelled,
}

/// Shared write half of an endpoint. Direction tasks and filter-response
/// paths write through it; an extra clone keeps the stream open past the
/// relay's own lifetime.
pub type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

fn shared(writer: Box<dyn AsyncWrite + Send + Unpin>) -> SharedWriter {
    Arc::new(Mutex::new(writer))
}

async fn write_all_shared(writer: &SharedWriter, data: &[u8]) -> std::io::Result<()> {
    let mut guard = writer.lock().await;
    guard.write_all(data).await?;
    guard.flush().await
}

/// The duplex relay between the near and far endpoints
pub struct TransferLoop {
    near: NearIo,
    far_reader: Box<dyn AsyncRead + Send + Unpin>,
    far_writer: SharedWriter,
    config: RelayConfig,
    flow: Arc<FlowController>,
    filters_near_to_far: FilterChain,
    filters_far_to_near: FilterChain,
    activity: Arc<ActivityTracker>,
}

enum NearIo {
    Stream(Endpoint),
    Child(ChildPipes),
}

impl TransferLoop {
    /// Relay between two byte streams (peer <-> stdio, or any pair)
    pub fn between(
        near: Endpoint,
        far: Endpoint,
        config: RelayConfig,
        flow: Arc<FlowController>,
    ) -> Self {
        Self {
            near: NearIo::Stream(near),
            far_reader: far.reader,
            far_writer: shared(far.writer),
            config,
            flow,
            filters_near_to_far: FilterChain::new(),
            filters_far_to_near: FilterChain::new(),
            activity: Arc::new(ActivityTracker::new()),
        }
    }

    /// Relay between a spawned child's pumps and the peer
    pub fn with_child(
        pipes: ChildPipes,
        far: Endpoint,
        config: RelayConfig,
        flow: Arc<FlowController>,
    ) -> Self {
        Self {
            near: NearIo::Child(pipes),
            far_reader: far.reader,
            far_writer: shared(far.writer),
            config,
            flow,
            filters_near_to_far: FilterChain::new(),
            filters_far_to_near: FilterChain::new(),
            activity: Arc::new(ActivityTracker::new()),
        }
    }

    /// Install a filter chain for one direction
    pub fn set_filters(&mut self, direction: Direction, chain: FilterChain) {
        match direction {
            Direction::NearToFar => self.filters_near_to_far = chain,
            Direction::FarToNear => self.filters_far_to_near = chain,
        }
    }

    /// Shared activity tracker, read by the lifecycle's idle timer
    pub fn activity(&self) -> Arc<ActivityTracker> {
        self.activity.clone()
    }

    /// Shared handle to the peer's write half. The relay drops its own
    /// clones when its tasks finish; holding this keeps the peer connection
    /// open until the caller releases it.
    pub fn peer_writer(&self) -> SharedWriter {
        self.far_writer.clone()
    }

    /// Run both directions until the first terminal condition, draining
    /// in-flight writes before returning.
    pub async fn run(self, cancel: CancellationToken) -> RelaySummary {
        let chunk = self.config.read_chunk_bytes.max(1);
        let far_writer = self.far_writer;

        let (near_to_far, far_to_near): (
            JoinHandle<(DirectionEnd, u64)>,
            JoinHandle<(DirectionEnd, u64)>,
        ) = match self.near {
            NearIo::Stream(near) => {
                let near_writer = shared(near.writer);
                let a = tokio::spawn(run_stream_direction(StreamDirection {
                    direction: Direction::NearToFar,
                    reader: near.reader,
                    dest: far_writer.clone(),
                    response_writer: near_writer.clone(),
                    filters: self.filters_near_to_far,
                    convert: self.config.crlf.applies_to(Direction::NearToFar),
                    close_on_eof: self.config.close_on_eof(Direction::NearToFar),
                    flow: self.flow.clone(),
                    activity: self.activity.clone(),
                    cancel: cancel.clone(),
                    chunk,
                }));
                let b = tokio::spawn(run_stream_direction(StreamDirection {
                    direction: Direction::FarToNear,
                    reader: self.far_reader,
                    dest: near_writer,
                    response_writer: far_writer,
                    filters: self.filters_far_to_near,
                    convert: self.config.crlf.applies_to(Direction::FarToNear),
                    close_on_eof: self.config.close_on_eof(Direction::FarToNear),
                    flow: self.flow.clone(),
                    activity: self.activity.clone(),
                    cancel: cancel.clone(),
                    chunk,
                }));
                (a, b)
            }
            NearIo::Child(pipes) => {
                let a = tokio::spawn(run_child_output_direction(
                    pipes.output_rx,
                    far_writer.clone(),
                    pipes.stdin_tx.downgrade(),
                    self.filters_near_to_far,
                    self.config.crlf.applies_to(Direction::NearToFar),
                    self.flow.clone(),
                    self.activity.clone(),
                    cancel.clone(),
                ));
                let b = tokio::spawn(run_peer_to_child_direction(PeerToChild {
                    reader: self.far_reader,
                    stdin_tx: pipes.stdin_tx,
                    response_writer: far_writer,
                    filters: self.filters_far_to_near,
                    convert: self.config.crlf.applies_to(Direction::FarToNear),
                    close_on_eof: self.config.close_on_eof(Direction::FarToNear),
                    flow: self.flow.clone(),
                    activity: self.activity.clone(),
                    cancel: cancel.clone(),
                    chunk,
                }));
                (a, b)
            }
        };

        let (end_near, ntf_bytes, end_far, ftn_bytes) =
            join_directions(near_to_far, far_to_near, &cancel).await;

        let end = conclude(end_near, end_far);
        debug!(
            end = ?end,
            near_to_far_bytes = ntf_bytes,
            far_to_near_bytes = ftn_bytes,
            "relay finished"
        );

        RelaySummary {
            end,
            near_to_far_bytes: ntf_bytes,
            far_to_near_bytes: ftn_bytes,
        }
    }
}

/// Await both direction tasks; once either finishes with a session-ending
/// condition, cancel the other so it drains and exits.
async fn join_directions(
    mut near_to_far: JoinHandle<(DirectionEnd, u64)>,
    mut far_to_near: JoinHandle<(DirectionEnd, u64)>,
    cancel: &CancellationToken,
) -> (DirectionEnd, u64, DirectionEnd, u64) {
    let mut end_near: Option<(DirectionEnd, u64)> = None;
    let mut end_far: Option<(DirectionEnd, u64)> = None;

    while end_near.is_none() || end_far.is_none() {
        tokio::select! {
            result = &mut near_to_far, if end_near.is_none() => {
                end_near = Some(unwrap_join(Direction::NearToFar, result));
            }
            result = &mut far_to_near, if end_far.is_none() => {
                end_far = Some(unwrap_join(Direction::FarToNear, result));
            }
        }

        let terminal = [&end_near, &end_far].into_iter().flatten().any(|(end, _)| {
            matches!(
                end,
                DirectionEnd::Eof { ends_session: true }
                    | DirectionEnd::Error(_)
                    | DirectionEnd::Cancelled
            )
        });
        if terminal {
            cancel.cancel();
        }
    }

    let (end_near, ntf_bytes) = end_near.expect("near direction joined");
    let (end_far, ftn_bytes) = end_far.expect("far direction joined");
    (end_near, ntf_bytes, end_far, ftn_bytes)
}

fn unwrap_join(
    direction: Direction,
    result: std::result::Result<(DirectionEnd, u64), tokio::task::JoinError>,
) -> (DirectionEnd, u64) {
    match result {
        Ok(end) => end,
        Err(e) => {
            warn!(%direction, error = %e, "direction task join failed");
            (
                DirectionEnd::Error(WirecatError::internal(format!(
                    "direction task failed: {}",
                    e
                ))),
                0,
            )
        }
    }
}

/// Fold the two direction results into the relay's terminal reason
fn conclude(end_near: DirectionEnd, end_far: DirectionEnd) -> RelayEnd {
    if let DirectionEnd::Error(error) = end_near {
        return RelayEnd::Error {
            direction: Direction::NearToFar,
            error,
        };
    }
    if let DirectionEnd::Error(error) = end_far {
        return RelayEnd::Error {
            direction: Direction::FarToNear,
            error,
        };
    }
    match (&end_near, &end_far) {
        (DirectionEnd::Eof { ends_session: true }, _) => RelayEnd::Eof(Direction::NearToFar),
        (_, DirectionEnd::Eof { ends_session: true }) => RelayEnd::Eof(Direction::FarToNear),
        (DirectionEnd::Eof { .. }, DirectionEnd::Eof { .. }) => RelayEnd::BothEof,
        _ => RelayEnd::Cancelled,
    }
}

struct StreamDirection {
    direction: Direction,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    dest: SharedWriter,
    response_writer: SharedWriter,
    filters: FilterChain,
    convert: bool,
    close_on_eof: bool,
    flow: Arc<FlowController>,
    activity: Arc<ActivityTracker>,
    cancel: CancellationToken,
    chunk: usize,
}

/// One stream-to-stream direction: read, transform, account, write, release.
async fn run_stream_direction(mut dir: StreamDirection) -> (DirectionEnd, u64) {
    let mut buf = vec![0u8; dir.chunk];
    let mut bytes_moved: u64 = 0;

    loop {
        if dir.flow.should_pause() {
            tokio::select! {
                _ = dir.cancel.cancelled() => return (DirectionEnd::Cancelled, bytes_moved),
                _ = dir.flow.wait_until_resumed() => {}
            }
        }

        let n = tokio::select! {
            _ = dir.cancel.cancelled() => return (DirectionEnd::Cancelled, bytes_moved),
            result = dir.reader.read(&mut buf) => match result {
                Ok(0) => {
                    trace!(direction = %dir.direction, "source EOF");
                    return (
                        DirectionEnd::Eof { ends_session: dir.close_on_eof },
                        bytes_moved,
                    );
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(direction = %dir.direction, error = %e, "read failed");
                    return (DirectionEnd::Error(e.into()), bytes_moved);
                }
            },
        };
        dir.activity.touch();

        let (forward, responses) =
            match prepare_chunk(&buf[..n], dir.convert, &mut dir.filters) {
                Ok(prepared) => prepared,
                Err(e) => return (DirectionEnd::Error(e), bytes_moved),
            };

        if !forward.is_empty() {
            let len = forward.len();
            dir.flow.record(len);
            if let Err(e) = write_all_shared(&dir.dest, &forward).await {
                dir.flow.release(len);
                debug!(direction = %dir.direction, error = %e, "write failed");
                return (DirectionEnd::Error(e.into()), bytes_moved);
            }
            dir.flow.release(len);
            dir.activity.touch();
            bytes_moved += len as u64;
        }

        for response in responses {
            if let Err(e) = write_all_shared(&dir.response_writer, &response).await {
                debug!(direction = %dir.direction, error = %e, "response write failed");
                return (DirectionEnd::Error(e.into()), bytes_moved);
            }
        }
    }
}

/// Child output to peer. Chunks were already recorded by the output pumps;
/// this side releases after the peer write completes. Channel closure means
/// both output pumps exited, which follows child exit, so it always ends the
/// session.
#[allow(clippy::too_many_arguments)]
async fn run_child_output_direction(
    mut output_rx: mpsc::Receiver<ChildChunk>,
    dest: SharedWriter,
    stdin_tx: mpsc::WeakSender<Bytes>,
    mut filters: FilterChain,
    convert: bool,
    flow: Arc<FlowController>,
    activity: Arc<ActivityTracker>,
    cancel: CancellationToken,
) -> (DirectionEnd, u64) {
    let direction = Direction::NearToFar;
    let mut bytes_moved: u64 = 0;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return (DirectionEnd::Cancelled, bytes_moved),
            chunk = output_rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => {
                    trace!("child output closed");
                    return (DirectionEnd::Eof { ends_session: true }, bytes_moved);
                }
            },
        };
        activity.touch();

        let recorded = chunk.data.len();
        let (forward, responses) = match prepare_chunk(&chunk.data, convert, &mut filters) {
            Ok(prepared) => prepared,
            Err(e) => {
                flow.release(recorded);
                return (DirectionEnd::Error(e), bytes_moved);
            }
        };

        if let Err(e) = write_all_shared(&dest, &forward).await {
            flow.release(recorded);
            debug!(%direction, error = %e, "peer write failed");
            return (DirectionEnd::Error(e.into()), bytes_moved);
        }
        flow.release(recorded);
        activity.touch();
        bytes_moved += forward.len() as u64;

        // Protocol responses travel back toward the child's stdin. The weak
        // sender never holds the stdin pipe open on its own.
        for response in responses {
            let Some(tx) = stdin_tx.upgrade() else { break };
            let len = response.len();
            flow.record(len);
            if tx.send(response).await.is_err() {
                flow.release(len);
                warn!("child stdin gone, dropping filter response");
                break;
            }
        }
    }
}

struct PeerToChild {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    stdin_tx: mpsc::Sender<Bytes>,
    response_writer: SharedWriter,
    filters: FilterChain,
    convert: bool,
    close_on_eof: bool,
    flow: Arc<FlowController>,
    activity: Arc<ActivityTracker>,
    cancel: CancellationToken,
    chunk: usize,
}

/// Peer to child stdin. Records before enqueueing; the stdin pump releases
/// after its write completes. Returning drops the sender, which closes the
/// child's stdin once the pump drains.
async fn run_peer_to_child_direction(mut dir: PeerToChild) -> (DirectionEnd, u64) {
    let direction = Direction::FarToNear;
    let mut buf = vec![0u8; dir.chunk];
    let mut bytes_moved: u64 = 0;

    loop {
        if dir.flow.should_pause() {
            tokio::select! {
                _ = dir.cancel.cancelled() => return (DirectionEnd::Cancelled, bytes_moved),
                _ = dir.flow.wait_until_resumed() => {}
            }
        }

        let n = tokio::select! {
            _ = dir.cancel.cancelled() => return (DirectionEnd::Cancelled, bytes_moved),
            result = dir.reader.read(&mut buf) => match result {
                Ok(0) => {
                    trace!(%direction, "peer EOF, closing child stdin");
                    return (
                        DirectionEnd::Eof { ends_session: dir.close_on_eof },
                        bytes_moved,
                    );
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(%direction, error = %e, "peer read failed");
                    return (DirectionEnd::Error(e.into()), bytes_moved);
                }
            },
        };
        dir.activity.touch();

        let (forward, responses) =
            match prepare_chunk(&buf[..n], dir.convert, &mut dir.filters) {
                Ok(prepared) => prepared,
                Err(e) => return (DirectionEnd::Error(e), bytes_moved),
            };

        if !forward.is_empty() {
            let len = forward.len();
            dir.flow.record(len);
            if dir.stdin_tx.send(forward).await.is_err() {
                dir.flow.release(len);
                debug!(%direction, "child stdin closed, direction terminal");
                return (
                    DirectionEnd::Error(WirecatError::ConnectionClosed),
                    bytes_moved,
                );
            }
            dir.activity.touch();
            bytes_moved += len as u64;
        }

        // Responses (e.g. negotiation replies) go back to the peer
        for response in responses {
            if let Err(e) = write_all_shared(&dir.response_writer, &response).await {
                debug!(%direction, error = %e, "response write failed");
                return (DirectionEnd::Error(e.into()), bytes_moved);
            }
        }
    }
}

/// Apply conversion and filters to one chunk
fn prepare_chunk(
    raw: &[u8],
    convert: bool,
    filters: &mut FilterChain,
) -> wirecat_utils::Result<(Bytes, Vec<Bytes>)> {
    let converted = if convert {
        codec::convert(raw)?
    } else {
        std::borrow::Cow::Borrowed(raw)
    };

    if filters.is_empty() {
        Ok((Bytes::copy_from_slice(&converted), Vec::new()))
    } else {
        filters.apply(&converted)
    }
}
