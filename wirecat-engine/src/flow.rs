//! Flow-control bookkeeping
//!
//! Tracks buffered bytes per session and issues pause/resume decisions with
//! hysteresis: pausing latches at one threshold and only clears once buffered
//! bytes drain below a lower one, so a producer hovering at a single boundary
//! cannot thrash the pause state.
//!
//! The controller is purely advisory. The transfer loop and the pump tasks
//! stop and resume reads; the controller only counts.

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

/// Per-session byte accounting with pause/resume hysteresis.
///
/// Shared by the transfer loop and up to three pump tasks, all recording and
/// releasing against one ceiling.
#[derive(Debug)]
pub struct FlowController {
    /// Buffered bytes at or above this latch the pause state
    pause_at: usize,
    /// Buffered bytes at or below this clear the pause state
    resume_at: usize,
    state: Mutex<FlowState>,
    /// Signalled whenever the pause state clears
    resumed: Notify,
}

#[derive(Debug)]
struct FlowState {
    buffered: usize,
    paused: bool,
}

impl FlowController {
    /// Create a controller for the given capacity ceiling and fractional
    /// thresholds (`pause_threshold > resume_threshold`, both in (0, 1]).
    ///
    /// The pause point rounds up and the resume point rounds down, so the
    /// pause latches only once the threshold is genuinely crossed.
    pub fn new(capacity: usize, pause_threshold: f64, resume_threshold: f64) -> Self {
        let pause_at = (capacity as f64 * pause_threshold).ceil() as usize;
        let resume_at = (capacity as f64 * resume_threshold).floor() as usize;
        Self {
            pause_at,
            resume_at,
            state: Mutex::new(FlowState {
                buffered: 0,
                paused: false,
            }),
            resumed: Notify::new(),
        }
    }

    /// Record `n` bytes as buffered
    pub fn record(&self, n: usize) {
        let mut state = self.state.lock();
        state.buffered = state.buffered.saturating_add(n);
        if state.buffered >= self.pause_at {
            state.paused = true;
        }
    }

    /// Release `n` bytes after the destination write completed.
    ///
    /// Releasing more than was recorded is a logic error upstream; the
    /// counter clamps to zero and the imbalance is logged, never panicked on.
    pub fn release(&self, n: usize) {
        let mut state = self.state.lock();
        if n > state.buffered {
            warn!(
                release = n,
                buffered = state.buffered,
                "flow counter underflow, clamping to zero"
            );
            state.buffered = 0;
        } else {
            state.buffered -= n;
        }
        if state.paused && state.buffered <= self.resume_at {
            state.paused = false;
            drop(state);
            self.resumed.notify_waiters();
        }
    }

    /// Whether sources should stop reading
    pub fn should_pause(&self) -> bool {
        self.state.lock().paused
    }

    /// Whether a paused source may read again
    pub fn should_resume(&self) -> bool {
        !self.state.lock().paused
    }

    /// Currently buffered bytes
    pub fn buffered(&self) -> usize {
        self.state.lock().buffered
    }

    /// Wait until the pause state clears. Returns immediately when not
    /// paused.
    pub async fn wait_until_resumed(&self) {
        loop {
            let notified = self.resumed.notified();
            if !self.state.lock().paused {
                return;
            }
            notified.await;
        }
    }
}
