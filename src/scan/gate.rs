//! Checkpoint Gate
//!
//! Cooperative pause/resume/stop for a worker loop. The worker calls
//! [`CheckpointGate::checkpoint`] between units of work; a scheduler calls
//! `pause`, `resume` and `stop` from elsewhere.
//!
//! The paused flag and the count of parked workers live in a single
//! `watch` value, so registering as a waiter and observing a resume can
//! never interleave into a lost wakeup: a waiter subscribes before it
//! registers, and `wait_for` re-checks the current value first.

use log::{debug, trace};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Gate state as one atomically-updated value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateState {
    pub paused: bool,
    /// Workers currently parked at a checkpoint
    pub waiting: usize,
}

/// What a worker should do after a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Proceed,
    Stopped,
}

#[derive(Debug)]
pub struct CheckpointGate {
    state: watch::Sender<GateState>,
    stop: CancellationToken,
}

impl Default for CheckpointGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointGate {
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    /// Gate whose stop signal is (a child of) an external token
    pub fn with_cancellation(stop: CancellationToken) -> Self {
        let (state, _) = watch::channel(GateState::default());
        Self { state, stop }
    }

    /// Set the paused flag; does not block
    pub fn pause(&self) {
        self.state.send_modify(|s| s.paused = true);
        debug!("Checkpoint gate paused");
    }

    /// Pause, then block until a worker is parked or the gate is stopped
    pub async fn pause_and_wait_drain(&self) {
        let mut rx = self.state.subscribe();
        self.pause();
        tokio::select! {
            _ = rx.wait_for(|s| s.waiting >= 1) => {
                debug!("Checkpoint gate drained");
            }
            _ = self.stop.cancelled() => {
                debug!("Checkpoint gate stopped while draining");
            }
        }
    }

    /// Clear the paused flag and wake every parked worker
    pub fn resume(&self) {
        self.state.send_modify(|s| s.paused = false);
        debug!("Checkpoint gate resumed");
    }

    /// Called by a worker between units of work
    pub async fn checkpoint(&self) -> Checkpoint {
        if self.is_stopped() {
            return Checkpoint::Stopped;
        }

        let mut rx = self.state.subscribe();
        let mut registered = false;
        self.state.send_if_modified(|s| {
            if s.paused {
                s.waiting += 1;
                registered = true;
            }
            registered
        });
        if !registered {
            return Checkpoint::Proceed;
        }

        let _parked = ParkedWorker { state: &self.state };
        trace!("Worker parked at checkpoint");
        tokio::select! {
            _ = rx.wait_for(|s| !s.paused) => {}
            _ = self.stop.cancelled() => {}
        }

        if self.is_stopped() {
            Checkpoint::Stopped
        } else {
            Checkpoint::Proceed
        }
    }

    /// Signal cancellation; parked workers unblock and see `Stopped`
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }

    pub fn waiting(&self) -> usize {
        self.state.borrow().waiting
    }

    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    /// Resolves once the gate is stopped
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }
}

/// Decrements the waiting count however the checkpoint future ends
struct ParkedWorker<'a> {
    state: &'a watch::Sender<GateState>,
}

impl Drop for ParkedWorker<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|s| s.waiting = s.waiting.saturating_sub(1));
    }
}
