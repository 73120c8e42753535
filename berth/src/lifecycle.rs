//! The two lifecycle primitives shared by most resource handles.
//!
//! [`Latch`] is the readiness gate: background handlers release it (possibly
//! with an attached failure that re-raises on the waiter), foreground callers
//! park on it. [`DeadFlag`] is the destruction marker with its two
//! consumption modes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::{Error, Result};

/// Default time a caller will park on a latch.
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Containers may be waiting behind an image upload, so they get longer.
pub const IMAGE_READY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Default)]
enum LatchState {
    #[default]
    Pending,
    Ready,
    Failed(Error),
}

/// A one-way readiness latch with failure propagation.
#[derive(Clone)]
pub struct Latch {
    tx: Arc<watch::Sender<LatchState>>,
}

impl Default for Latch {
    fn default() -> Self {
        Latch::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Latch {
            tx: Arc::new(watch::Sender::new(LatchState::Pending)),
        }
    }

    /// Release every waiter. Idempotent; a recorded failure is not erased.
    pub fn mark_as_ready(&self) {
        self.tx.send_if_modified(|state| match state {
            LatchState::Pending => {
                *state = LatchState::Ready;
                true
            }
            _ => false,
        });
    }

    /// Release every waiter with a failure: each pending or future
    /// `wait_until_ready` call raises `err` instead of returning.
    pub fn unblock_and_raise(&self, err: Error) {
        self.tx.send_if_modified(|state| match state {
            LatchState::Failed(_) => false,
            _ => {
                *state = LatchState::Failed(err);
                true
            }
        });
    }

    pub fn is_ready(&self) -> bool {
        !matches!(*self.tx.borrow(), LatchState::Pending)
    }

    /// Park with no deadline: completion latches (a process may legitimately
    /// run for hours) use this instead of [`Latch::wait_until_ready`].
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, LatchState::Pending))
            .await
            .map_err(|_| Error::Disconnected)?;
        match &*state {
            LatchState::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Park until the latch is released or `timeout` expires.
    ///
    /// Returns `Ok(true)` when ready, `Ok(false)` on timeout (the caller must
    /// re-check), and re-raises a failure attached by the background side.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<bool> {
        let mut rx = self.tx.subscribe();
        let released = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| !matches!(state, LatchState::Pending)),
        )
        .await;
        match released {
            Err(_elapsed) => Ok(false),
            Ok(Err(_)) => Err(Error::Disconnected),
            Ok(Ok(state)) => match &*state {
                LatchState::Ready => Ok(true),
                LatchState::Failed(err) => Err(err.clone()),
                LatchState::Pending => unreachable!("wait_for past the pending state"),
            },
        }
    }
}

/// A boolean destruction marker.
///
/// `bail_if_dead` is for paths where the caller did not initiate the death
/// (late frames, duplicate teardown): log and carry on. `ensure_alive` is for
/// paths where the caller is misusing a destroyed handle: raise.
#[derive(Clone, Default)]
pub struct DeadFlag {
    dead: Arc<AtomicBool>,
}

impl DeadFlag {
    pub fn new() -> Self {
        DeadFlag::default()
    }

    /// Returns true if this call was the one that killed the object.
    pub fn mark_as_dead(&self) -> bool {
        !self.dead.swap(true, Ordering::AcqRel)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn bail_if_dead(&self, what: &str) -> bool {
        let dead = self.is_dead();
        if dead {
            debug!("{what} was previously terminated, carrying on");
        }
        dead
    }

    pub fn ensure_alive(&self, what: &str) -> Result<()> {
        if self.is_dead() {
            return Err(Error::State(format!("cannot use destroyed {what}")));
        }
        Ok(())
    }
}
