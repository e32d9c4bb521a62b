//! Shared application state.
//!
//! Owned by `main` and handed to each task as `Arc<AppContext>`:
//! - initialization state, published once through a watch channel
//! - the "playback in progress" flag
//! - the last observed clipboard text

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::speaker::Speaker;

#[derive(Clone, Default)]
pub enum InitState {
    #[default]
    Pending,
    Ready(Arc<Speaker>),
    Failed(String),
}

impl InitState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Debug for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Ready(_) => write!(f, "Ready"),
            Self::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

pub struct AppContext {
    init: watch::Sender<InitState>,
    playing: AtomicBool,
    snapshot: Mutex<String>,
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AppContext {
    pub fn new() -> Self {
        Self {
            init: watch::Sender::new(InitState::Pending),
            playing: AtomicBool::new(false),
            snapshot: Mutex::new(String::new()),
        }
    }

    // --- Initialization state ---

    pub fn init_state(&self) -> InitState {
        self.init.borrow().clone()
    }

    pub fn subscribe_init(&self) -> watch::Receiver<InitState> {
        self.init.subscribe()
    }

    pub fn publish_ready(&self, speaker: Speaker) -> bool {
        self.publish(InitState::Ready(Arc::new(speaker)))
    }

    pub fn publish_failed(&self, reason: impl Into<String>) -> bool {
        self.publish(InitState::Failed(reason.into()))
    }

    /// Move to a terminal state. Only the first call has any effect.
    fn publish(&self, next: InitState) -> bool {
        let published = self.init.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = next;
                true
            }
        });
        if !published {
            warn!("Initialization state already terminal, ignoring update");
        }
        published
    }

    /// Wait until initialization is ready or failed.
    ///
    /// Re-checks every `poll` and also wakes as soon as the state is
    /// published. Returns `None` if `timeout` elapses first.
    pub async fn wait_for_init(
        &self,
        poll: Duration,
        timeout: Option<Duration>,
    ) -> Option<InitState> {
        let mut rx = self.init.subscribe();
        let wait = async {
            loop {
                let state = rx.borrow_and_update().clone();
                if state.is_terminal() {
                    return state;
                }
                tokio::select! {
                    _ = rx.changed() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.ok(),
            None => Some(wait.await),
        }
    }

    // --- Playback flag ---

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Set the playback flag; it is cleared when the guard drops.
    pub fn begin_playback(self: &Arc<Self>) -> PlaybackGuard {
        self.playing.store(true, Ordering::SeqCst);
        debug!("Playback flag set");
        PlaybackGuard {
            ctx: Arc::clone(self),
        }
    }

    // --- Clipboard snapshot ---

    #[allow(dead_code)]
    pub fn snapshot(&self) -> String {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn snapshot_matches(&self, current: &str) -> bool {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) == current
    }

    pub fn set_snapshot(&self, text: String) {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = text;
    }
}

/// Clears the playback flag on every exit path, including panics.
pub struct PlaybackGuard {
    ctx: Arc<AppContext>,
}

impl Drop for PlaybackGuard {
    fn drop(&mut self) {
        self.ctx.playing.store(false, Ordering::SeqCst);
        debug!("Playback flag cleared");
    }
}
