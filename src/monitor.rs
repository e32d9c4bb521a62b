//! Clipboard polling and dispatch.
//!
//! Each tick reads the clipboard. New, non-blank text updates the snapshot;
//! text containing CJK ideographs is dropped, anything else is queued for
//! playback once the current playback (if any) has finished. Queueing never
//! blocks, so texts copied while the speaker is still initializing are all
//! kept, in order.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::context::AppContext;
use crate::playback::preview;

/// Code points whose presence keeps text from being spoken.
const EXCLUDED_SCRIPT: std::ops::RangeInclusive<char> = '\u{4e00}'..='\u{9fff}';

#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read clipboard: {0}")]
    Read(String),
}

/// Source of clipboard text.
pub trait ClipboardSource {
    fn read(&mut self) -> Result<String, ClipboardError>;
}

/// The system clipboard via arboard. Opened lazily so a missing display
/// shows up as a tick error rather than a startup failure.
#[derive(Default)]
pub struct SystemClipboard {
    inner: Option<arboard::Clipboard>,
}

impl ClipboardSource for SystemClipboard {
    fn read(&mut self) -> Result<String, ClipboardError> {
        let clipboard = match &mut self.inner {
            Some(clipboard) => clipboard,
            slot => slot.insert(
                arboard::Clipboard::new()
                    .map_err(|e| ClipboardError::Unavailable(e.to_string()))?,
            ),
        };

        match clipboard.get_text() {
            Ok(text) => Ok(text),
            // Empty or non-text clipboard reads as empty text.
            Err(arboard::Error::ContentNotAvailable) => Ok(String::new()),
            Err(e) => {
                self.inner = None;
                Err(ClipboardError::Read(e.to_string()))
            }
        }
    }
}

/// Whether `text` contains any character of the excluded script.
pub fn is_excluded(text: &str) -> bool {
    text.chars().any(|c| EXCLUDED_SCRIPT.contains(&c))
}

/// Result of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Unchanged,
    Excluded,
    Dispatched,
    /// The playback queue is gone; nothing can be spoken any more.
    QueueClosed,
}

pub struct ClipboardMonitor<C> {
    clipboard: C,
    ctx: Arc<AppContext>,
    queue: mpsc::UnboundedSender<String>,
    config: MonitorConfig,
}

impl<C: ClipboardSource> ClipboardMonitor<C> {
    pub fn new(
        clipboard: C,
        ctx: Arc<AppContext>,
        queue: mpsc::UnboundedSender<String>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            clipboard,
            ctx,
            queue,
            config,
        }
    }

    /// Record whatever is on the clipboard at startup so it is not spoken.
    pub fn seed(&mut self) {
        match self.clipboard.read() {
            Ok(text) => {
                info!("Initial clipboard content:\n {}", preview(&text, 30));
                self.ctx.set_snapshot(text);
            }
            Err(e) => {
                warn!("Failed to read initial clipboard content: {e}");
                self.ctx.set_snapshot(String::new());
            }
        }
    }

    /// Poll forever. Tick errors back off once and then polling resumes.
    pub async fn run(mut self) {
        info!("Listening to clipboard...");
        loop {
            match self.tick().await {
                Ok(TickOutcome::QueueClosed) => {
                    warn!("Playback queue closed, stopping clipboard monitor");
                    return;
                }
                Ok(_) => sleep(self.config.poll_interval()).await,
                Err(e) => {
                    warn!("Error while watching clipboard: {e}");
                    sleep(self.config.backoff()).await;
                }
            }
        }
    }

    pub async fn tick(&mut self) -> Result<TickOutcome, ClipboardError> {
        let current = self.clipboard.read()?;

        if current.trim().is_empty() || self.ctx.snapshot_matches(&current) {
            return Ok(TickOutcome::Unchanged);
        }

        info!("Clipboard changed [{} chars]", current.chars().count());
        self.ctx.set_snapshot(current.clone());

        if is_excluded(&current) {
            info!("Ignoring CJK content: {}", preview(&current, 50));
            return Ok(TickOutcome::Excluded);
        }

        info!("Queueing text for playback: {}", preview(&current, 50));
        self.await_playback_slot().await;

        match self.queue.send(current) {
            Ok(()) => Ok(TickOutcome::Dispatched),
            Err(_) => Ok(TickOutcome::QueueClosed),
        }
    }

    /// Poll the playback flag until the current playback finishes.
    async fn await_playback_slot(&self) {
        if !self.ctx.is_playing() {
            return;
        }

        info!("Waiting for current playback to finish...");
        let started = Instant::now();
        while self.ctx.is_playing() {
            if let Some(limit) = self.config.playback_wait_timeout() {
                if started.elapsed() >= limit {
                    warn!("Playback still running after {limit:?}, queueing anyway");
                    return;
                }
            }
            sleep(self.config.busy_wait()).await;
        }
        debug!("Playback slot free after {:?}", started.elapsed());
    }
}
