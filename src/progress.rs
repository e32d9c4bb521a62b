//! Animated status line shown while the speaker initializes.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crate::context::{AppContext, InitState};

const SPINNER: [char; 8] = ['⣾', '⣽', '⣻', '⢿', '⡿', '⣟', '⣯', '⣷'];
const MESSAGES: [&str; 5] = [
    "Initializing...",
    "Loading model...",
    "Preparing speech engine...",
    "Loading vocabulary...",
    "Configuring neural network...",
];
const FRAME_INTERVAL: Duration = Duration::from_millis(100);
/// Frames shown per status message.
const FRAMES_PER_MESSAGE: usize = 10;

pub fn frame(counter: usize) -> String {
    let glyph = SPINNER[counter % SPINNER.len()];
    let message = MESSAGES[(counter / FRAMES_PER_MESSAGE) % MESSAGES.len()];
    format!("{glyph} {message}")
}

pub fn final_line(state: &InitState) -> String {
    match state {
        InitState::Failed(reason) => format!("✗ Initialization failed! {reason}"),
        _ => "✓ Initialization complete!".to_string(),
    }
}

/// Redraw the spinner until initialization reaches a terminal state.
pub async fn run(ctx: Arc<AppContext>) {
    let mut rx = ctx.subscribe_init();
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);
    let mut counter = 0usize;

    let state = loop {
        let state = rx.borrow_and_update().clone();
        if state.is_terminal() {
            break state;
        }
        redraw(&frame(counter));
        counter = counter.wrapping_add(1);

        tokio::select! {
            _ = ticker.tick() => {}
            _ = rx.changed() => {}
        }
    };

    // Pad so the final line fully covers the longest spinner frame.
    redraw(&format!("{:<40}\n", final_line(&state)));
}

fn redraw(line: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = write!(stdout, "\r{line}");
    let _ = stdout.flush();
}
