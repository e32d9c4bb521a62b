//! clipboard-speaker: reads copied text aloud with offline Kokoro TTS.

mod config;
mod context;
mod initializer;
mod lexicon;
mod monitor;
mod playback;
mod progress;
mod resolver;
mod speaker;

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "clipboard-speaker",
    about = "Speaks newly copied non-CJK text aloud"
)]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local model directory (overrides model.root)
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// How many times each text is spoken
    #[arg(short, long)]
    repeat: Option<u32>,

    /// Pause between repeats, in seconds
    #[arg(short, long)]
    interval: Option<f64>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

/// The model directory must exist before anything else starts.
fn startup_check(model_root: &Path) -> Result<(), String> {
    if model_root.is_dir() {
        Ok(())
    } else {
        Err(format!(
            "Local model directory does not exist: {}\n\
             Place the model folder at that location and start again.",
            model_root.display()
        ))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Environment writes must happen before the runtime spawns its workers.
    let base_dir = std::env::current_dir()?;
    initializer::force_offline(&base_dir);
    run(base_dir)
}

#[tokio::main]
async fn run(base_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy ort internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,ort=info")
    } else {
        EnvFilter::new("info,ort=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("clipboard-speaker starting");
    info!("Copy any English text and it will be read aloud");

    let mut config = config::Config::load(args.config.as_deref());
    if let Some(model_dir) = args.model_dir {
        config.model.root = model_dir;
    }
    if let Some(repeat) = args.repeat {
        config.speaker.repeat_count = repeat;
    }
    if let Some(interval) = args.interval {
        config.speaker.repeat_interval = interval;
    }
    let config = config.validated();

    let model_root = config.model_root(&base_dir);
    if let Err(message) = startup_check(&model_root) {
        eprintln!("Error: {message}");
        std::process::exit(1);
    }
    info!(
        "Found model directory: {}",
        model_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| model_root.display().to_string())
    );

    let ctx = Arc::new(context::AppContext::new());

    initializer::Initializer::new(config.clone(), base_dir, model_root).spawn(Arc::clone(&ctx))?;

    if config.ui.progress {
        tokio::spawn(progress::run(Arc::clone(&ctx)));
    }

    let settings = Arc::new(playback::PlaybackSettings::from_config(&config));
    let (queue, _worker) = playback::spawn_worker(Arc::clone(&ctx), settings);

    info!(
        "Clipboard monitor started: non-CJK text is read {} time(s), {:.1}s apart",
        config.speaker.repeat_count, config.speaker.repeat_interval
    );
    let mut monitor = monitor::ClipboardMonitor::new(
        monitor::SystemClipboard::default(),
        Arc::clone(&ctx),
        queue,
        config.monitor.clone(),
    );
    monitor.seed();

    tokio::select! {
        _ = monitor.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Exiting");
        }
    }

    // Background threads (initializer, playback) are not drained.
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_model_directory_is_reported() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("models--hexgrad--Kokoro-82M");
        let message = startup_check(&missing).unwrap_err();
        assert!(message.contains("models--hexgrad--Kokoro-82M"));
    }

    #[test]
    fn existing_model_directory_passes() {
        let dir = tempdir().unwrap();
        assert!(startup_check(dir.path()).is_ok());
    }

    #[test]
    fn cli_overrides_parse() {
        let args = Args::parse_from(["clipboard-speaker", "--repeat", "2", "-i", "0.5", "-v"]);
        assert_eq!(args.repeat, Some(2));
        assert_eq!(args.interval, Some(0.5));
        assert!(args.verbose);
    }
}
