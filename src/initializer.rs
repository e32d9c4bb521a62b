//! One-time speaker setup, run on its own thread.
//!
//! Steps: optional lexicon install, acceleration check, offline resolver,
//! optional lexicon load, engine construction, warm-up, output format check.
//! The outcome is published to the [`AppContext`] exactly once, even when a
//! step panics; failures are also appended to the error log.
//!
//! The offline environment is set from `main` via [`force_offline`] before
//! the async runtime starts any threads.

use std::any::Any;
use std::backtrace::Backtrace;
use std::error::Error as _;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::Local;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::context::AppContext;
use crate::lexicon::{self, Lexicon};
use crate::resolver::{ArtifactResolver, LocalArtifactResolver};
use crate::speaker::output::{AudioOutput, OutputError, RodioOutput};
use crate::speaker::tts::{self, EngineOptions, KokoroEngine, SpeechEngine, TtsError};
use crate::speaker::{Speaker, SAMPLE_RATE};

pub const ERROR_LOG: &str = "error_log.txt";
const WARMUP_TEXT: &str = "This is a test.";
const WARMUP_SAMPLES: usize = 100;

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Tts(#[from] TtsError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error("initialization panicked: {0}")]
    Panic(String),
}

pub struct Initializer {
    config: Config,
    base_dir: PathBuf,
    model_root: PathBuf,
    error_log: PathBuf,
}

impl Initializer {
    pub fn new(config: Config, base_dir: PathBuf, model_root: PathBuf) -> Self {
        let error_log = base_dir.join(ERROR_LOG);
        Self {
            config,
            base_dir,
            model_root,
            error_log,
        }
    }

    /// Run setup on a dedicated thread.
    pub fn spawn(self, ctx: Arc<AppContext>) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("initializer".into())
            .spawn(move || self.run(&ctx))
    }

    pub fn run(&self, ctx: &AppContext) {
        self.complete(ctx, || self.setup());
    }

    /// Run `setup` and publish its outcome. A panic counts as a failure.
    fn complete(&self, ctx: &AppContext, setup: impl FnOnce() -> Result<Speaker, InitError>) {
        match panic::catch_unwind(AssertUnwindSafe(setup)) {
            Ok(Ok(speaker)) => {
                ctx.publish_ready(speaker);
                info!("Speaker ready");
            }
            Ok(Err(e)) => self.record_failure(ctx, &e),
            Err(payload) => self.record_failure(ctx, &InitError::Panic(panic_message(&*payload))),
        }
    }

    fn setup(&self) -> Result<Speaker, InitError> {
        self.install_lexicon();

        info!("Detecting hardware acceleration...");
        let use_cuda = tts::cuda_available();
        if use_cuda {
            info!("GPU (CUDA) acceleration enabled");
        } else {
            info!("Running on CPU");
        }

        info!("Configuring model paths...");
        let resolver: Arc<dyn ArtifactResolver> =
            Arc::new(LocalArtifactResolver::new(&self.model_root));

        let lexicon = self.load_lexicon();

        let options = EngineOptions {
            lang_code: self.config.speaker.lang_code.clone(),
            collection: self.config.model.collection.clone(),
            onnx_file: self.config.model.onnx_file.clone(),
            config_file: self.config.model.config_file.clone(),
            speed: self.config.speaker.speed,
            threads: self.config.model.threads,
            use_cuda,
        };
        let engine = KokoroEngine::new(&options, resolver, lexicon)?;

        let output = RodioOutput::open()?;

        info!("Warming up the model...");
        warm_up(&engine, &output, &self.config.speaker.voice)?;

        output.validate_output_format(1, SAMPLE_RATE)?;

        Ok(Speaker::new(Box::new(engine), Box::new(output)))
    }

    fn install_lexicon(&self) {
        info!("Checking pronunciation lexicon...");
        let archive = self.base_dir.join(&self.config.lexicon.archive);
        let dest = self.base_dir.join(&self.config.lexicon.dir);
        if let Err(e) = lexicon::install(&archive, &dest) {
            warn!("Optional lexicon install skipped: {e}");
        }
    }

    fn load_lexicon(&self) -> Lexicon {
        let dir = self.base_dir.join(&self.config.lexicon.dir);
        Lexicon::load(&dir).unwrap_or_else(|e| {
            warn!("Optional lexicon not loaded: {e}");
            Lexicon::Unavailable
        })
    }

    fn record_failure(&self, ctx: &AppContext, err: &InitError) {
        error!("Initialization error: {err}");
        ctx.publish_failed(err.to_string());
        if let Err(e) = append_error_log(&self.error_log, err) {
            warn!("Failed to write {}: {e}", self.error_log.display());
        }
    }
}

/// Environment that keeps model tooling off the network, rooted at `base_dir`.
pub fn offline_env(base_dir: &Path) -> [(&'static str, OsString); 2] {
    [
        ("HF_HUB_OFFLINE", OsString::from("1")),
        ("HF_HOME", base_dir.as_os_str().to_owned()),
    ]
}

/// Apply [`offline_env`] to the process. Call before any other thread exists.
pub fn force_offline(base_dir: &Path) {
    for (key, value) in offline_env(base_dir) {
        std::env::set_var(key, value);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Synthesize a short phrase and start (but don't await) a tiny slice of it,
/// so one-time costs land before the first real request.
fn warm_up(
    engine: &dyn SpeechEngine,
    output: &dyn AudioOutput,
    voice: &str,
) -> Result<(), InitError> {
    if let Some(chunk) = engine.synthesize(WARMUP_TEXT, voice).next() {
        let mut audio = chunk?.audio;
        audio.truncate(WARMUP_SAMPLES);
        output.play(audio, SAMPLE_RATE)?;
    }
    Ok(())
}

/// Append a timestamped section with the error chain and a backtrace.
fn append_error_log(path: &Path, err: &InitError) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    writeln!(file)?;
    writeln!(file, "--- Error at {} ---", Local::now().format("%a %b %e %H:%M:%S %Y"))?;
    writeln!(file, "{err}")?;
    let mut source = err.source();
    while let Some(cause) = source {
        writeln!(file, "Caused by: {cause}")?;
        source = cause.source();
    }
    // Where the failure was recorded; the error chain above says where it arose.
    writeln!(file, "Backtrace (at logging time):")?;
    writeln!(file, "{}", Backtrace::force_capture())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InitState;
    use crate::playback::testing::{Event, EventLog, FakeEngine, FakeOutput, Script};
    use crate::resolver::ResolveError;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn not_found() -> InitError {
        InitError::Tts(TtsError::Resolve(ResolveError::NotFound {
            filename: "config.json".into(),
            root: PathBuf::from("/models"),
        }))
    }

    #[test]
    fn failure_is_published_and_appended_to_log() {
        let dir = tempdir().unwrap();
        let init = Initializer::new(Config::default(), dir.path().into(), dir.path().join("m"));
        let ctx = AppContext::new();

        init.record_failure(&ctx, &not_found());

        match ctx.init_state() {
            InitState::Failed(reason) => assert!(reason.contains("config.json")),
            other => panic!("unexpected state {other:?}"),
        }
        let log = fs::read_to_string(dir.path().join(ERROR_LOG)).unwrap();
        assert!(log.contains("--- Error at "));
        assert!(log.contains("file not found in local model directory"));
    }

    #[test]
    fn panicking_setup_is_published_as_failure() {
        let dir = tempdir().unwrap();
        let init = Initializer::new(Config::default(), dir.path().into(), dir.path().join("m"));
        let ctx = AppContext::new();

        init.complete(&ctx, || panic!("phonemizer exploded"));

        match ctx.init_state() {
            InitState::Failed(reason) => {
                assert!(reason.contains("initialization panicked"));
                assert!(reason.contains("phonemizer exploded"));
            }
            other => panic!("unexpected state {other:?}"),
        }
        let log = fs::read_to_string(dir.path().join(ERROR_LOG)).unwrap();
        assert!(log.contains("phonemizer exploded"));
        assert!(log.contains("Backtrace (at logging time):"));
    }

    #[test]
    fn formatted_panic_payloads_are_kept() {
        let payload = panic::catch_unwind(|| panic!("voice {} missing", "af_heart")).unwrap_err();
        assert_eq!(panic_message(&*payload), "voice af_heart missing");
    }

    #[test]
    fn offline_env_points_hub_home_at_base_dir() {
        let env = offline_env(Path::new("/opt/speaker"));
        assert_eq!(env[0], ("HF_HUB_OFFLINE", OsString::from("1")));
        assert_eq!(env[1], ("HF_HOME", OsString::from("/opt/speaker")));
    }

    #[test]
    fn error_log_is_append_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(ERROR_LOG);
        fs::write(&path, "earlier entry\n").unwrap();

        append_error_log(&path, &not_found()).unwrap();
        append_error_log(&path, &not_found()).unwrap();

        let log = fs::read_to_string(&path).unwrap();
        assert!(log.starts_with("earlier entry\n"));
        assert_eq!(log.matches("--- Error at ").count(), 2);
    }

    #[test]
    fn missing_model_files_fail_initialization() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("models--hexgrad--Kokoro-82M");
        fs::create_dir_all(&root).unwrap();
        let init = Initializer::new(Config::default(), dir.path().into(), root);
        let ctx = AppContext::new();

        init.run(&ctx);

        assert!(matches!(ctx.init_state(), InitState::Failed(_)));
        assert!(dir.path().join(ERROR_LOG).exists());
    }

    #[test]
    fn warm_up_plays_only_a_short_prefix_without_waiting() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let engine = FakeEngine::new(
            Arc::clone(&log),
            vec![Script::Chunks(vec![vec![0.25; 1000], vec![0.5; 10]])],
        );
        let output = FakeOutput {
            log: Arc::clone(&log),
        };

        warm_up(&engine, &output, "af_heart").unwrap();

        let events = log.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], Event::Play(vec![0.25; WARMUP_SAMPLES]));
    }

    #[test]
    fn warm_up_propagates_engine_errors() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let engine = FakeEngine::new(Arc::clone(&log), vec![Script::Fail]);
        let output = FakeOutput { log };
        assert!(matches!(
            warm_up(&engine, &output, "af_heart"),
            Err(InitError::Tts(_))
        ));
    }
}
