//! Configuration management for clipboard-speaker.
//!
//! Every value has a built-in default, so no config file is needed. An
//! optional YAML file in one of the standard locations overrides them.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeakerConfig {
    pub voice: String,
    pub lang_code: String,
    pub speed: f32,
    pub repeat_count: u32,
    /// Pause between repeats, in seconds.
    pub repeat_interval: f64,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            voice: "af_heart".into(),
            lang_code: "a".into(),
            speed: 1.0,
            repeat_count: 3,
            repeat_interval: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Local model directory. Relative paths are joined onto the base dir.
    pub root: PathBuf,
    /// Collection identifier, used only as a resolver cache namespace.
    pub collection: String,
    pub onnx_file: String,
    pub config_file: String,
    pub threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("models--hexgrad--Kokoro-82M"),
            collection: "hexgrad/Kokoro-82M".into(),
            onnx_file: "kokoro-v1.0.onnx".into(),
            config_file: "config.json".into(),
            threads: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_ms: u64,
    pub backoff_ms: u64,
    /// Interval for re-checking the playback flag before a dispatch.
    pub busy_wait_ms: u64,
    /// Interval for re-checking initialization from a waiting playback.
    pub init_poll_ms: u64,
    /// Give up waiting for the playback flag after this long. Unset waits forever.
    pub playback_wait_timeout_secs: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_ms: 300,
            backoff_ms: 1000,
            busy_wait_ms: 200,
            init_poll_ms: 500,
            playback_wait_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Drop a pending utterance if initialization takes longer than this.
    pub init_wait_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LexiconConfig {
    /// Zip archive holding `lexicon.json`, relative to the base dir.
    pub archive: PathBuf,
    /// Directory the archive is unpacked into, relative to the base dir.
    pub dir: PathBuf,
}

impl Default for LexiconConfig {
    fn default() -> Self {
        Self {
            archive: PathBuf::from("en_lexicon.zip"),
            dir: PathBuf::from("lexicon"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub progress: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self { progress: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub speaker: SpeakerConfig,
    pub model: ModelConfig,
    pub monitor: MonitorConfig,
    pub playback: PlaybackConfig,
    pub lexicon: LexiconConfig,
    pub ui: UiConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/clipboard-speaker/config.yaml
    /// 3. /etc/clipboard-speaker/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/clipboard-speaker/config.yaml")),
                Some(PathBuf::from("/etc/clipboard-speaker/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str::<Self>(contents).map(Self::validated)
    }

    /// Clamp values that would make the speaker loop meaningless.
    pub fn validated(mut self) -> Self {
        if self.speaker.repeat_count == 0 {
            warn!("repeat_count must be at least 1, using 1");
            self.speaker.repeat_count = 1;
        }
        if !self.speaker.repeat_interval.is_finite() || self.speaker.repeat_interval < 0.0 {
            warn!("repeat_interval must be >= 0, using 0");
            self.speaker.repeat_interval = 0.0;
        }
        self
    }

    pub fn repeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.speaker.repeat_interval)
    }

    /// Model root, with relative paths joined onto `base`.
    pub fn model_root(&self, base: &Path) -> PathBuf {
        base.join(&self.model.root)
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn busy_wait(&self) -> Duration {
        Duration::from_millis(self.busy_wait_ms)
    }

    pub fn init_poll(&self) -> Duration {
        Duration::from_millis(self.init_poll_ms)
    }

    pub fn playback_wait_timeout(&self) -> Option<Duration> {
        self.playback_wait_timeout_secs.map(Duration::from_secs)
    }
}

impl PlaybackConfig {
    pub fn init_wait_timeout(&self) -> Option<Duration> {
        self.init_wait_timeout_secs.map(Duration::from_secs)
    }
}
