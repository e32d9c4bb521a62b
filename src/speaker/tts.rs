//! Kokoro TTS engine: text → phonemes → ONNX inference → f32 audio.
//!
//! Pipeline:
//! 1. Text → lexicon substitutions (when a lexicon is available)
//! 2. Text → sentences (split on .!?)
//! 3. Sentence → phonemes (misaki-rs G2P)
//! 4. Phonemes → token IDs (vocab from config.json)
//! 5. Token IDs + voice style + speed → ONNX inference → f32 audio (24kHz)
//!
//! Every model file is fetched through the injected [`ArtifactResolver`].
//! Sentences are synthesized lazily, one per call to `next()`.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use ndarray::{Array2, Array3};
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use ort::value::Tensor;
use thiserror::Error;
use tracing::{debug, info};

use crate::lexicon::Lexicon;
use crate::resolver::{ArtifactResolver, ResolveError};

use super::SAMPLE_RATE;

const MAX_TOKENS: usize = 510; // Voice style array first dimension
const STYLE_DIM: usize = 256;

#[derive(Debug, Error)]
pub enum TtsError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse model config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to read voice '{voice}': {message}")]
    Npy { voice: String, message: String },
    #[error("ONNX runtime error: {0}")]
    Onnx(String),
    #[error("phonemization failed: {0}")]
    Phonemizer(String),
    #[error("unknown voice: {0}")]
    UnknownVoice(String),
    #[error("unsupported language code '{0}'")]
    UnsupportedLanguage(String),
    #[error("bad tensor shape: {0}")]
    Shape(String),
}

/// One synthesized piece of an utterance.
#[derive(Debug, Clone)]
pub struct SpeechChunk {
    pub graphemes: String,
    pub phonemes: String,
    pub audio: Vec<f32>,
}

pub type ChunkStream<'a> = Box<dyn Iterator<Item = Result<SpeechChunk, TtsError>> + 'a>;

/// Text-to-speech capability: text and voice in, lazily produced audio out.
pub trait SpeechEngine: Send + Sync {
    fn synthesize<'a>(&'a self, text: &'a str, voice: &'a str) -> ChunkStream<'a>;
}

/// Construction parameters for [`KokoroEngine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub lang_code: String,
    pub collection: String,
    pub onnx_file: String,
    pub config_file: String,
    pub speed: f32,
    pub threads: usize,
    pub use_cuda: bool,
}

/// Whether the CUDA execution provider can be used on this machine.
pub fn cuda_available() -> bool {
    match CUDAExecutionProvider::default().is_available() {
        Ok(available) => available,
        Err(e) => {
            debug!("CUDA availability check failed: {e}");
            false
        }
    }
}

/// Native Kokoro TTS engine.
pub struct KokoroEngine {
    // ONNX model (Mutex because ort 2.0 Session::run needs &mut)
    session: Mutex<ort::session::Session>,

    phonemizer: misaki_rs::G2P,

    // Vocabulary: phoneme char → token ID
    vocab: HashMap<char, i64>,

    // Voice styles, loaded on first use. shape: (510, 256)
    voices: Mutex<HashMap<String, Arc<Array2<f32>>>>,

    resolver: Arc<dyn ArtifactResolver>,
    collection: String,
    lexicon: Lexicon,
    speed: f32,
}

impl KokoroEngine {
    /// Load vocab, ONNX graph and phonemizer. Blocking.
    pub fn new(
        options: &EngineOptions,
        resolver: Arc<dyn ArtifactResolver>,
        lexicon: Lexicon,
    ) -> Result<Self, TtsError> {
        let t0 = Instant::now();
        let language = language_for(&options.lang_code)?;

        let config_path = resolver.resolve(&options.collection, &options.config_file)?;
        info!("Loading vocabulary from {}", config_path.display());
        let vocab = load_vocab(&config_path)?;
        info!("Vocabulary loaded: {} tokens", vocab.len());

        let model_path = resolver.resolve(&options.collection, &options.onnx_file)?;
        info!("Loading ONNX model from {}", model_path.display());
        let mut builder = ort::session::Session::builder()
            .map_err(|e| TtsError::Onnx(format!("failed to create session builder: {e}")))?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(|e| TtsError::Onnx(format!("failed to set optimization level: {e}")))?
            .with_intra_threads(options.threads)
            .map_err(|e| TtsError::Onnx(format!("failed to set thread count: {e}")))?;
        if options.use_cuda {
            builder = builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])
                .map_err(|e| TtsError::Onnx(format!("failed to register CUDA: {e}")))?;
        }
        let session = builder
            .commit_from_file(&model_path)
            .map_err(|e| TtsError::Onnx(format!("failed to load model: {e}")))?;

        if lexicon.is_available() {
            info!("Using pronunciation lexicon");
        }

        info!("Initializing misaki-rs phonemizer...");
        let phonemizer = misaki_rs::G2P::new(language);

        info!("Kokoro engine loaded in {}ms", t0.elapsed().as_millis());

        Ok(Self {
            session: Mutex::new(session),
            phonemizer,
            vocab,
            voices: Mutex::new(HashMap::new()),
            resolver,
            collection: options.collection.clone(),
            lexicon,
            speed: options.speed,
        })
    }

    /// Style vectors for a voice, resolved as `voices/<voice>.npy` on first use.
    fn voice_styles(&self, voice: &str) -> Result<Arc<Array2<f32>>, TtsError> {
        if let Some(styles) = self
            .voices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(voice)
        {
            return Ok(Arc::clone(styles));
        }

        let filename = format!("voices/{voice}.npy");
        let path = match self.resolver.resolve(&self.collection, &filename) {
            Ok(path) => path,
            Err(ResolveError::NotFound { .. }) => return Err(TtsError::UnknownVoice(voice.into())),
            Err(e) => return Err(e.into()),
        };
        let styles = Arc::new(load_voice(&path, voice)?);
        info!("Loaded voice {voice} from {}", path.display());

        self.voices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(voice.to_string(), Arc::clone(&styles));
        Ok(styles)
    }

    /// Generate audio for a single sentence.
    fn generate(&self, sentence: &str, voice: &str) -> Result<SpeechChunk, TtsError> {
        let (phonemes, _tokens) = self
            .phonemizer
            .g2p(sentence)
            .map_err(|e| TtsError::Phonemizer(e.to_string()))?;

        if phonemes.is_empty() {
            return Ok(SpeechChunk {
                graphemes: sentence.to_string(),
                phonemes,
                audio: Vec::new(),
            });
        }

        let mut token_ids: Vec<i64> = Vec::with_capacity(phonemes.len() + 2);
        token_ids.push(0);
        token_ids.extend(phonemes.chars().filter_map(|ch| self.vocab.get(&ch).copied()));
        token_ids.push(0);

        let n_tokens = token_ids.len().min(MAX_TOKENS);
        token_ids.truncate(n_tokens);

        // Index into style array by token count (clamped to max)
        let styles = self.voice_styles(voice)?;
        let style_idx = n_tokens.saturating_sub(2).min(styles.nrows() - 1);
        let style_vec: Vec<f32> = styles.row(style_idx).to_vec();

        let tokens_array = Array2::from_shape_vec((1, n_tokens), token_ids)
            .map_err(|e| TtsError::Shape(format!("tokens: {e}")))?;
        let tokens_tensor =
            Tensor::from_array(tokens_array).map_err(|e| TtsError::Onnx(e.to_string()))?;

        let style_array = Array2::from_shape_vec((1, STYLE_DIM), style_vec)
            .map_err(|e| TtsError::Shape(format!("style: {e}")))?;
        let style_tensor =
            Tensor::from_array(style_array).map_err(|e| TtsError::Onnx(e.to_string()))?;

        let speed_tensor = Tensor::from_array(ndarray::Array1::from_vec(vec![self.speed]))
            .map_err(|e| TtsError::Onnx(e.to_string()))?;

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session
            .run(ort::inputs![
                "tokens" => tokens_tensor,
                "style" => style_tensor,
                "speed" => speed_tensor
            ])
            .map_err(|e| TtsError::Onnx(format!("inference failed: {e}")))?;

        let first_output = outputs
            .iter()
            .next()
            .ok_or_else(|| TtsError::Onnx("no output tensor from model".into()))?;
        let (_shape, audio_slice) = first_output
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| TtsError::Onnx(format!("failed to extract audio: {e}")))?;
        let audio = audio_slice.to_vec();

        debug!(
            "Generated {} samples ({:.1}s)",
            audio.len(),
            audio.len() as f32 / SAMPLE_RATE as f32
        );

        Ok(SpeechChunk {
            graphemes: sentence.to_string(),
            phonemes,
            audio,
        })
    }
}

impl SpeechEngine for KokoroEngine {
    fn synthesize<'a>(&'a self, text: &'a str, voice: &'a str) -> ChunkStream<'a> {
        let normalized = self.lexicon.apply(text.trim());
        let sentences: Vec<String> = split_sentences(&normalized)
            .into_iter()
            .map(str::to_string)
            .collect();

        Box::new(
            sentences
                .into_iter()
                .map(move |sentence| self.generate(&sentence, voice)),
        )
    }
}

fn language_for(lang_code: &str) -> Result<misaki_rs::Language, TtsError> {
    match lang_code {
        "a" | "en-us" => Ok(misaki_rs::Language::EnglishUS),
        other => Err(TtsError::UnsupportedLanguage(other.to_string())),
    }
}

/// Load the phoneme vocabulary from the model's config.json.
///
/// Accepts both the Kokoro layout (`vocab` at the top level) and the
/// tokenizer.json layout (`model.vocab`).
fn load_vocab(path: &Path) -> Result<HashMap<char, i64>, TtsError> {
    let contents = fs::read_to_string(path).map_err(|source| TtsError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let data: serde_json::Value = serde_json::from_str(&contents)?;

    let vocab = data["vocab"]
        .as_object()
        .or_else(|| data["model"]["vocab"].as_object())
        .ok_or_else(|| TtsError::Shape(format!("no vocab table in {}", path.display())))?;

    let mut map = HashMap::new();
    for (token, id) in vocab {
        let id = id
            .as_i64()
            .ok_or_else(|| TtsError::Shape(format!("token id for '{token}' is not an integer")))?;
        // Each token should be a single character
        if let Some(ch) = token.chars().next() {
            map.insert(ch, id);
        }
    }
    Ok(map)
}

/// Load a voice style array of shape (510, 1, 256) and squeeze it to (510, 256).
fn load_voice(path: &Path, voice: &str) -> Result<Array2<f32>, TtsError> {
    let arr: Array3<f32> = ndarray_npy::read_npy(path).map_err(|e| TtsError::Npy {
        voice: voice.to_string(),
        message: e.to_string(),
    })?;

    let dim0 = arr.shape()[0];
    let dim2 = arr.shape()[2];
    if dim0 == 0 || dim2 != STYLE_DIM {
        return Err(TtsError::Shape(format!(
            "voice '{voice}' has shape {:?}, expected (N, 1, {STYLE_DIM})",
            arr.shape()
        )));
    }

    arr.into_shape_with_order((dim0, dim2))
        .map_err(|e| TtsError::Shape(format!("voice '{voice}': {e}")))
}

/// Split copied text into speakable pieces: every line on its own, and within
/// a line after `.`, `!` or `?` followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    text.lines().flat_map(|line| sentences_in_line(line)).collect()
}

fn sentences_in_line(line: &str) -> impl Iterator<Item = &str> + '_ {
    let mut rest = line.trim();
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let mut chars = rest.char_indices().peekable();
        let mut cut = rest.len();
        while let Some((idx, ch)) = chars.next() {
            let ends_sentence = matches!(ch, '.' | '!' | '?');
            if ends_sentence && chars.peek().is_some_and(|&(_, next)| next.is_whitespace()) {
                cut = idx + ch.len_utf8();
                break;
            }
        }
        let (sentence, tail) = rest.split_at(cut);
        rest = tail.trim_start();
        Some(sentence)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::LocalArtifactResolver;
    use tempfile::tempdir;

    fn options(lang_code: &str) -> EngineOptions {
        EngineOptions {
            lang_code: lang_code.into(),
            collection: "hexgrad/Kokoro-82M".into(),
            onnx_file: "kokoro-v1.0.onnx".into(),
            config_file: "config.json".into(),
            speed: 1.0,
            threads: 1,
            use_cuda: false,
        }
    }

    #[test]
    fn splits_on_sentence_punctuation() {
        assert_eq!(
            split_sentences("Hello world. How are you? Fine!"),
            vec!["Hello world.", "How are you?", "Fine!"]
        );
        assert_eq!(split_sentences("version 1.2 is out"), vec!["version 1.2 is out"]);
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn line_breaks_separate_pieces() {
        assert_eq!(
            split_sentences("Release notes\n\n  Fixed the parser. Faster builds\r\n"),
            vec!["Release notes", "Fixed the parser.", "Faster builds"]
        );
        assert_eq!(split_sentences("Wait... what?"), vec!["Wait...", "what?"]);
    }

    #[test]
    fn vocab_reads_top_level_and_tokenizer_layouts() {
        let dir = tempdir().unwrap();
        let kokoro = dir.path().join("config.json");
        fs::write(&kokoro, r#"{"n_token": 178, "vocab": {"a": 43, "ə": 83}}"#).unwrap();
        let vocab = load_vocab(&kokoro).unwrap();
        assert_eq!(vocab.get(&'ə'), Some(&83));

        let tokenizer = dir.path().join("tokenizer.json");
        fs::write(&tokenizer, r#"{"model": {"vocab": {"b": 44}}}"#).unwrap();
        assert_eq!(load_vocab(&tokenizer).unwrap().get(&'b'), Some(&44));
    }

    #[test]
    fn vocab_without_table_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"n_token": 178}"#).unwrap();
        assert!(matches!(load_vocab(&path), Err(TtsError::Shape(_))));
    }

    #[test]
    fn voice_array_is_squeezed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("af_heart.npy");
        let arr = Array3::<f32>::zeros((510, 1, STYLE_DIM));
        ndarray_npy::write_npy(&path, &arr).unwrap();

        let styles = load_voice(&path, "af_heart").unwrap();
        assert_eq!(styles.shape(), &[510, STYLE_DIM]);
    }

    #[test]
    fn unsupported_language_fails_before_any_lookup() {
        let dir = tempdir().unwrap();
        let resolver = Arc::new(LocalArtifactResolver::new(dir.path()));
        let err = KokoroEngine::new(&options("z"), resolver.clone(), Lexicon::Unavailable)
            .err()
            .unwrap();
        assert!(matches!(err, TtsError::UnsupportedLanguage(_)));
        assert!(resolver.cached("hexgrad/Kokoro-82M", "config.json").is_none());
    }

    #[test]
    fn missing_artifacts_surface_as_resolve_errors() {
        let dir = tempdir().unwrap();
        let resolver = Arc::new(LocalArtifactResolver::new(dir.path()));
        let err = KokoroEngine::new(&options("a"), resolver, Lexicon::Unavailable)
            .err()
            .unwrap();
        assert!(matches!(err, TtsError::Resolve(ResolveError::NotFound { .. })));
    }
}
