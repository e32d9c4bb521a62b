//! Optional pronunciation lexicon.
//!
//! A word → spoken-form table (e.g. `k8s` → `kubernetes`) shipped as a local
//! zip package. Installing and loading it are both best-effort: the speaker
//! works the same without it, just with the phonemizer's own guesses.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

pub const LEXICON_FILE: &str = "lexicon.json";

#[derive(Debug, Error)]
pub enum LexiconError {
    #[error("lexicon I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("bad lexicon archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("bad lexicon JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default)]
pub enum Lexicon {
    Available(HashMap<String, String>),
    #[default]
    Unavailable,
}

/// Unpack the lexicon archive into `dest` unless it is already installed.
/// Returns whether anything was extracted.
pub fn install(archive: &Path, dest: &Path) -> Result<bool, LexiconError> {
    if dest.join(LEXICON_FILE).exists() {
        debug!("Lexicon already installed in {}", dest.display());
        return Ok(false);
    }
    if !archive.exists() {
        debug!("No lexicon archive at {}", archive.display());
        return Ok(false);
    }

    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    fs::create_dir_all(dest)?;
    zip.extract(dest)?;
    info!("Installed lexicon from {}", archive.display());
    Ok(true)
}

impl Lexicon {
    pub fn load(dir: &Path) -> Result<Self, LexiconError> {
        let contents = fs::read_to_string(dir.join(LEXICON_FILE))?;
        let raw: HashMap<String, String> = serde_json::from_str(&contents)?;
        let entries: HashMap<String, String> = raw
            .into_iter()
            .map(|(word, spoken)| (word.to_lowercase(), spoken))
            .collect();
        info!("Lexicon loaded: {} entries", entries.len());
        Ok(Self::Available(entries))
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    /// Replace known words, keeping surrounding punctuation and spacing.
    pub fn apply<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let Self::Available(entries) = self else {
            return Cow::Borrowed(text);
        };
        if entries.is_empty() {
            return Cow::Borrowed(text);
        }

        let mut out = String::with_capacity(text.len());
        let mut changed = false;
        let mut word_start = None;

        for (i, ch) in text.char_indices() {
            if ch.is_whitespace() {
                if let Some(start) = word_start.take() {
                    changed |= push_word(&mut out, &text[start..i], entries);
                }
                out.push(ch);
            } else if word_start.is_none() {
                word_start = Some(i);
            }
        }
        if let Some(start) = word_start {
            changed |= push_word(&mut out, &text[start..], entries);
        }

        if changed {
            Cow::Owned(out)
        } else {
            Cow::Borrowed(text)
        }
    }
}

fn push_word(out: &mut String, token: &str, entries: &HashMap<String, String>) -> bool {
    let core = token.trim_matches(|c: char| c.is_ascii_punctuation());
    if core.is_empty() {
        out.push_str(token);
        return false;
    }
    match entries.get(&core.to_lowercase()) {
        Some(spoken) => {
            let start = token.find(core).unwrap_or(0);
            out.push_str(&token[..start]);
            out.push_str(spoken);
            out.push_str(&token[start + core.len()..]);
            true
        }
        None => {
            out.push_str(token);
            false
        }
    }
}
