//! Playback of clipboard text.
//!
//! A single worker task takes texts from an unbounded queue, waits for the
//! speaker to finish initializing, then speaks each text `repeat_count`
//! times on a blocking thread. One worker means at most one utterance plays
//! at a time.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::context::{AppContext, InitState};
use crate::speaker::output::OutputError;
use crate::speaker::tts::TtsError;
use crate::speaker::{Speaker, SAMPLE_RATE};

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Tts(#[from] TtsError),
    #[error(transparent)]
    Output(#[from] OutputError),
}

#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub voice: String,
    pub repeat_count: u32,
    pub repeat_interval: Duration,
    pub init_poll: Duration,
    pub init_wait_timeout: Option<Duration>,
}

impl PlaybackSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            voice: config.speaker.voice.clone(),
            repeat_count: config.speaker.repeat_count.max(1),
            repeat_interval: config.repeat_interval(),
            init_poll: config.monitor.init_poll(),
            init_wait_timeout: config.playback.init_wait_timeout(),
        }
    }
}

/// What happened across the repeats of one utterance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackReport {
    pub played: u32,
    pub empty: u32,
    pub failed: u32,
}

/// Spawn the playback worker. Texts sent on the returned channel are spoken
/// in order, one at a time.
pub fn spawn_worker(
    ctx: Arc<AppContext>,
    settings: Arc<PlaybackSettings>,
) -> (mpsc::UnboundedSender<String>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handle = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            play_text(Arc::clone(&ctx), text, Arc::clone(&settings)).await;
        }
        debug!("Playback queue closed");
    });
    (tx, handle)
}

/// Speak `text` once the speaker is ready. Returns `None` if nothing was played
/// because initialization failed or never finished.
pub async fn play_text(
    ctx: Arc<AppContext>,
    text: String,
    settings: Arc<PlaybackSettings>,
) -> Option<PlaybackReport> {
    let speaker = match ctx.init_state() {
        InitState::Ready(speaker) => speaker,
        InitState::Failed(reason) => {
            warn!("Cannot play, initialization failed: {reason}");
            return None;
        }
        InitState::Pending => {
            info!("Waiting for initialization to finish...");
            match ctx
                .wait_for_init(settings.init_poll, settings.init_wait_timeout)
                .await
            {
                Some(InitState::Ready(speaker)) => speaker,
                Some(InitState::Failed(reason)) => {
                    warn!("Cannot play, initialization failed: {reason}");
                    return None;
                }
                Some(InitState::Pending) | None => {
                    warn!("Initialization did not finish in time, dropping text");
                    return None;
                }
            }
        }
    };

    let guard = ctx.begin_playback();
    let result = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        speak_repeated(&speaker, &text, &settings)
    })
    .await;

    let report = match result {
        Ok(report) => Some(report),
        Err(e) => {
            error!("Playback task failed: {e}");
            None
        }
    };

    info!("Playback complete");
    info!("Listening to clipboard...");
    report
}

/// Speak `text` `repeat_count` times. Blocking.
///
/// A failing or silent repeat is logged and the next repeat still runs.
pub fn speak_repeated(speaker: &Speaker, text: &str, settings: &PlaybackSettings) -> PlaybackReport {
    let mut report = PlaybackReport::default();
    let total = settings.repeat_count;

    for repeat in 0..total {
        info!("Playing repeat {}/{total}: {}", repeat + 1, preview(text, 30));

        match speak_once(speaker, text, &settings.voice) {
            Ok(0) => {
                warn!("No audio chunks were generated");
                report.empty += 1;
            }
            Ok(chunks) => {
                debug!("Repeat {} played {chunks} chunk(s)", repeat + 1);
                report.played += 1;
            }
            Err(e) => {
                warn!("Error during playback: {e}");
                report.failed += 1;
            }
        }

        if repeat + 1 < total && !settings.repeat_interval.is_zero() {
            thread::sleep(settings.repeat_interval);
        }
    }

    report
}

/// Play every chunk of one synthesis pass, each to completion before the next.
fn speak_once(speaker: &Speaker, text: &str, voice: &str) -> Result<usize, PlaybackError> {
    let mut played = 0;
    for chunk in speaker.engine.synthesize(text, voice) {
        let chunk = chunk?;
        if chunk.audio.is_empty() {
            continue;
        }
        debug!("Chunk {}: \"{}\" [{}]", played + 1, chunk.graphemes, chunk.phonemes);
        speaker.output.play(chunk.audio, SAMPLE_RATE)?;
        speaker.output.wait();
        played += 1;
    }
    Ok(played)
}

/// First `max` characters of `text`, with an ellipsis when cut.
pub fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::Mutex;

    fn settings(repeat_count: u32) -> PlaybackSettings {
        PlaybackSettings {
            voice: "af_heart".into(),
            repeat_count,
            repeat_interval: Duration::ZERO,
            init_poll: Duration::from_millis(5),
            init_wait_timeout: Some(Duration::from_secs(5)),
        }
    }

    fn speaker(log: &EventLog, scripts: Vec<Script>, ctx: Option<Arc<AppContext>>) -> Speaker {
        let mut engine = FakeEngine::new(Arc::clone(log), scripts);
        engine.ctx = ctx;
        Speaker::new(
            Box::new(engine),
            Box::new(FakeOutput {
                log: Arc::clone(log),
            }),
        )
    }

    #[test]
    fn chunks_play_in_order_and_each_is_awaited() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let sp = speaker(
            &log,
            vec![
                Script::Chunks(vec![vec![1.0], vec![2.0]]),
                Script::Chunks(vec![vec![3.0]]),
            ],
            None,
        );

        let report = speak_repeated(&sp, "Hi there. Bye.", &settings(2));
        assert_eq!(report, PlaybackReport { played: 2, empty: 0, failed: 0 });

        let events = log.lock().unwrap().clone();
        let expected_tail = vec![
            Event::Play(vec![1.0]),
            Event::Wait,
            Event::Play(vec![2.0]),
            Event::Wait,
        ];
        assert_eq!(&events[1..5], expected_tail.as_slice());
        // Second repeat only starts after the first repeat's last wait.
        assert!(matches!(events[5], Event::Synthesize { .. }));
        assert_eq!(&events[6..], &[Event::Play(vec![3.0]), Event::Wait]);
    }

    #[test]
    fn failing_and_empty_repeats_do_not_stop_the_rest() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let sp = speaker(
            &log,
            vec![Script::Fail, Script::Chunks(vec![]), Script::Chunks(vec![vec![0.1]])],
            None,
        );

        let report = speak_repeated(&sp, "text", &settings(3));
        assert_eq!(report, PlaybackReport { played: 1, empty: 1, failed: 1 });
    }

    #[test]
    fn pause_separates_repeats_but_not_the_last() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let sp = speaker(&log, vec![], None);
        let mut s = settings(3);
        s.repeat_interval = Duration::from_millis(40);

        let started = std::time::Instant::now();
        speak_repeated(&sp, "text", &s);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(80));
        assert!(elapsed < Duration::from_millis(120 + 500));
    }

    #[tokio::test]
    async fn hello_world_is_spoken_three_times_with_flag_held() {
        let ctx = Arc::new(AppContext::new());
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        ctx.publish_ready(speaker(&log, vec![], Some(Arc::clone(&ctx))));
        assert!(!ctx.is_playing());

        let report = play_text(Arc::clone(&ctx), "Hello world".into(), Arc::new(settings(3)))
            .await
            .unwrap();

        assert_eq!(report.played, 3);
        assert!(!ctx.is_playing());
        let calls: Vec<_> = log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Synthesize { text, voice, playing } => {
                    Some((text.clone(), voice.clone(), *playing))
                }
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 3);
        for (text, voice, playing) in calls {
            assert_eq!(text, "Hello world");
            assert_eq!(voice, "af_heart");
            assert!(playing);
        }
    }

    #[tokio::test]
    async fn flag_is_cleared_after_errors() {
        let ctx = Arc::new(AppContext::new());
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        ctx.publish_ready(speaker(&log, vec![Script::Fail, Script::Fail], None));

        let report = play_text(Arc::clone(&ctx), "text".into(), Arc::new(settings(2)))
            .await
            .unwrap();
        assert_eq!(report.failed, 2);
        assert!(!ctx.is_playing());
    }

    #[tokio::test]
    async fn waits_for_pending_initialization() {
        let ctx = Arc::new(AppContext::new());
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let pending = tokio::spawn(play_text(
            Arc::clone(&ctx),
            "later".into(),
            Arc::new(settings(1)),
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(log.lock().unwrap().is_empty());
        ctx.publish_ready(speaker(&log, vec![], None));

        let report = pending.await.unwrap().unwrap();
        assert_eq!(report.played, 1);
    }

    #[tokio::test]
    async fn failed_initialization_short_circuits() {
        let ctx = Arc::new(AppContext::new());
        ctx.publish_failed("no model");
        let report = play_text(Arc::clone(&ctx), "text".into(), Arc::new(settings(3))).await;
        assert!(report.is_none());
        assert!(!ctx.is_playing());
    }

    #[tokio::test]
    async fn worker_plays_queued_texts_in_order() {
        let ctx = Arc::new(AppContext::new());
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        ctx.publish_ready(speaker(&log, vec![], None));

        let (tx, handle) = spawn_worker(Arc::clone(&ctx), Arc::new(settings(1)));
        tx.send("first".into()).unwrap();
        tx.send("second".into()).unwrap();
        drop(tx);
        handle.await.unwrap();

        let texts: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Synthesize { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn preview_cuts_on_char_boundaries() {
        assert_eq!(preview("short", 30), "short");
        assert_eq!(preview("héllo wörld", 5), "héllo...");
        assert_eq!(preview("abc", 3), "abc");
    }
}
