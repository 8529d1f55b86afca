//! Console scene playback.
//!
//! Walks a [`PlaybackSession`] from start to end in one sequential loop.
//! Partner lines are spoken and auto-advance; performer lines wait for a
//! [`Cue`] or a timed reading estimate.

use async_trait::async_trait;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::config::{Config, PacingConfig};
use crate::error::ScenePartnerError;
use crate::sequence::{PlayStep, StepKind};
use crate::session::PlaybackSession;
use crate::tts::{SpeakOptions, SpeechSink};

/// Callback for scene events.
pub type SceneCallback = Box<dyn Fn(SceneEvent) + Send + Sync>;

/// Events emitted during playback.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneEvent {
    /// Playback is starting.
    SceneStart { total: usize },
    /// The scene contained no usable lines.
    NoLines,
    /// A partner line is about to be spoken.
    PartnerLine {
        position: usize,
        total: usize,
        speaker: String,
        text: String,
    },
    /// The speech sink could not say a partner line.
    SpeechFailed { speaker: String, error: String },
    /// The performer should deliver a line.
    PerformerLine {
        position: usize,
        total: usize,
        speaker: String,
        text: String,
        wait_for_user: bool,
    },
    /// The last step has been played.
    SceneEnd,
}

/// How a playback run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Every step was played.
    Completed { steps: usize },
    /// There was nothing to play.
    NoLines,
}

/// The performer's signal that a line has been delivered.
#[async_trait]
pub trait Cue: Send {
    async fn wait_for_cue(&mut self, step: &PlayStep) -> Result<(), ScenePartnerError>;
}

/// Plays one scene on the console.
pub struct ScenePlayer {
    session: PlaybackSession,
    sink: Box<dyn SpeechSink>,
    cue: Option<Box<dyn Cue>>,
    wait_for_user: bool,
    pacing: PacingConfig,
    speak: SpeakOptions,
    callback: Option<SceneCallback>,
}

impl ScenePlayer {
    /// Create a player for `steps` using the settings in `config`.
    pub fn new(config: &Config, steps: Vec<PlayStep>, sink: Box<dyn SpeechSink>) -> Self {
        Self {
            session: PlaybackSession::with_steps(steps),
            sink,
            cue: None,
            wait_for_user: config.performer.wait_for_user,
            pacing: config.pacing.clone(),
            speak: config.speech.speak_options(),
            callback: None,
        }
    }

    /// Set where performer cues come from.
    pub fn with_cue(mut self, cue: Box<dyn Cue>) -> Self {
        self.cue = Some(cue);
        self
    }

    /// Set a callback for scene events.
    pub fn with_callback(mut self, callback: SceneCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Play the scene to the end.
    pub async fn run(&mut self) -> Result<PlaybackOutcome, ScenePartnerError> {
        if self.session.is_empty() {
            info!("no valid lines in scene");
            self.emit_event(SceneEvent::NoLines);
            return Ok(PlaybackOutcome::NoLines);
        }

        let total = self.session.len();
        info!(total, sink = self.sink.name(), "starting scene");
        self.emit_event(SceneEvent::SceneStart { total });

        while let Some(step) = self.session.current().cloned() {
            let position = self.session.position();
            debug!(position, total, kind = ?step.kind, "playing step");

            match step.kind {
                StepKind::Partner => self.play_partner(&step, position, total).await,
                StepKind::Performer => self.play_performer(&step, position, total).await?,
            }

            self.session.advance();
        }

        self.emit_event(SceneEvent::SceneEnd);
        Ok(PlaybackOutcome::Completed { steps: total })
    }

    /// Speak a partner line and hold for its estimated duration.
    ///
    /// Time spent inside a blocking sink counts towards the estimate, so
    /// blocking and fire-and-forget sinks pace the same way.
    async fn play_partner(&mut self, step: &PlayStep, position: usize, total: usize) {
        self.emit_event(SceneEvent::PartnerLine {
            position,
            total,
            speaker: step.speaker().to_string(),
            text: step.text.clone(),
        });

        let started = Instant::now();
        if let Err(e) = self.sink.speak(&step.text, &self.speak).await {
            warn!(error = %e, sink = self.sink.name(), "speech failed, continuing on estimate");
            self.emit_event(SceneEvent::SpeechFailed {
                speaker: step.speaker().to_string(),
                error: e.to_string(),
            });
        }

        let estimate = self.pacing.partner_estimate(&step.text, self.speak.rate);
        sleep(estimate.saturating_sub(started.elapsed())).await;
        sleep(self.pacing.partner_pause()).await;
    }

    async fn play_performer(
        &mut self,
        step: &PlayStep,
        position: usize,
        total: usize,
    ) -> Result<(), ScenePartnerError> {
        let wait_for_user = self.wait_for_user && self.cue.is_some();
        self.emit_event(SceneEvent::PerformerLine {
            position,
            total,
            speaker: step.speaker().to_string(),
            text: step.text.clone(),
            wait_for_user,
        });

        match self.cue.as_mut() {
            Some(cue) if wait_for_user => cue.wait_for_cue(step).await?,
            _ => {
                if self.wait_for_user {
                    debug!("no cue source, falling back to timed performer lines");
                }
                // reading pace, independent of the speech rate
                sleep(self.pacing.performer_estimate(&step.text, 1.0)).await;
            }
        }

        Ok(())
    }

    /// Emit an event if a callback is registered.
    fn emit_event(&self, event: SceneEvent) {
        if let Some(ref callback) = self.callback {
            callback(event);
        }
    }

    pub fn session(&self) -> &PlaybackSession {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse_scene_text;
    use crate::sequence::build_sequence;
    use crate::session::SessionState;
    use crate::tts::SilentSpeech;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const SCENE: &str = "JAMIE: I can't believe you did that.\nALEX: Someone had to.";

    struct CountingCue(Arc<AtomicUsize>);

    #[async_trait]
    impl Cue for CountingCue {
        async fn wait_for_cue(&mut self, _step: &PlayStep) -> Result<(), ScenePartnerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSpeech;

    #[async_trait]
    impl SpeechSink for FailingSpeech {
        fn name(&self) -> &str {
            "failing"
        }

        async fn speak(&mut self, _text: &str, _options: &SpeakOptions) -> Result<(), ScenePartnerError> {
            Err(ScenePartnerError::SpeechError("backend unavailable".to_string()))
        }
    }

    /// Blocks for a fixed time, like a speech command that waits for audio.
    struct SlowSpeech(Duration);

    #[async_trait]
    impl SpeechSink for SlowSpeech {
        fn name(&self) -> &str {
            "slow"
        }

        async fn speak(&mut self, _text: &str, _options: &SpeakOptions) -> Result<(), ScenePartnerError> {
            sleep(self.0).await;
            Ok(())
        }
    }

    fn recorder() -> (SceneCallback, Arc<Mutex<Vec<SceneEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: SceneCallback = Box::new(move |event| sink.lock().unwrap().push(event));
        (callback, events)
    }

    fn assert_close(actual: Duration, expected_secs: f64) {
        let diff = (actual.as_secs_f64() - expected_secs).abs();
        assert!(diff < 0.01, "expected ~{expected_secs}s, got {actual:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_cue_on_performer_lines() {
        let config = Config::default();
        let steps = build_sequence(&parse_scene_text(SCENE), "JAMIE");
        let cues = Arc::new(AtomicUsize::new(0));
        let (callback, events) = recorder();

        let mut player = ScenePlayer::new(&config, steps, Box::new(SilentSpeech::new()))
            .with_cue(Box::new(CountingCue(cues.clone())))
            .with_callback(callback);

        let outcome = player.run().await.unwrap();
        assert_eq!(outcome, PlaybackOutcome::Completed { steps: 2 });
        assert_eq!(cues.load(Ordering::SeqCst), 1);
        assert_eq!(player.session().state(), SessionState::Ended);

        let events = events.lock().unwrap();
        assert_eq!(events.first(), Some(&SceneEvent::SceneStart { total: 2 }));
        assert_eq!(
            events[1],
            SceneEvent::PerformerLine {
                position: 1,
                total: 2,
                speaker: "JAMIE".to_string(),
                text: "I can't believe you did that.".to_string(),
                wait_for_user: true,
            }
        );
        assert!(matches!(events[2], SceneEvent::PartnerLine { position: 2, .. }));
        assert_eq!(events.last(), Some(&SceneEvent::SceneEnd));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_performer_lines() {
        let mut config = Config::default();
        config.performer.wait_for_user = false;
        let steps = build_sequence(&parse_scene_text("JAMIE: Hi."), "JAMIE");
        let cues = Arc::new(AtomicUsize::new(0));

        let mut player = ScenePlayer::new(&config, steps, Box::new(SilentSpeech::new()))
            .with_cue(Box::new(CountingCue(cues.clone())));

        let started = Instant::now();
        player.run().await.unwrap();

        assert_eq!(cues.load(Ordering::SeqCst), 0);
        assert_close(started.elapsed(), 1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partner_pacing_includes_pause() {
        let config = Config::default();
        let steps = build_sequence(&parse_scene_text("ALEX: Someone had to.\nALEX: Again."), "JAMIE");

        let mut player = ScenePlayer::new(&config, steps, Box::new(SilentSpeech::new()));
        let started = Instant::now();
        player.run().await.unwrap();

        // 3 words: 1.2s + 0.35s overhead, then the 1.0s floor; 0.5s pause each
        assert_close(started.elapsed(), 1.55 + 0.5 + 1.0 + 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_sink_counts_towards_estimate() {
        let config = Config::default();
        let steps = build_sequence(&parse_scene_text("ALEX: Someone had to."), "JAMIE");

        let mut player = ScenePlayer::new(&config, steps, Box::new(SlowSpeech(Duration::from_secs(3))));
        let started = Instant::now();
        player.run().await.unwrap();

        assert_close(started.elapsed(), 3.0 + 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speech_failure_does_not_stop_scene() {
        let config = Config::default();
        let steps = build_sequence(&parse_scene_text("ALEX: Someone had to.\nALEX: Maybe not."), "JAMIE");
        let (callback, events) = recorder();

        let mut player =
            ScenePlayer::new(&config, steps, Box::new(FailingSpeech)).with_callback(callback);
        let outcome = player.run().await.unwrap();

        assert_eq!(outcome, PlaybackOutcome::Completed { steps: 2 });
        let failures = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, SceneEvent::SpeechFailed { .. }))
            .count();
        assert_eq!(failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_lines() {
        let config = Config::default();
        let steps = build_sequence(&parse_scene_text("# only a comment\n\n// and another"), "JAMIE");
        let (callback, events) = recorder();

        let mut player =
            ScenePlayer::new(&config, steps, Box::new(SilentSpeech::new())).with_callback(callback);

        assert_eq!(player.run().await.unwrap(), PlaybackOutcome::NoLines);
        assert_eq!(*events.lock().unwrap(), vec![SceneEvent::NoLines]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_cue_falls_back_to_timer() {
        let config = Config::default();
        let steps = build_sequence(&parse_scene_text("JAMIE: Hi."), "JAMIE");
        let (callback, events) = recorder();

        let mut player =
            ScenePlayer::new(&config, steps, Box::new(SilentSpeech::new())).with_callback(callback);
        let started = Instant::now();
        player.run().await.unwrap();

        assert_close(started.elapsed(), 1.5);
        assert!(events.lock().unwrap().iter().any(|e| matches!(
            e,
            SceneEvent::PerformerLine {
                wait_for_user: false,
                ..
            }
        )));
    }
}
