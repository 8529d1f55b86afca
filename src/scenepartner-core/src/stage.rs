//! Render-cycle driver for interactive hosts.
//!
//! A host that re-runs its page logic on every request keeps one [`Stage`]
//! per visitor in storage, applies the visitor's [`StageAction`], then calls
//! [`Stage::render`] to decide what to show. Rendering the same stage twice
//! without an action in between gives the same frame, and stale actions are
//! ignored, so repeated requests never skip lines.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PacingConfig;
use crate::script::parse_scene_text;
use crate::sequence::{PlayStep, StepKind, build_sequence};
use crate::session::{PlaybackSession, SessionState};
use crate::tts::{SpeakOptions, SpeechSink};

/// Slowest speech rate offered to the visitor.
pub const MIN_STAGE_RATE: f32 = 0.6;
/// Fastest speech rate offered to the visitor.
pub const MAX_STAGE_RATE: f32 = 1.4;

/// Scene shown before the visitor pastes their own.
pub const DEFAULT_SCENE: &str = "JAMIE: I can't believe you did that.
ALEX: Someone had to.
JAMIE: That's not an excuse.
ALEX: Maybe not. But it's the truth.
";

/// Visitor-controlled speech settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSettings {
    /// Speak partner lines automatically.
    pub auto_speak: bool,
    pub voice_hint: Option<String>,
    pub rate: f32,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            auto_speak: true,
            voice_hint: None,
            rate: 1.0,
        }
    }
}

impl StageSettings {
    pub fn new(auto_speak: bool, voice_hint: Option<String>, rate: f32) -> Self {
        let rate = if rate.is_finite() {
            rate.clamp(MIN_STAGE_RATE, MAX_STAGE_RATE)
        } else {
            1.0
        };
        Self {
            auto_speak,
            voice_hint: voice_hint.filter(|v| !v.trim().is_empty()),
            rate,
        }
    }

    fn speak_options(&self) -> SpeakOptions {
        SpeakOptions {
            voice_hint: self.voice_hint.clone(),
            rate: self.rate,
            volume: None,
        }
    }
}

/// Something the visitor did.
#[derive(Debug, Clone, PartialEq)]
pub enum StageAction {
    /// Build the scene from new text, performer and settings.
    Build {
        scene_text: String,
        performer: String,
        settings: StageSettings,
    },
    /// Forget the built scene; the next render builds it again.
    Reset,
    /// The performer finished the line at cursor `from`.
    Next { from: usize },
    /// A partner line at cursor `from` has had its time.
    AutoAdvance { from: usize },
    /// Go back to the first line.
    Restart,
}

/// What one render cycle shows.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The scene text had no usable lines.
    NoLines,
    /// Every line has been played.
    Ended { total: usize },
    /// A partner line; the host re-renders with
    /// [`StageAction::AutoAdvance`] after `advance_after`.
    Partner {
        cursor: usize,
        total: usize,
        step: PlayStep,
        advance_after: Duration,
    },
    /// A performer line; waits for [`StageAction::Next`].
    Performer {
        cursor: usize,
        total: usize,
        step: PlayStep,
    },
}

/// Per-visitor scene state that survives between render cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    scene_text: String,
    performer: String,
    settings: StageSettings,
    session: PlaybackSession,
}

impl Stage {
    pub fn new(scene_text: impl Into<String>, performer: impl Into<String>) -> Self {
        Self {
            scene_text: scene_text.into(),
            performer: performer.into(),
            settings: StageSettings::default(),
            session: PlaybackSession::new(),
        }
    }

    pub fn scene_text(&self) -> &str {
        &self.scene_text
    }

    pub fn performer(&self) -> &str {
        &self.performer
    }

    pub fn settings(&self) -> &StageSettings {
        &self.settings
    }

    pub fn session(&self) -> &PlaybackSession {
        &self.session
    }

    /// Apply a visitor action. Returns whether anything changed.
    pub fn apply(&mut self, action: StageAction) -> bool {
        debug!(?action, cursor = self.session.cursor(), "stage action");
        match action {
            StageAction::Build {
                scene_text,
                performer,
                settings,
            } => {
                self.scene_text = scene_text;
                self.performer = performer;
                self.settings = settings;
                self.build();
                true
            }
            StageAction::Reset => {
                self.session.clear();
                true
            }
            StageAction::Next { from } => self.advance_if(StepKind::Performer, from),
            StageAction::AutoAdvance { from } => self.advance_if(StepKind::Partner, from),
            StageAction::Restart => {
                self.ensure_built();
                self.session.reset();
                true
            }
        }
    }

    fn build(&mut self) {
        let lines = parse_scene_text(&self.scene_text);
        self.session.rebuild(build_sequence(&lines, &self.performer));
    }

    fn ensure_built(&mut self) {
        if self.session.state() == SessionState::Idle {
            self.build();
        }
    }

    fn advance_if(&mut self, kind: StepKind, from: usize) -> bool {
        self.ensure_built();
        let on_turn = self.session.current().is_some_and(|step| step.kind == kind);
        on_turn && self.session.advance_from(from)
    }

    /// Decide what to show for the current state.
    ///
    /// Builds the scene first if none is built. Partner lines are handed to
    /// `sink` when auto-speak is on; a failing sink only logs.
    pub async fn render(&mut self, pacing: &PacingConfig, sink: &mut dyn SpeechSink) -> Frame {
        self.ensure_built();

        let total = self.session.len();
        let cursor = self.session.cursor();
        let Some(step) = self.session.current().cloned() else {
            return if self.session.is_empty() {
                Frame::NoLines
            } else {
                Frame::Ended { total }
            };
        };

        match step.kind {
            StepKind::Partner => {
                if self.settings.auto_speak {
                    if let Err(e) = sink.speak(&step.text, &self.settings.speak_options()).await {
                        warn!(error = %e, sink = sink.name(), "speech failed");
                    }
                }
                let advance_after = pacing.partner_estimate(&step.text, self.settings.rate);
                Frame::Partner {
                    cursor,
                    total,
                    step,
                    advance_after,
                }
            }
            StepKind::Performer => Frame::Performer {
                cursor,
                total,
                step,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::{BrowserSpeech, SilentSpeech};

    fn stage() -> Stage {
        Stage::new(DEFAULT_SCENE, "JAMIE")
    }

    #[tokio::test]
    async fn test_first_render_builds_scene() {
        let mut stage = stage();
        let frame = stage.render(&PacingConfig::default(), &mut SilentSpeech::new()).await;

        match frame {
            Frame::Performer { cursor, total, step } => {
                assert_eq!(cursor, 0);
                assert_eq!(total, 4);
                assert_eq!(step.speaker(), "JAMIE");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_render_is_idempotent() {
        let mut stage = stage();
        let pacing = PacingConfig::default();
        let mut sink = SilentSpeech::new();
        let first = stage.render(&pacing, &mut sink).await;
        let second = stage.render(&pacing, &mut sink).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_partner_frame_speaks_and_schedules_advance() {
        let mut stage = stage();
        let pacing = PacingConfig::default();
        stage.apply(StageAction::Next { from: 0 });

        let mut sink = BrowserSpeech::new();
        let frame = stage.render(&pacing, &mut sink).await;
        let Frame::Partner {
            cursor,
            advance_after,
            ..
        } = frame
        else {
            panic!("expected partner frame");
        };
        assert_eq!(cursor, 1);
        assert_eq!(advance_after, pacing.partner_estimate("Someone had to.", 1.0));

        let spoken = sink.take_pending();
        assert_eq!(spoken.len(), 1);
        assert_eq!(spoken[0].text, "Someone had to.");

        assert!(stage.apply(StageAction::AutoAdvance { from: 1 }));
        assert!(!stage.apply(StageAction::AutoAdvance { from: 1 }));
        assert_eq!(stage.session().cursor(), 2);
    }

    #[tokio::test]
    async fn test_auto_speak_off_stays_quiet() {
        let mut stage = stage();
        stage.apply(StageAction::Build {
            scene_text: DEFAULT_SCENE.to_string(),
            performer: "JAMIE".to_string(),
            settings: StageSettings::new(false, None, 1.0),
        });
        stage.apply(StageAction::Next { from: 0 });

        let mut sink = BrowserSpeech::new();
        let frame = stage.render(&PacingConfig::default(), &mut sink).await;
        assert!(matches!(frame, Frame::Partner { .. }));
        assert!(sink.take_pending().is_empty());
    }

    #[tokio::test]
    async fn test_actions_only_apply_to_matching_turn() {
        let mut stage = stage();
        stage.render(&PacingConfig::default(), &mut SilentSpeech::new()).await;

        // cursor 0 is a performer line
        assert!(!stage.apply(StageAction::AutoAdvance { from: 0 }));
        assert!(stage.apply(StageAction::Next { from: 0 }));
        // cursor 1 is a partner line
        assert!(!stage.apply(StageAction::Next { from: 1 }));
        assert_eq!(stage.session().cursor(), 1);
    }

    #[tokio::test]
    async fn test_end_of_scene_and_restart() {
        let mut stage = Stage::new("JAMIE: Hi.\nALEX: Bye.", "JAMIE");
        let pacing = PacingConfig::default();
        let mut sink = SilentSpeech::new();
        stage.render(&pacing, &mut sink).await;
        stage.apply(StageAction::Next { from: 0 });
        stage.apply(StageAction::AutoAdvance { from: 1 });

        assert_eq!(stage.render(&pacing, &mut sink).await, Frame::Ended { total: 2 });

        stage.apply(StageAction::Restart);
        assert!(matches!(
            stage.render(&pacing, &mut sink).await,
            Frame::Performer { cursor: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_no_lines() {
        let mut stage = Stage::new("# nothing\n\njust prose", "JAMIE");
        let frame = stage.render(&PacingConfig::default(), &mut SilentSpeech::new()).await;
        assert_eq!(frame, Frame::NoLines);
    }

    #[tokio::test]
    async fn test_reset_rebuilds_from_current_text() {
        let mut stage = stage();
        let pacing = PacingConfig::default();
        let mut sink = SilentSpeech::new();
        stage.apply(StageAction::Build {
            scene_text: "ALEX: Only me.".to_string(),
            performer: "JAMIE".to_string(),
            settings: StageSettings::default(),
        });
        stage.apply(StageAction::AutoAdvance { from: 0 });
        assert_eq!(stage.render(&pacing, &mut sink).await, Frame::Ended { total: 1 });

        stage.apply(StageAction::Reset);
        assert_eq!(stage.session().state(), SessionState::Idle);
        assert!(matches!(
            stage.render(&pacing, &mut sink).await,
            Frame::Partner { cursor: 0, total: 1, .. }
        ));
    }

    #[test]
    fn test_settings_clamp_rate() {
        assert_eq!(StageSettings::new(true, None, 3.0).rate, MAX_STAGE_RATE);
        assert_eq!(StageSettings::new(true, None, 0.1).rate, MIN_STAGE_RATE);
        assert_eq!(StageSettings::new(true, None, f32::NAN).rate, 1.0);
        assert_eq!(StageSettings::new(true, Some(" ".to_string()), 1.0).voice_hint, None);
    }
}
