//! Scene Partner Core Library
//!
//! Turns a two-character script into a turn-taking rehearsal: the
//! performer's lines wait for them, every other line is spoken aloud.

pub mod config;
pub mod error;
pub mod player;
pub mod script;
pub mod sequence;
pub mod session;
pub mod stage;
pub mod timing;
pub mod tts;

pub use config::{Config, PacingConfig, SpeechBackend};
pub use error::ScenePartnerError;
pub use player::{Cue, PlaybackOutcome, SceneCallback, SceneEvent, ScenePlayer};
pub use script::{ScriptLine, parse_scene_text, parse_script};
pub use sequence::{PlayStep, StepKind, build_sequence};
pub use session::{PlaybackSession, SessionState};
pub use stage::{Frame, Stage, StageAction, StageSettings};
pub use timing::{PacingProfile, estimate, estimate_seconds};
pub use tts::{SpeakOptions, SpeechSink, open_sink};
