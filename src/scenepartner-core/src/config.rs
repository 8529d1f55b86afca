//! Configuration module for loading TOML config files.

use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ScenePartnerError;
use crate::timing::{self, DEFAULT_WORDS_PER_SECOND, PacingProfile};
use crate::tts::SpeakOptions;

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "scenepartner.toml";

/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "SCENEPARTNER_CONFIG";

/// Largest accepted `speech.rate` multiplier.
pub const MAX_SPEECH_RATE: f32 = 4.0;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub performer: PerformerConfig,
    pub speech: SpeechConfig,
    pub pacing: PacingConfig,
}

/// Who the user plays and how their lines advance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PerformerConfig {
    /// Character used when the user does not name one.
    pub default_name: String,
    /// Wait for an explicit cue after each performer line instead of a timed
    /// reading estimate.
    pub wait_for_user: bool,
}

impl Default for PerformerConfig {
    fn default() -> Self {
        Self {
            default_name: "JAMIE".to_string(),
            wait_for_user: true,
        }
    }
}

/// Which speech backend speaks partner lines.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpeechBackend {
    /// The operating system's speech command.
    #[default]
    System,
    /// The kokoro neural voice engine.
    Kokoro,
    /// No audio; lines are only printed.
    Silent,
}

impl SpeechBackend {
    pub fn name(&self) -> &str {
        match self {
            SpeechBackend::System => "system",
            SpeechBackend::Kokoro => "kokoro",
            SpeechBackend::Silent => "silent",
        }
    }
}

impl fmt::Display for SpeechBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SpeechBackend {
    type Err = ScenePartnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "system" => Ok(SpeechBackend::System),
            "kokoro" => Ok(SpeechBackend::Kokoro),
            "silent" | "none" => Ok(SpeechBackend::Silent),
            other => Err(ScenePartnerError::UnknownBackend(other.to_string())),
        }
    }
}

/// Speech settings shared by all backends.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpeechConfig {
    pub backend: SpeechBackend,
    /// Voice name hint, matched case-insensitively as a substring.
    pub voice_name: Option<String>,
    /// Speed multiplier, 1.0 being about 150 words per minute.
    pub rate: Option<f32>,
    /// Output volume between 0.0 and 1.0.
    pub volume: Option<f32>,
    /// Override for the system speech command.
    pub command: Option<String>,
    /// Audio player used by the kokoro backend.
    pub player: Option<String>,
}

impl SpeechConfig {
    pub fn effective_rate(&self) -> f32 {
        self.rate.unwrap_or(1.0)
    }

    pub fn speak_options(&self) -> SpeakOptions {
        SpeakOptions {
            voice_hint: self.voice_name.clone().filter(|v| !v.trim().is_empty()),
            rate: self.effective_rate(),
            volume: self.volume,
        }
    }
}

/// Timing of automatic advances.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PacingConfig {
    pub words_per_second: f64,
    /// Extra pause after a partner line in the console player.
    pub partner_pause_seconds: f64,
    pub partner: PacingProfile,
    pub performer: PacingProfile,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            words_per_second: DEFAULT_WORDS_PER_SECOND,
            partner_pause_seconds: 0.5,
            partner: PacingProfile::PARTNER,
            performer: PacingProfile::PERFORMER,
        }
    }
}

impl PacingConfig {
    /// How long a partner line is expected to take when spoken.
    pub fn partner_estimate(&self, text: &str, rate: f32) -> Duration {
        timing::seconds(timing::estimate_seconds(
            text,
            self.words_per_second,
            rate as f64,
            self.partner,
        ))
    }

    /// How long the performer gets for a line when not waiting for a cue.
    pub fn performer_estimate(&self, text: &str, rate: f32) -> Duration {
        timing::seconds(timing::estimate_seconds(
            text,
            self.words_per_second,
            rate as f64,
            self.performer,
        ))
    }

    pub fn partner_pause(&self) -> Duration {
        timing::seconds(self.partner_pause_seconds)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ScenePartnerError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ScenePartnerError::ConfigError(format!("Failed to read config: {}", e)))?;

        Self::from_str(&content)
    }

    /// Load configuration from string content.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ScenePartnerError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ScenePartnerError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Find the configuration to use.
    ///
    /// An explicit path must exist. Otherwise `SCENEPARTNER_CONFIG` is tried,
    /// then `scenepartner.toml` in the working directory, then the defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ScenePartnerError> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }

        if let Ok(path) = env::var(CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                let path = PathBuf::from(path);
                return Ok((Self::load(&path)?, Some(path)));
            }
        }

        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.is_file() {
            return Ok((Self::load(&local)?, Some(local)));
        }

        Ok((Self::default(), None))
    }

    /// Check value ranges that the TOML types cannot express.
    pub fn validate(&self) -> Result<(), ScenePartnerError> {
        if self.performer.default_name.trim().is_empty() {
            return Err(ScenePartnerError::ConfigError(
                "performer.default_name cannot be empty".to_string(),
            ));
        }

        if let Some(volume) = self.speech.volume {
            if !(0.0..=1.0).contains(&volume) {
                return Err(ScenePartnerError::ConfigError(format!(
                    "speech.volume must be between 0.0 and 1.0, got {}",
                    volume
                )));
            }
        }

        if let Some(rate) = self.speech.rate {
            if !rate.is_finite() || rate <= 0.0 || rate > MAX_SPEECH_RATE {
                return Err(ScenePartnerError::ConfigError(format!(
                    "speech.rate is a speed multiplier (1.0 is about 150 words per minute) \
                     and must be above 0 and at most {}, got {}",
                    MAX_SPEECH_RATE, rate
                )));
            }
        }

        let pacing = &self.pacing;
        if !pacing.words_per_second.is_finite() || pacing.words_per_second <= 0.0 {
            return Err(ScenePartnerError::ConfigError(format!(
                "pacing.words_per_second must be positive, got {}",
                pacing.words_per_second
            )));
        }
        if pacing.partner_pause_seconds < 0.0 {
            return Err(ScenePartnerError::ConfigError(
                "pacing.partner_pause_seconds cannot be negative".to_string(),
            ));
        }
        for (name, profile) in [("partner", pacing.partner), ("performer", pacing.performer)] {
            if profile.floor_seconds < 0.0 || profile.overhead_seconds < 0.0 {
                return Err(ScenePartnerError::ConfigError(format!(
                    "pacing.{} floor and overhead cannot be negative",
                    name
                )));
            }
        }

        Ok(())
    }
}
