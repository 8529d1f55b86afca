//! Speech output for partner lines.
//!
//! Every backend implements [`SpeechSink`]. Callers must not assume that
//! `speak` blocks until the line has been heard: the system and kokoro
//! backends do, the browser backend only queues the line for the page.

use async_trait::async_trait;
use kokoro_tiny::TtsEngine;
use regex::Regex;
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{SpeechBackend, SpeechConfig};
use crate::error::ScenePartnerError;
use crate::timing::MIN_RATE;

/// Words per minute at rate 1.0.
const BASE_WORDS_PER_MINUTE: f32 = 150.0;

/// Kokoro output sample rate.
const SAMPLE_RATE: u32 = 24_000;

/// Per-utterance speech settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakOptions {
    /// Substring of the preferred voice name.
    pub voice_hint: Option<String>,
    /// Speed multiplier, 1.0 is normal.
    pub rate: f32,
    /// Output volume between 0.0 and 1.0, backend default when unset.
    pub volume: Option<f32>,
}

impl Default for SpeakOptions {
    fn default() -> Self {
        Self {
            voice_hint: None,
            rate: 1.0,
            volume: None,
        }
    }
}

impl SpeakOptions {
    fn words_per_minute(&self) -> u32 {
        (BASE_WORDS_PER_MINUTE * self.rate.max(MIN_RATE as f32)).round() as u32
    }
}

/// Something that can say a line out loud.
#[async_trait]
pub trait SpeechSink: Send {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Speak `text`. May return before the audio has finished.
    async fn speak(&mut self, text: &str, options: &SpeakOptions) -> Result<(), ScenePartnerError>;

    /// Voices this backend can use, if it can enumerate them.
    async fn voices(&mut self) -> Result<Vec<String>, ScenePartnerError> {
        Ok(Vec::new())
    }
}

/// Open the backend selected in `config`.
pub async fn open_sink(config: &SpeechConfig) -> Result<Box<dyn SpeechSink>, ScenePartnerError> {
    let sink: Box<dyn SpeechSink> = match config.backend {
        SpeechBackend::System => Box::new(SystemSpeech::new(config.command.clone())),
        SpeechBackend::Kokoro => Box::new(KokoroSpeech::new(config.player.clone()).await?),
        SpeechBackend::Silent => Box::new(SilentSpeech::new()),
    };
    debug!(backend = sink.name(), "speech sink ready");
    Ok(sink)
}

/// First voice whose name contains `hint`, ignoring case.
pub fn pick_voice<'a>(available: &'a [String], hint: Option<&str>) -> Option<&'a str> {
    let hint = hint?.trim().to_lowercase();
    if hint.is_empty() {
        return None;
    }
    available
        .iter()
        .find(|v| v.to_lowercase().contains(&hint))
        .map(String::as_str)
}

/// Output format of the system speech command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandFlavor {
    /// macOS `say`.
    Say,
    /// `espeak` and `espeak-ng`.
    Espeak,
}

impl CommandFlavor {
    fn detect(command: &str) -> Self {
        let file = Path::new(command)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or(command);
        if file == "say" {
            CommandFlavor::Say
        } else {
            CommandFlavor::Espeak
        }
    }
}

fn default_speech_command() -> &'static str {
    if cfg!(target_os = "macos") {
        "say"
    } else {
        "espeak"
    }
}

/// Speaks through the operating system's speech command.
pub struct SystemSpeech {
    command: String,
    flavor: CommandFlavor,
    voices: Option<Vec<String>>,
}

impl SystemSpeech {
    pub fn new(command: Option<String>) -> Self {
        let command = command
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| default_speech_command().to_string());
        let flavor = CommandFlavor::detect(&command);
        Self {
            command,
            flavor,
            voices: None,
        }
    }

    fn command_args(&self, text: &str, voice: Option<&str>, options: &SpeakOptions) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(voice) = voice {
            args.push("-v".to_string());
            args.push(voice.to_string());
        }

        match self.flavor {
            CommandFlavor::Say => {
                args.push("-r".to_string());
                args.push(options.words_per_minute().to_string());
            }
            CommandFlavor::Espeak => {
                args.push("-s".to_string());
                args.push(options.words_per_minute().to_string());
                if let Some(volume) = options.volume {
                    args.push("-a".to_string());
                    args.push(((volume * 100.0).round() as u32).to_string());
                }
            }
        }

        args.push(text.to_string());
        args
    }

    async fn list_voices(&self) -> Result<Vec<String>, ScenePartnerError> {
        let listing_args: &[&str] = match self.flavor {
            CommandFlavor::Say => &["-v", "?"],
            CommandFlavor::Espeak => &["--voices"],
        };

        let output = Command::new(&self.command)
            .args(listing_args)
            .output()
            .await
            .map_err(|e| {
                ScenePartnerError::SpeechError(format!("Failed to run {}: {}", self.command, e))
            })?;

        Ok(parse_voice_listing(
            self.flavor,
            &String::from_utf8_lossy(&output.stdout),
        ))
    }

    /// Resolve the voice hint against the installed voices.
    ///
    /// Falls back to passing the hint through when the listing is unavailable.
    async fn resolve_voice(&mut self, hint: Option<&str>) -> Option<String> {
        let hint = hint.map(str::trim).filter(|h| !h.is_empty())?;

        if self.voices.is_none() {
            match self.list_voices().await {
                Ok(voices) => self.voices = Some(voices),
                Err(e) => {
                    debug!(error = %e, "voice listing unavailable");
                    return Some(hint.to_string());
                }
            }
        }

        let voices = self.voices.as_deref().unwrap_or_default();
        if voices.is_empty() {
            return Some(hint.to_string());
        }

        match pick_voice(voices, Some(hint)) {
            Some(voice) => Some(voice.to_string()),
            None => {
                warn!(hint, "no installed voice matches, using the default voice");
                None
            }
        }
    }
}

#[async_trait]
impl SpeechSink for SystemSpeech {
    fn name(&self) -> &str {
        &self.command
    }

    async fn speak(&mut self, text: &str, options: &SpeakOptions) -> Result<(), ScenePartnerError> {
        if text.trim().is_empty() {
            return Ok(());
        }

        if self.flavor == CommandFlavor::Say && options.volume.is_some() {
            debug!("say has no volume control, ignoring speech.volume");
        }

        let voice = self.resolve_voice(options.voice_hint.as_deref()).await;
        let args = self.command_args(text, voice.as_deref(), options);
        debug!(command = %self.command, ?args, "speaking");

        let status = Command::new(&self.command)
            .args(&args)
            .status()
            .await
            .map_err(|e| {
                ScenePartnerError::SpeechError(format!("Failed to run {}: {}", self.command, e))
            })?;

        if !status.success() {
            return Err(ScenePartnerError::SpeechError(format!(
                "{} exited with {}",
                self.command, status
            )));
        }

        Ok(())
    }

    async fn voices(&mut self) -> Result<Vec<String>, ScenePartnerError> {
        let voices = self.list_voices().await?;
        self.voices = Some(voices.clone());
        Ok(voices)
    }
}

/// Extract voice names from `say -v ?` or `espeak --voices` output.
fn parse_voice_listing(flavor: CommandFlavor, listing: &str) -> Vec<String> {
    match flavor {
        CommandFlavor::Say => {
            // "Fred                en_US    # I sure like being inside..."
            let Ok(re) = Regex::new(r"^(.+?)\s{2,}[A-Za-z]{2}[_-]") else {
                return Vec::new();
            };
            listing
                .lines()
                .filter_map(|line| re.captures(line))
                .filter_map(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
                .collect()
        }
        CommandFlavor::Espeak => listing
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().nth(3))
            .map(str::to_string)
            .collect(),
    }
}

/// Speaks with the kokoro neural voice engine and an external audio player.
pub struct KokoroSpeech {
    engine: TtsEngine,
    available_voices: Vec<String>,
    player: String,
    /// Removed from disk when the sink is dropped.
    wav: NamedTempFile,
}

impl KokoroSpeech {
    /// Initialize the TTS engine (downloads model on first run).
    pub async fn new(player: Option<String>) -> Result<Self, ScenePartnerError> {
        let engine = TtsEngine::new()
            .await
            .map_err(|e| ScenePartnerError::SpeechError(format!("Failed to initialize TTS: {}", e)))?;

        let available_voices = engine.voices();
        let player = player
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| default_player().to_string());
        let wav = scratch_wav()?;

        Ok(Self {
            engine,
            available_voices,
            player,
            wav,
        })
    }

    /// Synthesize a partner line, one chunk per engine call.
    fn synthesize(&mut self, text: &str, voice_id: Option<&str>) -> Result<Vec<f32>, ScenePartnerError> {
        let chunks = split_into_chunks(text, 200);

        let mut all_samples = Vec::new();

        for chunk in chunks {
            if chunk.trim().is_empty() {
                continue;
            }

            let samples = self
                .engine
                .synthesize(&chunk, voice_id)
                .map_err(|e| ScenePartnerError::SpeechError(format!("Synthesis failed: {}", e)))?;

            all_samples.extend(samples);

            // 0.3s between chunks so words are not clipped
            all_samples.extend(vec![0.0; (SAMPLE_RATE as usize * 3) / 10]);
        }

        Ok(all_samples)
    }
}

#[async_trait]
impl SpeechSink for KokoroSpeech {
    fn name(&self) -> &str {
        "kokoro"
    }

    async fn speak(&mut self, text: &str, options: &SpeakOptions) -> Result<(), ScenePartnerError> {
        if text.trim().is_empty() {
            return Ok(());
        }

        let voice = pick_voice(&self.available_voices, options.voice_hint.as_deref())
            .map(str::to_string);
        if voice.is_none() && options.voice_hint.is_some() {
            warn!(hint = ?options.voice_hint, "no kokoro voice matches, using the default voice");
        }

        let samples = self.synthesize(text, voice.as_deref())?;
        let samples = adjust_audio_speed(samples, options.rate.max(MIN_RATE as f32));
        let samples = apply_volume(samples, options.volume.unwrap_or(1.0));

        write_wav(self.wav.path(), &samples)?;

        let status = Command::new(&self.player)
            .arg(self.wav.path())
            .status()
            .await
            .map_err(|e| {
                ScenePartnerError::SpeechError(format!("Failed to run {}: {}", self.player, e))
            })?;

        if !status.success() {
            return Err(ScenePartnerError::SpeechError(format!(
                "{} exited with {}",
                self.player, status
            )));
        }

        Ok(())
    }

    async fn voices(&mut self) -> Result<Vec<String>, ScenePartnerError> {
        let mut voices = self.available_voices.clone();
        voices.sort();
        Ok(voices)
    }
}

fn default_player() -> &'static str {
    if cfg!(target_os = "macos") {
        "afplay"
    } else {
        "aplay"
    }
}

fn scratch_wav() -> Result<NamedTempFile, ScenePartnerError> {
    tempfile::Builder::new()
        .prefix("scenepartner-")
        .suffix(".wav")
        .tempfile()
        .map_err(|e| ScenePartnerError::SpeechError(format!("Failed to create WAV file: {}", e)))
}

/// Write mono 16-bit samples at the kokoro sample rate.
fn write_wav(path: &Path, samples: &[f32]) -> Result<(), ScenePartnerError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let wav_error = |e: hound::Error| ScenePartnerError::SpeechError(format!("Failed to write WAV: {}", e));

    let mut writer = hound::WavWriter::create(path, spec).map_err(wav_error)?;
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(value).map_err(wav_error)?;
    }
    writer.finalize().map_err(wav_error)
}

/// Prints nothing and plays nothing; remembers what it was asked to say.
#[derive(Debug, Default)]
pub struct SilentSpeech {
    spoken: Vec<String>,
}

impl SilentSpeech {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spoken(&self) -> &[String] {
        &self.spoken
    }
}

#[async_trait]
impl SpeechSink for SilentSpeech {
    fn name(&self) -> &str {
        "silent"
    }

    async fn speak(&mut self, text: &str, _options: &SpeakOptions) -> Result<(), ScenePartnerError> {
        debug!(text, "silent speech");
        self.spoken.push(text.to_string());
        Ok(())
    }
}

/// A line queued for the browser's speech synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub voice_hint: Option<String>,
    pub rate: f32,
}

/// Queues lines for a page to speak with the Web Speech API.
///
/// `speak` returns at once; the host drains the queue into the rendered page.
#[derive(Debug, Default)]
pub struct BrowserSpeech {
    pending: Vec<Utterance>,
}

impl BrowserSpeech {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_pending(&mut self) -> Vec<Utterance> {
        std::mem::take(&mut self.pending)
    }
}

#[async_trait]
impl SpeechSink for BrowserSpeech {
    fn name(&self) -> &str {
        "browser"
    }

    async fn speak(&mut self, text: &str, options: &SpeakOptions) -> Result<(), ScenePartnerError> {
        self.pending.push(Utterance {
            text: text.to_string(),
            voice_hint: options.voice_hint.clone(),
            rate: options.rate,
        });
        Ok(())
    }
}

/// Break a partner line into pieces short enough for one kokoro call.
///
/// Splits after sentence punctuation, and after commas inside a sentence
/// that alone exceeds `max_chars`.
fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current_chunk = String::new();

    for sentence in text.split_inclusive(&['.', '!', '?', ';'][..]) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }

        if current_chunk.len() + sentence.len() > max_chars {
            if !current_chunk.is_empty() {
                chunks.push(current_chunk.trim().to_string());
                current_chunk = String::new();
            }

            // Sentence alone is too long, fall back to commas
            if sentence.len() > max_chars {
                for part in sentence.split_inclusive(',') {
                    if current_chunk.len() + part.len() > max_chars && !current_chunk.is_empty() {
                        chunks.push(current_chunk.trim().to_string());
                        current_chunk = String::new();
                    }
                    current_chunk.push_str(part);
                    current_chunk.push(' ');
                }
            } else {
                current_chunk.push_str(sentence);
                current_chunk.push(' ');
            }
        } else {
            current_chunk.push_str(sentence);
            current_chunk.push(' ');
        }
    }

    if !current_chunk.trim().is_empty() {
        chunks.push(current_chunk.trim().to_string());
    }

    chunks
}

/// Resample kokoro output so it plays at `rate` times normal speed.
fn adjust_audio_speed(samples: Vec<f32>, rate: f32) -> Vec<f32> {
    if (rate - 1.0).abs() < 0.001 || rate <= 0.0 {
        return samples;
    }

    let new_len = (samples.len() as f32 / rate) as usize;
    let mut result = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_pos = i as f32 * rate;
        let src_idx = src_pos as usize;
        let frac = src_pos - src_idx as f32;

        if src_idx + 1 < samples.len() {
            let sample = samples[src_idx] * (1.0 - frac) + samples[src_idx + 1] * frac;
            result.push(sample);
        } else if src_idx < samples.len() {
            result.push(samples[src_idx]);
        }
    }

    result
}

fn apply_volume(samples: Vec<f32>, volume: f32) -> Vec<f32> {
    if (volume - 1.0).abs() < 0.001 {
        return samples;
    }
    let gain = volume.clamp(0.0, 1.0);
    samples.into_iter().map(|s| s * gain).collect()
}
