//! Scene Partner CLI - rehearse a two-character scene.
//!
//! Speaks your partner's lines out loud and waits for you on yours, either in
//! the terminal or in the browser.

mod web;

use async_trait::async_trait;
use clap::{ArgAction, Args, Parser, Subcommand};
use colored::Colorize;
use scenepartner_core::script::characters;
use scenepartner_core::tts::SilentSpeech;
use scenepartner_core::{
    Config, Cue, PlayStep, PlaybackOutcome, SceneEvent, ScenePartnerError, ScenePlayer,
    SpeechBackend, SpeechSink, build_sequence, open_sink, parse_script,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_SCRIPT: &str = "data/sample_scene.txt";

#[derive(Parser)]
#[command(
    name = "scenepartner",
    version,
    about = "Scene Partner - rehearse a scene with a speaking partner",
    long_about = "Reads a NAME: line script, speaks every line that isn't yours and waits for you on yours."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file (defaults to $SCENEPARTNER_CONFIG, then ./scenepartner.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Speech backend to use instead of the configured one
    #[arg(long, global = true, value_name = "BACKEND", value_parser = parse_backend)]
    backend: Option<SpeechBackend>,

    /// More log output on stderr (-v, -vv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Play a script in the terminal (the default)
    Play(PlayArgs),
    /// Run the scene partner in the browser
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8501", value_name = "ADDR")]
        bind: SocketAddr,
    },
    /// List the voices the speech backend offers
    Voices,
}

#[derive(Args)]
struct PlayArgs {
    /// Script with one NAME: line per row
    #[arg(short, long, default_value = DEFAULT_SCRIPT, value_name = "PATH")]
    script: PathBuf,

    /// Character you are playing (asked interactively when omitted)
    #[arg(long = "as", value_name = "NAME")]
    performer: Option<String>,

    /// Print partner lines without speaking them
    #[arg(long)]
    mute: bool,

    /// Advance your lines on a timer instead of waiting for Enter
    #[arg(long, conflicts_with = "wait")]
    timed: bool,

    /// Wait for Enter after each of your lines
    #[arg(long)]
    wait: bool,
}

impl Default for PlayArgs {
    fn default() -> Self {
        Self {
            script: PathBuf::from(DEFAULT_SCRIPT),
            performer: None,
            mute: false,
            timed: false,
            wait: false,
        }
    }
}

fn parse_backend(value: &str) -> Result<SpeechBackend, String> {
    value
        .parse()
        .map_err(|e: ScenePartnerError| format!("{} (expected system, kokoro or silent)", e))
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("SCENEPARTNER_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let (mut config, config_path) = Config::discover(cli.config.as_deref())?;
    if let Some(path) = &config_path {
        info!(path = %path.display(), "loaded config");
    }
    if let Some(backend) = cli.backend {
        config.speech.backend = backend;
    }

    match cli.command.unwrap_or_else(|| Command::Play(PlayArgs::default())) {
        Command::Play(args) => play(config, args).await,
        Command::Serve { bind } => {
            println!(
                "{} {}",
                "Scene Partner is running at".bold(),
                format!("http://{}", bind).bright_cyan()
            );
            web::serve(&config, bind).await
        }
        Command::Voices => list_voices(&config).await,
    }
}

async fn play(mut config: Config, args: PlayArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.timed {
        config.performer.wait_for_user = false;
    } else if args.wait {
        config.performer.wait_for_user = true;
    }

    let lines = parse_script(&args.script)?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let performer = match args.performer {
        Some(name) => resolve_performer(&name, &config.performer.default_name),
        None => prompt_performer(&mut stdin, &config.performer.default_name).await?,
    };

    let cast = characters(&lines);
    let wanted = performer.trim().to_uppercase();
    if !cast.is_empty() && !cast.contains(&wanted) {
        eprintln!(
            "{}",
            format!(
                "Warning: {} has no lines in this scene (characters: {}).",
                wanted,
                cast.join(", ")
            )
            .yellow()
        );
    }

    let steps = build_sequence(&lines, &performer);
    let sink = open_speech(&config, args.mute).await;

    if !steps.is_empty() {
        print_header(&args.script, &wanted, &steps, sink.name());
    }

    let mut player = ScenePlayer::new(&config, steps, sink)
        .with_cue(Box::new(ConsoleCue { lines: stdin }))
        .with_callback(create_console_callback());

    match player.run().await? {
        PlaybackOutcome::NoLines => {
            eprintln!(
                "{}",
                "No valid lines found. Make sure each line is like: NAME: dialogue".yellow()
            );
        }
        PlaybackOutcome::Completed { .. } => {}
    }

    Ok(())
}

/// Open the configured speech backend, falling back to silence.
async fn open_speech(config: &Config, mute: bool) -> Box<dyn SpeechSink> {
    if mute {
        return Box::new(SilentSpeech::new());
    }

    match open_sink(&config.speech).await {
        Ok(sink) => sink,
        Err(e) => {
            warn!(error = %e, backend = %config.speech.backend, "speech backend unavailable");
            eprintln!(
                "{}",
                format!("Warning: speech unavailable ({}). Lines will only be printed.", e)
                    .yellow()
            );
            Box::new(SilentSpeech::new())
        }
    }
}

async fn list_voices(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut sink = open_sink(&config.speech).await?;
    let voices = sink.voices().await?;

    if voices.is_empty() {
        println!(
            "The {} speech backend cannot list its voices.",
            config.speech.backend
        );
        return Ok(());
    }

    println!("{}", format!("Voices ({}):", sink.name()).bold());
    for voice in voices {
        println!("  - {}", voice);
    }
    Ok(())
}

fn stdin_error(source: std::io::Error) -> ScenePartnerError {
    ScenePartnerError::Io {
        path: PathBuf::from("<stdin>"),
        source,
    }
}

async fn prompt(text: &str) -> Result<(), ScenePartnerError> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await.map_err(stdin_error)?;
    stdout.flush().await.map_err(stdin_error)
}

async fn prompt_performer(
    stdin: &mut Lines<BufReader<Stdin>>,
    default_name: &str,
) -> Result<String, ScenePartnerError> {
    prompt(&format!("Who are you playing? (default: {}) ", default_name)).await?;
    let answer = stdin.next_line().await.map_err(stdin_error)?.unwrap_or_default();
    Ok(resolve_performer(&answer, default_name))
}

/// The typed name, or the default when it is blank.
fn resolve_performer(answer: &str, default_name: &str) -> String {
    let answer = answer.trim();
    if answer.is_empty() {
        default_name.to_string()
    } else {
        answer.to_string()
    }
}

/// Waits for Enter after each of the performer's lines.
struct ConsoleCue {
    lines: Lines<BufReader<Stdin>>,
}

#[async_trait]
impl Cue for ConsoleCue {
    async fn wait_for_cue(&mut self, _step: &PlayStep) -> Result<(), ScenePartnerError> {
        prompt(&format!(
            "  {} ",
            "Say your line now, then press Enter to continue...".dimmed()
        ))
        .await?;

        // EOF counts as a cue so piped input plays through
        self.lines.next_line().await.map_err(stdin_error)?;
        Ok(())
    }
}

fn print_header(script: &Path, performer: &str, steps: &[PlayStep], speech: &str) {
    let yours = steps.iter().filter(|s| s.is_performer()).count();

    println!();
    println!("{}", "═".repeat(70).bright_blue());
    println!("{}", "  Scene Partner".bright_blue().bold());
    println!("{}", "═".repeat(70).bright_blue());
    println!();
    println!("{} {}", "Script:".bold(), script.display().to_string().bright_white());
    println!(
        "{} {} ({} of {} lines)",
        "You are:".bold(),
        performer.bright_green(),
        yours,
        steps.len()
    );
    println!("{} {}", "Speech:".bold(), speech.dimmed());
    println!();
}

/// Create a callback that prints scene events to the console.
fn create_console_callback() -> Box<dyn Fn(SceneEvent) + Send + Sync> {
    Box::new(move |event| match event {
        SceneEvent::SceneStart { .. } => {
            println!("{}", "─".repeat(70).dimmed());
            println!("{}", "  Starting scene".bright_magenta().bold());
            println!("{}", "─".repeat(70).dimmed());
            println!();
        }
        SceneEvent::PartnerLine {
            position,
            total,
            speaker,
            text,
        } => {
            println!(
                "{} {} {}",
                format!("[{}/{}]", position, total).dimmed(),
                speaker.bright_cyan().bold(),
                "(AI)".yellow()
            );
            for line in wrap_dialogue(&text, 66) {
                println!("  {}", line);
            }
            println!();
        }
        SceneEvent::SpeechFailed { speaker, error } => {
            eprintln!(
                "{}",
                format!("  Warning: could not speak {}'s line: {}", speaker, error).yellow()
            );
        }
        SceneEvent::PerformerLine {
            position,
            total,
            speaker,
            text,
            ..
        } => {
            println!(
                "{} {} {}",
                format!("[{}/{}]", position, total).dimmed(),
                speaker.bright_green().bold(),
                "(YOU)".yellow()
            );
            for line in wrap_dialogue(&text, 66) {
                println!("  {}", line.bold());
            }
        }
        SceneEvent::SceneEnd => {
            println!();
            println!("{}", "═".repeat(70).bright_blue());
            println!("{}", "  End of scene.".bright_green().bold());
            println!("{}", "═".repeat(70).bright_blue());
            println!();
        }
        SceneEvent::NoLines => {
            // Handled in play
        }
    })
}

/// Break a line of dialogue into console rows of at most `width` columns.
///
/// A single word longer than `width` gets a row of its own.
fn wrap_dialogue(text: &str, width: usize) -> Vec<String> {
    let mut rows: Vec<String> = Vec::new();
    let mut row = String::new();

    for word in text.split_whitespace() {
        if !row.is_empty() && row.chars().count() + 1 + word.chars().count() > width {
            rows.push(std::mem::take(&mut row));
        }
        if !row.is_empty() {
            row.push(' ');
        }
        row.push_str(word);
    }

    if !row.is_empty() {
        rows.push(row);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults_to_play() {
        let cli = Cli::try_parse_from(["scenepartner"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(PlayArgs::default().script, PathBuf::from(DEFAULT_SCRIPT));
    }

    #[test]
    fn test_play_args() {
        let cli = Cli::try_parse_from([
            "scenepartner",
            "play",
            "--script",
            "scene.txt",
            "--as",
            "alex",
            "--timed",
            "--backend",
            "silent",
        ])
        .unwrap();

        assert_eq!(cli.backend, Some(SpeechBackend::Silent));
        let Some(Command::Play(args)) = cli.command else {
            panic!("expected play");
        };
        assert_eq!(args.script, PathBuf::from("scene.txt"));
        assert_eq!(args.performer.as_deref(), Some("alex"));
        assert!(args.timed);
    }

    #[test]
    fn test_timed_conflicts_with_wait() {
        assert!(Cli::try_parse_from(["scenepartner", "play", "--timed", "--wait"]).is_err());
    }

    #[test]
    fn test_rejects_unknown_backend() {
        assert!(Cli::try_parse_from(["scenepartner", "--backend", "piper"]).is_err());
    }

    #[test]
    fn test_serve_bind() {
        let cli = Cli::try_parse_from(["scenepartner", "serve", "--bind", "0.0.0.0:9000"]).unwrap();
        let Some(Command::Serve { bind }) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(bind.port(), 9000);
    }

    #[test]
    fn test_resolve_performer() {
        assert_eq!(resolve_performer("  ", "JAMIE"), "JAMIE");
        assert_eq!(resolve_performer(" alex\n", "JAMIE"), "alex");
    }

    #[test]
    fn test_wrap_dialogue() {
        assert_eq!(
            wrap_dialogue("one two three four five", 9),
            vec!["one two", "three", "four five"]
        );
        assert_eq!(wrap_dialogue("unbelievable!", 5), vec!["unbelievable!"]);
        assert!(wrap_dialogue("   ", 10).is_empty());
    }
}
