//! Browser surface.
//!
//! Every request is one render cycle: load the visitor's [`Stage`] from the
//! store, apply the action the request carries, render the current frame.
//! Partner lines are spoken by the page with the Web Speech API, and the page
//! schedules its own reload that advances past the line.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Form, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use scenepartner_core::config::PacingConfig;
use scenepartner_core::stage::{DEFAULT_SCENE, MAX_STAGE_RATE, MIN_STAGE_RATE};
use scenepartner_core::tts::{BrowserSpeech, Utterance};
use scenepartner_core::{Config, Frame, Stage, StageAction, StageSettings};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

const SESSION_COOKIE: &str = "scenepartner_sid";

/// Stages untouched for this long are dropped.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Most visitor stages held at once.
const MAX_STAGES: usize = 10_000;

struct StageEntry {
    stage: Stage,
    touched: Instant,
}

/// Visitor stages keyed by session id, bounded in age and count.
struct StageStore {
    entries: HashMap<String, StageEntry>,
    capacity: usize,
}

impl StageStore {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// The stage for `sid`, created with `new_stage` if missing.
    fn stage(&mut self, sid: &str, new_stage: impl FnOnce() -> Stage) -> &mut Stage {
        let now = Instant::now();
        if !self.entries.contains_key(sid) {
            self.evict(now);
        }

        let entry = self
            .entries
            .entry(sid.to_string())
            .or_insert_with(|| StageEntry {
                stage: new_stage(),
                touched: now,
            });
        entry.touched = now;
        &mut entry.stage
    }

    /// Drop idle stages, then the oldest ones until there is room for one more.
    fn evict(&mut self, now: Instant) {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.touched) < IDLE_TIMEOUT);

        while self.entries.len() >= self.capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(sid, _)| sid.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
        }

        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "evicted visitor stages");
        }
    }
}

#[derive(Clone)]
struct AppState {
    stages: Arc<Mutex<StageStore>>,
    pacing: PacingConfig,
    default_performer: String,
}

impl AppState {
    fn new(config: &Config) -> Self {
        Self::with_capacity(config, MAX_STAGES)
    }

    fn with_capacity(config: &Config, capacity: usize) -> Self {
        Self {
            stages: Arc::new(Mutex::new(StageStore::new(capacity))),
            pacing: config.pacing.clone(),
            default_performer: config.performer.default_name.clone(),
        }
    }

    fn new_stage(&self) -> Stage {
        Stage::new(DEFAULT_SCENE, self.default_performer.clone())
    }
}

/// Serve the browser surface on `addr` until the process is stopped.
pub async fn serve(config: &Config, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(AppState::new(config));

    info!(%addr, "browser surface listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/build", post(build))
        .route("/reset", post(reset))
        .route("/restart", post(restart))
        .route("/next", post(next))
        .route("/advance", get(advance))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct BuildForm {
    scene: String,
    performer: String,
    /// Present only when the checkbox is ticked.
    auto_speak: Option<String>,
    #[serde(default)]
    voice_hint: String,
    rate: f32,
}

#[derive(Debug, Deserialize)]
struct CursorForm {
    from: usize,
}

async fn index(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let mut speech = BrowserSpeech::new();

    // a first visit renders a throwaway stage; it is stored once the
    // visitor comes back with the cookie
    let (sid, page) = match visitor_id(&headers) {
        Some(sid) => {
            let mut stages = state.stages.lock().await;
            let stage = stages.stage(&sid, || state.new_stage());
            let frame = stage.render(&state.pacing, &mut speech).await;
            let page = render_page(stage, &frame, &speech.take_pending());
            (sid, page)
        }
        None => {
            let mut stage = state.new_stage();
            let frame = stage.render(&state.pacing, &mut speech).await;
            let page = render_page(&stage, &frame, &speech.take_pending());
            (new_visitor_id(), page)
        }
    };

    with_session_cookie(&sid, Html(page))
}

async fn build(State(state): State<AppState>, headers: HeaderMap, Form(form): Form<BuildForm>) -> Response {
    let settings = StageSettings::new(
        form.auto_speak.is_some(),
        Some(form.voice_hint),
        form.rate,
    );
    apply(
        &state,
        &headers,
        StageAction::Build {
            scene_text: form.scene,
            performer: form.performer,
            settings,
        },
    )
    .await
}

async fn reset(State(state): State<AppState>, headers: HeaderMap) -> Response {
    apply(&state, &headers, StageAction::Reset).await
}

async fn restart(State(state): State<AppState>, headers: HeaderMap) -> Response {
    apply(&state, &headers, StageAction::Restart).await
}

async fn next(State(state): State<AppState>, headers: HeaderMap, Form(form): Form<CursorForm>) -> Response {
    apply(&state, &headers, StageAction::Next { from: form.from }).await
}

async fn advance(State(state): State<AppState>, headers: HeaderMap, Query(query): Query<CursorForm>) -> Response {
    apply(&state, &headers, StageAction::AutoAdvance { from: query.from }).await
}

/// Apply an action to the visitor's stage, then send them back to the page.
///
/// Actions from requests without a session cookie have no stage to act on
/// and are dropped.
async fn apply(state: &AppState, headers: &HeaderMap, action: StageAction) -> Response {
    let Some(sid) = visitor_id(headers) else {
        debug!(?action, "action without session cookie ignored");
        return with_session_cookie(&new_visitor_id(), Redirect::to("/"));
    };

    let mut stages = state.stages.lock().await;
    let changed = stages.stage(&sid, || state.new_stage()).apply(action);
    debug!(sid = %sid, changed, visitors = stages.len(), "applied stage action");

    with_session_cookie(&sid, Redirect::to("/"))
}

/// The visitor's session id from the request cookie.
fn visitor_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|cookies| cookie_value(cookies, SESSION_COOKIE))
}

fn new_visitor_id() -> String {
    Uuid::new_v4().to_string()
}

fn cookie_value(cookies: &str, name: &str) -> Option<String> {
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key.trim() == name && !value.trim().is_empty()).then(|| value.trim().to_string())
    })
}

fn with_session_cookie(sid: &str, body: impl IntoResponse) -> Response {
    let mut response = body.into_response();
    let cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, sid);
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// JSON literal that is safe inside a `<script>` element.
fn script_literal<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "null".to_string())
        .replace("</", "<\\/")
}

fn speech_script(utterances: &[Utterance]) -> String {
    utterances
        .iter()
        .map(|u| {
            format!(
                r#"<script>
(function () {{
  const text = {text};
  const hint = {hint};
  const u = new SpeechSynthesisUtterance(text);
  u.rate = {rate};
  if (hint) {{
    const wanted = hint.toLowerCase();
    const voice = window.speechSynthesis.getVoices()
      .find(v => v.name.toLowerCase().includes(wanted));
    if (voice) u.voice = voice;
  }}
  window.speechSynthesis.cancel();
  window.speechSynthesis.speak(u);
}})();
</script>"#,
                text = script_literal(&u.text),
                hint = script_literal(&u.voice_hint),
                rate = u.rate,
            )
        })
        .collect()
}

fn restart_button() -> &'static str {
    r#"<form method="post" action="/restart"><button type="submit">Restart</button></form>"#
}

fn render_frame(frame: &Frame) -> String {
    match frame {
        Frame::NoLines => r#"<p class="warning">No valid lines found. Make sure each line is like: NAME: dialogue</p>"#
            .to_string(),
        Frame::Ended { .. } => format!(
            r#"<p class="success">End of scene.</p>{}"#,
            restart_button()
        ),
        Frame::Partner {
            cursor,
            total,
            step,
            ..
        } => format!(
            r#"<h2>Step {position} / {total}</h2>
<p class="line partner"><strong>AI ({speaker})</strong>: {text}</p>"#,
            position = cursor + 1,
            total = total,
            speaker = escape_html(step.speaker()),
            text = escape_html(&step.text),
        ),
        Frame::Performer {
            cursor,
            total,
            step,
        } => format!(
            r#"<h2>Step {position} / {total}</h2>
<p class="line performer"><strong>YOU ({speaker})</strong>: {text}</p>
<p class="info">Say your line (pauses and beats are fine). Click Next when you're ready.</p>
<div class="row">
<form method="post" action="/next"><input type="hidden" name="from" value="{cursor}"><button type="submit" autofocus>Next &#9654;</button></form>
{restart}
</div>"#,
            position = cursor + 1,
            total = total,
            speaker = escape_html(step.speaker()),
            text = escape_html(&step.text),
            cursor = cursor,
            restart = restart_button(),
        ),
    }
}

/// Full page for one render cycle.
fn render_page(stage: &Stage, frame: &Frame, speech: &[Utterance]) -> String {
    let settings = stage.settings();

    // partner lines schedule the reload that advances past them
    let refresh = match frame {
        Frame::Partner {
            cursor,
            advance_after,
            ..
        } => format!(
            r#"<meta http-equiv="refresh" content="{:.2};url=/advance?from={}">"#,
            advance_after.as_secs_f64(),
            cursor
        ),
        _ => String::new(),
    };

    format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Scene Partner</title>
{refresh}
<style>
body {{ font-family: system-ui, sans-serif; max-width: 46rem; margin: 2rem auto; padding: 0 1rem; }}
textarea {{ width: 100%; font-family: inherit; }}
.row {{ display: flex; gap: 0.75rem; align-items: center; flex-wrap: wrap; }}
.line {{ font-size: 1.3rem; }}
.warning {{ color: #8a5300; }}
.success {{ color: #1d6b2f; }}
.info {{ color: #35577d; }}
</style>
</head>
<body>
<h1>Scene Partner</h1>
<p>Partner lines are spoken and advance on their own. You click Next only on your lines.</p>
<form method="post" action="/build">
<label>Paste scene (NAME: line per row)<br><textarea name="scene" rows="8">{scene}</textarea></label>
<div class="row">
<label>Who are you playing? <input name="performer" value="{performer}"></label>
<label><input type="checkbox" name="auto_speak" value="on"{auto_speak}> Auto-speak partner lines</label>
</div>
<details><summary>Voice settings (browser-dependent)</summary>
<div class="row">
<label>Voice hint <input name="voice_hint" value="{voice_hint}"></label>
<label>Speech rate <input type="range" name="rate" min="{min_rate}" max="{max_rate}" step="0.1" value="{rate}"></label>
</div>
</details>
<div class="row"><button type="submit">Build scene</button></div>
</form>
<form method="post" action="/reset"><button type="submit">Reset</button></form>
<hr>
{frame}
{speech}
</body>
</html>
"#,
        refresh = refresh,
        scene = escape_html(stage.scene_text()),
        performer = escape_html(stage.performer()),
        auto_speak = if settings.auto_speak { " checked" } else { "" },
        voice_hint = escape_html(settings.voice_hint.as_deref().unwrap_or_default()),
        min_rate = MIN_STAGE_RATE,
        max_rate = MAX_STAGE_RATE,
        rate = settings.rate,
        frame = render_frame(frame),
        speech = speech_script(speech),
    )
}
