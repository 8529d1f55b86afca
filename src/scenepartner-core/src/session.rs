//! Playback session state machine.
//!
//! A [`PlaybackSession`] walks an ordered list of [`PlayStep`]s one step at a
//! time. It holds no call stack of its own, so a host that re-runs its render
//! logic on every request can keep the session in storage between runs.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sequence::PlayStep;

/// Coarse state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No scene has been built.
    Idle,
    /// The cursor points at a step.
    InProgress,
    /// The cursor is past the last step.
    Ended,
}

/// Cursor over a fixed list of steps.
///
/// Invariant: `cursor <= steps.len()`. `cursor == steps.len()` is the end of
/// the scene.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "StoredSession")]
pub struct PlaybackSession {
    steps: Vec<PlayStep>,
    cursor: usize,
    built: bool,
}

/// Unchecked form of a session read back from storage.
#[derive(Deserialize)]
struct StoredSession {
    steps: Vec<PlayStep>,
    cursor: usize,
    built: bool,
}

impl TryFrom<StoredSession> for PlaybackSession {
    type Error = String;

    fn try_from(stored: StoredSession) -> Result<Self, Self::Error> {
        if stored.cursor > stored.steps.len() {
            return Err(format!(
                "cursor {} is past the end of a {}-step session",
                stored.cursor,
                stored.steps.len()
            ));
        }
        if !stored.built && (stored.cursor != 0 || !stored.steps.is_empty()) {
            return Err("an idle session cannot hold steps".to_string());
        }
        Ok(Self {
            steps: stored.steps,
            cursor: stored.cursor,
            built: stored.built,
        })
    }
}

impl PlaybackSession {
    /// An idle session with no scene.
    pub fn new() -> Self {
        Self::default()
    }

    /// A session built from `steps`.
    pub fn with_steps(steps: Vec<PlayStep>) -> Self {
        let mut session = Self::new();
        session.build(steps);
        session
    }

    /// Install `steps` and move the cursor to the first one.
    ///
    /// An empty list yields an ended session rather than an error.
    pub fn build(&mut self, steps: Vec<PlayStep>) {
        self.steps = steps;
        self.cursor = 0;
        self.built = true;
        debug!(steps = self.steps.len(), state = ?self.state(), "session built");
    }

    /// Replace the steps of an existing session and start over.
    pub fn rebuild(&mut self, steps: Vec<PlayStep>) {
        self.build(steps);
    }

    /// Drop the scene entirely and return to [`SessionState::Idle`].
    pub fn clear(&mut self) {
        self.steps.clear();
        self.cursor = 0;
        self.built = false;
        debug!("session cleared");
    }

    pub fn state(&self) -> SessionState {
        if !self.built {
            SessionState::Idle
        } else if self.cursor < self.steps.len() {
            SessionState::InProgress
        } else {
            SessionState::Ended
        }
    }

    /// The step under the cursor while in progress.
    pub fn current(&self) -> Option<&PlayStep> {
        match self.state() {
            SessionState::InProgress => self.steps.get(self.cursor),
            SessionState::Idle | SessionState::Ended => None,
        }
    }

    /// Move exactly one step forward.
    ///
    /// Calling this on an ended or idle session does nothing.
    pub fn advance(&mut self) -> SessionState {
        if self.state() == SessionState::InProgress {
            self.cursor += 1;
            debug!(cursor = self.cursor, total = self.steps.len(), "advanced");
        }
        self.state()
    }

    /// Advance only if the cursor is still at `expected`.
    ///
    /// Returns whether the cursor moved. A stale request (a repeated click or
    /// a re-sent self-refresh) leaves the session untouched.
    pub fn advance_from(&mut self, expected: usize) -> bool {
        if self.cursor != expected || self.state() != SessionState::InProgress {
            debug!(expected, cursor = self.cursor, "stale advance ignored");
            return false;
        }
        self.advance();
        true
    }

    /// Move the cursor back to the first step without rebuilding.
    ///
    /// Valid from any state. An idle session has no steps, so it ends.
    pub fn reset(&mut self) -> SessionState {
        self.cursor = 0;
        self.built = true;
        debug!(total = self.steps.len(), "session reset");
        self.state()
    }

    pub fn steps(&self) -> &[PlayStep] {
        &self.steps
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 1-based position of the current step, for display.
    pub fn position(&self) -> usize {
        (self.cursor + 1).min(self.steps.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_steps() -> Vec<PlayStep> {
        vec![
            PlayStep::performer("I can't believe you did that.", "JAMIE"),
            PlayStep::partner("Someone had to.", "ALEX"),
        ]
    }

    #[test]
    fn test_new_session_is_idle() {
        let mut session = PlaybackSession::new();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.current().is_none());
        assert_eq!(session.advance(), SessionState::Idle);
    }

    #[test]
    fn test_reset_from_idle_ends() {
        let mut session = PlaybackSession::new();
        assert_eq!(session.reset(), SessionState::Ended);
        assert_eq!(session.cursor(), 0);
        assert!(session.current().is_none());

        session.clear();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_advance_through_two_steps() {
        let mut session = PlaybackSession::with_steps(two_steps());
        assert_eq!(session.state(), SessionState::InProgress);
        assert_eq!(session.current().unwrap().speaker(), "JAMIE");

        assert_eq!(session.advance(), SessionState::InProgress);
        assert_eq!(session.cursor(), 1);
        assert_eq!(session.current().unwrap().speaker(), "ALEX");

        assert_eq!(session.advance(), SessionState::Ended);
        assert_eq!(session.cursor(), 2);
        assert!(session.current().is_none());

        assert_eq!(session.advance(), SessionState::Ended);
        assert_eq!(session.advance(), SessionState::Ended);
        assert_eq!(session.cursor(), 2);
    }

    #[test]
    fn test_empty_build_is_ended() {
        let session = PlaybackSession::with_steps(Vec::new());
        assert_eq!(session.state(), SessionState::Ended);
        assert!(session.is_empty());
        assert!(session.current().is_none());
    }

    #[test]
    fn test_rebuild_then_reset_starts_over() {
        let mut session = PlaybackSession::with_steps(two_steps());
        session.advance();
        session.advance();

        session.rebuild(two_steps());
        assert_eq!(session.reset(), SessionState::InProgress);
        assert_eq!(session.cursor(), 0);
    }

    #[test]
    fn test_reset_keeps_steps() {
        let mut session = PlaybackSession::with_steps(two_steps());
        session.advance();
        session.reset();
        assert_eq!(session.len(), 2);
        assert_eq!(session.cursor(), 0);

        let mut empty = PlaybackSession::with_steps(Vec::new());
        assert_eq!(empty.reset(), SessionState::Ended);
    }

    #[test]
    fn test_advance_from_ignores_stale_cursor() {
        let mut session = PlaybackSession::with_steps(two_steps());
        assert!(session.advance_from(0));
        assert!(!session.advance_from(0));
        assert_eq!(session.cursor(), 1);
        assert!(session.advance_from(1));
        assert!(!session.advance_from(2));
        assert_eq!(session.state(), SessionState::Ended);
    }

    #[test]
    fn test_clear_returns_to_idle() {
        let mut session = PlaybackSession::with_steps(two_steps());
        session.advance();
        session.clear();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.is_empty());
    }

    #[test]
    fn test_stored_session_round_trips() {
        let mut session = PlaybackSession::with_steps(two_steps());
        session.advance();

        let json = serde_json::to_string(&session).unwrap();
        let restored: PlaybackSession = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.cursor(), 1);
        assert_eq!(restored.state(), SessionState::InProgress);
        assert_eq!(restored.current().unwrap().speaker(), "ALEX");
    }

    #[test]
    fn test_stored_session_rejects_cursor_past_end() {
        let json = r#"{"steps":[],"cursor":3,"built":true}"#;
        let err = serde_json::from_str::<PlaybackSession>(json).unwrap_err();
        assert!(err.to_string().contains("past the end"));

        let idle_with_cursor = r#"{"steps":[],"cursor":1,"built":false}"#;
        assert!(serde_json::from_str::<PlaybackSession>(idle_with_cursor).is_err());
    }

    #[test]
    fn test_position_is_one_based() {
        let mut session = PlaybackSession::with_steps(two_steps());
        assert_eq!(session.position(), 1);
        session.advance();
        assert_eq!(session.position(), 2);
        session.advance();
        assert_eq!(session.position(), 2);
    }
}
