//! Sequence building.
//!
//! Classifies each script line as the performer's turn or the partner's turn.

use serde::{Deserialize, Serialize};

use crate::script::ScriptLine;

/// Whose turn a step is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StepKind {
    /// The live performer delivers this line.
    Performer,
    /// The partner speaks this line through the speech sink.
    Partner,
}

impl StepKind {
    pub fn display_name(&self) -> &str {
        match self {
            StepKind::Performer => "YOU",
            StepKind::Partner => "AI",
        }
    }
}

/// One step of a playback session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayStep {
    pub kind: StepKind,
    /// Speaking character, if known.
    pub character: Option<String>,
    pub text: String,
}

impl PlayStep {
    pub fn performer(text: impl Into<String>, character: impl Into<String>) -> Self {
        Self {
            kind: StepKind::Performer,
            character: Some(character.into()),
            text: text.into(),
        }
    }

    pub fn partner(text: impl Into<String>, character: impl Into<String>) -> Self {
        Self {
            kind: StepKind::Partner,
            character: Some(character.into()),
            text: text.into(),
        }
    }

    pub fn is_performer(&self) -> bool {
        self.kind == StepKind::Performer
    }

    /// Character name, falling back to the kind label.
    pub fn speaker(&self) -> &str {
        self.character
            .as_deref()
            .unwrap_or_else(|| self.kind.display_name())
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_uppercase()
}

/// Build the ordered step list for a performer playing `performer_name`.
///
/// An empty performer name matches nobody, so every step becomes a partner
/// step.
pub fn build_sequence(lines: &[ScriptLine], performer_name: &str) -> Vec<PlayStep> {
    let performer = normalize(performer_name);

    lines
        .iter()
        .map(|line| {
            if !performer.is_empty() && normalize(&line.character) == performer {
                PlayStep::performer(line.text.clone(), line.character.clone())
            } else {
                PlayStep::partner(line.text.clone(), line.character.clone())
            }
        })
        .collect()
}
