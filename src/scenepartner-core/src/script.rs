//! Script parsing.
//!
//! Turns plain text with one `NAME: dialogue` entry per line into
//! [`ScriptLine`]s. Anything that does not look like dialogue is skipped.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ScenePartnerError;

/// A single line of dialogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLine {
    /// Speaking character, upper-cased by the parser.
    pub character: String,
    /// What the character says, kept verbatim apart from trimming.
    pub text: String,
}

impl ScriptLine {
    pub fn new(character: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            character: character.into(),
            text: text.into(),
        }
    }
}

/// Parse scene text into script lines.
///
/// Blank lines, `#` and `//` comments, lines without a `:` and lines with an
/// empty name or text are ignored.
pub fn parse_scene_text(text: &str) -> Vec<ScriptLine> {
    text.lines().filter_map(parse_line).collect()
}

/// Read and parse a script file.
pub fn parse_script<P: AsRef<Path>>(path: P) -> Result<Vec<ScriptLine>, ScenePartnerError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ScenePartnerError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(parse_scene_text(&content))
}

fn parse_line(raw: &str) -> Option<ScriptLine> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
        return None;
    }

    let (name, text) = line.split_once(':')?;
    let name = name.trim().to_uppercase();
    let text = text.trim();
    if name.is_empty() || text.is_empty() {
        return None;
    }

    Some(ScriptLine::new(name, text))
}

/// Distinct speakers in order of first appearance.
pub fn characters(lines: &[ScriptLine]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for line in lines {
        if !seen.iter().any(|c| c == &line.character) {
            seen.push(line.character.clone());
        }
    }
    seen
}
