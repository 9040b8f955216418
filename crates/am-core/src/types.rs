use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// AgentKind
// ---------------------------------------------------------------------------

/// The program a session hosts: one of the supported coding-agent CLIs, or a
/// plain login shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
    OpenCode,
    Shell,
}

impl AgentKind {
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Claude,
        AgentKind::Codex,
        AgentKind::Gemini,
        AgentKind::OpenCode,
        AgentKind::Shell,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
            AgentKind::OpenCode => "open_code",
            AgentKind::Shell => "shell",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = ParseAgentKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(AgentKind::Claude),
            "codex" => Ok(AgentKind::Codex),
            "gemini" => Ok(AgentKind::Gemini),
            "open_code" | "opencode" => Ok(AgentKind::OpenCode),
            "shell" | "terminal" => Ok(AgentKind::Shell),
            _ => Err(ParseAgentKindError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown agent kind: {0}")]
pub struct ParseAgentKindError(pub String);

// ---------------------------------------------------------------------------
// WorkKey
// ---------------------------------------------------------------------------

/// Identifies a unit of work (typically a git worktree) that sessions are
/// opened for. Opaque to the session core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkKey(String);

impl WorkKey {
    pub fn new(key: impl Into<String>) -> Result<Self, InvalidWorkKey> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(InvalidWorkKey::Empty);
        }
        if key.chars().any(char::is_control) {
            return Err(InvalidWorkKey::ControlCharacter);
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkKey {
    type Err = InvalidWorkKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkKey::new(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidWorkKey {
    #[error("work key must not be empty")]
    Empty,
    #[error("work key must not contain control characters")]
    ControlCharacter,
}
