use std::fmt;

use thiserror::Error;

use super::{TransportError, header::HeaderError};

/// SQLSTATE given to server errors that arrive without one.
pub const FALLBACK_STATE: &str = "M0M10";

const STATE_LEN: usize = 5;

/// Returns true if `text` opens with a five character upper-case
/// alphanumeric state code followed by `!`.
pub(crate) fn has_state_code(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() > STATE_LEN
        && bytes[STATE_LEN] == b'!'
        && bytes[..STATE_LEN]
            .iter()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Rewrites an error line (including its `!` marker) so it always carries a
/// state code.
pub(crate) fn normalize_error_line(line: &str) -> String {
    let body = line.strip_prefix('!').unwrap_or(line);
    if has_state_code(body) {
        line.to_string()
    } else {
        format!("!{FALLBACK_STATE}!{body}")
    }
}

/// One error line reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub state: String,
    pub message: String,
}

impl ServerMessage {
    /// Splits error line text (without the leading marker) into state code
    /// and message.
    pub fn parse(text: &str) -> Self {
        if has_state_code(text) {
            Self {
                state: text[..STATE_LEN].to_string(),
                message: text[STATE_LEN + 1..].to_string(),
            }
        } else {
            Self {
                state: FALLBACK_STATE.to_string(),
                message: text.to_string(),
            }
        }
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.state, self.message)
    }
}

/// Aggregated error block of a single reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    messages: Vec<ServerMessage>,
}

impl ServerError {
    pub fn new(messages: Vec<ServerMessage>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[ServerMessage] {
        &self.messages
    }

    /// State code of the first error line.
    pub fn state(&self) -> &str {
        self.messages
            .first()
            .map_or(FALLBACK_STATE, |m| m.state.as_str())
    }

    /// Message text of all lines, newline separated and trimmed.
    pub fn message(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.message.as_str())
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = self
            .messages
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        write!(f, "{}", lines.join("\n").trim())
    }
}

impl std::error::Error for ServerError {}

#[derive(Debug, Error)]
pub enum MclError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("server error: {0}")]
    Server(ServerError),

    #[error("session is disconnected")]
    Disabled,

    #[error("no reply pending; send a command first")]
    NoReplyPending,

    #[error("binary reply of {0} bytes must be read before continuing")]
    BinaryPending(usize),

    #[error("no binary reply was announced")]
    UnexpectedBinary,

    #[error("binary read of {requested} bytes exceeds the {available} announced bytes")]
    BinaryOverrun { requested: usize, available: usize },

    #[error("login failed: {0}")]
    Login(String),

    #[error("the server sent a redirect for this connection: {0}")]
    Redirect(String),

    #[error(transparent)]
    Header(#[from] HeaderError),
}

impl From<ServerError> for MclError {
    fn from(value: ServerError) -> Self {
        MclError::Server(value)
    }
}
