use std::fmt;

pub(crate) const ERROR_MARKER: char = '!';
pub(crate) const HEADER_MARKER: char = '%';
pub(crate) const RESULT_MARKER: char = '[';
pub(crate) const RESULT_NOSLICE_MARKER: char = '=';
pub(crate) const SOHEADER_MARKER: char = '&';
pub(crate) const REDIRECT_MARKER: char = '^';
pub(crate) const INFO_MARKER: char = '#';
pub(crate) const PROMPT_MARKER: char = '.';
pub(crate) const MORE_MARKER: char = ',';

/// Kind of a protocol line, decided by its first character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineType {
    /// Empty line or no recognised marker; passed through untouched.
    Unknown,
    Error,
    Header,
    Result,
    SoHeader,
    Redirect,
    Info,
    Prompt,
    More,
}

impl LineType {
    pub fn classify(line: &str) -> Self {
        match line.chars().next() {
            Some(ERROR_MARKER) => LineType::Error,
            Some(HEADER_MARKER) => LineType::Header,
            Some(RESULT_MARKER) | Some(RESULT_NOSLICE_MARKER) => LineType::Result,
            Some(SOHEADER_MARKER) => LineType::SoHeader,
            Some(REDIRECT_MARKER) => LineType::Redirect,
            Some(INFO_MARKER) => LineType::Info,
            Some(PROMPT_MARKER) => LineType::Prompt,
            Some(MORE_MARKER) => LineType::More,
            _ => LineType::Unknown,
        }
    }

    pub fn marker(self) -> Option<char> {
        match self {
            LineType::Unknown => None,
            LineType::Error => Some(ERROR_MARKER),
            LineType::Header => Some(HEADER_MARKER),
            LineType::Result => Some(RESULT_MARKER),
            LineType::SoHeader => Some(SOHEADER_MARKER),
            LineType::Redirect => Some(REDIRECT_MARKER),
            LineType::Info => Some(INFO_MARKER),
            LineType::Prompt => Some(PROMPT_MARKER),
            LineType::More => Some(MORE_MARKER),
        }
    }
}

impl fmt::Display for LineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LineType::Unknown => "unknown",
            LineType::Error => "error",
            LineType::Header => "header",
            LineType::Result => "result",
            LineType::SoHeader => "start of header",
            LineType::Redirect => "redirect",
            LineType::Info => "info",
            LineType::Prompt => "prompt",
            LineType::More => "more",
        };
        write!(f, "{name}")
    }
}
