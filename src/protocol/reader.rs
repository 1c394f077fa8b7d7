use std::{
    io::{self, BufRead, BufReader, Read},
    sync::{Arc, Mutex, PoisonError},
};

use log::trace;

use super::{
    LineType, TransportError,
    error::{ServerError, ServerMessage, normalize_error_line},
};

/// Byte that terminates a reply in the legacy single-marker framing.
pub const LEGACY_PROMPT: u8 = 0x01;

/// Shared handle on the type of the last line a [`LineReader`] classified.
///
/// The reader owns one; a [`LineWriter`](super::LineWriter) registered with the
/// reader holds a clone and resets it on every write.
#[derive(Debug, Clone, Default)]
pub struct LineTracker(Arc<Mutex<Option<LineType>>>);

impl LineTracker {
    pub fn get(&self) -> Option<LineType> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, line_type: Option<LineType>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = line_type;
    }

    /// Marks the last read line as stale.
    pub fn reset(&self) {
        self.set(None);
    }
}

/// Reads newline terminated protocol lines and classifies each one.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: BufReader<R>,
    tracker: LineTracker,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            tracker: LineTracker::default(),
        }
    }

    pub fn tracker(&self) -> LineTracker {
        self.tracker.clone()
    }

    /// Type of the last line read, or `None` if nothing was read since the
    /// last write on the paired writer.
    pub fn line_type(&self) -> Option<LineType> {
        self.tracker.get()
    }

    /// Reads one line without classifying it. Returns `None` at end of stream.
    pub fn read_plain_line(&mut self) -> Result<Option<String>, TransportError> {
        let mut buf = Vec::new();
        let read = self
            .inner
            .read_until(b'\n', &mut buf)
            .map_err(|e| lost_on_eof(e, "end of stream inside a line"))?;
        if read == 0 {
            trace!("RX <EOF>");
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }

        let line = String::from_utf8(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        trace!("RX {line}");
        Ok(Some(line))
    }

    /// Reads and classifies one line. Error lines are rewritten to always
    /// carry a state code. At end of stream the line type becomes
    /// [`LineType::Unknown`] and `None` is returned.
    pub fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        let line = match self.read_plain_line()? {
            Some(line) => line,
            None => {
                self.tracker.set(Some(LineType::Unknown));
                return Ok(None);
            }
        };

        let line_type = LineType::classify(&line);
        self.tracker.set(Some(line_type));
        if line_type == LineType::Error {
            Ok(Some(normalize_error_line(&line)))
        } else {
            Ok(Some(line))
        }
    }

    /// Reads up to the next prompt, collecting every error line on the way.
    ///
    /// Returns immediately if the last line read is already a prompt. Running
    /// out of input before a prompt is a lost connection. The caller must hold
    /// the reader exclusively, which `&mut self` guarantees.
    pub fn wait_for_prompt(&mut self) -> Result<Option<ServerError>, TransportError> {
        let mut errors = Vec::new();

        while self.line_type() != Some(LineType::Prompt) {
            let line = self
                .read_line()?
                .ok_or_else(|| TransportError::lost("end of stream while waiting for prompt"))?;
            if self.line_type() == Some(LineType::Error) {
                errors.push(ServerMessage::parse(&line[1..]));
            }
        }

        if errors.is_empty() {
            Ok(None)
        } else {
            Ok(Some(ServerError::new(errors)))
        }
    }

    /// Reads raw text up to the legacy prompt byte, which is consumed together
    /// with a single newline directly following it.
    pub fn read_legacy_reply(&mut self) -> Result<String, TransportError> {
        let mut buf = Vec::new();
        self.inner
            .read_until(LEGACY_PROMPT, &mut buf)
            .map_err(|e| lost_on_eof(e, "end of stream inside a reply"))?;
        if buf.pop() != Some(LEGACY_PROMPT) {
            return Err(TransportError::lost(
                "end of stream before the end-of-reply marker",
            ));
        }
        if self.inner.fill_buf()?.first() == Some(&b'\n') {
            self.inner.consume(1);
        }

        let reply = String::from_utf8(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        trace!("RX {reply}<prompt>");
        // The marker ends the exchange just like a prompt line.
        self.tracker.set(Some(LineType::Prompt));
        Ok(reply)
    }

    /// Reads exactly `size` bytes, bypassing line handling.
    pub fn read_bytes(&mut self, size: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0; size];
        self.inner.read_exact(&mut buf).map_err(|e| {
            lost_on_eof(e, &format!("end of stream inside a {size} byte binary block"))
        })?;
        trace!("RD read {size} binary bytes");
        self.tracker.reset();
        Ok(buf)
    }
}

/// Maps a premature end of stream to a lost connection, keeping its cause.
fn lost_on_eof(e: io::Error, context: &str) -> TransportError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => TransportError::lost(format!("{context}: {e}")),
        _ => TransportError::Io(e),
    }
}
