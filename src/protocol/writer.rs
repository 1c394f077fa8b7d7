use std::io::{BufWriter, Write};

use log::trace;

use super::{LineReader, TransportError, reader::LineTracker};

/// Line terminator of the protocol, regardless of platform.
pub const LINE_TERMINATOR: char = '\n';

/// Writes protocol lines. Every write invalidates the line type remembered by
/// the registered reader.
#[derive(Debug)]
pub struct LineWriter<W: Write> {
    inner: BufWriter<W>,
    registered: Option<LineTracker>,
}

impl<W: Write> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
            registered: None,
        }
    }

    pub fn register_reader<R>(&mut self, reader: &LineReader<R>)
    where
        R: std::io::Read,
    {
        self.registered = Some(reader.tracker());
    }

    /// Writes `text` followed by the line terminator and flushes.
    pub fn write_line(&mut self, text: &str) -> Result<(), TransportError> {
        self.inner.write_all(text.as_bytes())?;
        write!(self.inner, "{LINE_TERMINATOR}")?;
        self.finish(text)
    }

    /// Writes `text` as given and flushes.
    pub fn write_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.inner.write_all(text.as_bytes())?;
        self.finish(text)
    }

    fn finish(&mut self, text: &str) -> Result<(), TransportError> {
        // A write obsoletes the last read line, even if the flush fails.
        if let Some(tracker) = &self.registered {
            tracker.reset();
        }
        trace!("TX {}", text.trim_end_matches(LINE_TERMINATOR));
        self.inner.flush()?;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        self.inner.get_mut()
    }
}
