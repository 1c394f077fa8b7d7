//! MAPI block-mode framing.
//!
//! On the wire every message is sent as a sequence of blocks. Each block is
//! preceded by a two byte little-endian header holding `length << 1 | last`,
//! where `last` marks the final block of a message. [`BlockStream`] hides this
//! framing and exposes a plain byte stream to the line reader and writer.
//!
//! The end of a message is an implicit flush on the server side. It is made
//! visible to readers by inserting a prompt line (`.\n`) after each final block,
//! so the [`LineReader`](super::LineReader) sees a regular PROMPT line.
use std::io::{self, Read, Write};

use log::trace;

use super::{Transport, TransportError, line::PROMPT_MARKER};

/// Maximum payload of a single block.
pub const BLOCK_SIZE: usize = 8 * 1024 - 2;

const HEADER_SIZE: usize = 2;

#[derive(Debug)]
pub struct BlockStream<T> {
    inner: T,
    read_buf: Vec<u8>,
    read_pos: usize,
    write_buf: Vec<u8>,
}

impl<T> BlockStream<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            read_buf: Vec::with_capacity(BLOCK_SIZE + 3),
            read_pos: 0,
            write_buf: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    fn available(&self) -> usize {
        self.read_buf.len() - self.read_pos
    }
}

/// End of stream inside a block. Readers report it as a lost connection.
fn incomplete(error: TransportError) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, error)
}

impl<T: Read> BlockStream<T> {
    /// Fills `buf` completely. Returns `false` on a clean end of stream before
    /// the first byte; a partial fill is an incomplete block.
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut received = 0;
        while received < buf.len() {
            match self.inner.read(&mut buf[received..]) {
                Ok(0) if received == 0 => return Ok(false),
                Ok(0) => {
                    return Err(incomplete(TransportError::IncompleteBlock {
                        expected: buf.len(),
                        received,
                    }));
                }
                Ok(n) => received += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Reads the next block into the internal buffer. Returns `false` once the
    /// stream ended on a block boundary.
    fn read_block(&mut self) -> io::Result<bool> {
        let mut header = [0u8; HEADER_SIZE];
        if !self.read_full(&mut header)? {
            trace!("RD server closed the connection (EOF)");
            return Ok(false);
        }

        let header = u16::from_le_bytes(header);
        let length = (header >> 1) as usize;
        let last = header & 1 == 1;
        if length > BLOCK_SIZE {
            return Err(io::Error::other(TransportError::OversizedBlock(length)));
        }

        self.read_buf.clear();
        self.read_buf.resize(length, 0);
        self.read_pos = 0;
        let mut block = std::mem::take(&mut self.read_buf);
        let filled = self.read_full(&mut block);
        self.read_buf = block;
        if !filled? && length > 0 {
            return Err(incomplete(TransportError::IncompleteBlock {
                expected: length,
                received: 0,
            }));
        }
        trace!(
            "RD read {} block: {length} bytes",
            if last { "final" } else { "new" }
        );

        if last {
            if self.read_buf.last().is_some_and(|b| *b != b'\n') {
                self.read_buf.push(b'\n');
            }
            self.read_buf.push(PROMPT_MARKER as u8);
            self.read_buf.push(b'\n');
        }
        Ok(true)
    }
}

impl<T: Write> BlockStream<T> {
    fn write_block(&mut self, last: bool) -> io::Result<()> {
        let header = ((self.write_buf.len() as u16) << 1) | u16::from(last);
        self.inner.write_all(&header.to_le_bytes())?;
        self.inner.write_all(&self.write_buf)?;
        trace!(
            "TD write {}block: {} bytes",
            if last { "final " } else { "" },
            self.write_buf.len()
        );
        self.write_buf.clear();
        Ok(())
    }
}

impl<T: Read> Read for BlockStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Empty non-final blocks carry nothing; keep going until data arrives.
        while self.available() == 0 {
            if !self.read_block()? {
                return Ok(0);
            }
        }

        let n = buf.len().min(self.available());
        buf[..n].copy_from_slice(&self.read_buf[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        Ok(n)
    }
}

impl<T: Write> Write for BlockStream<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            if self.write_buf.len() == BLOCK_SIZE {
                self.write_block(false)?;
            }
            let take = rest.len().min(BLOCK_SIZE - self.write_buf.len());
            self.write_buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        Ok(buf.len())
    }

    /// Sends whatever is buffered as the final block of the message.
    fn flush(&mut self) -> io::Result<()> {
        self.write_block(true)?;
        self.inner.flush()
    }
}

impl<T: Transport> Transport for BlockStream<T> {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(BlockStream::new(self.inner.try_clone()?))
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}
