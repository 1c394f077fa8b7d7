use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
};

use log::debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection lost: {context}")]
    ConnectionLost { context: String },
    #[error("incomplete block read from stream: expected {expected} bytes, received {received}")]
    IncompleteBlock { expected: usize, received: usize },
    #[error("server sent a block larger than the block size: {0} bytes")]
    OversizedBlock(usize),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub(crate) fn lost(context: impl Into<String>) -> Self {
        TransportError::ConnectionLost {
            context: context.into(),
        }
    }
}

/// Bidirectional byte stream carrying a session or a control exchange.
///
/// A reader and a writer each hold their own handle to the same stream, so
/// implementations must be able to hand out additional handles. Closing any
/// handle closes the underlying connection.
pub trait Transport: Read + Write + Sized {
    fn try_clone(&self) -> io::Result<Self>;

    fn close(&mut self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            // Peer already hung up.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            res => res,
        }
    }
}

/// Opens a plain TCP connection with Nagle disabled; the protocols exchange
/// many small messages.
pub fn connect<A: ToSocketAddrs>(address: A) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect(address)?;
    stream.set_nodelay(true)?;
    debug!("connected to {:?}", stream.peer_addr().ok());
    Ok(stream)
}
