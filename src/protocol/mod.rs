//! MAPI client protocol.
//!
//! This module implements the client side of the line oriented protocol spoken by the
//! database server and by its managing daemon. It covers everything between a raw byte
//! stream and a query reply: framing, line classification, error normalization, login and
//! the per-connection session state machine.
//!
//! # Overview
//!
//! Every reply from the server is a sequence of newline terminated lines. The first
//! character of a line tells what it carries:
//!
//! - `!` an error, `#` an informational message and `^` a redirect,
//! - `&` a start of header, `%` a column header and `[` or `=` a result row,
//! - `.` the prompt that ends a reply and `,` a request for more input.
//!
//! On TCP the lines travel inside length prefixed blocks ([`BlockStream`]). Older servers
//! end a reply with a single marker byte instead of a prompt line; [`Framing::Legacy`]
//! selects that mode.
//!
//! # Key Components
//!
//! - [`LineReader`] / [`LineWriter`]: classify incoming lines and write outgoing ones,
//!   sharing the type of the last line read.
//! - [`Session`]: sends commands and collects replies, tracking whether a reply is
//!   pending, failed or the connection is gone.
//! - [`StartOfHeaderParser`]: decodes the `&` line opening a query reply.
//! - [`connect`]: opens a TCP connection and logs in, following redirects.
//!
//! # See Also
//!
//! - [`control`](crate::control): client for the managing daemon's control channel.
mod block;
mod error;
mod header;
mod line;
mod login;
mod reader;
mod session;
pub(crate) mod transport;
mod writer;

pub use block::{BLOCK_SIZE, BlockStream};
pub use error::{FALLBACK_STATE, MclError, ServerError, ServerMessage};
pub use header::{
    FieldKind, HeaderError, HeaderField, HeaderRecord, QueryType, StartOfHeaderParser,
};
pub use line::LineType;
pub use login::{
    ConnectConfig, DEFAULT_PORT, HashAlgorithm, LoginOutcome, PROTOCOL_VERSION,
    challenge_response, connect,
};
pub use reader::{LEGACY_PROMPT, LineReader, LineTracker};
pub use session::{Framing, MAX_ANNOTATIONS, QUIT_COMMAND, Session, SessionState};
pub use transport::{Transport, TransportError};
pub use writer::{LINE_TERMINATOR, LineWriter};
