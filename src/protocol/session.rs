use log::{debug, info, warn};

use super::{
    HeaderRecord, LineReader, LineType, LineWriter, MclError, Transport, TransportError,
    error::{ServerError, ServerMessage},
    line::{ERROR_MARKER, INFO_MARKER},
};

/// Informational lines kept per session; later ones are dropped.
pub const MAX_ANNOTATIONS: usize = 3;

/// Command sent to the server when a session is closed.
pub const QUIT_COMMAND: &str = "quit\n";

/// Result text announcing `<size>` raw bytes after the current line.
const BINARY_ANNOUNCEMENT: &str = "bin:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Idle, a command may be sent.
    Ready,
    /// A command was sent and its reply has not been read up to the prompt.
    Sent,
    /// Connection terminated; no further I/O.
    Disabled,
    /// The server reported an error; the session resynchronises on the next
    /// prompt before sending again.
    Errored,
}

/// How the server marks the end of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Classified lines terminated by a prompt line.
    Typed,
    /// Raw text terminated by a single sentinel byte.
    Legacy,
}

/// Per-connection protocol state on top of a transport.
pub struct Session<T: Transport> {
    pub(super) reader: LineReader<T>,
    pub(super) writer: LineWriter<T>,
    state: SessionState,
    framing: Framing,
    annotations: Vec<String>,
    binary_pending: Option<usize>,
    more_requested: bool,
    header: Option<String>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Result<Self, TransportError> {
        Self::with_framing(transport, Framing::Typed)
    }

    pub fn legacy(transport: T) -> Result<Self, TransportError> {
        Self::with_framing(transport, Framing::Legacy)
    }

    fn with_framing(transport: T, framing: Framing) -> Result<Self, TransportError> {
        let reader = LineReader::new(transport.try_clone()?);
        let mut writer = LineWriter::new(transport);
        writer.register_reader(&reader);

        Ok(Self {
            reader,
            writer,
            state: SessionState::Ready,
            framing,
            annotations: Vec::new(),
            binary_pending: None,
            more_requested: false,
            header: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn line_type(&self) -> Option<LineType> {
        self.reader.line_type()
    }

    /// Informational lines received so far, at most [`MAX_ANNOTATIONS`].
    pub fn annotations(&self) -> &[String] {
        &self.annotations
    }

    pub fn clear_annotations(&mut self) {
        self.annotations.clear();
    }

    /// True if the last reply ended with the server asking for more input.
    pub fn more_requested(&self) -> bool {
        self.more_requested
    }

    /// Size of the binary block announced by the last reply and not read yet.
    pub fn binary_pending(&self) -> Option<usize> {
        self.binary_pending
    }

    /// Start of header line of the last reply, kept out of the reply text.
    pub fn last_header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    /// Decodes [`last_header`](Self::last_header).
    pub fn header_record(&self) -> Result<Option<HeaderRecord>, MclError> {
        match &self.header {
            Some(line) => Ok(Some(HeaderRecord::parse(line)?)),
            None => Ok(None),
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("session {:?} -> {next:?}", self.state);
            self.state = next;
        }
    }

    /// Sends `command` as is; the caller supplies any terminating newline.
    ///
    /// A pending or failed exchange is first drained up to its prompt. Errors
    /// found while draining are returned and nothing is sent; the session is
    /// then ready again.
    pub fn send(&mut self, command: &str) -> Result<(), MclError> {
        match self.state {
            SessionState::Disabled => return Err(MclError::Disabled),
            SessionState::Sent | SessionState::Errored => self.resync()?,
            SessionState::Ready => {}
        }

        if command.trim_end() == QUIT_COMMAND.trim_end() {
            return self.disconnect();
        }

        self.more_requested = false;
        self.header = None;
        self.writer.write_text(command)?;
        self.transition(SessionState::Sent);
        Ok(())
    }

    /// Sends `command` and reads its reply.
    pub fn execute(&mut self, command: &str) -> Result<String, MclError> {
        self.send(command)?;
        self.receive_reply()
    }

    /// Reads the reply to the last command.
    ///
    /// Comment lines are kept as annotations and the start of header line is
    /// kept for [`last_header`](Self::last_header); neither is returned. A reply
    /// announcing a binary block stops right after the announcement; the block
    /// must be taken with [`read_binary_block`](Self::read_binary_block) before
    /// reading on.
    pub fn receive_reply(&mut self) -> Result<String, MclError> {
        match self.state {
            SessionState::Disabled => return Err(MclError::Disabled),
            SessionState::Ready | SessionState::Errored => return Err(MclError::NoReplyPending),
            SessionState::Sent => {}
        }
        if let Some(size) = self.binary_pending {
            return Err(MclError::BinaryPending(size));
        }

        match self.framing {
            Framing::Typed => self.receive_typed(),
            Framing::Legacy => self.receive_legacy(),
        }
    }

    fn receive_typed(&mut self) -> Result<String, MclError> {
        let mut reply = String::new();

        loop {
            let line = self
                .reader
                .read_line()?
                .ok_or_else(|| TransportError::lost("end of stream while reading reply"))?;

            match self.reader.line_type() {
                Some(LineType::Prompt) => {
                    self.transition(SessionState::Ready);
                    return Ok(reply);
                }
                Some(LineType::More) => {
                    self.more_requested = true;
                    self.transition(SessionState::Ready);
                    return Ok(reply);
                }
                Some(LineType::Error) => {
                    self.transition(SessionState::Errored);
                    let error = self.collect_error(&line)?;
                    return Err(MclError::Server(error));
                }
                Some(LineType::Info) => self.annotate(&line[1..]),
                Some(LineType::SoHeader) => self.header = Some(line),
                _ => {
                    reply.push_str(&line);
                    reply.push('\n');
                    if let Some(size) = binary_announcement(&line) {
                        debug!("binary reply of {size} bytes announced");
                        self.binary_pending = Some(size);
                        return Ok(reply);
                    }
                }
            }
        }
    }

    /// Gathers the error block starting at `first` up to the closing prompt.
    fn collect_error(&mut self, first: &str) -> Result<ServerError, MclError> {
        let mut messages = vec![ServerMessage::parse(&first[1..])];

        loop {
            let line = self
                .reader
                .read_line()?
                .ok_or_else(|| TransportError::lost("end of stream while reading error"))?;
            match self.reader.line_type() {
                Some(LineType::Error) => messages.push(ServerMessage::parse(&line[1..])),
                Some(LineType::Prompt) | Some(LineType::More) => break,
                _ => debug!("ignoring line after error: {line}"),
            }
        }

        Ok(ServerError::new(messages))
    }

    fn receive_legacy(&mut self) -> Result<String, MclError> {
        let raw = self.reader.read_legacy_reply()?;
        let mut reply = String::new();
        let mut error: Option<String> = None;

        for line in raw.split_inclusive('\n') {
            if let Some(error) = error.as_mut() {
                error.push_str(line);
            } else if let Some(comment) = line.strip_prefix(INFO_MARKER) {
                self.annotate(comment.trim_end_matches('\n'));
            } else if let Some(rest) = line.strip_prefix(ERROR_MARKER) {
                error = Some(rest.to_string());
            } else {
                reply.push_str(line);
            }
        }

        match error {
            Some(text) => {
                self.transition(SessionState::Errored);
                let message = ServerMessage::parse(text.trim());
                Err(MclError::Server(ServerError::new(vec![message])))
            }
            None => {
                self.transition(SessionState::Ready);
                Ok(reply)
            }
        }
    }

    fn annotate(&mut self, text: &str) {
        if self.annotations.len() < MAX_ANNOTATIONS {
            self.annotations.push(text.to_string());
        } else {
            warn!("dropping annotation: {text}");
        }
    }

    /// Brings the session back to [`SessionState::Ready`].
    pub fn sync(&mut self) -> Result<(), MclError> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Disabled => Err(MclError::Disabled),
            SessionState::Sent | SessionState::Errored => self.resync(),
        }
    }

    fn resync(&mut self) -> Result<(), MclError> {
        if let Some(size) = self.binary_pending.take() {
            debug!("skipping {size} unread binary bytes");
            self.reader.read_bytes(size)?;
        }

        let drained = match self.framing {
            Framing::Typed => self.reader.wait_for_prompt()?,
            Framing::Legacy if self.reader.line_type() == Some(LineType::Prompt) => None,
            Framing::Legacy => {
                self.reader.read_legacy_reply()?;
                None
            }
        };
        self.transition(SessionState::Ready);

        match drained {
            Some(error) => Err(MclError::Server(error)),
            None => Ok(()),
        }
    }

    /// Reads `size` raw bytes of an announced binary reply.
    pub fn read_binary_block(&mut self, size: usize) -> Result<Vec<u8>, MclError> {
        if self.state == SessionState::Disabled {
            return Err(MclError::Disabled);
        }
        let available = self.binary_pending.ok_or(MclError::UnexpectedBinary)?;
        if size > available {
            return Err(MclError::BinaryOverrun {
                requested: size,
                available,
            });
        }

        let block = self.reader.read_bytes(size)?;
        self.binary_pending = Some(available - size).filter(|left| *left > 0);
        Ok(block)
    }

    /// Sends the quit command and closes the transport. Does nothing on a
    /// disconnected session.
    pub fn disconnect(&mut self) -> Result<(), MclError> {
        if self.state == SessionState::Disabled {
            return Ok(());
        }

        let quit = self.writer.write_text(QUIT_COMMAND);
        self.transition(SessionState::Disabled);
        let closed = self.writer.get_mut().close();
        info!("session closed");

        quit?;
        closed.map_err(TransportError::from)?;
        Ok(())
    }

    /// Closes the transport without saying goodbye to the server.
    pub(crate) fn abort(&mut self) {
        if self.state == SessionState::Disabled {
            return;
        }
        self.transition(SessionState::Disabled);
        if let Err(e) = self.writer.get_mut().close() {
            warn!("failed to close transport: {e}");
        }
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("failed to disconnect session: {e}");
        }
    }
}

fn binary_announcement(line: &str) -> Option<usize> {
    line.strip_prefix(BINARY_ANNOUNCEMENT)?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use crate::protocol::{
        BlockStream, HeaderError, HeaderField, QueryType, transport::mock::MockStream,
    };

    use super::*;

    fn session(input: &str) -> (Session<MockStream>, MockStream) {
        let stream = MockStream::new(input);
        (Session::new(stream.clone()).unwrap(), stream)
    }

    #[test]
    fn reply_with_header_line() {
        let (mut session, stream) = session("&2 5 5 3 0\n[42,'x']\n.\n");

        session.send("sinsert into t values (42, 'x');\n").unwrap();
        assert_eq!(session.state(), SessionState::Sent);

        let reply = session.receive_reply().unwrap();
        assert_eq!(reply, "[42,'x']\n");
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(stream.written_str(), "sinsert into t values (42, 'x');\n");

        assert_eq!(session.last_header(), Some("&2 5 5 3 0"));
        let record = HeaderRecord::parse(session.last_header().unwrap()).unwrap();
        assert_eq!(record.query_type, QueryType::Update);
        assert_eq!(record.fields, vec![HeaderField::Int(5)]);
    }

    #[test]
    fn header_cleared_by_next_send() {
        let (mut session, _) = session("&4 f\n.\n=OK\n.\n&9 1\n.\n");

        session.execute("sSTART TRANSACTION;\n").unwrap();
        let record = session.header_record().unwrap().unwrap();
        assert_eq!(record.query_type, QueryType::Transaction);
        assert_eq!(record.fields, vec![HeaderField::Str("f".into())]);

        assert_eq!(session.execute("sselect 1;\n").unwrap(), "=OK\n");
        assert_eq!(session.last_header(), None);
        assert!(session.header_record().unwrap().is_none());

        session.execute("sselect 2;\n").unwrap();
        let err = session.header_record().unwrap_err();
        assert!(matches!(err, MclError::Header(HeaderError::UnknownType { .. })));
    }

    #[test]
    fn error_reply_then_resync() {
        let (mut session, stream) = session("!42000!syntax error\n!42000!query aborted\n.\n=OK\n.\n");

        let err = session.execute("sselec 1;\n").unwrap_err();
        match err {
            MclError::Server(error) => {
                assert_eq!(error.state(), "42000");
                assert_eq!(error.message(), "syntax error\nquery aborted");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Errored);

        // The prompt was consumed with the error; the next send goes straight out.
        assert_eq!(session.execute("sselect 1;\n").unwrap(), "=OK\n");
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(stream.written_str(), "sselec 1;\nsselect 1;\n");
    }

    #[test]
    fn send_drains_unread_reply() {
        let (mut session, stream) = session("[ 1\t]\n.\n[ 2\t]\n.\n");

        session.send("sselect 1;\n").unwrap();
        session.send("sselect 2;\n").unwrap();

        assert_eq!(session.receive_reply().unwrap(), "[ 2\t]\n");
        assert_eq!(stream.written_str(), "sselect 1;\nsselect 2;\n");
    }

    #[test]
    fn send_surfaces_drained_errors() {
        let (mut session, stream) = session("!bad\n.\n");

        session.send("sselect 1;\n").unwrap();
        let err = session.send("sselect 2;\n").unwrap_err();

        assert!(matches!(err, MclError::Server(ref e) if e.state() == "M0M10"));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(stream.written_str(), "sselect 1;\n");
    }

    #[test]
    fn annotations_are_capped() {
        let (mut session, _) = session("#one\n#two\n#three\n#four\n=OK\n.\n");

        assert_eq!(session.execute("sselect 1;\n").unwrap(), "=OK\n");
        assert_eq!(session.annotations(), ["one", "two", "three"]);

        session.clear_annotations();
        assert!(session.annotations().is_empty());
    }

    #[test]
    fn sync_is_noop_when_ready() {
        let (mut session, stream) = session("");

        session.sync().unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(stream.written().is_empty());
    }

    #[test]
    fn receive_without_send() {
        let (mut session, _) = session(".\n");

        assert!(matches!(
            session.receive_reply(),
            Err(MclError::NoReplyPending)
        ));
    }

    #[test]
    fn connection_lost_mid_reply() {
        let (mut session, _) = session("[ 1\t]\n");

        let err = session.execute("sselect 1;\n").unwrap_err();
        assert!(matches!(
            err,
            MclError::Transport(TransportError::ConnectionLost { .. })
        ));
    }

    #[test]
    fn truncated_block_loses_connection() {
        let mut input: Vec<u8> = vec![0x29, 0x00];
        input.extend_from_slice(b"[ 1\t");
        let stream = MockStream::new(input);
        let mut session = Session::new(BlockStream::new(stream.clone())).unwrap();

        let err = session.execute("sselect 1;\n").unwrap_err();
        assert!(matches!(
            err,
            MclError::Transport(TransportError::ConnectionLost { .. })
        ));
        // the command itself went out as one final block
        assert_eq!(&stream.written()[..2], &[23u8, 0][..]);
    }

    #[test]
    fn more_prompt_ends_reply() {
        let (mut session, _) = session("&2 0 -1\n,\n");

        assert_eq!(session.execute("sCOPY INTO t FROM STDIN;\n").unwrap(), "");
        assert_eq!(session.last_header(), Some("&2 0 -1"));
        assert!(session.more_requested());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn binary_block_read() {
        let (mut session, _) = session("bin:4\n\x00\n.\x01.\n");

        let reply = session.execute("Xexport 1\n").unwrap();
        assert_eq!(reply, "bin:4\n");
        assert_eq!(session.binary_pending(), Some(4));
        assert!(matches!(
            session.receive_reply(),
            Err(MclError::BinaryPending(4))
        ));

        assert_eq!(session.read_binary_block(3).unwrap(), b"\x00\n.");
        assert_eq!(session.read_binary_block(1).unwrap(), b"\x01");
        assert_eq!(session.binary_pending(), None);

        assert_eq!(session.receive_reply().unwrap(), "");
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn binary_read_requires_announcement() {
        let (mut session, _) = session("=OK\n.\n");
        session.execute("sselect 1;\n").unwrap();

        assert!(matches!(
            session.read_binary_block(1),
            Err(MclError::UnexpectedBinary)
        ));
    }

    #[test]
    fn binary_read_overrun() {
        let (mut session, _) = session("bin:2\nab.\n");
        session.execute("Xexport 1\n").unwrap();

        assert!(matches!(
            session.read_binary_block(3),
            Err(MclError::BinaryOverrun {
                requested: 3,
                available: 2
            })
        ));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (mut session, stream) = session("");

        session.disconnect().unwrap();
        assert_eq!(session.state(), SessionState::Disabled);
        assert!(stream.is_closed());
        assert_eq!(stream.written_str(), QUIT_COMMAND);

        session.disconnect().unwrap();
        assert_eq!(stream.written_str(), QUIT_COMMAND);
        assert!(matches!(session.send("sselect 1;\n"), Err(MclError::Disabled)));
    }

    #[test]
    fn quit_command_disables() {
        let (mut session, stream) = session("");

        session.send("quit\n").unwrap();
        assert_eq!(session.state(), SessionState::Disabled);
        assert!(stream.is_closed());
    }

    #[test]
    fn drop_disconnects() {
        let stream = MockStream::new("");
        {
            let _session = Session::new(stream.clone()).unwrap();
        }

        assert!(stream.is_closed());
        assert_eq!(stream.written_str(), QUIT_COMMAND);
    }

    #[test]
    fn legacy_reply_skips_comments() {
        let stream = MockStream::new("#hello\nrow 1\n#again\nrow 2\n\x01\n");
        let mut session = Session::legacy(stream).unwrap();

        assert_eq!(session.execute("print(1);\n").unwrap(), "row 1\nrow 2\n");
        assert_eq!(session.annotations(), ["hello", "again"]);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn legacy_error_aggregates_until_marker() {
        let stream = MockStream::new("partial\n!MALException:missing\nmore detail\n\x01ok\n\x01");
        let mut session = Session::legacy(stream).unwrap();

        let err = session.execute("bogus();\n").unwrap_err();
        match err {
            MclError::Server(error) => {
                assert_eq!(error.message(), "MALException:missing\nmore detail");
                assert_eq!(error.state(), "M0M10");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Errored);

        assert_eq!(session.execute("print(2);\n").unwrap(), "ok\n");
    }
}
