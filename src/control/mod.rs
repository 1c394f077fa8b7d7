//! Control channel client for the database managing daemon.
//!
//! The daemon listens for administrative commands on its own port. Every
//! command runs over a fresh connection:
//!
//! 1. the daemon greets with `merovingian:<version>:<token>:`,
//! 2. the client answers with [`control_hash`] of its passphrase and the token,
//!    suffixed with `:control` for version 2, and expects `OK`,
//! 3. the client sends `<target> <command>` and again expects `OK`,
//! 4. commands producing output send it line by line until the daemon closes
//!    the connection.
//!
//! The connection is closed on every exit path.
mod status;

use std::net::TcpStream;

use log::{debug, info, warn};
use thiserror::Error;

use crate::protocol::{LineReader, LineWriter, Transport, TransportError, transport};

pub use status::{DatabaseState, StatusError, StatusRecord, UNKNOWN_URI};

pub const DEFAULT_CONTROL_PORT: u16 = 50000;

const GREETING_PREFIX: &str = "merovingian";
const ACCEPTED: &str = "OK";
const CONTROL_MODE: &str = "control";

/// Target addressing all databases, or the daemon's defaults.
pub const ALL_DATABASES: &str = "#all";
pub const DEFAULTS: &str = "#defaults";

const NEIGHBOUR_TARGET: &str = "anelosimus";
const NEIGHBOUR_COMMAND: &str = "eximius";
/// Neighbour name whose uri is used as is.
const VERBATIM_NEIGHBOUR: &str = "*";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid greeting from daemon: {0}")]
    Handshake(String),

    #[error("unsupported control protocol: {0}")]
    UnsupportedVersion(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("expected one status record for '{database}', received {found}")]
    StatusCount { database: String, found: usize },

    #[error("malformed property line: {0}")]
    MalformedProperty(String),
}

/// Rolling 32 bit hash the daemon uses to verify the passphrase.
///
/// The passphrase loop shifts the saved top bits logically, the salt loop
/// arithmetically. Both operate on masked, non-negative values.
pub fn control_hash(passphrase: &str, salt: &str) -> String {
    let mut h: i64 = 0;

    for c in passphrase.chars() {
        let ho = h & 0xF800_0000;
        h = (h << 5) & 0xFFFF_FFFF;
        h ^= ((ho as u64) >> 27) as i64;
        h ^= i64::from(u32::from(c));
    }
    for c in salt.chars() {
        let ho = h & 0xF800_0000;
        h = (h << 5) & 0xFFFF_FFFF;
        h ^= ho >> 27;
        h ^= i64::from(u32::from(c));
    }

    h.to_string()
}

/// A database announced by a neighbouring daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbour {
    pub name: String,
    pub uri: String,
}

impl Neighbour {
    fn parse(line: &str) -> Option<Self> {
        let (name, uri) = line.split_once('\t')?;
        Some(Self {
            name: name.to_string(),
            uri: uri.to_string(),
        })
    }

    /// Connection location of the database.
    pub fn location(&self) -> String {
        if self.name == VERBATIM_NEIGHBOUR {
            self.uri.clone()
        } else {
            format!("{}{}", self.uri, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlClient {
    host: String,
    port: u16,
    passphrase: String,
}

impl ControlClient {
    pub fn new(host: impl Into<String>, port: u16, passphrase: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            passphrase: passphrase.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Runs one command on a new connection. Returns the output lines when
    /// `expect_output` is set.
    pub fn send_command(
        &self,
        target: &str,
        command: &str,
        expect_output: bool,
    ) -> Result<Option<Vec<String>>, ControlError> {
        info!("control {}:{}: {target} {command}", self.host, self.port);
        let stream: TcpStream = transport::connect((self.host.as_str(), self.port))?;
        self.exchange(stream, target, command, expect_output)
    }

    /// Runs the command exchange on `transport` and closes it.
    pub(crate) fn exchange<T: Transport>(
        &self,
        mut transport: T,
        target: &str,
        command: &str,
        expect_output: bool,
    ) -> Result<Option<Vec<String>>, ControlError> {
        let result = self.converse(&mut transport, target, command, expect_output);
        if let Err(e) = transport.close() {
            warn!("failed to close control connection: {e}");
        }
        result
    }

    fn converse<T: Transport>(
        &self,
        transport: &mut T,
        target: &str,
        command: &str,
        expect_output: bool,
    ) -> Result<Option<Vec<String>>, ControlError> {
        let mut reader = LineReader::new(transport.try_clone().map_err(TransportError::from)?);
        let mut writer = LineWriter::new(transport);

        let greeting = reader
            .read_plain_line()?
            .ok_or_else(|| ControlError::Handshake("connection closed".to_string()))?;
        let mut tokens = greeting.split(':');
        if tokens.next() != Some(GREETING_PREFIX) {
            return Err(ControlError::Handshake(greeting));
        }
        let version = tokens.next();
        let token = tokens
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ControlError::Handshake(greeting.clone()))?;

        let hash = control_hash(&self.passphrase, token);
        match version {
            Some("1") => writer.write_line(&hash)?,
            Some("2") => writer.write_line(&format!("{hash}:{CONTROL_MODE}"))?,
            _ => return Err(ControlError::UnsupportedVersion(greeting)),
        }
        expect_ok(&mut reader).map_err(ControlError::Authentication)?;
        debug!("control channel authenticated");

        writer.write_line(&format!("{target} {command}"))?;
        expect_ok(&mut reader).map_err(ControlError::Command)?;

        if !expect_output {
            return Ok(None);
        }
        let mut lines = Vec::new();
        while let Some(line) = reader.read_plain_line()? {
            lines.push(line);
        }
        Ok(Some(lines))
    }

    fn command(&self, target: &str, command: &str) -> Result<(), ControlError> {
        self.send_command(target, command, false).map(|_| ())
    }

    fn output(&self, target: &str, command: &str) -> Result<Vec<String>, ControlError> {
        Ok(self
            .send_command(target, command, true)?
            .unwrap_or_default())
    }

    pub fn ping(&self) -> Result<(), ControlError> {
        self.command(ALL_DATABASES, "ping")
    }

    pub fn start(&self, database: &str) -> Result<(), ControlError> {
        self.command(database, "start")
    }

    pub fn stop(&self, database: &str) -> Result<(), ControlError> {
        self.command(database, "stop")
    }

    pub fn kill(&self, database: &str) -> Result<(), ControlError> {
        self.command(database, "kill")
    }

    pub fn create(&self, database: &str) -> Result<(), ControlError> {
        self.command(database, "create")
    }

    pub fn destroy(&self, database: &str) -> Result<(), ControlError> {
        self.command(database, "destroy")
    }

    /// Puts the database in maintenance mode.
    pub fn lock(&self, database: &str) -> Result<(), ControlError> {
        self.command(database, "lock")
    }

    pub fn release(&self, database: &str) -> Result<(), ControlError> {
        self.command(database, "release")
    }

    pub fn rename(&self, database: &str, new_name: &str) -> Result<(), ControlError> {
        self.command(database, &format!("name={new_name}"))
    }

    pub fn set_property(&self, database: &str, key: &str, value: &str) -> Result<(), ControlError> {
        self.command(database, &format!("{key}={value}"))
    }

    /// Resets a property to the daemon's default.
    pub fn inherit_property(&self, database: &str, key: &str) -> Result<(), ControlError> {
        self.command(database, &format!("{key}="))
    }

    pub fn get_properties(&self, database: &str) -> Result<Vec<(String, String)>, ControlError> {
        parse_properties(self.output(database, "get")?)
    }

    pub fn get_default_properties(&self) -> Result<Vec<(String, String)>, ControlError> {
        self.get_properties(DEFAULTS)
    }

    pub fn get_status(&self, database: &str) -> Result<StatusRecord, ControlError> {
        let lines = self.output(database, "status")?;
        match lines.as_slice() {
            [line] => Ok(StatusRecord::parse(line)?),
            _ => Err(ControlError::StatusCount {
                database: database.to_string(),
                found: lines.len(),
            }),
        }
    }

    pub fn get_all_statuses(&self) -> Result<Vec<StatusRecord>, ControlError> {
        self.output(ALL_DATABASES, "status")?
            .iter()
            .map(|line| StatusRecord::parse(line).map_err(ControlError::from))
            .collect()
    }

    pub fn get_all_neighbours(&self) -> Result<Vec<Neighbour>, ControlError> {
        let lines = self.output(NEIGHBOUR_TARGET, NEIGHBOUR_COMMAND)?;
        Ok(lines
            .iter()
            .filter_map(|line| {
                let neighbour = Neighbour::parse(line);
                if neighbour.is_none() {
                    warn!("discarding malformed neighbour line: {line}");
                }
                neighbour
            })
            .collect())
    }

    pub fn version(&self) -> Result<String, ControlError> {
        Ok(self.output(ALL_DATABASES, "version")?.join("\n"))
    }

    /// Path of the server binary the daemon starts.
    pub fn mserver(&self) -> Result<String, ControlError> {
        Ok(self.output(ALL_DATABASES, "mserver")?.join("\n"))
    }
}

/// Reads one line and checks it is the acceptance line. Returns the
/// offending line otherwise.
fn expect_ok<R: std::io::Read>(reader: &mut LineReader<R>) -> Result<(), String> {
    match reader.read_plain_line() {
        Ok(Some(line)) if line == ACCEPTED => Ok(()),
        Ok(Some(line)) => Err(line),
        Ok(None) => Err("connection closed by daemon".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_properties(lines: Vec<String>) -> Result<Vec<(String, String)>, ControlError> {
    lines
        .into_iter()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once('=') {
            Some((key, value)) => Ok((key.to_string(), value.to_string())),
            None => Err(ControlError::MalformedProperty(line)),
        })
        .collect()
}
