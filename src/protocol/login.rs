//! MAPI login: challenge/response authentication and redirect handling.
//!
//! After connecting, the server sends a challenge line of the form
//! `salt:servertype:protocol:hashes:endian:pwhash:`. The client answers with
//! `BIG:<user>:{ALGO}<digest>:<language>:<database>:` and then reads up to the
//! prompt. Info lines become warnings, redirect lines tell the client to go
//! elsewhere, either through a full reconnect (`mapi:monetdb://`) or inline on
//! the same connection when a proxy (`mapi:merovingian://`) answers.
use std::net::TcpStream;

use log::{debug, info};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use super::{
    BlockStream, LineReader, LineType, LineWriter, MclError, Session, Transport, TransportError,
    error::{ServerError, ServerMessage},
    transport,
};

/// Only protocol version understood by this client.
pub const PROTOCOL_VERSION: u32 = 9;

pub const DEFAULT_PORT: u16 = 50000;

const REDIRECT_PREFIX: &str = "mapi:";
const MEROVINGIAN: &str = "merovingian";

/// Connection and login settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Database to connect to; empty for the server's default.
    pub database: String,
    pub language: String,
    /// Overrides the hash list offered by the server, comma separated.
    pub hash: Option<String>,
    pub follow_redirects: bool,
    /// Maximum number of logins, including redirects, before giving up.
    pub redirect_ttl: u32,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        ConnectConfig {
            host: "localhost".to_owned(),
            port: DEFAULT_PORT,
            user: "monetdb".to_owned(),
            password: "monetdb".to_owned(),
            database: String::new(),
            language: "sql".to_owned(),
            hash: None,
            follow_redirects: true,
            redirect_ttl: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha512,
    Sha384,
    Sha256,
    Sha1,
    Md5,
}

impl HashAlgorithm {
    /// Strongest first.
    pub const PREFERENCE: [HashAlgorithm; 5] = [
        HashAlgorithm::Sha512,
        HashAlgorithm::Sha384,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha1,
        HashAlgorithm::Md5,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        HashAlgorithm::PREFERENCE
            .into_iter()
            .find(|algo| algo.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha512 => "SHA512",
            HashAlgorithm::Sha384 => "SHA384",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Md5 => "MD5",
        }
    }

    /// Lower-case hex digest over the concatenation of `parts`.
    pub fn hex_digest(self, parts: &[&[u8]]) -> String {
        match self {
            HashAlgorithm::Sha512 => hex_digest::<Sha512>(parts),
            HashAlgorithm::Sha384 => hex_digest::<Sha384>(parts),
            HashAlgorithm::Sha256 => hex_digest::<Sha256>(parts),
            HashAlgorithm::Sha1 => hex_digest::<Sha1>(parts),
            HashAlgorithm::Md5 => hex_digest::<Md5>(parts),
        }
    }
}

fn hex_digest<D: Digest>(parts: &[&[u8]]) -> String {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Builds the login response for `challenge`.
pub fn challenge_response(challenge: &str, config: &ConnectConfig) -> Result<String, MclError> {
    let tokens = challenge.split(':').collect::<Vec<&str>>();
    if tokens.len() <= 4 {
        return Err(MclError::Login(format!(
            "server challenge string unusable, too few tokens: {challenge}"
        )));
    }

    let salt = tokens[0];
    let server_type = tokens[1];
    let version = tokens[2]
        .trim()
        .parse::<u32>()
        .map_err(|_| MclError::Login(format!("protocol version unparseable: {}", tokens[2])))?;
    if version != PROTOCOL_VERSION {
        return Err(MclError::Login(format!(
            "unsupported protocol version: {version}"
        )));
    }

    let password_algo = tokens.get(5).copied().unwrap_or_default();
    let password_algo = HashAlgorithm::from_name(password_algo).ok_or_else(|| {
        MclError::Login(format!("unsupported password hash: {password_algo}"))
    })?;
    let mut password = password_algo.hex_digest(&[config.password.as_bytes()]);
    let mut user = config.user.as_str();

    // A proxying daemon gets masked credentials unless we talk to it directly.
    if server_type == MEROVINGIAN && config.language != "control" {
        user = MEROVINGIAN;
        password = MEROVINGIAN.to_owned();
    }

    let offered = config.hash.as_deref().unwrap_or(tokens[3]).to_uppercase();
    let offered = offered
        .split([',', ' '])
        .filter(|h| !h.is_empty())
        .collect::<Vec<&str>>();
    let algo = HashAlgorithm::PREFERENCE
        .into_iter()
        .find(|algo| offered.contains(&algo.name()))
        .ok_or_else(|| MclError::Login(format!("no supported password hashes in {}", tokens[3])))?;
    let digest = algo.hex_digest(&[password.as_bytes(), salt.as_bytes()]);

    match tokens[4] {
        "BIG" | "LIT" => {}
        other => return Err(MclError::Login(format!("invalid byte-order: {other}"))),
    }

    Ok(format!(
        "BIG:{user}:{{{}}}{digest}:{}:{}:",
        algo.name(),
        config.language,
        config.database
    ))
}

/// Result of a successful login exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Logged in; the session is ready.
    Ready { warnings: Vec<String> },
    /// The server sent the client to another server.
    Reconnect {
        host: String,
        port: Option<u16>,
        warnings: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RedirectTarget {
    Inline,
    Server { host: String, port: Option<u16> },
}

/// Interprets a redirect URI, applying its arguments to `config`.
fn follow_redirect(
    redirect: &str,
    config: &mut ConnectConfig,
    warnings: &mut Vec<String>,
) -> Result<RedirectTarget, MclError> {
    let uri = redirect
        .strip_prefix(REDIRECT_PREFIX)
        .ok_or_else(|| MclError::Login(format!("unsupported redirect: {redirect}")))?;
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| MclError::Login(format!("malformed redirect: {redirect}")))?;
    let (location, query) = rest.split_once('?').unwrap_or((rest, ""));

    for arg in query.split('&').filter(|a| !a.is_empty()) {
        match arg.split_once('=') {
            Some(("database", value)) => {
                if value != config.database {
                    warnings.push(format!("redirect points to different database: {value}"));
                    config.database = value.to_string();
                }
            }
            Some(("language", value)) => {
                warnings.push(format!("redirect specifies use of different language: {value}"));
                config.language = value.to_string();
            }
            Some(("user", value)) => {
                if value != config.user {
                    warnings.push(format!(
                        "ignoring different username '{value}' set by redirect"
                    ));
                }
            }
            Some(("password", _)) => {
                warnings.push("ignoring different password set by redirect".to_string());
            }
            Some((key, _)) if !key.is_empty() => {
                warnings.push(format!("ignoring unknown argument '{key}' from redirect"));
            }
            _ => warnings.push(format!("ignoring illegal argument from redirect: {arg}")),
        }
    }

    match scheme {
        "merovingian" => Ok(RedirectTarget::Inline),
        "monetdb" => {
            let (authority, path) = location.split_once('/').unwrap_or((location, ""));
            let database = path.trim();
            if !database.is_empty() && database != config.database {
                warnings.push(format!("redirect points to different database: {database}"));
                config.database = database.to_string();
            }

            let (host, port) = match authority.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse::<u16>().map_err(|_| {
                        MclError::Login(format!("invalid port in redirect: {redirect}"))
                    })?;
                    (host, Some(port))
                }
                None => (authority, None),
            };
            Ok(RedirectTarget::Server {
                host: host.to_string(),
                port,
            })
        }
        _ => Err(MclError::Login(format!(
            "unsupported scheme in redirect: {redirect}"
        ))),
    }
}

/// Runs the login exchange on a freshly connected stream.
pub(crate) fn authenticate<T: Transport>(
    reader: &mut LineReader<T>,
    writer: &mut LineWriter<T>,
    config: &mut ConnectConfig,
    ttl: &mut u32,
) -> Result<LoginOutcome, MclError> {
    let mut warnings = Vec::new();

    loop {
        if *ttl == 0 {
            return Err(MclError::Login(
                "maximum number of redirects reached, aborting connection attempt".to_string(),
            ));
        }
        *ttl -= 1;

        let challenge = reader
            .read_line()?
            .ok_or_else(|| TransportError::lost("end of stream before login challenge"))?;
        if let Some(error) = reader.wait_for_prompt()? {
            return Err(MclError::Server(error));
        }
        writer.write_line(&challenge_response(&challenge, config)?)?;

        let mut errors = Vec::new();
        let mut redirects = Vec::new();
        loop {
            let line = reader
                .read_line()?
                .ok_or_else(|| TransportError::lost("end of stream during login"))?;
            match reader.line_type() {
                Some(LineType::Prompt) => break,
                Some(LineType::Error) => errors.push(ServerMessage::parse(&line[1..])),
                Some(LineType::Info) => warnings.push(line[1..].to_string()),
                Some(LineType::Redirect) => redirects.push(line[1..].to_string()),
                _ => debug!("ignoring login line: {line}"),
            }
        }

        if !errors.is_empty() {
            return Err(MclError::Server(ServerError::new(errors)));
        }
        let Some(redirect) = redirects.first() else {
            return Ok(LoginOutcome::Ready { warnings });
        };
        if !config.follow_redirects {
            let all = redirects
                .iter()
                .map(|r| format!("[{r}]"))
                .collect::<Vec<_>>();
            return Err(MclError::Redirect(all.join(" ")));
        }

        match follow_redirect(redirect, config, &mut warnings)? {
            RedirectTarget::Inline => debug!("proxy redirect, logging in again: {redirect}"),
            RedirectTarget::Server { host, port } => {
                return Ok(LoginOutcome::Reconnect {
                    host,
                    port,
                    warnings,
                });
            }
        }
    }
}

impl<T: Transport> Session<T> {
    /// Logs in on this session's connection. `ttl` counts the logins left
    /// across redirects.
    pub fn login(
        &mut self,
        config: &mut ConnectConfig,
        ttl: &mut u32,
    ) -> Result<LoginOutcome, MclError> {
        let outcome = authenticate(&mut self.reader, &mut self.writer, config, ttl);
        if outcome.is_err() {
            self.abort();
        }
        outcome
    }
}

/// Connects and logs in over block-mode TCP, reconnecting on redirects.
/// Returns the session and the warnings collected on the way.
pub fn connect(
    mut config: ConnectConfig,
) -> Result<(Session<BlockStream<TcpStream>>, Vec<String>), MclError> {
    let mut ttl = config.redirect_ttl;
    let mut warnings = Vec::new();
    let mut host = config.host.clone();
    let mut port = config.port;

    loop {
        info!("connecting to {host}:{port}");
        let stream = transport::connect((host.as_str(), port))?;
        let mut session = Session::new(BlockStream::new(stream))?;

        match session.login(&mut config, &mut ttl)? {
            LoginOutcome::Ready { warnings: more } => {
                warnings.extend(more);
                info!("logged in to {host}:{port} as {}", config.user);
                return Ok((session, warnings));
            }
            LoginOutcome::Reconnect {
                host: next_host,
                port: next_port,
                warnings: more,
            } => {
                warnings.extend(more);
                let next_port = next_port.unwrap_or(port);
                warnings.push(format!(
                    "redirect by {host}:{port} to {next_host}:{next_port}"
                ));
                session.abort();
                host = next_host;
                port = next_port;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::{SessionState, transport::mock::MockStream};

    use super::*;

    const CHALLENGE: &str = "s4lt:mserver:9:RIPEMD160,SHA256,SHA1,MD5:LIT:SHA512:";

    fn expected_response(user: &str, password: &str, language: &str, database: &str) -> String {
        let pw = HashAlgorithm::Sha512.hex_digest(&[password.as_bytes()]);
        let digest = HashAlgorithm::Sha256.hex_digest(&[pw.as_bytes(), b"s4lt"]);
        format!("BIG:{user}:{{SHA256}}{digest}:{language}:{database}:")
    }

    #[test]
    fn known_digests() {
        assert_eq!(
            HashAlgorithm::Md5.hex_digest(&[b""]),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            HashAlgorithm::Sha1.hex_digest(&[b"abc"]),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            HashAlgorithm::Sha256.hex_digest(&[b"a", b"bc"]),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn response_uses_strongest_offered_hash() {
        let config = ConnectConfig {
            database: "demo".into(),
            ..Default::default()
        };

        let response = challenge_response(CHALLENGE, &config).unwrap();
        assert_eq!(response, expected_response("monetdb", "monetdb", "sql", "demo"));
    }

    #[test]
    fn hash_override() {
        let config = ConnectConfig {
            hash: Some("md5".into()),
            ..Default::default()
        };

        let response = challenge_response(CHALLENGE, &config).unwrap();
        assert!(response.starts_with("BIG:monetdb:{MD5}"));
    }

    #[test]
    fn merovingian_masks_credentials() {
        let challenge = "s4lt:merovingian:9:SHA1:BIG:SHA512:";
        let config = ConnectConfig::default();

        let response = challenge_response(challenge, &config).unwrap();
        let digest = HashAlgorithm::Sha1.hex_digest(&[b"merovingian", b"s4lt"]);
        assert_eq!(response, format!("BIG:merovingian:{{SHA1}}{digest}:sql::"));
    }

    #[test]
    fn challenge_errors() {
        let config = ConnectConfig::default();
        let inputs = vec![
            ("s4lt:mserver:9:SHA1", "too few tokens"),
            ("s4lt:mserver:x:SHA1:LIT:SHA512:", "unparseable"),
            ("s4lt:mserver:8:SHA1:LIT:SHA512:", "unsupported protocol version"),
            ("s4lt:mserver:9:SHA1:LIT:RIPEMD160:", "unsupported password hash"),
            ("s4lt:mserver:9:RIPEMD160:LIT:SHA512:", "no supported password hashes"),
            ("s4lt:mserver:9:SHA1:MIXED:SHA512:", "invalid byte-order"),
        ];

        for (challenge, expected) in inputs {
            let err = challenge_response(challenge, &config).unwrap_err();
            assert!(err.to_string().contains(expected), "{challenge}: {err}");
        }
    }

    #[test]
    fn login_success_collects_warnings() {
        let input = format!("{CHALLENGE}\n.\n#server is tired\n.\n");
        let stream = MockStream::new(input);
        let mut session = Session::new(stream.clone()).unwrap();
        let mut config = ConnectConfig::default();
        let mut ttl = 10;

        let outcome = session.login(&mut config, &mut ttl).unwrap();
        assert_eq!(
            outcome,
            LoginOutcome::Ready {
                warnings: vec!["server is tired".into()]
            }
        );
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(
            stream.written_str(),
            format!("{}\n", expected_response("monetdb", "monetdb", "sql", ""))
        );
        assert_eq!(ttl, 9);
    }

    #[test]
    fn login_error_closes_session() {
        let input = format!("{CHALLENGE}\n.\n!InvalidCredentialsException:checkCredentials:invalid credentials for user 'monetdb'\n.\n");
        let stream = MockStream::new(input);
        let mut session = Session::new(stream.clone()).unwrap();

        let err = session
            .login(&mut ConnectConfig::default(), &mut 10)
            .unwrap_err();
        assert!(matches!(err, MclError::Server(ref e) if e.message().contains("invalid credentials")));
        assert_eq!(session.state(), SessionState::Disabled);
        assert!(stream.is_closed());
    }

    #[test]
    fn inline_redirect_logs_in_again() {
        let input = format!(
            "{CHALLENGE}\n.\n^mapi:merovingian://proxy?database=other\n.\n{CHALLENGE}\n.\n.\n"
        );
        let stream = MockStream::new(input);
        let mut session = Session::new(stream.clone()).unwrap();
        let mut config = ConnectConfig::default();
        let mut ttl = 10;

        let outcome = session.login(&mut config, &mut ttl).unwrap();
        assert_eq!(
            outcome,
            LoginOutcome::Ready {
                warnings: vec!["redirect points to different database: other".into()]
            }
        );
        assert_eq!(config.database, "other");
        assert_eq!(ttl, 8);
        assert_eq!(
            stream.written_str(),
            format!(
                "{}\n{}\n",
                expected_response("monetdb", "monetdb", "sql", ""),
                expected_response("monetdb", "monetdb", "sql", "other")
            )
        );
    }

    #[test]
    fn server_redirect_requests_reconnect() {
        let input = format!("{CHALLENGE}\n.\n^mapi:monetdb://db.example.com:50001/sales?user=x\n.\n");
        let stream = MockStream::new(input);
        let mut session = Session::new(stream).unwrap();
        let mut config = ConnectConfig::default();

        let outcome = session.login(&mut config, &mut 10).unwrap();
        assert_eq!(
            outcome,
            LoginOutcome::Reconnect {
                host: "db.example.com".into(),
                port: Some(50001),
                warnings: vec![
                    "ignoring different username 'x' set by redirect".into(),
                    "redirect points to different database: sales".into(),
                ],
            }
        );
        assert_eq!(config.database, "sales");
    }

    #[test]
    fn redirects_refused_when_not_following() {
        let input = format!("{CHALLENGE}\n.\n^mapi:monetdb://a:1/x\n^mapi:monetdb://b:2/x\n.\n");
        let stream = MockStream::new(input);
        let mut session = Session::new(stream).unwrap();
        let mut config = ConnectConfig {
            follow_redirects: false,
            ..Default::default()
        };

        let err = session.login(&mut config, &mut 10).unwrap_err();
        assert_eq!(
            err.to_string(),
            "the server sent a redirect for this connection: [mapi:monetdb://a:1/x] [mapi:monetdb://b:2/x]"
        );
    }

    #[test]
    fn redirect_loop_is_bounded() {
        let hop = format!("{CHALLENGE}\n.\n^mapi:merovingian://proxy\n.\n");
        let stream = MockStream::new(hop.repeat(3));
        let mut session = Session::new(stream).unwrap();

        let err = session
            .login(&mut ConnectConfig::default(), &mut 2)
            .unwrap_err();
        assert!(err.to_string().contains("maximum number of redirects"));
    }
}
