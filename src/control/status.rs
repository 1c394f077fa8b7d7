//! Status records served by the daemon's `status` command.
//!
//! A record is a single line `sabdb:<version>:<fields>`, the fields comma
//! separated and strictly positional. Version 2 is the current format;
//! version 1 is still understood when reading.
use std::{fmt, str::FromStr};

use thiserror::Error;

const MAGIC: &str = "sabdb";
const CURRENT_VERSION: u32 = 2;
const SCENARIO_SEPARATOR: &str = "'";
/// Timestamp value meaning "never happened".
const NO_TIMESTAMP: i64 = -1;
/// Placeholder uri for version 1 records, which carry none.
pub const UNKNOWN_URI: &str = "unknown";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("string does not contain a magic: {0}")]
    MissingMagic(String),

    #[error("string is not a sabdb struct: {0}")]
    NotARecord(String),

    #[error("string does not contain a version number and fields: {0}")]
    MalformedHeader(String),

    #[error("string has unsupported version: {0}")]
    UnsupportedVersion(String),

    #[error("version {version} record needs {expected} fields, found {found}")]
    FieldCount {
        version: u32,
        expected: usize,
        found: usize,
    },

    #[error("invalid value for {name}: '{value}'")]
    InvalidField { name: &'static str, value: String },

    #[error("unknown database state: {0}")]
    InvalidState(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseState {
    Illegal,
    Running,
    Crashed,
    Inactive,
    Starting,
}

impl DatabaseState {
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => DatabaseState::Illegal,
            1 => DatabaseState::Running,
            2 => DatabaseState::Crashed,
            3 => DatabaseState::Inactive,
            4 => DatabaseState::Starting,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        match self {
            DatabaseState::Illegal => 0,
            DatabaseState::Running => 1,
            DatabaseState::Crashed => 2,
            DatabaseState::Inactive => 3,
            DatabaseState::Starting => 4,
        }
    }
}

impl fmt::Display for DatabaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatabaseState::Illegal => "illegal",
            DatabaseState::Running => "running",
            DatabaseState::Crashed => "crashed",
            DatabaseState::Inactive => "inactive",
            DatabaseState::Starting => "starting",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle and health snapshot of one managed database.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    pub name: String,
    pub uri: String,
    pub locked: bool,
    pub state: DatabaseState,
    pub scenarios: Vec<String>,
    pub start_count: i32,
    pub stop_count: i32,
    pub crash_count: i32,
    /// Uptimes in seconds.
    pub avg_uptime: i64,
    pub max_uptime: i64,
    pub min_uptime: i64,
    /// Unix timestamps; `None` when the event never happened.
    pub last_crash: Option<i64>,
    pub last_start: Option<i64>,
    pub last_stop: Option<i64>,
    pub crash_avg1: i32,
    pub crash_avg10: f64,
    pub crash_avg30: f64,
}

impl StatusRecord {
    pub fn parse(text: &str) -> Result<Self, StatusError> {
        let mut parts = text.splitn(3, ':');
        let magic = parts.next().unwrap_or_default();
        let (Some(version), Some(payload)) = (parts.next(), parts.next()) else {
            return Err(if text.contains(':') {
                StatusError::MalformedHeader(text.to_string())
            } else {
                StatusError::MissingMagic(text.to_string())
            });
        };
        if magic != MAGIC {
            return Err(StatusError::NotARecord(magic.to_string()));
        }

        let version = match version {
            "1" => 1,
            "2" => 2,
            other => return Err(StatusError::UnsupportedVersion(other.to_string())),
        };
        let expected = if version == 1 { 16 } else { 17 };
        let fields = payload.split(',').collect::<Vec<&str>>();
        if fields.len() != expected {
            return Err(StatusError::FieldCount {
                version,
                expected,
                found: fields.len(),
            });
        }

        let mut fields = fields.into_iter();
        // The length check above guarantees every positional read succeeds.
        let mut next = || fields.next().unwrap_or_default();

        let (name, uri) = if version == 1 {
            let path = next();
            let name = path.rsplit('/').next().unwrap_or(path);
            (name.to_string(), UNKNOWN_URI.to_string())
        } else {
            (next().to_string(), next().to_string())
        };
        let locked = number::<i32>("locked", next())? != 0;
        let state = number::<i32>("state", next())?;
        let state = DatabaseState::from_code(state).ok_or(StatusError::InvalidState(state))?;
        let scenarios = next()
            .split(SCENARIO_SEPARATOR)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if version == 1 {
            // connection count, no longer meaningful
            next();
        }

        let start_count = number("startcntr", next())?;
        let stop_count = number("stopcntr", next())?;
        let crash_count = number("crashcntr", next())?;
        let avg_uptime = number("avguptime", next())?;
        let max_uptime = number("maxuptime", next())?;
        let min_uptime = number("minuptime", next())?;
        let last_crash = timestamp("lastcrash", next())?;
        let last_start = timestamp("laststart", next())?;
        let last_stop = if version == 1 {
            None
        } else {
            timestamp("laststop", next())?
        };
        let crash_avg1 = crash_average_count(next())?;
        let crash_avg10 = number("crashavg10", next())?;
        let crash_avg30 = number("crashavg30", next())?;

        Ok(Self {
            name,
            uri,
            locked,
            state,
            scenarios,
            start_count,
            stop_count,
            crash_count,
            avg_uptime,
            max_uptime,
            min_uptime,
            last_crash,
            last_start,
            last_stop,
            crash_avg1,
            crash_avg10,
            crash_avg30,
        })
    }

    /// Serializes the record in the current format.
    pub fn to_wire(&self) -> String {
        let stamp = |t: Option<i64>| t.unwrap_or(NO_TIMESTAMP);
        format!(
            "{MAGIC}:{CURRENT_VERSION}:{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{:.6},{:.6}",
            self.name,
            self.uri,
            i32::from(self.locked),
            self.state.code(),
            self.scenarios.join(SCENARIO_SEPARATOR),
            self.start_count,
            self.stop_count,
            self.crash_count,
            self.avg_uptime,
            self.max_uptime,
            self.min_uptime,
            stamp(self.last_crash),
            stamp(self.last_start),
            stamp(self.last_stop),
            self.crash_avg1,
            self.crash_avg10,
            self.crash_avg30,
        )
    }

    /// Whether the most recent start did not crash within the last hour.
    pub fn last_start_succeeded(&self) -> bool {
        self.crash_avg1 == 0
    }
}

impl FromStr for StatusRecord {
    type Err = StatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StatusRecord::parse(s)
    }
}

fn number<T: FromStr>(name: &'static str, value: &str) -> Result<T, StatusError> {
    value.trim().parse().map_err(|_| StatusError::InvalidField {
        name,
        value: value.to_string(),
    })
}

fn timestamp(name: &'static str, value: &str) -> Result<Option<i64>, StatusError> {
    let stamp = number::<i64>(name, value)?;
    Ok((stamp != NO_TIMESTAMP).then_some(stamp))
}

// Written as an integer; a decimal rendering is accepted only when integral.
fn crash_average_count(value: &str) -> Result<i32, StatusError> {
    if let Ok(count) = number::<i32>("crashavg1", value) {
        return Ok(count);
    }
    let count = number::<f64>("crashavg1", value)?;
    if count.fract() != 0.0 || count < f64::from(i32::MIN) || count > f64::from(i32::MAX) {
        return Err(StatusError::InvalidField {
            name: "crashavg1",
            value: value.to_string(),
        });
    }
    Ok(count as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const V2: &str = "sabdb:2:demo,mapi:monetdb://db1:50000/demo,0,1,sql'mal,3,2,1,3600,7200,60,1700000000,1700003600,-1,0,0.100000,0.033333";
    const V1: &str = "sabdb:1:/var/dbfarm/demo,1,3,sql,12,3,2,1,3600,7200,60,-1,1700003600,1,0.5,0.25";

    #[test]
    fn parse_v2() {
        let record = StatusRecord::parse(V2).unwrap();

        assert_eq!(record.name, "demo");
        assert_eq!(record.uri, "mapi:monetdb://db1:50000/demo");
        assert!(!record.locked);
        assert_eq!(record.state, DatabaseState::Running);
        assert_eq!(record.scenarios, vec!["sql", "mal"]);
        assert_eq!(
            (record.start_count, record.stop_count, record.crash_count),
            (3, 2, 1)
        );
        assert_eq!(
            (record.avg_uptime, record.max_uptime, record.min_uptime),
            (3600, 7200, 60)
        );
        assert_eq!(record.last_crash, Some(1700000000));
        assert_eq!(record.last_start, Some(1700003600));
        assert_eq!(record.last_stop, None);
        assert_eq!(record.crash_avg1, 0);
        assert!((record.crash_avg10 - 0.1).abs() < 1e-9);
        assert!(record.last_start_succeeded());
    }

    #[test]
    fn parse_v1() {
        let record = StatusRecord::parse(V1).unwrap();

        assert_eq!(record.name, "demo");
        assert_eq!(record.uri, UNKNOWN_URI);
        assert!(record.locked);
        assert_eq!(record.state, DatabaseState::Inactive);
        assert_eq!(record.scenarios, vec!["sql"]);
        assert_eq!(record.start_count, 3);
        assert_eq!(record.last_crash, None);
        assert_eq!(record.last_stop, None);
        assert_eq!(record.crash_avg1, 1);
        assert!(!record.last_start_succeeded());
    }

    #[test]
    fn v2_last_stop_populated() {
        let line = V2.replace(",-1,0,", ",1700007200,0,");
        let record = StatusRecord::parse(&line).unwrap();

        assert_eq!(record.last_stop, Some(1700007200));
        assert_ne!(record.uri, UNKNOWN_URI);
    }

    #[test]
    fn field_count_must_match_version() {
        let inputs = vec![
            ("sabdb:1:a,0,1,,0,0,0,0,0,0,0,-1,-1,0,0", 1, 16, 15),
            ("sabdb:1:a,0,1,,0,0,0,0,0,0,0,-1,-1,0,0,0,0", 1, 16, 17),
            ("sabdb:2:a,u,0,1,,0,0,0,0,0,0,-1,-1,-1,0,0", 2, 17, 16),
            ("sabdb:2:a,u,0,1,,0,0,0,0,0,0,-1,-1,-1,0,0,0,0", 2, 17, 18),
        ];

        for (line, version, expected, found) in inputs {
            assert_eq!(
                StatusRecord::parse(line),
                Err(StatusError::FieldCount {
                    version,
                    expected,
                    found
                }),
                "{line}"
            );
        }
    }

    #[test]
    fn header_errors() {
        assert_eq!(
            StatusRecord::parse("garbage"),
            Err(StatusError::MissingMagic("garbage".into()))
        );
        assert_eq!(
            StatusRecord::parse("sabdb:2"),
            Err(StatusError::MalformedHeader("sabdb:2".into()))
        );
        assert_eq!(
            StatusRecord::parse("other:2:x"),
            Err(StatusError::NotARecord("other".into()))
        );
        assert_eq!(
            StatusRecord::parse("sabdb:3:x"),
            Err(StatusError::UnsupportedVersion("3".into()))
        );
    }

    #[test]
    fn invalid_values() {
        let bad_state = V2.replace(",0,1,sql", ",0,9,sql");
        assert_eq!(
            StatusRecord::parse(&bad_state),
            Err(StatusError::InvalidState(9))
        );

        let bad_counter = V2.replace(",3,2,1,", ",x,2,1,");
        assert!(matches!(
            StatusRecord::parse(&bad_counter),
            Err(StatusError::InvalidField { name: "startcntr", .. })
        ));
    }

    #[test]
    fn empty_scenarios() {
        let record = StatusRecord::parse("sabdb:2:a,u,0,3,,0,0,0,0,0,0,-1,-1,-1,0,0,0").unwrap();
        assert!(record.scenarios.is_empty());
        assert_eq!(record.state, DatabaseState::Inactive);
    }

    #[test]
    fn wire_format() {
        let record = StatusRecord::parse(V2).unwrap();
        assert_eq!(record.to_wire(), V2);

        let upgraded = StatusRecord::parse(V1).unwrap().to_wire();
        assert_eq!(
            upgraded,
            "sabdb:2:demo,unknown,1,3,sql,3,2,1,3600,7200,60,-1,1700003600,-1,1,0.500000,0.250000"
        );
        assert_eq!(upgraded.parse::<StatusRecord>().unwrap().name, "demo");
    }

    #[test]
    fn crash_average_accepts_decimal() {
        let line = V2.replace(",-1,0,0.1", ",-1,2.000000,0.1");
        assert_eq!(StatusRecord::parse(&line).unwrap().crash_avg1, 2);
    }

    #[test]
    fn fractional_crash_count_rejected() {
        let line = V2.replace(",-1,0,0.1", ",-1,2.9,0.1");
        assert_eq!(
            StatusRecord::parse(&line),
            Err(StatusError::InvalidField {
                name: "crashavg1",
                value: "2.9".into(),
            })
        );
    }
}
