use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{var} is required for role {role}")]
    Missing { var: &'static str, role: Role },
}

/// Which components this node hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Every component in one process.
    All,
    Metadata,
    /// Reservation store and the availability engine on top of it.
    Reservation,
    /// Orchestrator only; talks to a metadata node and a reservation node.
    Cubicle,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::All => "all",
            Role::Metadata => "metadata",
            Role::Reservation => "reservation",
            Role::Cubicle => "cubicle",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Role::All => 5433,
            Role::Metadata => 50051,
            Role::Reservation => 50052,
            Role::Cubicle => 50053,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Role::All),
            "metadata" => Ok(Role::Metadata),
            "reservation" | "reservations" => Ok(Role::Reservation),
            "cubicle" | "cubicles" => Ok(Role::Cubicle),
            other => Err(format!(
                "unknown role {other} (expected all, metadata, reservation or cubicle)"
            )),
        }
    }
}

/// `host:port` of another node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr {
    pub host: String,
    pub port: u16,
}

impl FromStr for RemoteAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| "expected host:port".to_string())?;
        if host.is_empty() {
            return Err("empty host".into());
        }
        let port = port.parse().map_err(|e| format!("bad port: {e}"))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// How long cancelled reservations are kept before being purged.
    pub retention_ms: Ms,
    pub request_timeout: Duration,
    pub metadata_addr: Option<RemoteAddr>,
    pub reservation_addr: Option<RemoteAddr>,
    pub metrics_port: Option<u16>,
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
    }
}

fn positive<T: PartialOrd + Default>(
    var: &'static str,
    value: T,
    raw: impl fmt::Display,
) -> Result<T, ConfigError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            var,
            value: raw.to_string(),
            reason: "must be positive".into(),
        })
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let role: Role = parse(&get, "CUBICLE_ROLE")?.unwrap_or(Role::All);
        let port = parse(&get, "CUBICLE_PORT")?.unwrap_or_else(|| role.default_port());
        let max_connections: usize = parse(&get, "CUBICLE_MAX_CONNECTIONS")?.unwrap_or(256);
        let compact_threshold: u64 = parse(&get, "CUBICLE_COMPACT_THRESHOLD")?.unwrap_or(1000);
        let retention_ms: Ms = parse(&get, "CUBICLE_RETENTION_MS")?.unwrap_or(604_800_000);
        let timeout_ms: u64 = parse(&get, "CUBICLE_REQUEST_TIMEOUT_MS")?.unwrap_or(2000);

        let config = Self {
            role,
            bind: get("CUBICLE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            data_dir: get("CUBICLE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: get("CUBICLE_PASSWORD").unwrap_or_else(|| "cubicle".into()),
            max_connections: positive("CUBICLE_MAX_CONNECTIONS", max_connections, max_connections)?,
            compact_threshold: positive(
                "CUBICLE_COMPACT_THRESHOLD",
                compact_threshold,
                compact_threshold,
            )?,
            retention_ms: positive("CUBICLE_RETENTION_MS", retention_ms, retention_ms)?,
            request_timeout: Duration::from_millis(positive(
                "CUBICLE_REQUEST_TIMEOUT_MS",
                timeout_ms,
                timeout_ms,
            )?),
            metadata_addr: parse(&get, "CUBICLE_METADATA_ADDR")?,
            reservation_addr: parse(&get, "CUBICLE_RESERVATION_ADDR")?,
            metrics_port: parse(&get, "CUBICLE_METRICS_PORT")?,
        };

        if role == Role::Cubicle {
            if config.metadata_addr.is_none() {
                return Err(ConfigError::Missing {
                    var: "CUBICLE_METADATA_ADDR",
                    role,
                });
            }
            if config.reservation_addr.is_none() {
                return Err(ConfigError::Missing {
                    var: "CUBICLE_RESERVATION_ADDR",
                    role,
                });
            }
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
