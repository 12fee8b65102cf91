//! Client configuration.
//!
//! Loaded from TOML, layered over defaults: every section and field is
//! optional. Durations are written as human strings ("1500ms", "2s",
//! "1m").
//!
//! ```toml
//! seeds = ["10.0.0.1:3000", "10.0.0.2:3000"]
//! racks = [1]
//!
//! [policy]
//! replica = "prefer_rack"
//! max_retries = 2
//! total_timeout = "1s"
//!
//! [shm]
//! enabled = true
//! on_attach_failure = "local"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spire_cluster::{PoolConfig, ReplicaPolicy, ShmSettings, DEFAULT_PARTITIONS};

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` addresses used to discover the cluster.
    pub seeds: Vec<String>,
    /// Client rack ids in preference order, for `prefer_rack` routing.
    pub racks: Vec<i32>,
    pub policy: PolicyConfig,
    pub pool: PoolSection,
    pub tend: TendConfig,
    pub tls: TlsConfig,
    pub auth: AuthConfig,
    pub shm: ShmConfig,
    pub event_loops: EventLoopConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seeds: vec!["127.0.0.1:3000".into()],
            racks: Vec::new(),
            policy: PolicyConfig::default(),
            pool: PoolSection::default(),
            tend: TendConfig::default(),
            tls: TlsConfig::default(),
            auth: AuthConfig::default(),
            shm: ShmConfig::default(),
            event_loops: EventLoopConfig::default(),
        }
    }
}

/// Per-command retry and timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub replica: ReplicaPolicy,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Upper bound for any single socket read or write.
    #[serde(with = "duration_str")]
    pub socket_timeout: Duration,
    /// Deadline for the whole command, retries included.
    #[serde(with = "duration_str")]
    pub total_timeout: Duration,
    #[serde(with = "duration_str")]
    pub sleep_between_retries: Duration,
    /// Requests larger than this many bytes are sent compressed. Zero
    /// disables compression.
    pub compress_threshold: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            replica: ReplicaPolicy::Sequence,
            max_retries: 2,
            socket_timeout: Duration::from_secs(1),
            total_timeout: Duration::from_secs(2),
            sleep_between_retries: Duration::ZERO,
            compress_threshold: 0,
        }
    }
}

/// Connection limits per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub min_connections: usize,
    pub max_connections: usize,
    /// Async connections per node, per event loop.
    pub max_async_connections: usize,
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 100,
            max_async_connections: 100,
            idle_timeout: Duration::from_secs(55),
        }
    }
}

impl PoolSection {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_size: self.min_connections,
            max_size: self.max_connections,
            idle_timeout: (!self.idle_timeout.is_zero()).then_some(self.idle_timeout),
        }
    }
}

/// Cluster tending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TendConfig {
    #[serde(with = "duration_str")]
    pub interval: Duration,
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    /// Tend intervals per error-rate window.
    pub error_rate_window: u32,
    /// Command errors a node may accumulate per window before commands
    /// skip it. Zero disables the limit.
    pub max_error_rate: u32,
    /// Consecutive failed refreshes before a node is dropped.
    pub failure_limit: u32,
}

impl Default for TendConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            error_rate_window: 1,
            max_error_rate: 100,
            failure_limit: 5,
        }
    }
}

/// TLS for every connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Name expected in server certificates. Nodes that advertise their
    /// own TLS name override it.
    pub name: Option<String>,
    /// PEM file with CA certificates. The system trust store is used
    /// when absent.
    pub ca_cert: Option<PathBuf>,
    /// Skip certificate verification. Development only.
    pub insecure: bool,
}

/// Credentials for secured clusters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub user: Option<String>,
    /// The hashed credential sent with AUTHENTICATE.
    pub credential: Option<String>,
}

impl AuthConfig {
    /// User and credential, when both are configured.
    pub fn credentials(&self) -> Option<(&str, &[u8])> {
        match (&self.user, &self.credential) {
            (Some(user), Some(cred)) => Some((user.as_str(), cred.as_bytes())),
            _ => None,
        }
    }
}

/// What to do when the shared segment can't be created or attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachFailure {
    /// Fail cluster creation.
    #[default]
    Error,
    /// Log a warning and tend locally.
    Local,
}

/// Cross-process topology sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmConfig {
    pub enabled: bool,
    pub key: i32,
    pub max_nodes: u32,
    pub max_namespaces: u32,
    #[serde(with = "duration_str")]
    pub takeover_threshold: Duration,
    pub on_attach_failure: AttachFailure,
}

impl Default for ShmConfig {
    fn default() -> Self {
        let settings = ShmSettings::default();
        Self {
            enabled: false,
            key: settings.key,
            max_nodes: settings.max_nodes,
            max_namespaces: settings.max_namespaces,
            takeover_threshold: settings.takeover_threshold,
            on_attach_failure: AttachFailure::Error,
        }
    }
}

impl ShmConfig {
    pub fn settings(&self) -> ShmSettings {
        ShmSettings {
            key: self.key,
            max_nodes: self.max_nodes,
            max_namespaces: self.max_namespaces,
            n_partitions: DEFAULT_PARTITIONS,
            takeover_threshold: self.takeover_threshold,
            remove_on_drop: false,
        }
    }
}

/// Async command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopConfig {
    /// Event loop threads. Zero disables async commands.
    pub count: usize,
    /// Send commands back to back on one connection per node.
    pub pipelining: bool,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            count: 1,
            pipelining: false,
        }
    }
}

impl ClientConfig {
    /// Reads a TOML file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML, e.g. to print a template.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects settings that can't work together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.seeds.is_empty() {
            return invalid("at least one seed is required".into());
        }
        if self.pool.max_connections == 0 {
            return invalid("pool.max_connections must be at least 1".into());
        }
        if self.pool.min_connections > self.pool.max_connections {
            return invalid(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            ));
        }
        if self.event_loops.count > 0 && self.pool.max_async_connections == 0 {
            return invalid("pool.max_async_connections must be at least 1".into());
        }
        if self.policy.total_timeout.is_zero() || self.policy.socket_timeout.is_zero() {
            return invalid("policy timeouts must be non-zero".into());
        }
        if self.policy.socket_timeout > self.policy.total_timeout {
            return invalid(format!(
                "policy.socket_timeout ({}) exceeds policy.total_timeout ({})",
                format_duration(self.policy.socket_timeout),
                format_duration(self.policy.total_timeout)
            ));
        }
        if self.tend.interval.is_zero() {
            return invalid("tend.interval must be non-zero".into());
        }
        if self.tend.error_rate_window == 0 {
            return invalid("tend.error_rate_window must be at least 1".into());
        }
        if self.shm.enabled && (self.shm.max_nodes == 0 || self.shm.max_namespaces == 0) {
            return invalid("shm.max_nodes and shm.max_namespaces must be at least 1".into());
        }
        if self.auth.user.is_some() != self.auth.credential.is_some() {
            return invalid("auth.user and auth.credential must be set together".into());
        }
        Ok(())
    }
}

/// Parses a human-readable duration: a number followed by `ms`, `s`,
/// `m` or `h`. A bare number is milliseconds.
///
/// - "250ms" → 250ms
/// - "2s" → 2s
/// - "1m" → 60s
/// - "1500" → 1.5s
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration string".into());
    }

    let (num, unit_ms) = if let Some(n) = input.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = input.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = input.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = input.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (input, 1)
    };

    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: '{input}'"))?;
    value
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration overflow: '{input}'"))
}

/// Renders a duration in the largest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms != 0 && ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms != 0 && ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms != 0 && ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{ms}ms")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 1500 ").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("99999999999999999h").is_err());
    }

    #[test]
    fn format_picks_exact_unit() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(2)), "2s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::ZERO), "0ms");
    }

    #[test]
    fn defaults_validate() {
        ClientConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_template_round_trips() {
        let cfg = ClientConfig::default();
        let text = cfg.to_toml().unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
seeds = ["10.0.0.1:3000"]
racks = [2, 1]

[policy]
replica = "prefer_rack"
total_timeout = "5s"

[shm]
enabled = true
on_attach_failure = "local"
"#
        )
        .unwrap();

        let cfg = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.seeds, vec!["10.0.0.1:3000"]);
        assert_eq!(cfg.racks, vec![2, 1]);
        assert_eq!(cfg.policy.replica, ReplicaPolicy::PreferRack);
        assert_eq!(cfg.policy.total_timeout, Duration::from_secs(5));
        assert_eq!(cfg.policy.max_retries, 2);
        assert!(cfg.shm.enabled);
        assert_eq!(cfg.shm.on_attach_failure, AttachFailure::Local);
        assert_eq!(cfg.pool.max_connections, 100);
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = ClientConfig::from_file("/nonexistent/spire.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn validate_rejects_inconsistent_settings() {
        let mut cfg = ClientConfig::default();
        cfg.seeds.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = ClientConfig::default();
        cfg.pool.min_connections = 10;
        cfg.pool.max_connections = 5;
        assert!(cfg.validate().is_err());

        let mut cfg = ClientConfig::default();
        cfg.pool.max_connections = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ClientConfig::default();
        cfg.policy.socket_timeout = Duration::from_secs(10);
        assert!(cfg.validate().is_err());

        let mut cfg = ClientConfig::default();
        cfg.auth.user = Some("admin".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_duration_in_file_is_parse_error() {
        let err = toml::from_str::<ClientConfig>("[policy]\ntotal_timeout = \"soon\"\n").unwrap_err();
        assert!(err.to_string().contains("soon"));
    }
}
