//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command line** — positional `REMOTE`, `--tag`, `--debug`
//! 2. **Environment variables** — `DOCKD_REMOTE`, `DOCKD_IDENTITY`
//! 3. **Config file** — path via `--config <path>`, or `dockd.toml` in CWD
//! 4. **Compiled defaults** — see each field's default value below
//!
//! Everything is read once at startup and never reloaded.
//!
//! ```toml
//! [remote]
//! address = "secret@controller.internal:10002"
//!
//! [device]
//! identity = "win-build-07"        # default: <platform>-<hostname>
//! tags = ["gpu", "east"]
//!
//! [server]
//! control_listen = "0.0.0.0:10002"
//! relay_listen = "0.0.0.0:7001"
//!
//! [executor]
//! candidates = ["c:\\windows\\sysnative\\windowspowershell\\v1.0\\powershell.exe"]
//! policy_args = ["-ExecutionPolicy", "remotesigned", "-File"]
//! scripts_dir = "C:\\dockd\\scripts"   # default: scripts/ next to the binary
//! script_extension = "ps1"
//! # Not shipped with dockd: install a helper that downloads, gunzips and
//! # extracts the tarball URL it is given. Default: fetch-tar next to the binary.
//! fetch_helper = "C:\\dockd\\fetch-tar.cmd"
//!
//! [tunnel]
//! heartbeat_interval_secs = 30
//!
//! [logging]
//! level = "info"
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

/// Port the controller listens on when the remote address omits one.
pub const DEFAULT_REMOTE_PORT: u16 = 10002;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the controller lives.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// `[key@]host[:port]`. Override with `DOCKD_REMOTE` or the positional arg.
    #[serde(default = "default_remote")]
    pub address: String,
}

/// Identity announced to the controller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfig {
    /// Explicit identity. When absent, derived from the platform and hostname.
    pub identity: Option<String>,
    /// Extra capability tags appended after the platform tag.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Local listeners.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Control endpoint: identification string, health, inbound tunnel upgrades.
    #[serde(default = "default_control_listen")]
    pub control_listen: String,
    /// Artifact relay endpoint.
    #[serde(default = "default_relay_listen")]
    pub relay_listen: String,
}

/// Local script executor settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Executor binaries to try, first existing wins.
    #[serde(default = "default_candidates")]
    pub candidates: Vec<String>,
    /// Arguments placed before the script path.
    #[serde(default = "default_policy_args")]
    pub policy_args: Vec<String>,
    /// Directory holding the service action scripts.
    pub scripts_dir: Option<String>,
    /// Extension appended to a script name to form its file name.
    #[serde(default = "default_script_extension")]
    pub script_extension: String,
    /// Helper handed to the `sync` script for fetching the artifact tarball.
    /// dockd only passes the path along; the helper itself is installed
    /// separately.
    pub fetch_helper: Option<String>,
}

/// Tunnel session tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Seconds between keep-alive pings (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `--debug` and `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_remote() -> String {
    format!("localhost:{DEFAULT_REMOTE_PORT}")
}
fn default_control_listen() -> String {
    "0.0.0.0:10002".to_string()
}
fn default_relay_listen() -> String {
    "0.0.0.0:7001".to_string()
}
fn default_candidates() -> Vec<String> {
    vec![
        r"c:\windows\sysnative\windowspowershell\v1.0\powershell.exe".to_string(),
        r"c:\windows\system32\windowspowershell\v1.0\powershell.exe".to_string(),
    ]
}
fn default_policy_args() -> Vec<String> {
    ["-ExecutionPolicy", "remotesigned", "-File"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}
fn default_script_extension() -> String {
    "ps1".to_string()
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            address: default_remote(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_listen: default_control_listen(),
            relay_listen: default_relay_listen(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            candidates: default_candidates(),
            policy_args: default_policy_args(),
            scripts_dir: None,
            script_extension: default_script_extension(),
            fetch_helper: None,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `dockd.toml` in the
    /// current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new("dockd.toml").exists() => Self::from_file(Path::new("dockd.toml"))?,
            None => Config::default(),
        };

        if let Ok(remote) = std::env::var("DOCKD_REMOTE") {
            config.remote.address = remote;
        }
        if let Ok(identity) = std::env::var("DOCKD_IDENTITY") {
            config.device.identity = Some(identity);
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(path.display().to_string(), e))
    }

    /// Parsed controller endpoint.
    pub fn remote_endpoint(&self) -> Result<RemoteEndpoint, ConfigError> {
        self.remote.address.parse()
    }

    /// Identity announced in the handshake and the `origin` header.
    pub fn identity(&self) -> String {
        self.device
            .identity
            .clone()
            .unwrap_or_else(|| format!("{}-{}", platform_prefix(), hostname()))
    }

    /// Capability tags: the platform tag first, then configured extras.
    pub fn tags(&self) -> Vec<String> {
        let mut tags = vec![std::env::consts::OS.to_string()];
        for tag in &self.device.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags
    }

    /// Relay listen address, parsed.
    pub fn relay_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .relay_listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(self.server.relay_listen.clone()))
    }

    /// Control listen address, parsed.
    pub fn control_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .control_listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(self.server.control_listen.clone()))
    }

    /// Scripts directory, defaulting to `scripts/` beside the running binary.
    pub fn scripts_dir(&self) -> PathBuf {
        match self.executor.scripts_dir {
            Some(ref dir) => PathBuf::from(dir),
            None => install_dir().join("scripts"),
        }
    }

    /// Tarball fetch helper passed to the `sync` script.
    pub fn fetch_helper(&self) -> PathBuf {
        match self.executor.fetch_helper {
            Some(ref helper) => PathBuf::from(helper),
            None => install_dir().join("fetch-tar"),
        }
    }
}

/// Directory containing the running executable, or `.` when unknown.
fn install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn platform_prefix() -> &'static str {
    match std::env::consts::OS {
        "windows" => "win",
        other => other,
    }
}

/// Best-effort hostname without touching platform APIs.
fn hostname() -> String {
    ["COMPUTERNAME", "HOSTNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

/// The controller address: `host`, `port` and an optional key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
    pub key: Option<String>,
}

impl RemoteEndpoint {
    /// `host:port`, as used for the TCP connect and the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for RemoteEndpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidRemote(s.to_string());
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix("http://").unwrap_or(trimmed);
        let trimmed = trimmed.trim_end_matches('/');

        let (key, hostport) = match trimmed.rsplit_once('@') {
            Some((k, rest)) if !k.is_empty() => (Some(k.to_string()), rest),
            Some(_) => return Err(invalid()),
            None => (None, trimmed),
        };

        let (host, port) = match hostport.rsplit_once(':') {
            Some((h, p)) => (h, p.parse::<u16>().map_err(|_| invalid())?),
            None => (hostport, DEFAULT_REMOTE_PORT),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
            key,
        })
    }
}

/// Fatal startup problems.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    Read(String, std::io::Error),
    /// The config file is not valid TOML for [`Config`].
    Parse(String, toml::de::Error),
    /// The remote address is malformed.
    InvalidRemote(String),
    /// A listen address is not a socket address.
    InvalidListen(String),
    /// None of the executor candidates exist on this host.
    ExecutorNotFound(Vec<String>),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(p, e) => write!(f, "Failed to read config file {p}: {e}"),
            ConfigError::Parse(p, e) => write!(f, "Failed to parse config file {p}: {e}"),
            ConfigError::InvalidRemote(r) => write!(f, "Invalid remote address: {r:?}"),
            ConfigError::InvalidListen(l) => write!(f, "Invalid listen address: {l:?}"),
            ConfigError::ExecutorNotFound(c) => {
                write!(f, "Script executor not found (tried {})", c.join(", "))
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_host_only() {
        let r: RemoteEndpoint = "controller".parse().unwrap();
        assert_eq!(r.host, "controller");
        assert_eq!(r.port, DEFAULT_REMOTE_PORT);
        assert!(r.key.is_none());
    }

    #[test]
    fn test_remote_with_key_and_port() {
        let r: RemoteEndpoint = "s3cret@10.0.0.5:9000".parse().unwrap();
        assert_eq!(r.host, "10.0.0.5");
        assert_eq!(r.port, 9000);
        assert_eq!(r.key.as_deref(), Some("s3cret"));
        assert_eq!(r.authority(), "10.0.0.5:9000");
    }

    #[test]
    fn test_remote_http_prefix() {
        let r: RemoteEndpoint = "http://hub:10002/".parse().unwrap();
        assert_eq!(r.host, "hub");
        assert_eq!(r.port, 10002);
    }

    #[test]
    fn test_remote_invalid() {
        assert!("hub:notaport".parse::<RemoteEndpoint>().is_err());
        assert!(":10002".parse::<RemoteEndpoint>().is_err());
        assert!("@hub".parse::<RemoteEndpoint>().is_err());
    }

    #[test]
    fn test_tags_platform_first_and_deduped() {
        let mut config = Config::default();
        config.device.tags = vec![
            "gpu".to_string(),
            std::env::consts::OS.to_string(),
            "gpu".to_string(),
        ];
        assert_eq!(config.tags(), vec![std::env::consts::OS.to_string(), "gpu".to_string()]);
    }

    #[test]
    fn test_explicit_identity_wins() {
        let mut config = Config::default();
        config.device.identity = Some("win-build-07".to_string());
        assert_eq!(config.identity(), "win-build-07");
    }

    #[test]
    fn test_fetch_helper_default_and_override() {
        let mut config = Config::default();
        let default = config.fetch_helper();
        assert_eq!(default.file_name().and_then(|n| n.to_str()), Some("fetch-tar"));
        assert_eq!(default.parent(), Some(install_dir().as_path()));

        config.executor.fetch_helper = Some("/usr/local/bin/fetch-tar.sh".to_string());
        assert_eq!(config.fetch_helper(), PathBuf::from("/usr/local/bin/fetch-tar.sh"));
    }

    #[test]
    fn test_parse_toml_sections() {
        let config: Config = toml::from_str(
            r#"
            [remote]
            address = "hub:1234"

            [device]
            tags = ["east"]

            [executor]
            candidates = ["/bin/sh"]
            policy_args = []
            script_extension = "sh"
            "#,
        )
        .unwrap();
        assert_eq!(config.remote_endpoint().unwrap().port, 1234);
        assert_eq!(config.executor.candidates, vec!["/bin/sh".to_string()]);
        assert!(config.executor.policy_args.is_empty());
        assert_eq!(config.server.relay_listen, "0.0.0.0:7001");
        assert_eq!(config.tunnel.heartbeat_interval_secs, 30);
        assert_eq!(config.relay_addr().unwrap().port(), 7001);
    }
}
