//! Relay configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tcprelay_core::{PumpConfig, RelayError, RelayResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// 0 disables the idle timeout.
    #[serde(default)]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_sessions: usize,
    #[serde(default = "default_true")]
    pub nodelay: bool,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            target: default_target(),
            dial_timeout_ms: default_dial_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            idle_timeout_secs: 0,
            buffer_size: default_buffer_size(),
            max_sessions: 0,
            nodelay: true,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8081".to_string()
}
fn default_target() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_dial_timeout_ms() -> u64 {
    1000
}
fn default_read_timeout_ms() -> u64 {
    1000
}
fn default_buffer_size() -> usize {
    16 * 1024
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_true() -> bool {
    true
}

/// Values given on the command line. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub target: Option<String>,
    pub dial_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub buffer_size: Option<usize>,
    pub max_sessions: Option<usize>,
}

/// Resolved relay configuration (validated, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub target: String,
    pub dial_timeout: Duration,
    /// Poll interval for every pump read and backpressured write.
    pub read_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub buffer_size: usize,
    /// 0 means unlimited.
    pub max_sessions: usize,
    pub nodelay: bool,
    pub shutdown_grace: Duration,
}

impl RelayConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load(config_path: Option<&Path>, overrides: CliOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config.relay, overrides)
    }

    /// Merge CLI overrides into a file section and validate the result.
    pub fn resolve(section: RelaySection, overrides: CliOverrides) -> RelayResult<Self> {
        let listen_str = overrides.listen.unwrap_or(section.listen);
        let target = overrides.target.unwrap_or(section.target);
        let dial_timeout_ms = overrides.dial_timeout_ms.unwrap_or(section.dial_timeout_ms);
        let read_timeout_ms = overrides.read_timeout_ms.unwrap_or(section.read_timeout_ms);
        let idle_timeout_secs = overrides
            .idle_timeout_secs
            .unwrap_or(section.idle_timeout_secs);
        let buffer_size = overrides.buffer_size.unwrap_or(section.buffer_size);
        let max_sessions = overrides.max_sessions.unwrap_or(section.max_sessions);

        let listen: SocketAddr = listen_str.parse().map_err(|e| {
            RelayError::Config(format!("invalid listen address {listen_str:?}: {e}"))
        })?;
        validate_target(&target)?;
        if dial_timeout_ms == 0 {
            return Err(RelayError::Config("dial_timeout_ms must be non-zero".into()));
        }
        if read_timeout_ms == 0 {
            return Err(RelayError::Config("read_timeout_ms must be non-zero".into()));
        }
        if buffer_size == 0 {
            return Err(RelayError::Config("buffer_size must be non-zero".into()));
        }

        Ok(Self {
            listen,
            target,
            dial_timeout: Duration::from_millis(dial_timeout_ms),
            read_timeout: Duration::from_millis(read_timeout_ms),
            idle_timeout: (idle_timeout_secs > 0).then(|| Duration::from_secs(idle_timeout_secs)),
            buffer_size,
            max_sessions,
            nodelay: section.nodelay,
            shutdown_grace: Duration::from_secs(section.shutdown_grace_secs),
        })
    }

    /// Pump tuning derived from this config.
    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            buffer_size: self.buffer_size,
            poll_interval: self.read_timeout,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// Check that `target` looks like `host:port`. Name resolution happens per
/// dial, not here.
fn validate_target(target: &str) -> RelayResult<()> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| RelayError::Config(format!("target {target:?} is not host:port")))?;
    if host.is_empty() || host == "[]" {
        return Err(RelayError::Config(format!("target {target:?} has an empty host")));
    }
    port.parse::<u16>()
        .map_err(|_| RelayError::Config(format!("target {target:?} has an invalid port")))?;
    Ok(())
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let cfg = RelayConfig::resolve(RelaySection::default(), CliOverrides::default()).unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:8081".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.target, "127.0.0.1:8080");
        assert_eq!(cfg.dial_timeout, Duration::from_secs(1));
        assert_eq!(cfg.read_timeout, Duration::from_secs(1));
        assert_eq!(cfg.idle_timeout, None);
        assert_eq!(cfg.max_sessions, 0);
        assert!(cfg.nodelay);
    }

    #[test]
    fn parse_partial_toml_config() {
        let toml_str = r#"
[relay]
target = "db.internal:5432"
idle_timeout_secs = 30
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(file.relay.target, "db.internal:5432");
        assert_eq!(file.relay.listen, "0.0.0.0:8081"); // default
        assert_eq!(file.relay.buffer_size, 16 * 1024); // default

        let cfg = RelayConfig::resolve(file.relay, CliOverrides::default()).unwrap();
        assert_eq!(cfg.idle_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn cli_overrides_win() {
        let section = RelaySection {
            target: "file-host:1".to_string(),
            max_sessions: 10,
            ..RelaySection::default()
        };
        let overrides = CliOverrides {
            target: Some("cli-host:2".to_string()),
            listen: Some("127.0.0.1:9000".to_string()),
            read_timeout_ms: Some(250),
            ..CliOverrides::default()
        };
        let cfg = RelayConfig::resolve(section, overrides).unwrap();
        assert_eq!(cfg.target, "cli-host:2");
        assert_eq!(cfg.listen.port(), 9000);
        assert_eq!(cfg.read_timeout, Duration::from_millis(250));
        assert_eq!(cfg.max_sessions, 10);
        assert_eq!(cfg.pump_config().poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn rejects_invalid_values() {
        let bad = |overrides: CliOverrides| {
            RelayConfig::resolve(RelaySection::default(), overrides).is_err()
        };
        assert!(bad(CliOverrides {
            listen: Some("not-an-addr".into()),
            ..CliOverrides::default()
        }));
        assert!(bad(CliOverrides {
            target: Some("no-port".into()),
            ..CliOverrides::default()
        }));
        assert!(bad(CliOverrides {
            target: Some(":8080".into()),
            ..CliOverrides::default()
        }));
        assert!(bad(CliOverrides {
            target: Some("host:99999".into()),
            ..CliOverrides::default()
        }));
        assert!(bad(CliOverrides {
            buffer_size: Some(0),
            ..CliOverrides::default()
        }));
        assert!(bad(CliOverrides {
            dial_timeout_ms: Some(0),
            ..CliOverrides::default()
        }));
    }

    #[test]
    fn accepts_ipv6_target() {
        assert!(validate_target("[::1]:8080").is_ok());
        assert!(validate_target("[]:8080").is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nlisten = \"127.0.0.1:7000\"\nmax_sessions = 3").unwrap();

        let cfg = RelayConfig::load(Some(file.path()), CliOverrides::default()).unwrap();
        assert_eq!(cfg.listen.port(), 7000);
        assert_eq!(cfg.max_sessions, 3);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = RelayConfig::load(
            Some(Path::new("/definitely/not/here/tcprelay.toml")),
            CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.target, "127.0.0.1:8080");
    }

    #[test]
    fn malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nmax_sessions = \"lots\"").unwrap();
        let err = RelayConfig::load(Some(file.path()), CliOverrides::default()).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/x/y.toml"), home.join("x/y.toml"));
        }
        assert_eq!(expand_tilde_str("/abs/path"), PathBuf::from("/abs/path"));
    }
}
