//! Configuration module for linepulse.
//!
//! Settings come from three layers, highest precedence first:
//! environment overrides, an optional TOML file, built-in defaults.
//! The CLI picks the mode and the file; the mode-specific settings are
//! resolved after logging is up so bad override values can be reported.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Fixed address the server listens on.
pub const SERVER_LISTEN_ADDR: &str = "0.0.0.0:8989";

/// Server the client dials when `SERVER_ADDR` is not set.
pub const DEFAULT_SERVER_ADDR: &str = "localhost:8989";

pub const DEFAULT_SEND_PERIOD: Duration = Duration::from_secs(5);

pub const DEFAULT_LOGGEN_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_LOGGEN_MSG_LENGTH: usize = 100;
pub const DEFAULT_LOGGEN_MSG_COUNT: usize = 1;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "linepulse")]
#[command(author = "linepulse authors")]
#[command(version = "0.1.0")]
#[command(about = "TCP line server, periodic client and log generator", long_about = None)]
pub struct CliArgs {
    /// Which role to run
    #[arg(value_enum)]
    pub mode: Mode,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Process role selected on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Accept connections and log every received line
    Server,
    /// Send a timestamped line to the server every period
    Client,
    /// Print random log lines on a timer
    Loggen,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub loggen: LoggenSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[client]` table. Durations stay as strings so a bad value can fall back
/// with a warning instead of failing the whole file.
#[derive(Debug, Deserialize, Default)]
pub struct ClientSection {
    pub server_addr: Option<String>,
    pub send_period: Option<String>,
}

/// `[loggen]` table
#[derive(Debug, Deserialize, Default)]
pub struct LoggenSection {
    pub period: Option<String>,
    pub msg_length: Option<usize>,
    pub msg_count: Option<usize>,
    pub seed: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// CLI plus file, before any mode-specific resolution.
#[derive(Debug)]
pub struct Config {
    pub mode: Mode,
    pub log_level: String,
    pub file: TomlConfig,
}

impl Config {
    /// Parse CLI args and load the optional TOML file.
    /// `--log-level` takes precedence over the file's `[logging] level`.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let file = match cli.config {
            Some(ref path) => load_file(path)?,
            None => TomlConfig::default(),
        };

        Ok(Config {
            mode: cli.mode,
            log_level: cli
                .log_level
                .unwrap_or_else(|| file.logging.level.clone()),
            file,
        })
    }
}

fn load_file(path: &Path) -> Result<TomlConfig, ConfigError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
    toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
}

/// Reads a process environment variable; empty counts as unset.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Resolved client settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_addr: String,
    pub send_period: Duration,
}

impl ClientConfig {
    pub fn resolve<E>(file: &ClientSection, env: E) -> Self
    where
        E: Fn(&str) -> Option<String>,
    {
        let server_addr = match env("SERVER_ADDR") {
            Some(addr) => addr,
            None => match &file.server_addr {
                Some(addr) => {
                    info!("SERVER_ADDR not set, using config file value: {addr}");
                    addr.clone()
                }
                None => {
                    info!("SERVER_ADDR not set, using default: {DEFAULT_SERVER_ADDR}");
                    DEFAULT_SERVER_ADDR.to_string()
                }
            },
        };

        let send_period = resolve_period(
            "SEND_PERIOD",
            env("SEND_PERIOD"),
            file.send_period.as_deref(),
            DEFAULT_SEND_PERIOD,
        );

        ClientConfig {
            server_addr,
            send_period,
        }
    }
}

/// Resolved log generator settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggenConfig {
    pub period: Duration,
    pub msg_length: usize,
    pub msg_count: usize,
    /// `None` seeds from OS entropy.
    pub seed: Option<u64>,
}

impl LoggenConfig {
    pub fn resolve<E>(file: &LoggenSection, env: E) -> Self
    where
        E: Fn(&str) -> Option<String>,
    {
        let period = resolve_period(
            "LOGGEN_PERIOD",
            env("LOGGEN_PERIOD"),
            file.period.as_deref(),
            DEFAULT_LOGGEN_PERIOD,
        );
        let msg_length = override_value(
            "LOGGEN_MSG_LENGTH",
            env("LOGGEN_MSG_LENGTH"),
            file.msg_length.unwrap_or(DEFAULT_LOGGEN_MSG_LENGTH),
            usize::from_str,
        );
        let msg_count = override_value(
            "LOGGEN_MSG_COUNT",
            env("LOGGEN_MSG_COUNT"),
            file.msg_count.unwrap_or(DEFAULT_LOGGEN_MSG_COUNT),
            usize::from_str,
        );
        let seed = match env("LOGGEN_SEED") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(seed) => Some(seed),
                Err(e) => {
                    warn!(
                        variable = "LOGGEN_SEED",
                        value = %raw,
                        "Invalid LOGGEN_SEED '{raw}', using {:?}. Error: {e}",
                        file.seed
                    );
                    file.seed
                }
            },
            None => file.seed,
        };

        LoggenConfig {
            period,
            msg_length,
            msg_count,
            seed,
        }
    }
}

/// File value (falling back to `default` if malformed), then env override.
fn resolve_period(
    key: &str,
    env_value: Option<String>,
    file_value: Option<&str>,
    default: Duration,
) -> Duration {
    let base = match file_value {
        Some(raw) => match parse_period(raw) {
            Ok(period) => period,
            Err(e) => {
                warn!(
                    setting = key,
                    value = %raw,
                    "Invalid {key} '{raw}' in config file, using default {default:?}. Error: {e}"
                );
                default
            }
        },
        None => default,
    };

    override_value(key, env_value, base, parse_period)
}

/// Parses `raw` if present; on failure logs a warning and keeps `fallback`.
fn override_value<T, E, F>(key: &str, raw: Option<String>, fallback: T, parse: F) -> T
where
    T: fmt::Debug,
    E: fmt::Display,
    F: Fn(&str) -> Result<T, E>,
{
    let Some(raw) = raw else {
        return fallback;
    };

    match parse(&raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                variable = key,
                value = %raw,
                "Invalid {key} '{raw}', using default {fallback:?}. Error: {e}"
            );
            fallback
        }
    }
}

/// Parse a period: a duration string that must be greater than zero.
pub fn parse_period(s: &str) -> Result<Duration, DurationError> {
    let d = parse_duration(s)?;
    if d.is_zero() {
        return Err(DurationError::NotPositive);
    }
    Ok(d)
}

/// Parse a duration string such as `5s`, `250ms`, `1.5s` or `1h30m`.
///
/// Accepted units: `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`. Every number needs
/// a unit, except a bare `0`.
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }

    let rest = match s.as_bytes()[0] {
        b'-' => return Err(DurationError::NotPositive),
        b'+' => &s[1..],
        _ => s,
    };
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(DurationError::Invalid(s.to_string()));
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = rest;

    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number = &rest[..num_end];
        if number.is_empty() || number == "." {
            return Err(DurationError::Invalid(s.to_string()));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| DurationError::Invalid(s.to_string()))?;

        rest = &rest[num_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        let scale = match unit {
            "" => return Err(DurationError::MissingUnit(s.to_string())),
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            other => return Err(DurationError::UnknownUnit(other.to_string())),
        };
        total_nanos += value * scale;
        rest = &rest[unit_end..];
    }

    if total_nanos > u64::MAX as f64 {
        return Err(DurationError::Invalid(s.to_string()));
    }
    Ok(Duration::from_nanos(total_nanos as u64))
}

/// Duration string errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurationError {
    Empty,
    NotPositive,
    Invalid(String),
    MissingUnit(String),
    UnknownUnit(String),
}

impl fmt::Display for DurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurationError::Empty => write!(f, "empty duration"),
            DurationError::NotPositive => write!(f, "duration must be greater than zero"),
            DurationError::Invalid(s) => write!(f, "invalid duration \"{s}\""),
            DurationError::MissingUnit(s) => write!(f, "missing unit in duration \"{s}\""),
            DurationError::UnknownUnit(u) => write!(f, "unknown unit \"{u}\" in duration"),
        }
    }
}

impl std::error::Error for DurationError {}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    /// Run `f` with a subscriber that records everything it logs.
    fn with_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();

        let value = tracing::subscriber::with_default(subscriber, f);
        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        (value, output)
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert!(config.client.server_addr.is_none());
        assert!(config.loggen.seed.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [client]
            server_addr = "10.0.0.5:9000"
            send_period = "250ms"

            [loggen]
            period = "2s"
            msg_length = 40
            msg_count = 3
            seed = 7

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.client.server_addr.as_deref(), Some("10.0.0.5:9000"));
        assert_eq!(config.client.send_period.as_deref(), Some("250ms"));
        assert_eq!(config.loggen.msg_length, Some(40));
        assert_eq!(config.loggen.msg_count, Some(3));
        assert_eq!(config.loggen.seed, Some(7));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_mode_is_required_and_checked() {
        assert!(CliArgs::try_parse_from(["linepulse"]).is_err());
        assert!(CliArgs::try_parse_from(["linepulse", "bogus"]).is_err());

        let cli = CliArgs::try_parse_from(["linepulse", "client"]).unwrap();
        assert_eq!(cli.mode, Mode::Client);
        assert!(cli.config.is_none());

        let cli = CliArgs::try_parse_from([
            "linepulse",
            "--config",
            "pulse.toml",
            "--log-level",
            "debug",
            "loggen",
        ])
        .unwrap();
        assert_eq!(cli.mode, Mode::Loggen);
        assert_eq!(cli.config, Some(PathBuf::from("pulse.toml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_server_addr_source_is_logged() {
        let (config, logs) =
            with_logs(|| ClientConfig::resolve(&ClientSection::default(), env_from(&[])));
        assert_eq!(config.server_addr, DEFAULT_SERVER_ADDR);
        assert!(logs.contains("SERVER_ADDR not set, using default: localhost:8989"), "{logs}");

        let file = ClientSection {
            server_addr: Some("filehost:1".to_string()),
            send_period: None,
        };
        let (config, logs) = with_logs(|| ClientConfig::resolve(&file, env_from(&[])));
        assert_eq!(config.server_addr, "filehost:1");
        assert!(logs.contains("using config file value: filehost:1"), "{logs}");
        assert!(!logs.contains("using default"), "{logs}");
    }

    #[test]
    fn test_invalid_override_logs_warning() {
        let env = env_from(&[("SEND_PERIOD", "soon"), ("LOGGEN_MSG_COUNT", "many")]);

        let (config, logs) = with_logs(|| ClientConfig::resolve(&ClientSection::default(), &env));
        assert_eq!(config.send_period, DEFAULT_SEND_PERIOD);
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("Invalid SEND_PERIOD 'soon', using default 5s"), "{logs}");

        let (config, logs) = with_logs(|| LoggenConfig::resolve(&LoggenSection::default(), &env));
        assert_eq!(config.msg_count, DEFAULT_LOGGEN_MSG_COUNT);
        assert!(logs.contains("Invalid LOGGEN_MSG_COUNT 'many', using default 1"), "{logs}");

        let (_, logs) = with_logs(|| ClientConfig::resolve(&ClientSection::default(), env_from(&[])));
        assert!(!logs.contains("WARN"), "{logs}");
    }

    #[test]
    fn test_client_defaults_when_unset() {
        let config = ClientConfig::resolve(&ClientSection::default(), env_from(&[]));
        assert_eq!(config.server_addr, "localhost:8989");
        assert_eq!(config.send_period, Duration::from_secs(5));
    }

    #[test]
    fn test_client_env_overrides() {
        let env = env_from(&[("SERVER_ADDR", "example.net:1234"), ("SEND_PERIOD", "1m30s")]);
        let config = ClientConfig::resolve(&ClientSection::default(), env);
        assert_eq!(config.server_addr, "example.net:1234");
        assert_eq!(config.send_period, Duration::from_secs(90));
    }

    #[test]
    fn test_invalid_send_period_falls_back() {
        for bad in ["five seconds", "5", "0s", "-5s", "5parsecs"] {
            let env = env_from(&[("SEND_PERIOD", bad)]);
            let config = ClientConfig::resolve(&ClientSection::default(), env);
            assert_eq!(config.send_period, DEFAULT_SEND_PERIOD, "input {bad:?}");
        }
    }

    #[test]
    fn test_env_wins_over_file_and_bad_env_keeps_file() {
        let file = ClientSection {
            server_addr: Some("filehost:1".to_string()),
            send_period: Some("2s".to_string()),
        };

        let config = ClientConfig::resolve(&file, env_from(&[("SEND_PERIOD", "3s")]));
        assert_eq!(config.server_addr, "filehost:1");
        assert_eq!(config.send_period, Duration::from_secs(3));

        let config = ClientConfig::resolve(&file, env_from(&[("SEND_PERIOD", "soon")]));
        assert_eq!(config.send_period, Duration::from_secs(2));
    }

    #[test]
    fn test_bad_file_period_uses_default() {
        let file = ClientSection {
            server_addr: None,
            send_period: Some("often".to_string()),
        };
        let config = ClientConfig::resolve(&file, env_from(&[]));
        assert_eq!(config.send_period, DEFAULT_SEND_PERIOD);
    }

    #[test]
    fn test_loggen_resolution() {
        let config = LoggenConfig::resolve(&LoggenSection::default(), env_from(&[]));
        assert_eq!(config.period, Duration::from_secs(1));
        assert_eq!(config.msg_length, 100);
        assert_eq!(config.msg_count, 1);
        assert_eq!(config.seed, None);

        let env = env_from(&[
            ("LOGGEN_PERIOD", "500ms"),
            ("LOGGEN_MSG_LENGTH", "-3"),
            ("LOGGEN_MSG_COUNT", "4"),
            ("LOGGEN_SEED", "99"),
        ]);
        let config = LoggenConfig::resolve(&LoggenSection::default(), env);
        assert_eq!(config.period, Duration::from_millis(500));
        assert_eq!(config.msg_length, 100);
        assert_eq!(config.msg_count, 4);
        assert_eq!(config.seed, Some(99));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("1h2m3s").unwrap(), Duration::from_secs(3723));
        assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("7ns").unwrap(), Duration::from_nanos(7));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_errors() {
        assert_eq!(parse_duration(""), Err(DurationError::Empty));
        assert_eq!(parse_duration("-1s"), Err(DurationError::NotPositive));
        assert!(matches!(parse_duration("12"), Err(DurationError::MissingUnit(_))));
        assert!(matches!(parse_duration("3d"), Err(DurationError::UnknownUnit(_))));
        assert!(matches!(parse_duration("s"), Err(DurationError::Invalid(_))));
        assert_eq!(parse_period("0s"), Err(DurationError::NotPositive));
    }
}
