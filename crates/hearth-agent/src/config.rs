use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use regex::Regex;

const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_STATUS_PORT: u16 = 25565;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 5000;
// 1.21; servers answer status pings regardless of the version we claim.
const DEFAULT_PROTOCOL_VERSION: i32 = 767;

pub const DEFAULT_READY_PATTERN: &str =
    r#"^\[\d{2}:\d{2}:\d{2}\] \[Server thread/INFO\]: Done.*"$"#;
pub const DEFAULT_STOPPING_PATTERN: &str =
    r"^\[\d{2}:\d{2}:\d{2}\] \[Server thread/INFO\]: Stopping (the )?server";

/// Everything needed to launch and stop the game process.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub game_dir: PathBuf,
    pub executable_name: String,
    pub start_command: Vec<String>,
    pub stop_command: String,
    pub stop_timeout: Duration,
    pub ready_pattern: Regex,
    pub stopping_pattern: Regex,
}

impl SupervisorConfig {
    /// The file that must exist before a start is allowed.
    pub fn executable_path(&self) -> PathBuf {
        self.game_dir.join(&self.executable_name)
    }
}

#[derive(Debug, Clone)]
pub struct StatusProbeConfig {
    /// Host reported back to clients.
    pub public_host: String,
    /// Host the probe actually dials; the game normally runs next to us.
    pub connect_host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub protocol_version: i32,
}

#[derive(Debug, Clone)]
pub struct GameConfig {
    pub supervisor: SupervisorConfig,
    pub status: StatusProbeConfig,
    pub history_max_lines: usize,
}

impl GameConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = EnvLookup::new(get);

        let game_dir = PathBuf::from(
            env.string("HEARTH_GAME_DIR")
                .unwrap_or_else(|| "./data/game".to_string()),
        );
        let executable_name = env
            .string("HEARTH_GAME_FILE")
            .unwrap_or_else(|| "server.jar".to_string());
        let start_command = split_command_line(
            &env.string("HEARTH_GAME_START_COMMAND")
                .unwrap_or_else(|| format!("java -jar {executable_name} nogui")),
        );

        let ready_pattern = env
            .string("HEARTH_GAME_READY_PATTERN")
            .unwrap_or_else(|| DEFAULT_READY_PATTERN.to_string());
        let ready_pattern = Regex::new(&ready_pattern).context("invalid HEARTH_GAME_READY_PATTERN")?;
        let stopping_pattern = env
            .string("HEARTH_GAME_STOPPING_PATTERN")
            .unwrap_or_else(|| DEFAULT_STOPPING_PATTERN.to_string());
        let stopping_pattern =
            Regex::new(&stopping_pattern).context("invalid HEARTH_GAME_STOPPING_PATTERN")?;

        let supervisor = SupervisorConfig {
            game_dir,
            executable_name,
            start_command,
            stop_command: env
                .string("HEARTH_GAME_STOP_COMMAND")
                .unwrap_or_else(|| "stop".to_string()),
            stop_timeout: Duration::from_millis(
                env.u64("HEARTH_GAME_STOP_TIMEOUT_MS")
                    .map(|v| v.clamp(1000, 10 * 60 * 1000))
                    .unwrap_or(DEFAULT_STOP_TIMEOUT_MS),
            ),
            ready_pattern,
            stopping_pattern,
        };

        let public_host = env
            .string("HEARTH_STATUS_HOST")
            .unwrap_or_else(|| "localhost".to_string());
        let status = StatusProbeConfig {
            connect_host: env
                .string("HEARTH_STATUS_CONNECT_HOST")
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            public_host,
            port: env
                .u64("HEARTH_STATUS_PORT")
                .and_then(|v| u16::try_from(v).ok())
                .filter(|v| *v != 0)
                .unwrap_or(DEFAULT_STATUS_PORT),
            connect_timeout: Duration::from_millis(
                env.u64("HEARTH_STATUS_CONNECT_TIMEOUT_MS")
                    .map(|v| v.clamp(100, 60_000))
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            read_timeout: Duration::from_millis(
                env.u64("HEARTH_STATUS_READ_TIMEOUT_MS")
                    .map(|v| v.clamp(100, 60_000))
                    .unwrap_or(DEFAULT_READ_TIMEOUT_MS),
            ),
            protocol_version: env
                .string("HEARTH_STATUS_PROTOCOL_VERSION")
                .and_then(|v| v.parse::<i32>().ok())
                .unwrap_or(DEFAULT_PROTOCOL_VERSION),
        };

        Ok(Self {
            supervisor,
            status,
            history_max_lines: env
                .usize("HEARTH_LOG_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(DEFAULT_LOG_MAX_LINES),
        })
    }
}

/// Typed reads over a variable source; blank values count as unset.
pub struct EnvLookup<F: Fn(&str) -> Option<String>>(F);

impl<F: Fn(&str) -> Option<String>> EnvLookup<F> {
    pub fn new(get: F) -> Self {
        Self(get)
    }

    pub fn string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn u64(&self, name: &str) -> Option<u64> {
        self.string(name).and_then(|v| v.parse::<u64>().ok())
    }

    pub fn usize(&self, name: &str) -> Option<usize> {
        self.string(name).and_then(|v| v.parse::<usize>().ok())
    }
}

/// Splits a configured command line on whitespace. No quoting support.
pub fn split_command_line(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() || parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn cfg(vars: &[(&str, &str)]) -> anyhow::Result<GameConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GameConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let c = cfg(&[]).unwrap();
        assert_eq!(c.supervisor.stop_timeout, Duration::from_secs(10));
        assert_eq!(c.supervisor.stop_command, "stop");
        assert_eq!(
            c.supervisor.start_command,
            vec!["java", "-jar", "server.jar", "nogui"]
        );
        assert_eq!(c.status.port, 25565);
        assert_eq!(c.status.connect_timeout, Duration::from_secs(2));
        assert_eq!(c.history_max_lines, 1000);
        assert!(
            c.supervisor
                .ready_pattern
                .is_match(r#"[12:00:01] [Server thread/INFO]: Done (3.2s)! For help, type "help""#)
        );
    }

    #[test]
    fn clamps_out_of_range_values() {
        let c = cfg(&[
            ("HEARTH_LOG_MAX_LINES", "5"),
            ("HEARTH_GAME_STOP_TIMEOUT_MS", "1"),
            ("HEARTH_STATUS_PORT", "70000"),
        ])
        .unwrap();
        assert_eq!(c.history_max_lines, 100);
        assert_eq!(c.supervisor.stop_timeout, Duration::from_millis(1000));
        assert_eq!(c.status.port, 25565);
    }

    #[test]
    fn executable_path_joins_dir_and_file() {
        let c = cfg(&[("HEARTH_GAME_DIR", "/srv/game"), ("HEARTH_GAME_FILE", "paper.jar")]).unwrap();
        assert_eq!(c.supervisor.executable_path(), PathBuf::from("/srv/game/paper.jar"));
        assert_eq!(c.supervisor.start_command[2], "paper.jar");
    }

    #[test]
    fn rejects_invalid_ready_pattern() {
        let err = cfg(&[("HEARTH_GAME_READY_PATTERN", "Done(")]).unwrap_err();
        assert!(format_error_chain(&err).contains("HEARTH_GAME_READY_PATTERN"));
    }

    #[test]
    fn error_chain_dedupes_repeated_messages() {
        let err = anyhow::anyhow!("inner").context("inner").context("outer");
        assert_eq!(format_error_chain(&err), "outer: inner");
    }
}
