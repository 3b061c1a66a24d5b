use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const FILENAME: &str = "command_monitor.toml";

/// Upper bound for `poll_interval` and `shutdown_grace`.
const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// `~/.claude`, or `./.claude` if no home directory can be found.
fn claude_dir() -> PathBuf {
    home_dir().join(".claude")
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Static monitor settings, read once at startup.
///
/// Every key is optional in TOML:
///
/// ```toml
/// tool_command = "claude-code"
/// max_concurrent = 1
/// poll_interval = "2s"
/// shutdown_grace = "10s"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Queue written by the producer; only ever read here.
    pub queue_file: PathBuf,

    /// IDs already launched, owned by the monitor.
    pub processed_file: PathBuf,

    /// External tool, invoked as `<tool_command> -p <command>`.
    pub tool_command: String,

    /// Working directory for every launched job.
    pub working_dir: PathBuf,

    /// Ceiling on simultaneously running jobs. Must be at least 1.
    pub max_concurrent: usize,

    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long shutdown waits for each running job before terminating it.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Probe `<tool_command> --version` before polling.
    pub check_tool: bool,
}

impl Default for Config {
    fn default() -> Self {
        let dir = claude_dir();
        Self {
            queue_file: dir.join("command_queue.json"),
            processed_file: dir.join("processed_commands.json"),
            tool_command: "claude-code".into(),
            working_dir: home_dir(),
            max_concurrent: 1,
            poll_interval: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(10),
            check_tool: true,
        }
    }
}

impl Config {
    /// `~/.claude/command_monitor.toml`.
    pub fn default_path() -> PathBuf {
        claude_dir().join(FILENAME)
    }

    /// Load settings from `path`. A missing file yields the defaults;
    /// missing keys in an existing file are filled in via serde.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match fs::read_to_string(path) {
            Ok(contents) => toml::from_str::<Config>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.max_concurrent >= 1, "max_concurrent must be at least 1");
        ensure!(!self.poll_interval.is_zero(), "poll_interval must be non-zero");
        ensure!(self.poll_interval <= MAX_WAIT, "poll_interval must be at most 24h");
        ensure!(self.shutdown_grace <= MAX_WAIT, "shutdown_grace must be at most 24h");
        ensure!(!self.tool_command.is_empty(), "tool_command must not be empty");
        Ok(())
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
