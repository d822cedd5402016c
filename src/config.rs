use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure that can be loaded from CLI, config file, or environment
///
/// Example configuration file content
/// # RTMP playout configuration
///
/// # Server configuration
/// listen_on_port = 5000
/// workspace = "./data"
///
/// # Encoder configuration
/// ffmpeg_path = "/usr/bin/ffmpeg"
/// grace_timeout_ms = 5000
/// startup_probe_ms = 3000
/// stderr_tail_bytes = 8192
///
/// # Loop safeguard
/// failure_threshold = 3
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Port the control API listens on
    #[arg(short, long, default_value_t = 5000)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Working directory for the store, media files and backups
    #[arg(short = 'w', long, default_value = ".")]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Configuration file path (overrides all other arguments)
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Encoder executable
    #[arg(long, default_value = "ffmpeg")]
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// How long a stopping encoder may take to quit before it is killed
    #[arg(long, default_value_t = 5000)]
    #[serde(default = "default_grace_timeout_ms")]
    pub grace_timeout_ms: u64,

    /// How long a fresh encoder must keep running to be considered live
    #[arg(long, default_value_t = 3000)]
    #[serde(default = "default_startup_probe_ms")]
    pub startup_probe_ms: u64,

    /// Consecutive immediate failures after which loop playback gives up
    #[arg(long, default_value_t = 3)]
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Bytes of encoder stderr kept for diagnostics
    #[arg(long, default_value_t = 8192)]
    #[serde(default = "default_stderr_tail_bytes")]
    pub stderr_tail_bytes: usize,

    /// Timeout for the encoder availability check
    #[arg(long, default_value_t = 5000)]
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on_port: default_port(),
            workspace: default_workspace(),
            config: None,
            ffmpeg_path: default_ffmpeg_path(),
            grace_timeout_ms: default_grace_timeout_ms(),
            startup_probe_ms: default_startup_probe_ms(),
            failure_threshold: default_failure_threshold(),
            stderr_tail_bytes: default_stderr_tail_bytes(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> anyhow::Result<Self> {
        // First parse CLI args
        let mut config = Config::parse();

        // If a config file is specified, load it and merge
        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        // If CLI value is default, use file value
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.workspace == default_workspace() {
            self.workspace = file_config.workspace;
        }
        if self.ffmpeg_path == default_ffmpeg_path() {
            self.ffmpeg_path = file_config.ffmpeg_path;
        }
        if self.grace_timeout_ms == default_grace_timeout_ms() {
            self.grace_timeout_ms = file_config.grace_timeout_ms;
        }
        if self.startup_probe_ms == default_startup_probe_ms() {
            self.startup_probe_ms = file_config.startup_probe_ms;
        }
        if self.failure_threshold == default_failure_threshold() {
            self.failure_threshold = file_config.failure_threshold;
        }
        if self.stderr_tail_bytes == default_stderr_tail_bytes() {
            self.stderr_tail_bytes = file_config.stderr_tail_bytes;
        }
        if self.probe_timeout_ms == default_probe_timeout_ms() {
            self.probe_timeout_ms = file_config.probe_timeout_ms;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ffmpeg_path.trim().is_empty() {
            return Err(anyhow::anyhow!("ffmpeg_path cannot be empty"));
        }
        if self.workspace.trim().is_empty() {
            return Err(anyhow::anyhow!("workspace cannot be empty"));
        }
        if self.failure_threshold == 0 {
            return Err(anyhow::anyhow!("failure_threshold must be at least 1"));
        }
        if self.stderr_tail_bytes == 0 {
            return Err(anyhow::anyhow!("stderr_tail_bytes must be positive"));
        }
        for (name, value) in [
            ("grace_timeout_ms", self.grace_timeout_ms),
            ("startup_probe_ms", self.startup_probe_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
        ] {
            if value == 0 {
                return Err(anyhow::anyhow!("{name} must be positive"));
            }
        }

        Ok(())
    }

    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }

    pub fn startup_probe(&self) -> Duration {
        Duration::from_millis(self.startup_probe_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// Default value functions
fn default_port() -> u16 {
    5000
}

fn default_workspace() -> String {
    ".".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_grace_timeout_ms() -> u64 {
    5000
}

fn default_startup_probe_ms() -> u64 {
    3000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_stderr_tail_bytes() -> usize {
    8192
}

fn default_probe_timeout_ms() -> u64 {
    5000
}
