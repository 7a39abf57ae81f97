use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::models::Endpoint;
use crate::preferences::FilePreferenceStore;

// ── Settings (CLI) ─────────────────────────────────────────────────────────────

/// Live face-detection client
#[derive(Parser, Debug, Clone)]
#[command(name = "facefy", about = "Live face-detection client", version)]
pub struct Settings {
    /// Server host (saved for the next run)
    #[arg(long)]
    pub host: Option<String>,

    /// Server port (saved for the next run)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=65535))]
    pub port: Option<u32>,

    /// Connect immediately on start
    #[arg(long)]
    pub connect: bool,

    /// Request the video stream once connected
    #[arg(long)]
    pub stream: bool,

    /// Handshake timeout in seconds (0 waits forever)
    #[arg(long, default_value = "10")]
    pub connect_timeout_secs: u64,

    /// Reconnect attempts after a transport failure (0 disables)
    #[arg(long, default_value = "0")]
    pub reconnect_attempts: u32,

    /// Initial reconnect backoff in milliseconds, doubled per attempt
    #[arg(long, default_value = "500")]
    pub reconnect_backoff_ms: u64,

    /// Directory holding saved preferences (default: ~/.facefy)
    #[arg(long, env = "FACEFY_PREFS_DIR")]
    pub prefs_dir: Option<PathBuf>,

    /// Clear saved preferences before starting
    #[arg(long)]
    pub clear: bool,

    /// Logging level
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"])]
    pub log_level: String,

    /// Log file path
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Settings {
    /// Parse the process arguments.
    pub fn load() -> Self {
        Self::load_from_args(std::env::args_os())
    }

    /// Parse an explicit argument list and apply derived values.
    pub fn load_from_args<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut settings = Settings::parse_from(args);

        // --debug overrides log level.
        if settings.debug {
            settings.log_level = "DEBUG".to_string();
        }

        settings
    }

    /// Bounded handshake timeout, or `None` when disabled.
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_secs > 0).then(|| Duration::from_secs(self.connect_timeout_secs))
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn prefs_dir(&self) -> PathBuf {
        self.prefs_dir
            .clone()
            .unwrap_or_else(FilePreferenceStore::default_dir)
    }

    /// Endpoint requested on the command line, completed from `current` when
    /// only one of `--host` / `--port` was given.
    pub fn endpoint_override(&self, current: &Endpoint) -> Result<Option<Endpoint>> {
        if self.host.is_none() && self.port.is_none() {
            return Ok(None);
        }
        let host = self.host.as_deref().unwrap_or(current.host());
        let port = self.port.unwrap_or(u32::from(current.port()));
        Endpoint::new(host, port).map(Some)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
