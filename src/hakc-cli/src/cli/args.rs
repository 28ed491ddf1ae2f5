//! CLI argument structures and parsing.

use std::path::PathBuf;

use clap::Parser;
use hakc_update::{ContentScope, ReleaseChannel};

/// Log verbosity level for CLI output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    /// Only show errors
    Error,
    /// Show warnings and errors
    Warn,
    /// Show informational messages, warnings, and errors (default)
    #[default]
    Info,
    /// Show debug messages and above
    Debug,
    /// Show all messages including trace-level details
    Trace,
}

impl LogLevel {
    /// Convert to tracing filter string.
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

const AFTER_HELP: &str = "\
Exit codes:
  0  success, up to date, or completed with skipped files
  2  configuration error       3  SD card not mounted
  4  another run holds the lock 5  release feed unavailable
  6  firmware download failed  7  applying to the card failed
  8  backup failed             9  not enough space on the card
  130 interrupted";

/// hakc - keep a PortaPack Mayhem SD card up to date
///
/// Installs the latest firmware bundle and frequency files onto the mounted
/// SD card. Captures, recordings, screenshots and your own frequency files
/// are never touched.
#[derive(Debug, Parser)]
#[command(name = "hakc", version, about, long_about = None, after_help = AFTER_HELP)]
pub struct Cli {
    /// Use the bundle without the world map (saves ~600 MB)
    #[arg(long)]
    pub no_world_map: bool,

    /// Only install the firmware bundle
    #[arg(long, conflicts_with_all = ["freq_only", "themes_only"])]
    pub firmware_only: bool,

    /// Only install frequency files
    #[arg(long, conflicts_with = "themes_only")]
    pub freq_only: bool,

    /// Only refresh the pp_res themes
    #[arg(long)]
    pub themes_only: bool,

    /// Countries to install frequency files for (default: all)
    #[arg(long, value_name = "COUNTRY", value_delimiter = ',', num_args = 1..)]
    pub countries: Vec<String>,

    /// Back up user data before changing the card
    #[arg(long)]
    pub backup: bool,

    /// Directory to write backups into (default: ~/Desktop)
    #[arg(long, value_name = "DIR", requires = "backup")]
    pub backup_dir: Option<PathBuf>,

    /// Only report what would be installed; never writes to the card
    #[arg(long)]
    pub check: bool,

    /// Follow nightly builds instead of tagged releases
    #[arg(long)]
    pub nightly: bool,

    /// Reconcile even if the card is already up to date
    #[arg(long)]
    pub force: bool,

    /// Mount point of the SD card
    #[arg(long, value_name = "PATH")]
    pub mount: Option<PathBuf>,

    /// Keep downloads in DIR between runs
    #[arg(long, value_name = "DIR")]
    pub staging_dir: Option<PathBuf>,

    /// Read configuration from FILE instead of ~/.hakc/config.json
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose output (same as --log-level debug)
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Log level
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Also write logs to FILE (default: ~/.hakc/logs/hakc.log)
    #[arg(long, value_name = "FILE", num_args = 0..=1)]
    pub log_file: Option<Option<PathBuf>>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    /// Content scope selected by the exclusive scope flags.
    pub fn scope(&self) -> ContentScope {
        if self.firmware_only {
            ContentScope::FirmwareOnly
        } else if self.freq_only {
            ContentScope::FrequencyOnly
        } else if self.themes_only {
            ContentScope::ThemesOnly
        } else {
            ContentScope::Full
        }
    }

    /// Channel requested on the command line, if any.
    pub fn channel_override(&self) -> Option<ReleaseChannel> {
        self.nightly.then_some(ReleaseChannel::Nightly)
    }

    /// `-v` wins over `--log-level`.
    pub fn effective_log_level(&self) -> LogLevel {
        if self.verbose {
            LogLevel::Debug
        } else {
            self.log_level
        }
    }

    /// Log file to write, if requested.
    pub fn log_file_path(&self) -> Option<PathBuf> {
        match &self.log_file {
            Some(Some(path)) => Some(path.clone()),
            Some(None) => hakc_common::get_app_dirs().map(|dirs| dirs.log_file()),
            None => None,
        }
    }
}
