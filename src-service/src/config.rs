//! Configuration for the video source daemon.
//!
//! Loaded from `~/.config/framebus/service.json` (or `--config`); every field
//! can be overridden on the command line.

use clap::ValueEnum;
use directories::ProjectDirs;
use framebus_common::directory::DEFAULT_SUFFIX;
use framebus_common::{CapsFilter, VideoFormat, DEFAULT_CAPS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::Pattern;

/// Where frames come from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Generated test pattern
    #[default]
    Pattern,
    /// Anything FFmpeg can decode
    Ffmpeg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Caps of the produced stream; missing fields come from the defaults
    pub caps: String,
    pub source: SourceKind,
    pub pattern: Pattern,
    /// FFmpeg input (file, device or URL) for the ffmpeg source
    pub input: Option<String>,
    /// Suffix of the well-known bus name
    pub bus_name_suffix: String,
    pub watchdog_timeout_ms: u64,
    /// Frames buffered per attached client
    pub queue_depth: usize,
    /// Emit frames one byte short or long at random
    pub size_jitter: bool,
    /// Stop with end-of-stream after this many frames
    pub num_frames: Option<u64>,
    /// Pace frames at the frame rate
    pub live: bool,
    /// Also write a daily log file
    pub log_file: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            caps: DEFAULT_CAPS.to_string(),
            source: SourceKind::Pattern,
            pattern: Pattern::Bars,
            input: None,
            bus_name_suffix: DEFAULT_SUFFIX.to_string(),
            watchdog_timeout_ms: 2000,
            queue_depth: 2,
            size_jitter: false,
            num_frames: None,
            live: true,
            log_file: false,
        }
    }
}

/// Reasons a configuration cannot be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidCaps(String),
    MissingInput,
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidCaps(msg) => write!(f, "Invalid caps: {}", msg),
            ConfigError::MissingInput => write!(f, "The ffmpeg source needs --input"),
            ConfigError::InvalidValue(field) => write!(f, "{} must be greater than zero", field),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ServiceConfig {
    /// The produced format. Partial caps are filled in from the defaults.
    pub fn format(&self) -> Result<VideoFormat, ConfigError> {
        let requested =
            CapsFilter::parse(&self.caps).map_err(|e| ConfigError::InvalidCaps(e.to_string()))?;
        let defaults: VideoFormat = DEFAULT_CAPS
            .parse()
            .map_err(|e: framebus_common::FormatError| ConfigError::InvalidCaps(e.to_string()))?;
        let format = VideoFormat {
            format: requested.format.unwrap_or(defaults.format),
            width: requested.width.unwrap_or(defaults.width),
            height: requested.height.unwrap_or(defaults.height),
            framerate: requested.framerate.unwrap_or(defaults.framerate),
        };
        // Re-parse so the usual checks (non-zero size and rate) apply
        format
            .to_caps()
            .parse()
            .map_err(|e: framebus_common::FormatError| ConfigError::InvalidCaps(e.to_string()))
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.format()?;
        if self.source == SourceKind::Ffmpeg && self.input.is_none() {
            return Err(ConfigError::MissingInput);
        }
        if self.watchdog_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("watchdog_timeout_ms"));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::InvalidValue("queue_depth"));
        }
        Ok(())
    }
}

/// Get the default path of the config file.
fn get_config_path() -> Result<PathBuf, String> {
    let proj_dirs =
        ProjectDirs::from("", "", "framebus").ok_or("Could not determine config directory")?;
    Ok(proj_dirs.config_dir().join("service.json"))
}

/// Load configuration from `path`, or from the default location.
/// Returns defaults if the file doesn't exist or is invalid.
///
/// Runs before logging is set up, so problems go to stderr directly.
pub fn load_config(path: Option<&Path>) -> ServiceConfig {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => match get_config_path() {
            Ok(path) => path,
            Err(e) => {
                eprintln!("[Config] Failed to get config path: {}", e);
                return ServiceConfig::default();
            }
        },
    };

    if !config_path.exists() {
        return ServiceConfig::default();
    }

    match fs::read_to_string(&config_path) {
        Ok(contents) => match serde_json::from_str::<ServiceConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                eprintln!(
                    "[Config] Failed to parse {:?}: {}. Using defaults.",
                    config_path, e
                );
                ServiceConfig::default()
            }
        },
        Err(e) => {
            eprintln!(
                "[Config] Failed to read {:?}: {}. Using defaults.",
                config_path, e
            );
            ServiceConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framebus_common::PixelFormat;

    #[test]
    fn test_default_format() {
        let format = ServiceConfig::default().format().unwrap();
        assert_eq!(format.format, PixelFormat::Bgr);
        assert_eq!((format.width, format.height), (1280, 720));
    }

    #[test]
    fn test_partial_caps_filled_from_defaults() {
        let config = ServiceConfig {
            caps: "video/x-raw,width=320,height=240".to_string(),
            ..ServiceConfig::default()
        };
        let format = config.format().unwrap();
        assert_eq!((format.width, format.height), (320, 240));
        assert_eq!(format.format, PixelFormat::Bgr);
    }

    #[test]
    fn test_validate() {
        assert!(ServiceConfig::default().validate().is_ok());

        let config = ServiceConfig {
            source: SourceKind::Ffmpeg,
            ..ServiceConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MissingInput));

        let config = ServiceConfig {
            queue_depth: 0,
            ..ServiceConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidValue("queue_depth"))
        );

        let config = ServiceConfig {
            caps: "video/x-raw,width=0".to_string(),
            ..ServiceConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidCaps(_))));
    }

    #[test]
    fn test_partial_json() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"bus_name_suffix": "cam0", "pattern": "counter"}"#).unwrap();
        assert_eq!(config.bus_name_suffix, "cam0");
        assert_eq!(config.pattern, Pattern::Counter);
        assert_eq!(config.queue_depth, 2);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/framebus/service.json")));
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_invalid_file_gives_defaults() {
        let path = std::env::temp_dir().join(format!("framebus-config-{}.json", std::process::id()));
        fs::write(&path, "{ not json").unwrap();
        let config = load_config(Some(&path));
        let _ = fs::remove_file(&path);
        assert_eq!(config, ServiceConfig::default());
    }
}
