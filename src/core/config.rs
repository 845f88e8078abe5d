//! Recorder configuration - immutable snapshot loaded from `recorder.ini`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::ini::{IniFile, Section, DEFAULT_SECTION};

/// Default output file pattern (strftime-style, token-substituted)
pub const DEFAULT_OUTPUT_PATTERN: &str = "desktop_%Y%m%d_%H%M%S.mkv";

/// Default recording subdirectory template
pub const DEFAULT_SUBDIR_TEMPLATE: &str = "{username}/s{session}";

#[cfg(windows)]
const DEFAULT_FFMPEG_PATH: &str = "./ffmpeg.exe";
#[cfg(not(windows))]
const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";

/// Errors that prevent a configuration snapshot from being produced
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration file: {}", .0.display())]
    Missing(PathBuf),

    #[error("Failed to read configuration file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Hardware or software encoder choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoder {
    Libx264,
    H264Nvenc,
    H264Qsv,
}

impl Encoder {
    /// Map the configured name; `auto` and anything unknown select libx264
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "h264_nvenc" => Self::H264Nvenc,
            "h264_qsv" => Self::H264Qsv,
            _ => Self::Libx264,
        }
    }
}

/// One immutable configuration snapshot. Replaced wholesale on reload.
#[derive(Debug, Clone, Serialize)]
pub struct RecorderConfig {
    // Output
    /// Root directory for recordings
    pub record_dir: PathBuf,
    /// Output file name pattern
    pub output_pattern: String,
    /// Subdirectory under `record_dir`
    pub subdir_template: String,
    /// Length of each segment in seconds
    pub segment_seconds: u32,
    /// Capture frame rate
    pub fps: u32,

    // Encoding
    /// Path to the capture executable
    pub ffmpeg_path: PathBuf,
    /// Configured encoder name, lower-cased
    pub encoder_name: String,
    /// libx264 constant rate factor
    pub crf: u32,

    // Supervision
    /// Delay before a crashed capture is restarted
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    /// Verbose logging for both the supervisor and the encoder
    pub verbose: bool,

    // Housekeeping
    /// Number of newest segments never touched by housekeeping
    pub keep_local: u32,
    /// Upload endpoint, `None` when uploading is disabled
    pub upload_url: Option<String>,
    /// Bearer token for the upload endpoint
    #[serde(skip_serializing)]
    pub upload_token: String,
    /// Label sent with every upload
    pub system_name: String,
    /// Segments older than this are discarded unsent (zero disables)
    #[serde(with = "duration_secs")]
    pub max_failed_upload_age: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            record_dir: PathBuf::from("./recordings"),
            output_pattern: DEFAULT_OUTPUT_PATTERN.to_string(),
            subdir_template: DEFAULT_SUBDIR_TEMPLATE.to_string(),
            segment_seconds: 3600,
            fps: 12,

            ffmpeg_path: PathBuf::from(DEFAULT_FFMPEG_PATH),
            encoder_name: "auto".to_string(),
            crf: 28,

            retry_delay: Duration::from_secs(180),
            verbose: false,

            keep_local: 2,
            upload_url: None,
            upload_token: String::new(),
            system_name: default_system_name(),
            max_failed_upload_age: Duration::ZERO,
        }
    }
}

impl RecorderConfig {
    /// Load a snapshot from an INI file. Only a missing or unreadable file is
    /// an error; bad individual keys fall back to their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let ini = IniFile::load(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self::from_ini(&ini, &base_dir))
    }

    /// Build a snapshot from parsed INI, resolving relative paths against `base_dir`
    pub fn from_ini(ini: &IniFile, base_dir: &Path) -> Self {
        let defaults = Self::default();
        if !ini.has_section(DEFAULT_SECTION) {
            debug!("No [{}] section, using defaults", DEFAULT_SECTION);
        }
        let s = ini.section(DEFAULT_SECTION);

        let record_dir = s
            .get("record_dir")
            .map(PathBuf::from)
            .unwrap_or(defaults.record_dir);
        let ffmpeg_path = s
            .get("ffmpeg_path")
            .map(PathBuf::from)
            .unwrap_or(defaults.ffmpeg_path);

        let system_name = s
            .get("system_name")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or(defaults.system_name);

        let max_failed_upload_age = s
            .get("max_failed_upload_age")
            .and_then(|raw| {
                let parsed = parse_duration(raw);
                if parsed.is_none() && !raw.trim().is_empty() {
                    debug!("Ignoring unparsable max_failed_upload_age '{}'", raw);
                }
                parsed
            })
            .unwrap_or(defaults.max_failed_upload_age);

        Self {
            record_dir: resolve_path(&record_dir, base_dir),
            output_pattern: s
                .get("output_pattern")
                .map(str::to_string)
                .unwrap_or(defaults.output_pattern),
            subdir_template: s
                .get("record_subdir_template")
                .map(str::to_string)
                .unwrap_or(defaults.subdir_template),
            segment_seconds: int(&s, "segment_seconds", defaults.segment_seconds, 1),
            fps: int(&s, "fps", defaults.fps, 1),

            ffmpeg_path: resolve_executable(&ffmpeg_path, base_dir),
            encoder_name: s
                .get("encoder")
                .map(|v| v.trim().to_lowercase())
                .unwrap_or(defaults.encoder_name),
            crf: int(&s, "libx264_crf", defaults.crf, 0),

            retry_delay: Duration::from_secs(u64::from(int(
                &s,
                "retry_delay_seconds",
                defaults.retry_delay.as_secs() as u32,
                1,
            ))),
            verbose: s.get_bool("verbose", defaults.verbose),

            keep_local: int(&s, "keep_local", defaults.keep_local, 0),
            upload_url: normalize_upload_url(s.get("upload_url").unwrap_or_default()),
            upload_token: s.get("upload_token").unwrap_or_default().to_string(),
            system_name,
            max_failed_upload_age,
        }
    }

    pub fn encoder(&self) -> Encoder {
        Encoder::from_name(&self.encoder_name)
    }

    /// Extension of segment files, including the leading dot (default `.mkv`)
    pub fn output_extension(&self) -> String {
        Path::new(&self.output_pattern)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .map(|e| format!(".{}", e))
            .unwrap_or_else(|| ".mkv".to_string())
    }

    pub fn upload_enabled(&self) -> bool {
        self.upload_url.is_some()
    }

    /// Period of the liveness guard timer
    pub fn guard_period(&self) -> Duration {
        self.retry_delay.max(Duration::from_secs(5))
    }
}

fn int(section: &Section<'_>, key: &str, default: u32, min: u32) -> u32 {
    let value = section.get_int(key, i64::from(default), i64::from(min));
    u32::try_from(value).unwrap_or(default)
}

fn default_system_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// Empty, `skip`, `none`, `disabled` and `false` all disable uploading
pub fn normalize_upload_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    match trimmed.to_lowercase().as_str() {
        "" | "skip" | "none" | "disabled" | "false" => None,
        _ => Some(trimmed.to_string()),
    }
}

/// Parse `<n>[s|m|h|d]`; a bare number is seconds
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (digits, unit) = match trimmed.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (trimmed[..idx].trim_end(), Some(c)),
        _ => (trimmed, None),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let value: u64 = digits.parse().ok()?;

    let secs = match unit.map(|c| c.to_ascii_lowercase()) {
        None | Some('s') => value,
        Some('m') => value.checked_mul(60)?,
        Some('h') => value.checked_mul(3600)?,
        Some('d') => value.checked_mul(86_400)?,
        Some(_) => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Resolve a configured path: `~` expands to home, relative paths join `base_dir`
pub fn resolve_path(path: &Path, base_dir: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Like [`resolve_path`], but a bare program name is left for `PATH` lookup
fn resolve_executable(path: &Path, base_dir: &Path) -> PathBuf {
    if path.components().count() == 1 && !path.starts_with("~") {
        path.to_path_buf()
    } else {
        resolve_path(path, base_dir)
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}
