//! Application configuration.
//!
//! A plain `serde`-deserializable struct with defaults, loadable from an
//! optional YAML file and then overridden by environment variables. The
//! binary crate layers CLI flags on top of this (see `apps/server`).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{MediaViewerError, MediaViewerResult};
use crate::util::parse_boolish;

/// Server configuration, covering everything in the external interfaces
/// environment variable list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Root directory of the indexed media tree. Required; missing or
    /// unreadable at startup is a fatal configuration error.
    pub media_root: PathBuf,

    /// Port to bind the HTTP(S) server to.
    pub port: u16,

    /// Connection string for an external catalog store. Accepted for
    /// compatibility; the in-process catalog never dials it.
    pub database_url: Option<String>,

    /// Enables HTTPS.
    pub use_ssl: bool,

    /// Path to a PEM-encoded TLS private key.
    pub https_key_path: Option<PathBuf>,

    /// Path to a PEM-encoded TLS certificate chain.
    pub https_cert_path: Option<PathBuf>,

    /// When `use_ssl` is set and either path above is missing, generate
    /// a self-signed certificate for `localhost`/`127.0.0.1` instead of
    /// refusing to start.
    pub https_auto_self_signed: bool,

    /// Value for the `Access-Control-Allow-Origin` response header.
    /// `None` disables CORS entirely.
    pub cors_origin: Option<String>,

    /// Path to the `ffprobe` binary.
    pub ffprobe_path: PathBuf,

    /// Path to the `ffmpeg` binary.
    pub ffmpeg_path: PathBuf,

    /// Directory used to cache generated thumbnails.
    pub thumb_cache_dir: PathBuf,

    /// Substring token used to detect the DeoVR user agent (lowercased
    /// before comparison). Configurable per the spec's open question
    /// about custom DeoVR UAs in the field.
    pub deovr_ua_token: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("/media"),
            port: 3000,
            database_url: None,
            use_ssl: false,
            https_key_path: None,
            https_cert_path: None,
            https_auto_self_signed: true,
            cors_origin: None,
            ffprobe_path: PathBuf::from("ffprobe"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            thumb_cache_dir: PathBuf::from(".mediaviewer/thumbs"),
            deovr_ua_token: "deovr".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from an optional YAML file, then applies
    /// environment variable overrides. Precedence: default -> file -> env.
    pub fn load(path: Option<&std::path::Path>) -> MediaViewerResult<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path).map_err(|e| {
                MediaViewerError::Fatal(format!(
                    "failed to read config file {}: {e}",
                    path.display()
                ))
            })?;
            serde_yaml::from_str(&content).map_err(|e| {
                MediaViewerError::Fatal(format!(
                    "failed to parse config file {}: {e}",
                    path.display()
                ))
            })?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies environment variable overrides in place.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEDIA_ROOT") {
            self.media_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("PORT") {
            if let Ok(port) = val.parse() {
                self.port = port;
            }
        }
        if let Ok(val) = std::env::var("DATABASE_URL") {
            self.database_url = Some(val);
        }
        if let Ok(val) = std::env::var("USE_SSL") {
            if let Some(b) = parse_boolish(&val) {
                self.use_ssl = b;
            }
        }
        if let Ok(val) = std::env::var("HTTPS_KEY_PATH") {
            self.https_key_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("HTTPS_CERT_PATH") {
            self.https_cert_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("HTTPS_AUTO_SELF_SIGNED") {
            if let Some(b) = parse_boolish(&val) {
                self.https_auto_self_signed = b;
            }
        }
        if let Ok(val) = std::env::var("CORS_ORIGIN") {
            self.cors_origin = Some(val);
        }
        if let Ok(val) = std::env::var("FFPROBE_PATH") {
            self.ffprobe_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("FFMPEG_PATH") {
            self.ffmpeg_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("MV_THUMB_CACHE_DIR") {
            self.thumb_cache_dir = PathBuf::from(val);
        }
    }

    /// Validates required settings, returning a Fatal error on failure.
    ///
    /// Fatal per spec.md §7: a missing/unreadable `MEDIA_ROOT` refuses startup.
    pub fn validate(&self) -> MediaViewerResult<()> {
        if self.media_root.as_os_str().is_empty() {
            return Err(MediaViewerError::Fatal("MEDIA_ROOT is empty".into()));
        }
        if !self.media_root.is_dir() {
            return Err(MediaViewerError::Fatal(format!(
                "MEDIA_ROOT {} is not a readable directory",
                self.media_root.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_port() {
        assert_eq!(Config::default().port, 3000);
    }

    #[test]
    fn validate_rejects_missing_media_root() {
        let mut config = Config::default();
        config.media_root = PathBuf::from("/definitely/does/not/exist/mediaviewer");
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.media_root = dir.path().to_path_buf();
        assert!(config.validate().is_ok());
    }
}
