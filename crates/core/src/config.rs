use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_REQUIRED_DURATION_SECS: f64 = 5.0;
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Tunables consumed by the crop workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    pub required_duration_secs: f64,
    /// Accepted deviation of a confirmed crop from `required_duration_secs`.
    pub duration_tolerance_secs: f64,
    pub max_file_size_bytes: u64,
    /// Includes container aliases, e.g. iOS reports `.mov` as `video/quicktime`.
    pub supported_mime_types: Vec<String>,
    pub track_width_px: f64,
    pub thumbnail_quality: f32,
    /// Upper bound for a single external media call. `None` waits forever.
    pub media_timeout_secs: Option<u64>,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            required_duration_secs: DEFAULT_REQUIRED_DURATION_SECS,
            duration_tolerance_secs: 0.1,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            supported_mime_types: [
                "video/mp4",
                "video/mov",
                "video/avi",
                "video/quicktime",
                "video/x-msvideo",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            track_width_px: 300.0,
            thumbnail_quality: 0.7,
            media_timeout_secs: Some(120),
        }
    }
}

impl CropConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: CropConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.required_duration_secs.is_finite() && self.required_duration_secs > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "required_duration_secs must be positive, got {}",
                self.required_duration_secs
            )));
        }
        if !(self.duration_tolerance_secs.is_finite() && self.duration_tolerance_secs >= 0.0) {
            return Err(Error::InvalidArgument(format!(
                "duration_tolerance_secs must be non-negative, got {}",
                self.duration_tolerance_secs
            )));
        }
        if !(self.track_width_px.is_finite() && self.track_width_px > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "track_width_px must be positive, got {}",
                self.track_width_px
            )));
        }
        if !(0.0..=1.0).contains(&self.thumbnail_quality) {
            return Err(Error::InvalidArgument(format!(
                "thumbnail_quality must be within 0..=1, got {}",
                self.thumbnail_quality
            )));
        }
        if self.supported_mime_types.is_empty() {
            return Err(Error::InvalidArgument(
                "supported_mime_types must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn is_supported_mime(&self, mime_type: &str) -> bool {
        let mime_type = mime_type.trim();
        self.supported_mime_types
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mime_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CropConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_file_size_bytes, 104_857_600);
        assert!(config.is_supported_mime("video/quicktime"));
        assert!(config.is_supported_mime("video/mov"));
        assert!(config.is_supported_mime("VIDEO/MP4"));
        assert!(!config.is_supported_mime("video/webm"));
    }

    #[test]
    fn load_fills_missing_keys_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "required_duration_secs": 3.0 }"#).unwrap();

        let config = CropConfig::load(&path).unwrap();
        assert_eq!(config.required_duration_secs, 3.0);
        assert_eq!(config.track_width_px, 300.0);
        assert_eq!(config.media_timeout_secs, Some(120));
    }

    #[test]
    fn load_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "track_width_px": 0 }"#).unwrap();
        assert!(matches!(
            CropConfig::load(&path),
            Err(Error::InvalidArgument(_))
        ));

        std::fs::write(&path, r#"{ "supported_mime_types": [] }"#).unwrap();
        assert!(matches!(
            CropConfig::load(&path),
            Err(Error::InvalidArgument(_))
        ));
    }
}
