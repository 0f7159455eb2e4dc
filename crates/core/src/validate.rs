use tracing::debug;

use crate::config::CropConfig;
use crate::error::ValidationError;
use crate::models::{RawAsset, SelectedVideo};

/// Admits raw picker/camera assets into the crop workflow.
#[derive(Debug, Clone)]
pub struct SelectionValidator {
    config: CropConfig,
}

impl SelectionValidator {
    pub fn new(config: &CropConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Checks size, then duration, then format. Constraints the source did
    /// not report are skipped, except duration: without one there is no
    /// window to crop.
    pub fn validate(&self, asset: &RawAsset) -> Result<SelectedVideo, ValidationError> {
        if let Some(size) = asset.file_size_bytes {
            if size > self.config.max_file_size_bytes {
                return Err(ValidationError::FileTooLarge {
                    size_bytes: size,
                    max_bytes: self.config.max_file_size_bytes,
                });
            }
        }

        let duration_secs = asset.duration_ms.map(ms_to_secs).unwrap_or(0.0);
        if duration_secs < self.config.required_duration_secs {
            return Err(ValidationError::TooShort {
                duration_secs,
                required_secs: self.config.required_duration_secs,
            });
        }

        if let Some(mime) = asset.mime_type.as_deref() {
            if !self.config.is_supported_mime(mime) {
                return Err(ValidationError::UnsupportedFormat {
                    mime_type: mime.to_string(),
                });
            }
        }

        debug!(
            uri = %asset.uri,
            duration_secs,
            size = asset.file_size_bytes,
            mime = asset.mime_type.as_deref().unwrap_or(""),
            "asset accepted"
        );

        Ok(SelectedVideo {
            uri: asset.uri.clone(),
            duration_secs,
            width: asset.width.unwrap_or(0),
            height: asset.height.unwrap_or(0),
            file_size_bytes: asset.file_size_bytes.unwrap_or(0),
            mime_type: asset.mime_type.clone().unwrap_or_default(),
        })
    }
}

fn ms_to_secs(ms: u64) -> f64 {
    ms as f64 / 1000.0
}
