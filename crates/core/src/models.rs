use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, MetadataErrors, ProcessingError, Result};

pub const NAME_MAX_CHARS: usize = 100;
pub const DESCRIPTION_MAX_CHARS: usize = 500;

/// Asset metadata as reported by a picker or camera. Every field but the uri
/// may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAsset {
    pub uri: String,
    pub duration_ms: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub file_size_bytes: Option<u64>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedVideo {
    pub uri: String,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub file_size_bytes: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropSelection {
    pub start_time_secs: f64,
    pub end_time_secs: f64,
    pub duration_secs: f64,
}

impl CropSelection {
    pub fn new(start_time_secs: f64, end_time_secs: f64) -> Self {
        Self {
            start_time_secs,
            end_time_secs,
            duration_secs: end_time_secs - start_time_secs,
        }
    }

    /// Checks the window against a (possibly corrected) source duration.
    pub fn check(
        &self,
        required_secs: f64,
        tolerance_secs: f64,
        source_duration_secs: f64,
    ) -> Result<()> {
        const EPS: f64 = 1e-6;
        let finite = self.start_time_secs.is_finite()
            && self.end_time_secs.is_finite()
            && source_duration_secs.is_finite();
        if !finite {
            return Err(Error::InvalidArgument("crop window is not finite".into()));
        }
        if self.start_time_secs < 0.0 || self.start_time_secs >= self.end_time_secs {
            return Err(Error::InvalidArgument(format!(
                "crop window [{:.3}, {:.3}] is empty or negative",
                self.start_time_secs, self.end_time_secs
            )));
        }
        if self.end_time_secs > source_duration_secs + EPS {
            return Err(Error::InvalidArgument(format!(
                "crop window ends at {:.3}s but the video is only {:.3}s long",
                self.end_time_secs, source_duration_secs
            )));
        }
        if (self.duration_secs - required_secs).abs() > tolerance_secs + EPS {
            return Err(Error::InvalidArgument(format!(
                "crop window is {:.3}s, expected {:.3}s",
                self.duration_secs, required_secs
            )));
        }
        Ok(())
    }

    pub fn midpoint_secs(&self) -> f64 {
        self.start_time_secs + (self.end_time_secs - self.start_time_secs) / 2.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub name: String,
    pub description: String,
}

impl VideoMetadata {
    /// Trims both fields and checks their bounds.
    pub fn new(name: &str, description: &str) -> std::result::Result<Self, MetadataErrors> {
        let name = name.trim();
        let description = description.trim();
        let errors = MetadataErrors {
            name: check_name(name),
            description: check_description(description),
        };
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            name: name.to_string(),
            description: description.to_string(),
        })
    }
}

fn check_name(name: &str) -> Option<String> {
    if name.is_empty() {
        Some("name is required".to_string())
    } else if name.chars().count() > NAME_MAX_CHARS {
        Some(format!("name must be at most {NAME_MAX_CHARS} characters"))
    } else {
        None
    }
}

fn check_description(description: &str) -> Option<String> {
    if description.chars().count() > DESCRIPTION_MAX_CHARS {
        Some(format!(
            "description must be at most {DESCRIPTION_MAX_CHARS} characters"
        ))
    } else {
        None
    }
}

/// Editable subset of a saved moment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MomentPatch {
    pub name: Option<String>,
    pub description: Option<String>,
}

impl MomentPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }

    /// Returns a copy with trimmed fields, or the field-level errors.
    pub fn normalized(&self) -> std::result::Result<Self, MetadataErrors> {
        let name = self.name.as_deref().map(str::trim);
        let description = self.description.as_deref().map(str::trim);
        let errors = MetadataErrors {
            name: name.and_then(check_name),
            description: description.and_then(check_description),
        };
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            name: name.map(String::from),
            description: description.map(String::from),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Moment {
    pub id: String,
    pub name: String,
    pub description: String,
    pub original_uri: String,
    pub cropped_uri: String,
    pub start_time_secs: f64,
    pub end_time_secs: f64,
    pub created_at: DateTime<Utc>,
    pub thumbnail_uri: Option<String>,
}

impl Moment {
    pub fn duration_secs(&self) -> f64 {
        self.end_time_secs - self.start_time_secs
    }

    pub(crate) fn apply(&mut self, patch: &MomentPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingResult {
    Success {
        output_uri: String,
        thumbnail_uri: Option<String>,
    },
    Failure {
        reason: ProcessingError,
    },
}

impl ProcessingResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingResult::Success { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    Analyzing,
    Trimming,
    Finalizing,
    Complete,
}

impl ProcessingStage {
    pub fn from_progress(fraction: f64) -> Self {
        if fraction >= 1.0 {
            ProcessingStage::Complete
        } else if fraction >= 0.8 {
            ProcessingStage::Finalizing
        } else if fraction >= 0.2 {
            ProcessingStage::Trimming
        } else {
            ProcessingStage::Analyzing
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProcessingStage::Analyzing => "Analyzing video",
            ProcessingStage::Trimming => "Cropping segment",
            ProcessingStage::Finalizing => "Finalizing",
            ProcessingStage::Complete => "Complete",
        }
    }
}
