//! Generation parameters and their transport encoding.
//!
//! The child process receives its parameters as a single command-line value:
//! compact JSON, then base64 with the URL-safe alphabet so the blob never needs
//! shell quoting on any platform.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Error type for parameter encoding and decoding.
#[derive(thiserror::Error, Debug)]
pub enum ParamsError {
    /// The parameters could not be serialized or the decoded JSON was invalid.
    #[error("Invalid parameter JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The blob was not valid base64.
    #[error("Invalid base64 parameter blob: {0}")]
    Base64(#[from] base64::DecodeError),
    /// JSON has no representation for infinite or NaN numbers.
    #[error("Guidance scale must be a finite number, got {0}")]
    NonFiniteGuidanceScale(f32),
}

/// Parameters for a single generation request.
///
/// Field names on the wire are fixed: `prompt`, `output_dir`, `guidance_scale`,
/// `karras_steps`, `use_fp16`. No validation happens here; callers check the
/// prompt and output directory before launching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    /// Text prompt describing the asset.
    pub prompt: String,
    /// Output directory. Empty means the child's default.
    #[serde(rename = "output_dir")]
    pub output_directory: String,
    /// Classifier-free guidance scale.
    pub guidance_scale: f32,
    /// Number of Karras sampling steps.
    pub karras_steps: u32,
    /// Run the model in half precision.
    pub use_fp16: bool,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            output_directory: String::new(),
            guidance_scale: 15.0,
            karras_steps: 64,
            use_fp16: true,
        }
    }
}

impl GenerationParameters {
    /// Create parameters with the given prompt and default settings.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Set the output directory.
    #[must_use]
    pub fn output_directory(mut self, dir: impl Into<String>) -> Self {
        self.output_directory = dir.into();
        self
    }

    /// Set the guidance scale.
    #[must_use]
    pub fn guidance_scale(mut self, scale: f32) -> Self {
        self.guidance_scale = scale;
        self
    }

    /// Set the number of Karras steps.
    #[must_use]
    pub fn karras_steps(mut self, steps: u32) -> Self {
        self.karras_steps = steps;
        self
    }

    /// Enable or disable half precision.
    #[must_use]
    pub fn use_fp16(mut self, enabled: bool) -> Self {
        self.use_fp16 = enabled;
        self
    }

    /// Serialize to compact JSON.
    ///
    /// # Errors
    ///
    /// Returns `ParamsError::NonFiniteGuidanceScale` for an infinite or NaN
    /// guidance scale, `ParamsError::Json` if serialization fails.
    pub fn to_json(&self) -> Result<String, ParamsError> {
        if !self.guidance_scale.is_finite() {
            return Err(ParamsError::NonFiniteGuidanceScale(self.guidance_scale));
        }
        Ok(serde_json::to_string(self)?)
    }

    /// Encode into the transport-safe launch argument.
    ///
    /// # Errors
    ///
    /// Returns `ParamsError` if the parameters cannot be serialized.
    pub fn encode(&self) -> Result<String, ParamsError> {
        Ok(URL_SAFE.encode(self.to_json()?))
    }

    /// Decode a launch argument produced by [`GenerationParameters::encode`].
    ///
    /// # Errors
    ///
    /// Returns `ParamsError` if the blob is not base64 or not a parameter record.
    pub fn decode(blob: &str) -> Result<Self, ParamsError> {
        let json = URL_SAFE.decode(blob.trim())?;
        Ok(serde_json::from_slice(&json)?)
    }
}
