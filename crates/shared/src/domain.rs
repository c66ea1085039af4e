use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Identifies a single upload or submission attempt. Notifications are keyed
/// by the attempt that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub const MIN_COLOURS: i64 = 1;
pub const MAX_COLOURS: i64 = 30;
pub const DEFAULT_COLOURS: i64 = 20;

pub const DEFAULT_SEGMENTS: i64 = 200;
pub const DEFAULT_COMPACTNESS: i64 = 10;
pub const DEFAULT_SIGMA: i64 = 1;
pub const DEFAULT_MIN_AREA: f64 = 0.0001;

/// Pixel channel order expected by the generation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColourEncoding {
    #[default]
    Bgr,
    Rgb,
}

impl ColourEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            ColourEncoding::Bgr => "BGR",
            ColourEncoding::Rgb => "RGB",
        }
    }
}

impl fmt::Display for ColourEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColourEncoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BGR" => Ok(ColourEncoding::Bgr),
            "RGB" => Ok(ColourEncoding::Rgb),
            other => Err(ConfigError::UnknownEncoding(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("k_colours must be between {MIN_COLOURS} and {MAX_COLOURS}, got {0}")]
    ColoursOutOfRange(i64),
    #[error("unknown colour encoding {0:?}, expected BGR or RGB")]
    UnknownEncoding(String),
}

/// The main (non-advanced) canvas configuration collected by the form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasConfig {
    pub k_colours: i64,
    pub encoding: ColourEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            k_colours: DEFAULT_COLOURS,
            encoding: ColourEncoding::default(),
            filename: None,
        }
    }
}

impl CanvasConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_COLOURS..=MAX_COLOURS).contains(&self.k_colours) {
            return Err(ConfigError::ColoursOutOfRange(self.k_colours));
        }
        Ok(())
    }
}
