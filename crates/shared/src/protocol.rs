use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::{DEFAULT_COMPACTNESS, DEFAULT_MIN_AREA, DEFAULT_SEGMENTS, DEFAULT_SIGMA};

/// Result of handing bytes to the remote media store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreReceipt {
    pub url: String,
}

/// Acknowledgement from the generation backend for one submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationAck {
    pub success: bool,
    pub message: String,
}

/// The advanced options and the defaults injected when a form omits them.
/// Present fields are never overwritten.
pub fn advanced_defaults() -> [(&'static str, Value); 4] {
    [
        ("segments", json!(DEFAULT_SEGMENTS)),
        ("compactness", json!(DEFAULT_COMPACTNESS)),
        ("sigma", json!(DEFAULT_SIGMA)),
        ("min_area", json!(DEFAULT_MIN_AREA)),
    ]
}

/// The finalized set of values sent to the generation backend for one
/// submission attempt. Constructible only through [`SubmissionPayload::build`]
/// and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionPayload {
    #[serde(rename = "imageUrl")]
    image_url: String,
    #[serde(flatten)]
    options: BTreeMap<String, Value>,
}

impl SubmissionPayload {
    /// Copies the explicit form fields, injects the image URL, and fills in
    /// the documented default for each advanced option that is absent.
    pub fn build(image_url: impl Into<String>, fields: BTreeMap<String, Value>) -> Self {
        let mut options = fields;
        for (name, default) in advanced_defaults() {
            options.entry(name.to_string()).or_insert(default);
        }
        Self {
            image_url: image_url.into(),
            options,
        }
    }

    pub fn image_url(&self) -> &str {
        &self.image_url
    }

    pub fn option(&self, name: &str) -> Option<&Value> {
        self.options.get(name)
    }

    pub fn options(&self) -> &BTreeMap<String, Value> {
        &self.options
    }
}
