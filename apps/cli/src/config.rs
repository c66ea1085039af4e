use std::{fs, time::Duration};

use serde::Deserialize;
use tracing::warn;

#[derive(Debug)]
pub struct Settings {
    pub store_url: String,
    pub store_api_key: Option<String>,
    pub store_folder: Option<String>,
    pub backend_url: String,
    pub upload_timeout_secs: Option<u64>,
    pub dispatch_timeout_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_url: "http://127.0.0.1:9090/".into(),
            store_api_key: None,
            store_folder: None,
            backend_url: "http://127.0.0.1:9091/".into(),
            upload_timeout_secs: None,
            dispatch_timeout_secs: None,
        }
    }
}

impl Settings {
    pub fn upload_timeout(&self) -> Option<Duration> {
        self.upload_timeout_secs.map(Duration::from_secs)
    }

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.dispatch_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    store_url: Option<String>,
    store_api_key: Option<String>,
    store_folder: Option<String>,
    backend_url: Option<String>,
    upload_timeout_secs: Option<u64>,
    dispatch_timeout_secs: Option<u64>,
}

fn apply_file_settings(settings: &mut Settings, raw: &str) {
    match toml::from_str::<FileSettings>(raw) {
        Ok(file_cfg) => {
            if let Some(v) = file_cfg.store_url {
                settings.store_url = v;
            }
            if let Some(v) = file_cfg.store_api_key {
                settings.store_api_key = Some(v);
            }
            if let Some(v) = file_cfg.store_folder {
                settings.store_folder = Some(v);
            }
            if let Some(v) = file_cfg.backend_url {
                settings.backend_url = v;
            }
            if let Some(v) = file_cfg.upload_timeout_secs {
                settings.upload_timeout_secs = Some(v);
            }
            if let Some(v) = file_cfg.dispatch_timeout_secs {
                settings.dispatch_timeout_secs = Some(v);
            }
        }
        Err(err) => {
            warn!(error = %err, "ignoring unparseable pbn.toml");
        }
    }
}

/// Defaults, overlaid by `pbn.toml` if present, overlaid by environment
/// variables. Timeouts stay open unless configured.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("pbn.toml") {
        apply_file_settings(&mut settings, &raw);
    }

    if let Ok(v) = std::env::var("PBN_STORE_URL") {
        settings.store_url = v;
    }
    if let Ok(v) = std::env::var("PBN_STORE_API_KEY") {
        settings.store_api_key = Some(v);
    }
    if let Ok(v) = std::env::var("PBN_STORE_FOLDER") {
        settings.store_folder = Some(v);
    }
    if let Ok(v) = std::env::var("PBN_BACKEND_URL") {
        settings.backend_url = v;
    }
    if let Ok(v) = std::env::var("PBN_UPLOAD_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse() {
            settings.upload_timeout_secs = Some(parsed);
        }
    }
    if let Ok(v) = std::env::var("PBN_DISPATCH_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse() {
            settings.dispatch_timeout_secs = Some(parsed);
        }
    }

    settings
}
