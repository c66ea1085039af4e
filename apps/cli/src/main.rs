use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Result};
use clap::Parser;
use client_core::{
    BackendConfig, HttpGenerationBackend, HttpRemoteStore, LocalFile, NoticeKind, StoreConfig,
    SubmissionGate, SubmissionGateConfig, UploadCoordinator, UploadCoordinatorConfig,
    UploadStatus,
};
use serde_json::json;
use shared::domain::{CanvasConfig, ColourEncoding};
use url::Url;

mod config;

#[derive(Parser, Debug)]
#[command(name = "pbn", about = "Generate a paint-by-numbers canvas from an image")]
struct Args {
    /// Image file to upload
    image: PathBuf,
    /// Number of colours on the canvas (1-30)
    #[arg(long, default_value_t = 20)]
    k_colours: i64,
    /// Colour encoding: BGR or RGB
    #[arg(long, default_value = "BGR")]
    encoding: String,
    /// Optional output filename
    #[arg(long)]
    filename: Option<String>,
    /// Superpixel segment count (default 200)
    #[arg(long)]
    segments: Option<i64>,
    /// Superpixel compactness (default 10)
    #[arg(long)]
    compactness: Option<i64>,
    /// Segmentation sigma, 0.1-1 (default 1)
    #[arg(long)]
    sigma: Option<f64>,
    /// Minimum region area ratio (default 0.0001)
    #[arg(long)]
    min_area: Option<f64>,
}

fn mime_for_path(path: &Path) -> Option<String> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => return None,
    };
    Some(mime.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();
    let settings = config::load_settings();

    let canvas = CanvasConfig {
        k_colours: args.k_colours,
        encoding: args.encoding.parse::<ColourEncoding>()?,
        filename: args.filename.clone(),
    };
    canvas.validate()?;

    let mut store_config = StoreConfig::new(Url::parse(&settings.store_url)?);
    store_config.api_key = settings.store_api_key.clone();
    store_config.request_timeout = settings.upload_timeout();
    if let Some(folder) = settings.store_folder.clone() {
        store_config.folder = folder;
    }
    let store = Arc::new(HttpRemoteStore::new(store_config));
    let coordinator = UploadCoordinator::with_config(
        store,
        UploadCoordinatorConfig {
            upload_timeout: settings.upload_timeout(),
            ..UploadCoordinatorConfig::default()
        },
    );

    let bytes = tokio::fs::read(&args.image).await?;
    let filename = args
        .image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let file = LocalFile {
        mime_type: mime_for_path(&args.image),
        filename,
        bytes,
    };

    let mut notices = coordinator.subscribe_notifications();
    coordinator.accept_file(file).await?;

    loop {
        let notice = notices.recv().await?;
        println!("{}", notice.message);
        match notice.kind {
            NoticeKind::UploadSucceeded | NoticeKind::UploadFailed => break,
            _ => {}
        }
    }

    let snapshot = coordinator.snapshot().await;
    if snapshot.status != UploadStatus::Success {
        bail!("upload did not complete; not submitting");
    }

    let mut backend_config = BackendConfig::new(Url::parse(&settings.backend_url)?);
    backend_config.request_timeout = settings.dispatch_timeout();
    let backend = Arc::new(HttpGenerationBackend::new(backend_config));
    let gate = SubmissionGate::with_config(
        backend,
        SubmissionGateConfig {
            dispatch_timeout: settings.dispatch_timeout(),
        },
    );

    let mut fields = BTreeMap::new();
    fields.insert("k_colours".to_string(), json!(canvas.k_colours));
    fields.insert("encoding".to_string(), json!(canvas.encoding.as_str()));
    if let Some(filename) = &canvas.filename {
        fields.insert("filename".to_string(), json!(filename));
    }
    if let Some(segments) = args.segments {
        fields.insert("segments".to_string(), json!(segments));
    }
    if let Some(compactness) = args.compactness {
        fields.insert("compactness".to_string(), json!(compactness));
    }
    if let Some(sigma) = args.sigma {
        fields.insert("sigma".to_string(), json!(sigma));
    }
    if let Some(min_area) = args.min_area {
        fields.insert("min_area".to_string(), json!(min_area));
    }

    let outcome = gate.submit(fields, &snapshot).await;
    println!("{}", outcome.message);
    if !outcome.success {
        bail!("canvas generation was not accepted");
    }
    Ok(())
}
