//! Image optimization on the batch pool.
//!
//! An image is shrunk to fit the configured bounds, keeping its aspect
//! ratio, and re-encoded as JPEG next to the source as
//! `<stem>_optimized.jpg`. Images already inside the bounds are only
//! re-encoded. Sources over the size ceiling are refused before decoding.

use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::batch::BatchProcessor;
use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::telemetry::metrics;

const OPTIMIZED_SUFFIX: &str = "_optimized";

/// Outcome of optimizing one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReport {
    pub original_width: u32,
    pub original_height: u32,
    pub width: u32,
    pub height: u32,
    pub original_bytes: u64,
    pub optimized_bytes: u64,
    pub optimized_path: PathBuf,
    /// Optimized size over original size; below 1.0 means it shrank.
    pub compression_ratio: f64,
}

/// Where the optimized copy of `path` is written.
pub fn optimized_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}{OPTIMIZED_SUFFIX}.jpg"))
}

/// Optimize `path` on the calling thread.
pub fn optimize_image(path: &Path, config: &MediaConfig) -> Result<ImageReport> {
    let start = Instant::now();

    let original_bytes = std::fs::metadata(path)?.len();
    if original_bytes > config.max_file_bytes {
        warn!(
            path = %path.display(),
            size = original_bytes,
            limit = config.max_file_bytes,
            "image over size ceiling, skipped"
        );
        return Err(Error::FileTooLarge {
            path: path.to_path_buf(),
            size: original_bytes,
            limit: config.max_file_bytes,
        });
    }

    let source = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    let (original_width, original_height) = (source.width(), source.height());

    let fitted = if original_width > config.max_width || original_height > config.max_height {
        source.resize(config.max_width, config.max_height, FilterType::Lanczos3)
    } else {
        source
    };
    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(fitted.to_rgb8());

    let target = optimized_path(path);
    let mut writer = BufWriter::new(std::fs::File::create(&target)?);
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut writer, config.quality))?;
    writer.flush()?;
    drop(writer);

    let optimized_bytes = std::fs::metadata(&target)?.len();
    let compression_ratio = if original_bytes > 0 {
        optimized_bytes as f64 / original_bytes as f64
    } else {
        0.0
    };

    metrics::operation_duration_ms().record(
        start.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", "media.optimize")],
    );
    debug!(
        path = %path.display(),
        width = rgb.width(),
        height = rgb.height(),
        ratio = %format!("{compression_ratio:.2}"),
        "image optimized"
    );

    Ok(ImageReport {
        original_width,
        original_height,
        width: rgb.width(),
        height: rgb.height(),
        original_bytes,
        optimized_bytes,
        optimized_path: target,
        compression_ratio,
    })
}

/// Optimize `path` on the batch pool without blocking the runtime.
pub async fn optimize_image_on(batch: &BatchProcessor, path: PathBuf, config: MediaConfig) -> Result<ImageReport> {
    batch.spawn(move || optimize_image(&path, &config)).await
}

/// Whether `path` has an extension this module can decode.
pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            matches!(
                ext.to_ascii_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp"
            )
        })
}
