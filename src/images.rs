//! Image handling: format checks, WebP thumbnails, uploads and remote fetch.

use std::io::Cursor;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use image::{GenericImageView, ImageFormat};
use rusty_ulid::Ulid;
use serde::Serialize;

use crate::storage::BlobStore;

/// Upload size limit (10 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Longest thumbnail edge in pixels
pub const THUMBNAIL_SIZE: u32 = 300;

const THUMBNAIL_QUALITY: u8 = 85;

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Formats accepted for queries and uploads.
pub const SUPPORTED_FORMATS: [ImageFormat; 5] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Bmp,
    ImageFormat::Gif,
];

/// Detect a supported image format from magic bytes.
pub fn sniff_format(data: &[u8]) -> Option<ImageFormat> {
    image::guess_format(data)
        .ok()
        .filter(|format| SUPPORTED_FORMATS.contains(format))
}

pub fn extension_of(format: ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("img")
}

/// Resize to fit `max_dimension` (keeping aspect ratio) and encode as lossy WebP.
///
/// Returns the WebP bytes and the original dimensions.
pub fn make_thumbnail(data: &[u8], max_dimension: u32, quality: u8) -> Result<(Vec<u8>, (u32, u32))> {
    let img = image::load_from_memory(data).context("Failed to decode image")?;
    let (orig_w, orig_h) = img.dimensions();

    let processed = if orig_w > max_dimension || orig_h > max_dimension {
        img.thumbnail(max_dimension, max_dimension)
    } else {
        img
    };

    let rgba = processed.to_rgba8();
    let (width, height) = rgba.dimensions();
    let encoded = webp::Encoder::from_rgba(&rgba, width, height).encode(quality as f32);

    Ok((encoded.to_vec(), (orig_w, orig_h)))
}

/// Small generated PNG used to probe image model dimensions.
pub fn probe_png() -> Result<Vec<u8>> {
    let img = image::RgbImage::from_fn(32, 32, |x, y| {
        image::Rgb([(x * 8) as u8, (y * 8) as u8, 128])
    });

    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .context("Failed to encode probe image")?;
    Ok(buf)
}

/// Metadata returned for a stored upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadedImage {
    pub filename: String,
    pub size: usize,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub content_type: String,
    /// Key under the uploads store
    pub image_path: String,
    pub thumbnail_path: String,
}

/// Validate an upload, store it under a ULID name and write its thumbnail.
pub fn store_upload(
    store: &dyn BlobStore,
    data: &[u8],
    original_name: Option<&str>,
    max_bytes: usize,
) -> Result<UploadedImage> {
    if data.is_empty() {
        bail!("Empty image upload");
    }
    if data.len() > max_bytes {
        bail!(
            "Image is {} bytes, the limit is {} bytes",
            data.len(),
            max_bytes
        );
    }

    let format = sniff_format(data).context("Unsupported image format")?;
    let (thumbnail, (width, height)) = make_thumbnail(data, THUMBNAIL_SIZE, THUMBNAIL_QUALITY)?;

    let id = Ulid::generate().to_string();
    let image_path = format!("{id}.{}", extension_of(format));
    let thumbnail_path = format!("thumbnails/{id}_thumb.webp");

    store
        .write(&image_path, data)
        .context("Failed to store uploaded image")?;
    if let Err(e) = store.write(&thumbnail_path, &thumbnail) {
        if let Err(cleanup) = store.delete(&image_path) {
            log::warn!("Failed to remove {} after thumbnail error: {}", image_path, cleanup);
        }
        return Err(e).context("Failed to store thumbnail");
    }

    log::info!(
        "Stored upload {} ({} bytes, {}x{})",
        image_path,
        data.len(),
        width,
        height
    );

    Ok(UploadedImage {
        filename: original_name.unwrap_or(&image_path).to_string(),
        size: data.len(),
        width,
        height,
        format: extension_of(format).to_string(),
        content_type: format.to_mime_type().to_string(),
        image_path,
        thumbnail_path,
    })
}

/// Fetch a remote image and store it like an upload. The original filename
/// is the last segment of the URL path.
pub fn store_remote(
    store: &dyn BlobStore,
    fetcher: &dyn ImageFetcher,
    url: &str,
    max_bytes: usize,
) -> Result<UploadedImage> {
    let data = fetcher.fetch(url)?;
    let name = url::Url::parse(url).ok().and_then(|parsed| {
        parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .filter(|segment| !segment.is_empty())
    });

    store_upload(store, &data, name.as_deref(), max_bytes)
}

/// Retrieves remote images for queries and catalog items.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Fetches images over HTTP with a blocking client.
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    timeout: Duration,
    max_bytes: usize,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Self {
        Self { timeout, max_bytes }
    }
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_UPLOAD_BYTES)
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let parsed = url::Url::parse(url).with_context(|| format!("Invalid image URL {url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("Unsupported URL scheme {}", parsed.scheme());
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;

        let response = client
            .get(parsed)
            .send()
            .with_context(|| format!("Failed to fetch {url}"))?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let bytes = response.bytes()?.to_vec();
        if bytes.len() > self.max_bytes {
            bail!("Remote image exceeds {} bytes", self.max_bytes);
        }

        let sniffed_image = infer::get(&bytes)
            .map(|kind| kind.matcher_type() == infer::MatcherType::Image)
            .unwrap_or(false);

        if !content_type.starts_with("image/") && !sniffed_image {
            bail!("URL does not point to an image (content type '{content_type}')");
        }

        Ok(bytes)
    }
}
