// Image validation for archive-sourced candidates

use image::ImageFormat;
use std::io::Cursor;
use tracing::debug;

/// Encodings accepted by the pipeline
pub const SUPPORTED_FORMATS: &[ImageFormat] = &[
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Gif,
    ImageFormat::Bmp,
    ImageFormat::Tiff,
    ImageFormat::WebP,
];

/// File extensions that mark an archive entry as a candidate image
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp"];

pub fn has_image_extension(name: &str) -> bool {
    std::path::Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Signature sniff followed by a full decode.
///
/// The sniff rejects obviously wrong payloads cheaply; the decode catches
/// truncated or corrupt files whose header still looks right.
pub fn is_valid_image(bytes: &[u8]) -> bool {
    let format = match image::guess_format(bytes) {
        Ok(format) if SUPPORTED_FORMATS.contains(&format) => format,
        Ok(format) => {
            debug!("Rejected image with unsupported format {:?}", format);
            return false;
        }
        Err(e) => {
            debug!("Rejected payload with unknown signature: {}", e);
            return false;
        }
    };

    let mut reader = image::ImageReader::new(Cursor::new(bytes));
    reader.set_format(format);
    match reader.decode() {
        Ok(img) => img.width() > 0 && img.height() > 0,
        Err(e) => {
            debug!("Rejected {:?} payload that failed to decode: {}", format, e);
            false
        }
    }
}
