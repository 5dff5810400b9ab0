use image::{DynamicImage, ImageFormat, ImageResult};
use std::io::Cursor;

/// Decode an image of any supported encoding, sniffing the format from its bytes.
pub fn decode_image(bytes: &[u8]) -> ImageResult<DynamicImage> {
    image::load_from_memory(bytes)
}

/// Encode an image as PNG (lossless, keeps alpha and colour exactly).
pub fn encode_png(img: &DynamicImage) -> ImageResult<Vec<u8>> {
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)?;
    Ok(png_bytes)
}

/// Strip directories and extension from an upload name and keep it filesystem friendly.
pub fn file_stem_sanitized(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let stem = match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    };

    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();

    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned
    }
}
