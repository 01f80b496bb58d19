//! Conversion between transport text (base64 with an optional
//! `data:image/<fmt>;base64,` header) and decoded images.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

/// Largest decoded image accepted (10MB)
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Image data is empty")]
    EmptyData,
    #[error("Invalid base64 encoding: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("Image data is too large: {0} bytes (max: {1} bytes)")]
    TooLarge(usize, usize),
    #[error("Unsupported image format")]
    UnsupportedFormat,
    #[error("Failed to decode image: {0}")]
    DecodeFailed(String),
    #[error("Failed to encode image as {format}: {reason}")]
    EncodeFailed { format: String, reason: String },
}

/// Drops everything up to and including the first comma. The header is not
/// inspected; the bytes decide the format.
fn strip_header(text: &str) -> &str {
    match text.split_once(',') {
        Some((_header, encoded)) => encoded,
        None => text,
    }
}

pub fn decode(text: &str) -> Result<DynamicImage, CodecError> {
    // Line-wrapped payloads (e.g. `base64` CLI output) are accepted.
    let encoded: String = strip_header(text)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if encoded.is_empty() {
        return Err(CodecError::EmptyData);
    }

    let bytes = STANDARD.decode(&encoded)?;
    if bytes.is_empty() {
        return Err(CodecError::EmptyData);
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(CodecError::TooLarge(bytes.len(), MAX_IMAGE_BYTES));
    }

    let format = detect_format(&bytes)?;
    image::load_from_memory_with_format(&bytes, format)
        .map_err(|e| CodecError::DecodeFailed(e.to_string()))
}

pub fn encode(image: &DynamicImage, format: ImageFormat) -> Result<String, CodecError> {
    let name = format_name(format);
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), format)
        .map_err(|e| CodecError::EncodeFailed {
            format: name.to_string(),
            reason: e.to_string(),
        })?;

    Ok(format!("data:image/{};base64,{}", name, STANDARD.encode(&buffer)))
}

pub fn encode_png(image: &DynamicImage) -> Result<String, CodecError> {
    encode(image, ImageFormat::Png)
}

/// Detect image format from magic bytes
pub fn detect_format(bytes: &[u8]) -> Result<ImageFormat, CodecError> {
    match bytes {
        [0x89, 0x50, 0x4E, 0x47, ..] => Ok(ImageFormat::Png),
        [0xFF, 0xD8, 0xFF, ..] => Ok(ImageFormat::Jpeg),
        [0x52, 0x49, 0x46, 0x46, _, _, _, _, 0x57, 0x45, 0x42, 0x50, ..] => Ok(ImageFormat::WebP),
        [0x47, 0x49, 0x46, 0x38, x, ..] if *x == 0x37 || *x == 0x39 => Ok(ImageFormat::Gif),
        [0x42, 0x4D, ..] => Ok(ImageFormat::Bmp),
        [0x49, 0x49, 0x2A, 0x00, ..] | [0x4D, 0x4D, 0x00, 0x2A, ..] => Ok(ImageFormat::Tiff),
        _ => Err(CodecError::UnsupportedFormat),
    }
}

fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::WebP => "webp",
        ImageFormat::Gif => "gif",
        ImageFormat::Bmp => "bmp",
        ImageFormat::Tiff => "tiff",
        _ => "octet-stream",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    pub(crate) fn sample_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8, 255])
        }))
    }

    pub(crate) fn sample_png_base64(width: u32, height: u32) -> String {
        encode_png(&sample_image(width, height)).unwrap()
    }

    #[test]
    fn png_round_trip_is_pixel_exact() {
        let original = sample_image(17, 9);
        let decoded = decode(&encode_png(&original).unwrap()).unwrap();
        assert_eq!(decoded.to_rgba8(), original.to_rgba8());
    }

    #[test]
    fn encode_writes_lowercase_media_type_header() {
        let text = encode(&sample_image(2, 2), ImageFormat::Png).unwrap();
        assert!(text.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn decode_tolerates_missing_header() {
        let with_header = sample_png_base64(5, 5);
        let (_, bare) = with_header.split_once(',').unwrap();

        let a = decode(&with_header).unwrap();
        let b = decode(bare).unwrap();
        assert_eq!(a.to_rgba8(), b.to_rgba8());
    }

    #[test]
    fn decode_ignores_header_contents() {
        let with_header = sample_png_base64(3, 3);
        let (_, bare) = with_header.split_once(',').unwrap();
        let mislabeled = format!("data:image/jpeg;base64,{bare}");
        assert!(decode(&mislabeled).is_ok());
    }

    #[test]
    fn jpeg_round_trip_keeps_dimensions() {
        let original = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 6, Rgb([200, 40, 40])));
        let text = encode(&original, ImageFormat::Jpeg).unwrap();
        assert!(text.starts_with("data:image/jpeg;base64,"));
        let decoded = decode(&text).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 6));
    }

    #[test]
    fn decode_accepts_line_wrapped_base64() {
        let text = sample_png_base64(16, 16);
        let (_, bare) = text.split_once(',').unwrap();
        let wrapped = bare
            .as_bytes()
            .chunks(76)
            .map(|line| std::str::from_utf8(line).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(wrapped.contains('\n'));

        let decoded = decode(&format!("data:image/png;base64,{wrapped}\r\n")).unwrap();
        assert_eq!(decoded.to_rgba8(), sample_image(16, 16).to_rgba8());
    }

    #[test]
    fn oversized_image_is_rejected() {
        let text = STANDARD.encode(vec![0u8; MAX_IMAGE_BYTES + 1]);
        match decode(&text) {
            Err(CodecError::TooLarge(size, max)) => {
                assert_eq!(size, MAX_IMAGE_BYTES + 1);
                assert_eq!(max, MAX_IMAGE_BYTES);
            }
            other => panic!("expected TooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn malformed_base64_is_rejected() {
        assert!(matches!(
            decode("data:image/png;base64,@@not-base64@@"),
            Err(CodecError::InvalidBase64(_))
        ));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(decode(""), Err(CodecError::EmptyData)));
        assert!(matches!(decode("data:image/png;base64,"), Err(CodecError::EmptyData)));
    }

    #[test]
    fn non_image_bytes_are_rejected() {
        let text = STANDARD.encode(b"definitely not an image");
        assert!(matches!(decode(&text), Err(CodecError::UnsupportedFormat)));
    }

    #[test]
    fn truncated_png_fails_to_decode() {
        let text = sample_png_base64(4, 4);
        let (_, bare) = text.split_once(',').unwrap();
        let mut bytes = STANDARD.decode(bare).unwrap();
        bytes.truncate(24);
        let truncated = STANDARD.encode(&bytes);
        assert!(matches!(decode(&truncated), Err(CodecError::DecodeFailed(_))));
    }
}
