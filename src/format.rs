//! Image format detection from buffer content

use serde::{Deserialize, Serialize};

/// Detected image format. Always derived from magic bytes, never from a
/// filename extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Jpeg,
    Png,
    Webp,
    Tiff,
    /// Formats handled by the general-purpose decoder fallback (GIF, BMP).
    /// Load/detect only.
    Legacy,
    #[default]
    Unknown,
}

impl ImageType {
    /// Sniff the image format from the buffer's magic bytes.
    pub fn detect(buf: &[u8]) -> ImageType {
        if buf.is_empty() {
            return ImageType::Unknown;
        }
        match infer::get(buf).map(|t| t.mime_type()) {
            Some("image/jpeg") => ImageType::Jpeg,
            Some("image/png") => ImageType::Png,
            Some("image/webp") => ImageType::Webp,
            Some("image/tiff") => ImageType::Tiff,
            Some("image/gif") | Some("image/bmp") => ImageType::Legacy,
            _ => ImageType::Unknown,
        }
    }

    /// Whether the engine can encode to this format.
    pub fn can_save(self) -> bool {
        matches!(self, ImageType::Jpeg | ImageType::Png | ImageType::Webp)
    }

    /// Whether the engine can decode this format.
    pub fn can_load(self) -> bool {
        self != ImageType::Unknown
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageType::Jpeg => "jpeg",
            ImageType::Png => "png",
            ImageType::Webp => "webp",
            ImageType::Tiff => "tiff",
            ImageType::Legacy => "legacy",
            ImageType::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn encode(format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
        buf
    }

    #[test]
    fn detects_by_content() {
        assert_eq!(ImageType::detect(&encode(ImageFormat::Jpeg)), ImageType::Jpeg);
        assert_eq!(ImageType::detect(&encode(ImageFormat::Png)), ImageType::Png);
        assert_eq!(ImageType::detect(&encode(ImageFormat::Tiff)), ImageType::Tiff);
        assert_eq!(ImageType::detect(&encode(ImageFormat::Bmp)), ImageType::Legacy);
    }

    #[test]
    fn rejects_garbage_and_empty() {
        assert_eq!(ImageType::detect(b"not an image at all"), ImageType::Unknown);
        assert_eq!(ImageType::detect(&[]), ImageType::Unknown);
    }

    #[test]
    fn save_support_is_a_closed_set() {
        assert!(ImageType::Jpeg.can_save());
        assert!(ImageType::Png.can_save());
        assert!(ImageType::Webp.can_save());
        assert!(!ImageType::Tiff.can_save());
        assert!(!ImageType::Legacy.can_save());
        assert!(!ImageType::Unknown.can_save());
    }
}
