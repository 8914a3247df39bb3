//! Buffer inspection without transformation

use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::Result;
use crate::format::ImageType;

/// Pixel dimensions of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Properties read from an encoded image buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub size: Dimensions,
    #[serde(rename = "type")]
    pub image_type: ImageType,
    pub alpha: bool,
    /// Whether an ICC colour profile is embedded.
    pub profile: bool,
    /// EXIF orientation (1-8; 1 when absent).
    pub orientation: u8,
}

/// Decode just enough of the buffer to report its properties. The handle is
/// disposable; it is released before this returns.
pub(crate) fn metadata(engine: &Engine, buf: &[u8]) -> Result<Metadata> {
    let (img, image_type) = engine.load(buf)?;
    Ok(Metadata {
        size: Dimensions {
            width: img.width(),
            height: img.height(),
        },
        image_type,
        alpha: img.has_alpha(),
        profile: img.has_profile(),
        orientation: img.orientation(),
    })
}
