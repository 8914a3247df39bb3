//! Transform request options
//!
//! An [`Options`] value describes one composite operation. It is immutable
//! per call: the pipeline only reads it.

use crate::format::ImageType;

/// Anchor used when cropping to a target aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Gravity {
    #[default]
    Centre,
    North,
    East,
    South,
    West,
    /// Pick the crop window covering the most detailed region.
    Smart,
}

/// Mirror axis for flip operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Top-bottom mirror.
    Vertical,
    /// Left-right mirror.
    Horizontal,
}

/// Resampling kernel for the affine scale primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolator {
    Nearest,
    Bilinear,
    #[default]
    Bicubic,
    Lanczos3,
}

/// Colour interpretation of decoded pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpretation {
    #[default]
    Srgb,
    Grey,
    Rgb16,
    Grey16,
    /// Float pixel data. No conversion defined; pre-save normalization
    /// skips these rather than erroring.
    Float,
}

impl Interpretation {
    /// Whether a colourspace conversion is defined for images in this
    /// interpretation.
    pub fn is_convertible(self) -> bool {
        !matches!(self, Interpretation::Float)
    }
}

/// Background fill used by the embed (pad) primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Extend {
    #[default]
    Black,
    White,
    /// Replicate the nearest edge pixel.
    Copy,
}

/// Text watermark parameters.
#[derive(Debug, Clone)]
pub struct Watermark {
    pub text: String,
    /// Rendering density; 72 draws glyphs at their base size.
    pub dpi: u32,
    /// Offset from the image edge, in pixels.
    pub margin: u32,
    pub opacity: f32,
    /// Disable tiling the text across the whole image.
    pub no_replicate: bool,
    /// Text colour.
    pub background: [u8; 3],
}

impl Default for Watermark {
    fn default() -> Self {
        Self {
            text: String::new(),
            dpi: 72,
            margin: 10,
            opacity: 0.25,
            no_replicate: false,
            background: [255, 255, 255],
        }
    }
}

/// Image watermark parameters.
#[derive(Debug, Clone)]
pub struct WatermarkImage {
    /// Encoded overlay image.
    pub buf: Vec<u8>,
    pub left: u32,
    pub top: u32,
    pub opacity: f32,
}

impl Default for WatermarkImage {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            left: 0,
            top: 0,
            opacity: 1.0,
        }
    }
}

/// Full description of a composite operation. The per-operation methods on
/// [`crate::Image`] build one of these; `process` accepts it directly.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Target width in pixels. 0 derives it from the source aspect ratio
    /// when a height is given.
    pub width: u32,
    /// Target height in pixels. 0 derives it from the source aspect ratio
    /// when a width is given.
    pub height: u32,

    // Extract area. Both dimensions must be set for an extract.
    pub area_left: u32,
    pub area_top: u32,
    pub area_width: u32,
    pub area_height: u32,

    /// Scale-to-cover then extract to the exact target.
    pub crop: bool,
    /// Pad to the exact target instead of leaving the image smaller.
    pub embed: bool,
    /// Permit scale factors above 1.
    pub enlarge: bool,

    /// Rotation in degrees; must be a multiple of 90 below 360.
    pub rotate: u32,
    /// Top-bottom mirror.
    pub flip: bool,
    /// Left-right mirror.
    pub flop: bool,
    /// Skip EXIF orientation normalization.
    pub no_auto_rotate: bool,

    pub gravity: Gravity,
    pub interpolator: Interpolator,
    pub extend: Extend,

    /// Output format. `Unknown` keeps the source format.
    pub image_type: ImageType,
    /// Encoder quality for JPEG/WEBP (1-100). 0 uses the default of 80.
    pub quality: u8,
    /// PNG compression level (1-9). 0 uses the default of 6.
    pub compression: u8,
    /// Progressive JPEG output.
    pub interlace: bool,
    /// Strip the embedded colour profile before save.
    pub no_profile: bool,
    /// Target interpretation for pre-save colourspace normalization.
    pub interpretation: Interpretation,

    pub watermark: Option<Watermark>,
    pub watermark_image: Option<WatermarkImage>,
}

pub(crate) const DEFAULT_QUALITY: u8 = 80;
pub(crate) const DEFAULT_COMPRESSION: u8 = 6;

impl Options {
    pub(crate) fn effective_quality(&self) -> u8 {
        if self.quality == 0 {
            DEFAULT_QUALITY
        } else {
            self.quality.min(100)
        }
    }

    pub(crate) fn effective_compression(&self) -> u8 {
        if self.compression == 0 {
            DEFAULT_COMPRESSION
        } else {
            self.compression.min(9)
        }
    }
}
