//! Fluent per-image API
//!
//! [`Image`] wraps an encoded buffer together with the engine that will
//! process it. Every operation consumes the current buffer, replaces it
//! with the operation's output, and returns a copy, so calls chain:
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = rastermill::Engine::default();
//! let buf = std::fs::read("photo.jpg")?;
//! let mut image = rastermill::Image::new(&engine, buf);
//! image.crop_by_width(300)?;
//! image.flip()?;
//! let out = image.convert(rastermill::ImageType::Png)?;
//! # let _ = out;
//! # Ok(())
//! # }
//! ```

use crate::engine::Engine;
use crate::error::Result;
use crate::format::ImageType;
use crate::metadata::{self, Dimensions, Metadata};
use crate::options::{Gravity, Options, Watermark, WatermarkImage};
use crate::pipeline;

/// An encoded image bound to an engine.
pub struct Image<'e> {
    engine: &'e Engine,
    buffer: Vec<u8>,
}

impl<'e> Image<'e> {
    pub fn new(engine: &'e Engine, buffer: Vec<u8>) -> Self {
        Image { engine, buffer }
    }

    /// Apply a composite operation. The image's buffer is replaced by the
    /// output, so further calls operate on the result.
    pub fn process(&mut self, options: Options) -> Result<Vec<u8>> {
        let out = pipeline::transform(self.engine, &self.buffer, &options)?;
        self.buffer = out.clone();
        Ok(out)
    }

    /// Scale to fit within `width` x `height` and pad to the exact size.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<Vec<u8>> {
        self.process(Options {
            width,
            height,
            embed: true,
            ..Default::default()
        })
    }

    /// Like [`resize`](Self::resize), but permits scaling up.
    pub fn enlarge(&mut self, width: u32, height: u32) -> Result<Vec<u8>> {
        self.process(Options {
            width,
            height,
            embed: true,
            enlarge: true,
            ..Default::default()
        })
    }

    /// Cut out the given area.
    pub fn extract(&mut self, left: u32, top: u32, width: u32, height: u32) -> Result<Vec<u8>> {
        self.process(Options {
            area_left: left,
            area_top: top,
            area_width: width,
            area_height: height,
            ..Default::default()
        })
    }

    /// Scale to cover `width` x `height`, then cut the target window at the
    /// given gravity.
    pub fn crop(&mut self, width: u32, height: u32, gravity: Gravity) -> Result<Vec<u8>> {
        self.process(Options {
            width,
            height,
            crop: true,
            gravity,
            ..Default::default()
        })
    }

    /// Crop to the given width, deriving the height from the aspect ratio.
    pub fn crop_by_width(&mut self, width: u32) -> Result<Vec<u8>> {
        self.process(Options {
            width,
            crop: true,
            ..Default::default()
        })
    }

    /// Crop to the given height, deriving the width from the aspect ratio.
    pub fn crop_by_height(&mut self, height: u32) -> Result<Vec<u8>> {
        self.process(Options {
            height,
            crop: true,
            ..Default::default()
        })
    }

    /// Centre-cropped square of the given edge length.
    pub fn thumbnail(&mut self, pixels: u32) -> Result<Vec<u8>> {
        self.process(Options {
            width: pixels,
            height: pixels,
            crop: true,
            ..Default::default()
        })
    }

    /// Rotate clockwise by a multiple of 90 degrees.
    pub fn rotate(&mut self, angle: u32) -> Result<Vec<u8>> {
        self.process(Options {
            rotate: angle,
            ..Default::default()
        })
    }

    /// Mirror top to bottom.
    pub fn flip(&mut self) -> Result<Vec<u8>> {
        self.process(Options {
            flip: true,
            ..Default::default()
        })
    }

    /// Mirror left to right.
    pub fn flop(&mut self) -> Result<Vec<u8>> {
        self.process(Options {
            flop: true,
            ..Default::default()
        })
    }

    /// Re-encode in the given format without touching geometry.
    pub fn convert(&mut self, image_type: ImageType) -> Result<Vec<u8>> {
        self.process(Options {
            image_type,
            ..Default::default()
        })
    }

    /// Composite a text watermark.
    pub fn watermark(&mut self, watermark: Watermark) -> Result<Vec<u8>> {
        self.process(Options {
            watermark: Some(watermark),
            ..Default::default()
        })
    }

    /// Composite another image as a watermark.
    pub fn watermark_image(&mut self, watermark: WatermarkImage) -> Result<Vec<u8>> {
        self.process(Options {
            watermark_image: Some(watermark),
            ..Default::default()
        })
    }

    /// Properties of the current buffer.
    pub fn metadata(&self) -> Result<Metadata> {
        metadata::metadata(self.engine, &self.buffer)
    }

    /// Pixel dimensions of the current buffer.
    pub fn size(&self) -> Result<Dimensions> {
        Ok(self.metadata()?.size)
    }

    /// Detected format of the current buffer.
    pub fn image_type(&self) -> ImageType {
        ImageType::detect(&self.buffer)
    }

    /// The current encoded buffer.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}
