//! Engine image handles and primitive transforms
//!
//! [`EngineImage`] is the opaque handle to decoded pixel state inside the
//! engine. It is not `Clone`: every primitive takes the handle by value and
//! returns a new one, so reusing a consumed handle is a compile error. The
//! allocation guard inside the handle deregisters on drop, which releases
//! the handle on every exit path of an aborted chain.

use std::sync::Arc;

use fast_image_resize as fr;
use image::{DynamicImage, RgbImage, Rgba, RgbaImage};
use img_parts::ImageICC;
use tracing::debug;

use crate::engine::{Engine, Shared, TrackedStats, MAX_DIMENSION};
use crate::error::{Error, Result};
use crate::font;
use crate::format::ImageType;
use crate::options::{Direction, Extend, Interpolator, Interpretation, Watermark, WatermarkImage};

/// Registration of one live handle with the engine's tracked stats.
struct AllocGuard {
    stats: Arc<TrackedStats>,
    bytes: usize,
}

impl AllocGuard {
    fn new(stats: Arc<TrackedStats>, bytes: usize) -> Self {
        stats.track(bytes);
        AllocGuard { stats, bytes }
    }
}

impl Drop for AllocGuard {
    fn drop(&mut self) {
        self.stats.release(self.bytes);
    }
}

/// Opaque handle to pixel and format state held by the engine. Exclusively
/// owned; consumed by every primitive call.
pub(crate) struct EngineImage {
    pixels: DynamicImage,
    profile: Option<Vec<u8>>,
    orientation: u8,
    shared: Arc<Shared>,
    #[allow(dead_code)]
    alloc: AllocGuard,
}

impl std::fmt::Debug for EngineImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineImage")
            .field("pixels", &self.pixels)
            .field("orientation", &self.orientation)
            .finish_non_exhaustive()
    }
}

/// Encoder parameters applied by [`EngineImage::save`].
pub(crate) struct SaveParams {
    pub image_type: ImageType,
    pub quality: u8,
    pub compression: u8,
    pub interlace: bool,
    pub no_profile: bool,
    pub interpretation: Interpretation,
}

impl Engine {
    /// Decode a buffer into a fresh handle, returning the detected format.
    pub(crate) fn load(&self, buf: &[u8]) -> Result<(EngineImage, ImageType)> {
        self.load_shrunk(buf, 1)
    }

    /// Decode with an integer shrink applied during load. The shrink-on-load
    /// fast path for JPEG resizes lands here.
    pub(crate) fn load_shrunk(&self, buf: &[u8], shrink: u32) -> Result<(EngineImage, ImageType)> {
        self.ensure_initialized()?;
        let image_type = ImageType::detect(buf);
        if image_type == ImageType::Unknown {
            return Err(Error::UnsupportedFormat);
        }
        let pixels = self.shared().decode(buf, shrink)?;
        let profile = read_profile(buf, image_type);
        let orientation = read_orientation(buf);
        Ok((
            EngineImage::new(self.shared().clone(), pixels, profile, orientation),
            image_type,
        ))
    }
}

/// Header-only dimension probe; no full decode.
pub(crate) fn probe_dimensions(buf: &[u8]) -> Result<(u32, u32)> {
    image::ImageReader::new(std::io::Cursor::new(buf))
        .with_guessed_format()
        .map_err(Error::engine)?
        .into_dimensions()
        .map_err(Error::engine)
}

impl EngineImage {
    fn new(
        shared: Arc<Shared>,
        pixels: DynamicImage,
        profile: Option<Vec<u8>>,
        orientation: u8,
    ) -> Self {
        let alloc = AllocGuard::new(shared.stats().clone(), pixels.as_bytes().len());
        EngineImage {
            pixels,
            profile,
            orientation,
            shared,
            alloc,
        }
    }

    /// Consume this handle and produce its successor, carrying over the
    /// profile and orientation state.
    fn succeed(self, pixels: DynamicImage) -> EngineImage {
        let EngineImage {
            profile,
            orientation,
            shared,
            ..
        } = self;
        EngineImage::new(shared, pixels, profile, orientation)
    }

    // ---- read-only queries ----

    pub(crate) fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub(crate) fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub(crate) fn has_alpha(&self) -> bool {
        self.pixels.color().has_alpha()
    }

    pub(crate) fn has_profile(&self) -> bool {
        self.profile.is_some()
    }

    /// EXIF orientation (1-8; 1 when absent).
    pub(crate) fn orientation(&self) -> u8 {
        self.orientation
    }

    pub(crate) fn interpretation(&self) -> Interpretation {
        use image::ColorType;
        match self.pixels.color() {
            ColorType::L8 | ColorType::La8 => Interpretation::Grey,
            ColorType::L16 | ColorType::La16 => Interpretation::Grey16,
            ColorType::Rgb16 | ColorType::Rgba16 => Interpretation::Rgb16,
            ColorType::Rgb32F | ColorType::Rgba32F => Interpretation::Float,
            _ => Interpretation::Srgb,
        }
    }

    pub(crate) fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    // ---- primitive transforms ----

    /// Rotate by a multiple of 90 degrees clockwise.
    pub(crate) fn rotate(self, angle: u32) -> Result<EngineImage> {
        let rotated = match angle % 360 {
            0 => return Ok(self),
            90 => self.pixels.rotate90(),
            180 => self.pixels.rotate180(),
            270 => self.pixels.rotate270(),
            other => return Err(Error::invalid(format!("rotation angle {other} is not a multiple of 90"))),
        };
        Ok(self.succeed(rotated))
    }

    pub(crate) fn flip(self, direction: Direction) -> Result<EngineImage> {
        let flipped = match direction {
            Direction::Vertical => self.pixels.flipv(),
            Direction::Horizontal => self.pixels.fliph(),
        };
        Ok(self.succeed(flipped))
    }

    /// Integer downscale by a box filter; cheap precursor to the
    /// float-precision affine.
    pub(crate) fn shrink(self, factor: u32) -> Result<EngineImage> {
        if factor <= 1 {
            return Ok(self);
        }
        let w = (self.width() / factor).max(1);
        let h = (self.height() / factor).max(1);
        let shrunk = box_shrink(&self.shared, &self.pixels, w, h)?;
        Ok(self.succeed(shrunk))
    }

    /// Float-precision scale by independent x/y factors.
    pub(crate) fn affine(self, sx: f64, sy: f64, interpolator: Interpolator) -> Result<EngineImage> {
        if sx <= 0.0 || sy <= 0.0 {
            return Err(Error::invalid("affine scale factors must be positive"));
        }
        let w = ((self.width() as f64 * sx).round() as u32).max(1);
        let h = ((self.height() as f64 * sy).round() as u32).max(1);
        if w == self.width() && h == self.height() {
            return Ok(self);
        }
        let scaled = resample(&self.shared, &self.pixels, w, h, resize_alg(interpolator))?;
        Ok(self.succeed(scaled))
    }

    /// Crop to the given area.
    pub(crate) fn extract(self, left: u32, top: u32, width: u32, height: u32) -> Result<EngineImage> {
        if width == 0 || height == 0 {
            return Err(Error::invalid("extract area width/height is required"));
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(Error::SizeExceeded);
        }
        if left.saturating_add(width) > self.width() || top.saturating_add(height) > self.height() {
            return Err(Error::invalid("extract area is out of bounds"));
        }
        let cropped = self.pixels.crop_imm(left, top, width, height);
        Ok(self.succeed(cropped))
    }

    /// Pad onto a `width` x `height` canvas with the image placed at
    /// (`left`, `top`).
    pub(crate) fn embed(
        self,
        left: u32,
        top: u32,
        width: u32,
        height: u32,
        extend: Extend,
    ) -> Result<EngineImage> {
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(Error::SizeExceeded);
        }
        if left.saturating_add(self.width()) > width || top.saturating_add(self.height()) > height {
            return Err(Error::invalid("embed canvas is smaller than the image"));
        }

        let keep_alpha = self.has_alpha();
        let padded = match extend {
            Extend::Copy => {
                let src = self.pixels.to_rgba8();
                let (sw, sh) = (self.width() as i64, self.height() as i64);
                let mut canvas = RgbaImage::new(width, height);
                for (x, y, px) in canvas.enumerate_pixels_mut() {
                    let sx = (x as i64 - left as i64).clamp(0, sw - 1) as u32;
                    let sy = (y as i64 - top as i64).clamp(0, sh - 1) as u32;
                    *px = *src.get_pixel(sx, sy);
                }
                DynamicImage::ImageRgba8(canvas)
            }
            Extend::Black | Extend::White => {
                let v = if extend == Extend::White { 255 } else { 0 };
                let mut canvas = RgbaImage::from_pixel(width, height, Rgba([v, v, v, 255]));
                image::imageops::overlay(
                    &mut canvas,
                    &self.pixels.to_rgba8(),
                    left as i64,
                    top as i64,
                );
                DynamicImage::ImageRgba8(canvas)
            }
        };
        let padded = restore_colour(padded, keep_alpha);
        Ok(self.succeed(padded))
    }

    /// Convert pixel data to the target interpretation. No-op when already
    /// there.
    pub(crate) fn colourspace(self, target: Interpretation) -> Result<EngineImage> {
        if self.interpretation() == target {
            return Ok(self);
        }
        let alpha = self.has_alpha();
        let converted = match target {
            Interpretation::Srgb => {
                if alpha {
                    DynamicImage::ImageRgba8(self.pixels.to_rgba8())
                } else {
                    DynamicImage::ImageRgb8(self.pixels.to_rgb8())
                }
            }
            Interpretation::Grey => {
                if alpha {
                    DynamicImage::ImageLumaA8(self.pixels.to_luma_alpha8())
                } else {
                    DynamicImage::ImageLuma8(self.pixels.to_luma8())
                }
            }
            Interpretation::Rgb16 => {
                if alpha {
                    DynamicImage::ImageRgba16(self.pixels.to_rgba16())
                } else {
                    DynamicImage::ImageRgb16(self.pixels.to_rgb16())
                }
            }
            Interpretation::Grey16 => {
                if alpha {
                    DynamicImage::ImageLumaA16(self.pixels.to_luma_alpha16())
                } else {
                    DynamicImage::ImageLuma16(self.pixels.to_luma16())
                }
            }
            Interpretation::Float => {
                return Err(Error::invalid("no conversion defined for float interpretation"))
            }
        };
        Ok(self.succeed(converted))
    }

    /// Composite a rasterized text overlay, tiled across the image unless
    /// `no_replicate` is set.
    pub(crate) fn watermark_text(self, mark: &Watermark) -> Result<EngineImage> {
        if mark.text.is_empty() {
            return Err(Error::invalid("watermark text is required"));
        }
        let scale = (mark.dpi / 72).max(1);
        let alpha = (mark.opacity.clamp(0.0, 1.0) * 255.0) as u8;
        let tile = font::render_text(&mark.text, scale, mark.background, alpha);

        let keep_alpha = self.has_alpha();
        let mut canvas = self.pixels.to_rgba8();
        let margin = mark.margin as i64;
        if mark.no_replicate {
            image::imageops::overlay(&mut canvas, &tile, margin, margin);
        } else {
            let step_x = (tile.width() as i64 + margin).max(1);
            let step_y = (tile.height() as i64 + margin).max(1);
            let mut y = margin;
            while y < canvas.height() as i64 {
                let mut x = margin;
                while x < canvas.width() as i64 {
                    image::imageops::overlay(&mut canvas, &tile, x, y);
                    x += step_x;
                }
                y += step_y;
            }
        }
        let composited = restore_colour(DynamicImage::ImageRgba8(canvas), keep_alpha);
        Ok(self.succeed(composited))
    }

    /// Composite a decoded overlay image at the given position.
    pub(crate) fn watermark_image(self, mark: &WatermarkImage) -> Result<EngineImage> {
        if mark.buf.is_empty() {
            return Err(Error::invalid("watermark image buffer is required"));
        }
        let overlay = image::ImageReader::new(std::io::Cursor::new(&mark.buf[..]))
            .with_guessed_format()
            .map_err(Error::engine)?
            .decode()
            .map_err(Error::engine)?;
        let mut overlay = overlay.to_rgba8();

        let opacity = mark.opacity.clamp(0.0, 1.0);
        if opacity < 1.0 {
            for px in overlay.pixels_mut() {
                px[3] = (px[3] as f32 * opacity) as u8;
            }
        }

        let keep_alpha = self.has_alpha();
        let mut canvas = self.pixels.to_rgba8();
        image::imageops::overlay(&mut canvas, &overlay, mark.left as i64, mark.top as i64);
        let composited = restore_colour(DynamicImage::ImageRgba8(canvas), keep_alpha);
        Ok(self.succeed(composited))
    }

    // ---- save ----

    /// Pre-save normalization followed by encode. Consumes the handle.
    pub(crate) fn save(self, params: &SaveParams) -> Result<Vec<u8>> {
        let img = self.pre_save(params)?;
        let profile = if params.no_profile {
            None
        } else {
            img.profile.clone()
        };

        let data = match params.image_type {
            ImageType::Webp => encode_webp(&img.pixels, params.quality),
            ImageType::Png => {
                if params.interlace {
                    debug!("interlaced output is not supported for png, ignoring");
                }
                encode_png(&img.pixels, params.compression)?
            }
            // JPEG is the default encoder for everything else.
            _ => encode_jpeg(&img.pixels, params.quality, params.interlace)?,
        };

        match profile {
            Some(icc) => attach_profile(data, params.image_type, &icc),
            None => Ok(data),
        }
    }

    /// Strip the profile if requested and coerce the colourspace to the
    /// configured interpretation. Conversion is skipped silently when the
    /// current interpretation has no conversion defined.
    fn pre_save(mut self, params: &SaveParams) -> Result<EngineImage> {
        if params.no_profile {
            self.profile = None;
        }
        let current = self.interpretation();
        if current == params.interpretation {
            return Ok(self);
        }
        if !current.is_convertible() {
            debug!(?current, "colourspace not convertible, keeping as-is");
            return Ok(self);
        }
        self.colourspace(params.interpretation)
    }
}

/// Convert an RGBA composite back to RGB when the source had no alpha, so
/// compositing does not invent an alpha channel. Composites are 8-bit:
/// deeper sources come out of embed/watermark as 8-bit RGB(A).
fn restore_colour(pixels: DynamicImage, keep_alpha: bool) -> DynamicImage {
    if keep_alpha {
        pixels
    } else {
        DynamicImage::ImageRgb8(pixels.to_rgb8())
    }
}

fn resize_alg(interpolator: Interpolator) -> fr::ResizeAlg {
    match interpolator {
        Interpolator::Nearest => fr::ResizeAlg::Nearest,
        Interpolator::Bilinear => fr::ResizeAlg::Convolution(fr::FilterType::Bilinear),
        Interpolator::Bicubic => fr::ResizeAlg::Convolution(fr::FilterType::CatmullRom),
        Interpolator::Lanczos3 => fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3),
    }
}

/// Integer box downscale used by the shrink primitive and shrink-on-load.
pub(crate) fn box_shrink(
    shared: &Shared,
    src: &DynamicImage,
    width: u32,
    height: u32,
) -> Result<DynamicImage> {
    resample(
        shared,
        src,
        width,
        height,
        fr::ResizeAlg::Convolution(fr::FilterType::Box),
    )
}

/// SIMD resample on the engine worker pool. Grey and alpha presence survive
/// the resample; 16-bit and float samples are coerced to 8-bit first, the
/// resampler has no deeper path.
fn resample(
    shared: &Shared,
    src: &DynamicImage,
    width: u32,
    height: u32,
    alg: fr::ResizeAlg,
) -> Result<DynamicImage> {
    if width == 0 || height == 0 {
        return Err(Error::invalid("target dimensions must be positive"));
    }
    let (raw, pixel_type) = match src {
        DynamicImage::ImageLuma8(img) => (img.as_raw().clone(), fr::PixelType::U8),
        DynamicImage::ImageLumaA8(img) => (img.as_raw().clone(), fr::PixelType::U8x2),
        DynamicImage::ImageLuma16(_) => (src.to_luma8().into_raw(), fr::PixelType::U8),
        DynamicImage::ImageLumaA16(_) => (src.to_luma_alpha8().into_raw(), fr::PixelType::U8x2),
        _ if src.color().has_alpha() => (src.to_rgba8().into_raw(), fr::PixelType::U8x4),
        _ => (src.to_rgb8().into_raw(), fr::PixelType::U8x3),
    };
    let src_image = fr::images::Image::from_vec_u8(src.width(), src.height(), raw, pixel_type)
        .map_err(Error::engine)?;
    let mut dst = fr::images::Image::new(width, height, pixel_type);

    let pool = shared.worker_pool()?;
    let options = fr::ResizeOptions::new().resize_alg(alg);
    pool.install(|| fr::Resizer::new().resize(&src_image, &mut dst, &options))
        .map_err(Error::engine)?;

    let buf = dst.buffer().to_vec();
    let out = match pixel_type {
        fr::PixelType::U8 => {
            image::GrayImage::from_raw(width, height, buf).map(DynamicImage::ImageLuma8)
        }
        fr::PixelType::U8x2 => {
            image::GrayAlphaImage::from_raw(width, height, buf).map(DynamicImage::ImageLumaA8)
        }
        fr::PixelType::U8x3 => RgbImage::from_raw(width, height, buf).map(DynamicImage::ImageRgb8),
        fr::PixelType::U8x4 => {
            RgbaImage::from_raw(width, height, buf).map(DynamicImage::ImageRgba8)
        }
        _ => None,
    };
    out.ok_or_else(|| Error::Engine("resampled buffer has unexpected size".into()))
}

// ---- codecs ----

fn encode_jpeg(pixels: &DynamicImage, quality: u8, progressive: bool) -> Result<Vec<u8>> {
    let rgb = pixels.to_rgb8();
    let (w, h) = rgb.dimensions();

    let mut comp = mozjpeg::Compress::new(mozjpeg::ColorSpace::JCS_RGB);
    comp.set_size(w as usize, h as usize);
    comp.set_quality(quality as f32);
    if progressive {
        comp.set_progressive_mode();
    }
    comp.set_optimize_coding(true);

    let mut started = comp.start_compress(Vec::new()).map_err(Error::engine)?;
    started.write_scanlines(rgb.as_raw()).map_err(Error::engine)?;
    started.finish().map_err(Error::engine)
}

fn encode_png(pixels: &DynamicImage, compression: u8) -> Result<Vec<u8>> {
    use image::codecs::png::{CompressionType, FilterType, PngEncoder};

    let compression = match compression {
        1..=3 => CompressionType::Fast,
        7..=9 => CompressionType::Best,
        _ => CompressionType::Default,
    };
    let mut buf = Vec::new();
    let encoder = PngEncoder::new_with_quality(
        std::io::Cursor::new(&mut buf),
        compression,
        FilterType::Adaptive,
    );
    pixels.write_with_encoder(encoder).map_err(Error::engine)?;
    Ok(buf)
}

fn encode_webp(pixels: &DynamicImage, quality: u8) -> Vec<u8> {
    let (w, h) = (pixels.width(), pixels.height());
    if pixels.color().has_alpha() {
        let rgba = pixels.to_rgba8();
        webp::Encoder::from_rgba(&rgba, w, h)
            .encode(quality as f32)
            .to_vec()
    } else {
        let rgb = pixels.to_rgb8();
        webp::Encoder::from_rgb(&rgb, w, h)
            .encode(quality as f32)
            .to_vec()
    }
}

// ---- buffer-level metadata ----

fn read_profile(buf: &[u8], image_type: ImageType) -> Option<Vec<u8>> {
    match image_type {
        ImageType::Jpeg => img_parts::jpeg::Jpeg::from_bytes(buf.to_vec().into())
            .ok()?
            .icc_profile()
            .map(|b| b.to_vec()),
        ImageType::Png => img_parts::png::Png::from_bytes(buf.to_vec().into())
            .ok()?
            .icc_profile()
            .map(|b| b.to_vec()),
        ImageType::Webp => img_parts::webp::WebP::from_bytes(buf.to_vec().into())
            .ok()?
            .icc_profile()
            .map(|b| b.to_vec()),
        _ => None,
    }
}

fn attach_profile(data: Vec<u8>, image_type: ImageType, icc: &[u8]) -> Result<Vec<u8>> {
    match image_type {
        ImageType::Jpeg => {
            let mut jpeg =
                img_parts::jpeg::Jpeg::from_bytes(data.into()).map_err(Error::engine)?;
            jpeg.set_icc_profile(Some(icc.to_vec().into()));
            Ok(jpeg.encoder().bytes().to_vec())
        }
        ImageType::Png => {
            let mut png = img_parts::png::Png::from_bytes(data.into()).map_err(Error::engine)?;
            png.set_icc_profile(Some(icc.to_vec().into()));
            Ok(png.encoder().bytes().to_vec())
        }
        _ => Ok(data),
    }
}

pub(crate) fn read_orientation(buf: &[u8]) -> u8 {
    let mut cursor = std::io::Cursor::new(buf);
    match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(data) => data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|f| f.value.get_uint(0))
            .map(|v| v.clamp(1, 8) as u8)
            .unwrap_or(1),
        Err(_) => 1,
    }
}
