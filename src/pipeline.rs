//! Composite transform pipeline
//!
//! [`transform`] turns one source buffer plus an [`Options`] value into one
//! output buffer. Stages run in a fixed order: load (with the JPEG
//! shrink-on-load fast path), orientation normalization, rotate and mirror,
//! extract or resize, watermarks, save. Parameter validation happens before
//! the decode so oversized or malformed requests fail without touching
//! pixel data.

use image::DynamicImage;
use tracing::debug;

use crate::engine::{Engine, MAX_DIMENSION};
use crate::error::{Error, Result};
use crate::format::ImageType;
use crate::handle::{self, EngineImage, SaveParams};
use crate::options::{Direction, Gravity, Options};

/// Apply a composite operation to an encoded image buffer.
pub(crate) fn transform(engine: &Engine, buf: &[u8], options: &Options) -> Result<Vec<u8>> {
    engine.ensure_initialized()?;
    validate(buf, options)?;

    let source_type = ImageType::detect(buf);
    if source_type == ImageType::Unknown {
        return Err(Error::UnsupportedFormat);
    }

    let shrink = load_shrink(buf, source_type, options)?;
    if shrink > 1 {
        debug!(shrink, "shrink-on-load");
    }
    let (mut img, _) = engine.load_shrunk(buf, shrink)?;

    if !options.no_auto_rotate {
        img = auto_rotate(img)?;
    }
    if options.rotate > 0 {
        img = img.rotate(options.rotate)?;
    }
    if options.flip {
        img = img.flip(Direction::Vertical)?;
    }
    if options.flop {
        img = img.flip(Direction::Horizontal)?;
    }

    if let Some((tw, th)) = derive_target(img.width(), img.height(), options) {
        img = if options.crop {
            crop_stage(img, tw, th, options)?
        } else {
            resize_stage(img, tw, th, options)?
        };
    }

    if options.area_width > 0 || options.area_height > 0 {
        img = img.extract(
            options.area_left,
            options.area_top,
            options.area_width,
            options.area_height,
        )?;
    }

    if let Some(mark) = &options.watermark {
        img = img.watermark_text(mark)?;
    }
    if let Some(mark) = &options.watermark_image {
        img = img.watermark_image(mark)?;
    }

    let target_type = resolve_save_type(source_type, options)?;
    debug!(source = source_type.name(), target = target_type.name(), "saving");
    img.save(&SaveParams {
        image_type: target_type,
        quality: options.effective_quality(),
        compression: options.effective_compression(),
        interlace: options.interlace,
        no_profile: options.no_profile,
        interpretation: options.interpretation,
    })
}

/// Parameter checks that need no pixel data.
fn validate(buf: &[u8], options: &Options) -> Result<()> {
    if buf.is_empty() {
        return Err(Error::invalid("image buffer is empty"));
    }
    if options.rotate % 90 != 0 || options.rotate >= 360 {
        return Err(Error::invalid(format!(
            "rotation angle {} is not a multiple of 90",
            options.rotate
        )));
    }
    for dim in [
        options.width,
        options.height,
        options.area_width,
        options.area_height,
    ] {
        if dim > MAX_DIMENSION {
            return Err(Error::SizeExceeded);
        }
    }
    Ok(())
}

/// Integer factor to shrink by during decode. JPEG only; skipped when an
/// extract area or a dimension-swapping rotation is requested. The factor
/// never shrinks below the final target, so the residual affine always
/// scales down or holds.
fn load_shrink(buf: &[u8], source_type: ImageType, options: &Options) -> Result<u32> {
    if source_type != ImageType::Jpeg
        || (options.width == 0 && options.height == 0)
        || options.area_width > 0
        || options.area_height > 0
        || options.rotate % 180 != 0
    {
        return Ok(1);
    }
    // Orientations 5-8 swap the axes during auto-rotation, which would put
    // the probe dimensions in the wrong frame for the factor.
    if !options.no_auto_rotate && handle::read_orientation(buf) >= 5 {
        return Ok(1);
    }
    let (src_w, src_h) = handle::probe_dimensions(buf)?;
    let (tw, th) = match derive_target(src_w, src_h, options) {
        Some(target) => target,
        None => return Ok(1),
    };
    let factor = (src_w / tw).min(src_h / th);
    Ok(if factor >= 2 { factor } else { 1 })
}

/// Resolve the requested target dimensions, deriving a missing one from the
/// source aspect ratio. `None` when no resize was requested.
fn derive_target(width: u32, height: u32, options: &Options) -> Option<(u32, u32)> {
    match (options.width, options.height) {
        (0, 0) => None,
        (w, 0) => {
            let h = ((height as f64 * w as f64 / width as f64).round() as u32).max(1);
            Some((w, h))
        }
        (0, h) => {
            let w = ((width as f64 * h as f64 / height as f64).round() as u32).max(1);
            Some((w, h))
        }
        (w, h) => Some((w, h)),
    }
}

/// Normalize pixel data to EXIF orientation 1.
fn auto_rotate(img: EngineImage) -> Result<EngineImage> {
    let orientation = img.orientation();
    if orientation > 1 {
        debug!(orientation, "normalizing orientation");
    }
    match orientation {
        2 => img.flip(Direction::Horizontal),
        3 => img.rotate(180),
        4 => img.flip(Direction::Vertical),
        5 => img.rotate(90)?.flip(Direction::Horizontal),
        6 => img.rotate(90),
        7 => img.rotate(270)?.flip(Direction::Horizontal),
        8 => img.rotate(270),
        _ => Ok(img),
    }
}

/// Scale to cover the target, then extract the target window at the
/// configured gravity.
fn crop_stage(img: EngineImage, tw: u32, th: u32, options: &Options) -> Result<EngineImage> {
    let (w, h) = (img.width(), img.height());
    let mut scale = (tw as f64 / w as f64).max(th as f64 / h as f64);
    if scale > 1.0 && !options.enlarge {
        scale = 1.0;
    }
    let img = scale_by(img, scale, options)?;

    let cw = tw.min(img.width());
    let ch = th.min(img.height());
    if cw == img.width() && ch == img.height() {
        return Ok(img);
    }
    let (left, top) = anchor(options.gravity, img.pixels(), cw, ch);
    debug!(left, top, cw, ch, "crop window");
    img.extract(left, top, cw, ch)
}

/// Scale to fit inside the target, optionally padding to the exact target
/// canvas.
fn resize_stage(img: EngineImage, tw: u32, th: u32, options: &Options) -> Result<EngineImage> {
    let (w, h) = (img.width(), img.height());
    let mut scale = (tw as f64 / w as f64).min(th as f64 / h as f64);
    if scale > 1.0 && !options.enlarge {
        scale = 1.0;
    }
    let img = scale_by(img, scale, options)?;

    if !options.embed || (img.width() >= tw && img.height() >= th) {
        return Ok(img);
    }
    let left = (tw - img.width()) / 2;
    let top = (th - img.height()) / 2;
    debug!(left, top, tw, th, "embedding");
    img.embed(left, top, tw, th, options.extend)
}

/// Uniform scale split into an integer box shrink plus a residual affine;
/// the shrink does the bulk of a large downscale cheaply.
fn scale_by(img: EngineImage, scale: f64, options: &Options) -> Result<EngineImage> {
    if (scale - 1.0).abs() < f64::EPSILON {
        return Ok(img);
    }
    let target_w = ((img.width() as f64 * scale).round() as u32).max(1);
    let target_h = ((img.height() as f64 * scale).round() as u32).max(1);

    let shrink = (1.0 / scale).floor() as u32;
    let img = if shrink >= 2 {
        debug!(shrink, "integer shrink");
        img.shrink(shrink)?
    } else {
        img
    };

    let sx = target_w as f64 / img.width() as f64;
    let sy = target_h as f64 / img.height() as f64;
    img.affine(sx, sy, options.interpolator)
}

/// Crop window anchor for a `cw` x `ch` window in the given image.
fn anchor(gravity: Gravity, pixels: &DynamicImage, cw: u32, ch: u32) -> (u32, u32) {
    let (w, h) = (pixels.width(), pixels.height());
    match gravity {
        Gravity::Centre => ((w - cw) / 2, (h - ch) / 2),
        Gravity::North => ((w - cw) / 2, 0),
        Gravity::South => ((w - cw) / 2, h - ch),
        Gravity::East => (w - cw, (h - ch) / 2),
        Gravity::West => (0, (h - ch) / 2),
        Gravity::Smart => smart_anchor(pixels, cw, ch),
    }
}

/// Slide the crop window over a coarse grid and keep the position with the
/// highest luma variance, a cheap stand-in for an entropy scan.
fn smart_anchor(pixels: &DynamicImage, cw: u32, ch: u32) -> (u32, u32) {
    let luma = pixels.to_luma8();
    let (w, h) = luma.dimensions();
    let (slack_x, slack_y) = (w - cw, h - ch);
    if slack_x == 0 && slack_y == 0 {
        return (0, 0);
    }

    let step_x = (slack_x / 8).max(1);
    let step_y = (slack_y / 8).max(1);
    let sample = ((cw.min(ch)) / 32).max(1);

    let mut best = (0u32, 0u32);
    let mut best_score = f64::MIN;
    let mut top = 0;
    while top <= slack_y {
        let mut left = 0;
        while left <= slack_x {
            let mut sum = 0.0;
            let mut sq = 0.0;
            let mut n = 0.0;
            let mut y = top;
            while y < top + ch {
                let mut x = left;
                while x < left + cw {
                    let v = luma.get_pixel(x, y)[0] as f64;
                    sum += v;
                    sq += v * v;
                    n += 1.0;
                    x += sample;
                }
                y += sample;
            }
            let mean = sum / n;
            let score = sq / n - mean * mean;
            if score > best_score {
                best_score = score;
                best = (left, top);
            }
            if slack_x == 0 {
                break;
            }
            left += step_x;
        }
        if slack_y == 0 {
            break;
        }
        top += step_y;
    }
    best
}

/// Pick the save format: an explicit request must name a saveable format;
/// otherwise keep the source format, falling back to JPEG for formats the
/// engine can read but not write.
fn resolve_save_type(source_type: ImageType, options: &Options) -> Result<ImageType> {
    if options.image_type != ImageType::Unknown {
        if !options.image_type.can_save() {
            return Err(Error::UnsupportedFormat);
        }
        return Ok(options.image_type);
    }
    if source_type.can_save() {
        Ok(source_type)
    } else {
        Ok(ImageType::Jpeg)
    }
}
