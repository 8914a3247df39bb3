//! rastermill: buffer-in, buffer-out image processing
//!
//! The crate wraps an in-process codec engine behind a small façade: decode
//! an encoded buffer, apply a composite of geometry, colour, and watermark
//! operations, and encode the result. JPEG, PNG, WEBP, and TIFF decode;
//! JPEG, PNG, and WEBP encode.
//!
//! An [`Engine`] owns the worker pool, decode cache, and memory accounting.
//! [`Image`] binds a buffer to an engine and exposes the per-operation
//! methods; arbitrary combinations go through [`Image::process`] with an
//! [`Options`] value.
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = rastermill::Engine::default();
//! let buf = std::fs::read("photo.jpg")?;
//! let thumb = rastermill::Image::new(&engine, buf).thumbnail(100)?;
//! # let _ = thumb;
//! # Ok(())
//! # }
//! ```

mod api;
mod engine;
mod error;
mod font;
mod format;
mod handle;
mod metadata;
mod options;
mod pipeline;

pub use api::Image;
pub use engine::{Engine, EngineConfig, MemoryStats, MAX_DIMENSION};
pub use error::{Error, Result};
pub use format::ImageType;
pub use metadata::{Dimensions, Metadata};
pub use options::{
    Direction, Extend, Gravity, Interpolator, Interpretation, Options, Watermark, WatermarkImage,
};
