//! End-to-end transform tests: encoded buffer in, encoded buffer out.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, Rgb32FImage, RgbImage, Rgba, RgbaImage};
use rastermill::{
    Engine, EngineConfig, Error, Gravity, Image, ImageType, Options, Watermark, WatermarkImage,
    MAX_DIMENSION,
};

fn engine() -> Engine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Engine::new(EngineConfig::default())
}

fn jpeg_fixture(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 5 % 256) as u8, (y * 11 % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg).unwrap();
    buf
}

fn png_alpha_fixture(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, 90, 200])
    });
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
    buf
}

// Splice a minimal APP1 EXIF segment carrying the given orientation after
// the SOI marker.
fn with_orientation(jpeg: &[u8], orientation: u8) -> Vec<u8> {
    let mut app1 = vec![0xFF, 0xE1, 0x00, 0x22];
    app1.extend(*b"Exif\0\0");
    app1.extend([0x49, 0x49, 0x2A, 0x00, 0x08, 0x00, 0x00, 0x00]);
    app1.extend([0x01, 0x00]);
    app1.extend([0x12, 0x01, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00]);
    app1.extend([orientation, 0x00, 0x00, 0x00]);
    app1.extend([0x00, 0x00, 0x00, 0x00]);

    let mut out = jpeg[..2].to_vec();
    out.extend(app1);
    out.extend(&jpeg[2..]);
    out
}

#[test]
fn resize_downscales_to_exact_target() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(1200, 900));
    image.resize(300, 240).unwrap();

    let meta = image.metadata().unwrap();
    assert_eq!((meta.size.width, meta.size.height), (300, 240));
    assert_eq!(meta.image_type, ImageType::Jpeg);
}

#[test]
fn enlarge_scales_up_and_keeps_png() {
    let engine = engine();
    let mut image = Image::new(&engine, png_alpha_fixture(200, 150));
    image.enlarge(500, 375).unwrap();

    let meta = image.metadata().unwrap();
    assert_eq!((meta.size.width, meta.size.height), (500, 375));
    assert_eq!(meta.image_type, ImageType::Png);
    assert!(meta.alpha);
}

#[test]
fn resize_without_enlarge_never_upscales() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(200, 150));
    image.process(Options {
        width: 500,
        height: 375,
        ..Default::default()
    })
    .unwrap();

    let size = image.size().unwrap();
    assert_eq!((size.width, size.height), (200, 150));
}

#[test]
fn extract_cuts_the_requested_area() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(800, 600));
    image.extract(100, 100, 300, 300).unwrap();

    let size = image.size().unwrap();
    assert_eq!((size.width, size.height), (300, 300));
}

#[test]
fn oversized_extract_fails_without_decoding() {
    let engine = engine();
    // Valid JPEG magic, no decodable body. SizeExceeded must win.
    let mut junk = vec![0xFF, 0xD8, 0xFF];
    junk.extend(std::iter::repeat(0u8).take(64));

    let mut image = Image::new(&engine, junk);
    let err = image.extract(0, 0, MAX_DIMENSION + 1, 100).unwrap_err();
    assert!(matches!(err, Error::SizeExceeded));
}

#[test]
fn width_only_resize_honors_exif_rotation() {
    let engine = engine();
    // Portrait phone shot: landscape pixels, orientation 6.
    let buf = with_orientation(&jpeg_fixture(1200, 900), 6);
    let mut image = Image::new(&engine, buf);
    assert_eq!(image.metadata().unwrap().orientation, 6);

    image
        .process(Options {
            width: 300,
            ..Default::default()
        })
        .unwrap();

    // Auto-rotation runs first, so the target frame is 900x1200 and the
    // derived height follows the rotated aspect.
    let size = image.size().unwrap();
    assert_eq!((size.width, size.height), (300, 400));
}

#[test]
fn float_tiff_converts_without_colourspace_error() {
    let engine = engine();
    let img = DynamicImage::ImageRgb32F(Rgb32FImage::from_pixel(60, 40, Rgb([0.25f32, 0.5, 0.75])));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Tiff).unwrap();

    // Float pixels have no colourspace conversion; pre-save keeps them
    // as-is instead of failing the whole operation.
    let mut image = Image::new(&engine, buf);
    let out = image.convert(ImageType::Jpeg).unwrap();
    assert_eq!(ImageType::detect(&out), ImageType::Jpeg);

    let size = image.size().unwrap();
    assert_eq!((size.width, size.height), (60, 40));
}

#[test]
fn crop_by_width_derives_height_from_aspect() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(840, 525));
    image.crop_by_width(600).unwrap();

    let size = image.size().unwrap();
    assert_eq!((size.width, size.height), (600, 375));
}

#[test]
fn crop_by_height_derives_width_from_aspect() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(840, 525));
    image.crop_by_height(300).unwrap();

    let size = image.size().unwrap();
    assert_eq!((size.width, size.height), (480, 300));
}

#[test]
fn crop_covers_then_cuts() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(840, 525));
    image.crop(800, 600, Gravity::Centre).unwrap();

    // Cover scale exceeds 1 and enlarge is off, so the window clamps to the
    // source height.
    let size = image.size().unwrap();
    assert_eq!((size.width, size.height), (800, 525));
}

#[test]
fn thumbnail_is_a_centre_square() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(640, 480));
    image.thumbnail(100).unwrap();

    let size = image.size().unwrap();
    assert_eq!((size.width, size.height), (100, 100));
}

#[test]
fn rotate_quarter_turn_swaps_dimensions() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(640, 480));
    image.rotate(90).unwrap();

    let size = image.size().unwrap();
    assert_eq!((size.width, size.height), (480, 640));
}

#[test]
fn rotate_rejects_non_quarter_angles() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(64, 48));
    assert!(matches!(
        image.rotate(45).unwrap_err(),
        Error::InvalidParameter(_)
    ));
    assert!(matches!(
        image.rotate(360).unwrap_err(),
        Error::InvalidParameter(_)
    ));
}

#[test]
fn flip_keeps_dimensions() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(64, 48));
    image.flip().unwrap();
    image.flop().unwrap();

    let size = image.size().unwrap();
    assert_eq!((size.width, size.height), (64, 48));
}

#[test]
fn convert_changes_format_only() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(120, 80));
    let out = image.convert(ImageType::Png).unwrap();
    assert_eq!(ImageType::detect(&out), ImageType::Png);

    let meta = image.metadata().unwrap();
    assert_eq!((meta.size.width, meta.size.height), (120, 80));
    assert_eq!(meta.image_type, ImageType::Png);

    // Converting again to the same format is a stable re-encode.
    image.convert(ImageType::Png).unwrap();
    assert_eq!(image.image_type(), ImageType::Png);
}

#[test]
fn convert_to_webp() {
    let engine = engine();
    let mut image = Image::new(&engine, png_alpha_fixture(60, 40));
    let out = image.convert(ImageType::Webp).unwrap();
    assert_eq!(ImageType::detect(&out), ImageType::Webp);
    assert!(image.metadata().unwrap().alpha);
}

#[test]
fn convert_to_unsaveable_format_is_rejected() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(32, 32));
    assert!(matches!(
        image.convert(ImageType::Tiff).unwrap_err(),
        Error::UnsupportedFormat
    ));
}

#[test]
fn fluent_chain_reflects_the_last_operation() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(840, 525));
    image.crop_by_width(300).unwrap();
    image.flip().unwrap();
    image.convert(ImageType::Png).unwrap();

    let meta = image.metadata().unwrap();
    assert_eq!(meta.size.width, 300);
    assert_eq!(meta.image_type, ImageType::Png);
}

#[test]
fn one_process_call_composes_operations() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(800, 600));
    let out = image
        .process(Options {
            width: 200,
            height: 200,
            crop: true,
            flop: true,
            image_type: ImageType::Png,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(ImageType::detect(&out), ImageType::Png);
    let size = image.size().unwrap();
    assert_eq!((size.width, size.height), (200, 200));
}

#[test]
fn text_watermark_keeps_geometry() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(320, 240));
    image
        .watermark(Watermark {
            text: "sample".into(),
            ..Default::default()
        })
        .unwrap();

    let size = image.size().unwrap();
    assert_eq!((size.width, size.height), (320, 240));
}

#[test]
fn empty_watermark_text_is_rejected() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(32, 32));
    assert!(matches!(
        image.watermark(Watermark::default()).unwrap_err(),
        Error::InvalidParameter(_)
    ));
}

#[test]
fn image_watermark_composites_an_overlay() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(320, 240));
    image
        .watermark_image(WatermarkImage {
            buf: png_alpha_fixture(40, 40),
            left: 10,
            top: 10,
            ..Default::default()
        })
        .unwrap();

    let size = image.size().unwrap();
    assert_eq!((size.width, size.height), (320, 240));
}

#[test]
fn unknown_input_is_unsupported() {
    let engine = engine();
    let mut image = Image::new(&engine, b"definitely not pixels".to_vec());
    assert!(matches!(
        image.resize(10, 10).unwrap_err(),
        Error::UnsupportedFormat
    ));
}

#[test]
fn metadata_roundtrip_through_a_file() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(400, 300));
    let out = image.convert(ImageType::Png).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.png");
    std::fs::write(&path, &out).unwrap();

    let reread = std::fs::read(&path).unwrap();
    let meta = Image::new(&engine, reread).metadata().unwrap();
    assert_eq!((meta.size.width, meta.size.height), (400, 300));
    assert_eq!(meta.image_type, ImageType::Png);
}

#[test]
fn handles_return_to_baseline_after_failures() {
    let engine = engine();
    let baseline = engine.memory_stats().allocations;

    // Fails after a successful load.
    let mut image = Image::new(&engine, jpeg_fixture(100, 100));
    assert!(image.extract(90, 90, 50, 50).is_err());
    assert_eq!(engine.memory_stats().allocations, baseline);

    // Fails during decode.
    let mut corrupt = vec![0xFF, 0xD8, 0xFF];
    corrupt.extend(std::iter::repeat(0u8).take(256));
    let mut image = Image::new(&engine, corrupt);
    assert!(matches!(
        image.process(Options::default()).unwrap_err(),
        Error::Engine(_)
    ));
    assert_eq!(engine.memory_stats().allocations, baseline);
}

#[test]
fn memory_stats_record_a_highwater_mark() {
    let engine = engine();
    let mut image = Image::new(&engine, jpeg_fixture(200, 200));
    image.flip().unwrap();

    let stats = engine.memory_stats();
    assert_eq!(stats.allocations, 0);
    assert_eq!(stats.current_bytes, 0);
    assert!(stats.highwater_bytes >= (200 * 200 * 3) as u64);
}

#[test]
fn engine_clones_share_one_lifecycle() {
    let engine = engine();
    let buf = jpeg_fixture(400, 300);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let buf = buf.clone();
            std::thread::spawn(move || Image::new(&engine, buf).thumbnail(50).unwrap())
        })
        .collect();
    for handle in handles {
        let out = handle.join().unwrap();
        assert_eq!(ImageType::detect(&out), ImageType::Jpeg);
    }
    assert_eq!(engine.memory_stats().allocations, 0);
}

#[test]
fn shutdown_blocks_work_until_reinitialized() {
    let engine = engine();
    let buf = jpeg_fixture(64, 48);

    engine.shutdown();
    assert!(!engine.is_initialized());
    assert!(matches!(
        Image::new(&engine, buf.clone()).flip().unwrap_err(),
        Error::Engine(_)
    ));

    engine.initialize();
    assert!(engine.is_initialized());
    Image::new(&engine, buf).flip().unwrap();
}
