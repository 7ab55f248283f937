use anyhow::{Context, Result};
use batchinfer_core::config::{ColorMode, ImageSpec};
use fast_image_resize::images::Image as FirImage;
use fast_image_resize::{
    FilterType as FirFilterType, PixelType as FirPixelType, ResizeAlg as FirResizeAlg,
    ResizeOptions as FirResizeOptions, Resizer as FirResizer,
};
use ndarray::Array3;
use zune_jpeg::zune_core::bytestream::ZCursor;
use zune_jpeg::JpegDecoder;

fn looks_like_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] == 0xD8
}

/// Interleaved pixels plus their dimensions.
struct Pixels {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

fn decode_with_image(bytes: &[u8], mode: ColorMode) -> Result<Pixels> {
    let format = image::guess_format(bytes).context("unsupported or unrecognised image format")?;
    let decoded = image::load_from_memory_with_format(bytes, format)
        .with_context(|| format!("{format:?} decode failed"))?;
    let (width, height) = (decoded.width(), decoded.height());
    let data = match mode {
        ColorMode::Rgb => decoded.to_rgb8().into_raw(),
        ColorMode::Luma => decoded.to_luma8().into_raw(),
        ColorMode::Rgba => decoded.to_rgba8().into_raw(),
    };
    Ok(Pixels {
        data,
        width,
        height,
    })
}

/// RGB JPEG fast path. Returns `None` when zune hands back a layout other than packed RGB so
/// the caller can fall back to the general decoder.
fn decode_jpeg_rgb_with_zune(bytes: &[u8]) -> Result<Option<Pixels>> {
    let cursor = ZCursor::new(bytes);
    let mut decoder = JpegDecoder::new(cursor);
    let pixels = decoder
        .decode()
        .map_err(|e| anyhow::anyhow!("zune jpeg decode failed: {e:?}"))?;
    let info = decoder
        .info()
        .context("zune decode missing image info")?;
    let width = u32::from(info.width);
    let height = u32::from(info.height);
    let expected_len = (width as usize)
        .checked_mul(height as usize)
        .and_then(|px| px.checked_mul(3))
        .context("decoded shape overflow")?;
    if pixels.len() != expected_len {
        return Ok(None);
    }
    Ok(Some(Pixels {
        data: pixels,
        width,
        height,
    }))
}

fn fir_pixel_type(mode: ColorMode) -> FirPixelType {
    match mode {
        ColorMode::Rgb => FirPixelType::U8x3,
        ColorMode::Luma => FirPixelType::U8,
        ColorMode::Rgba => FirPixelType::U8x4,
    }
}

fn resize(px: Pixels, mode: ColorMode, width: u32, height: u32) -> Result<Pixels> {
    if px.width == width && px.height == height {
        return Ok(px);
    }
    let pixel_type = fir_pixel_type(mode);
    let src = FirImage::from_vec_u8(px.width, px.height, px.data, pixel_type)
        .context("resize source init failed")?;
    let mut dst = FirImage::new(width, height, pixel_type);
    let mut resizer = FirResizer::new();
    let options =
        FirResizeOptions::new().resize_alg(FirResizeAlg::Convolution(FirFilterType::Bilinear));
    resizer
        .resize(&src, &mut dst, &options)
        .context("resize failed")?;
    Ok(Pixels {
        data: dst.into_vec(),
        width,
        height,
    })
}

/// Decodes encoded image bytes into an HWC array of `spec.height × spec.width × channels`.
pub fn decode_image(bytes: &[u8], spec: &ImageSpec) -> Result<Array3<u8>> {
    anyhow::ensure!(!bytes.is_empty(), "empty image payload");

    let fast = if spec.mode == ColorMode::Rgb && looks_like_jpeg(bytes) {
        decode_jpeg_rgb_with_zune(bytes)?
    } else {
        None
    };
    let px = match fast {
        Some(px) => px,
        None => decode_with_image(bytes, spec.mode)?,
    };
    anyhow::ensure!(
        px.width > 0 && px.height > 0,
        "decoded image has zero size ({}x{})",
        px.width,
        px.height
    );

    let px = resize(px, spec.mode, spec.width, spec.height)?;
    let shape = (
        px.height as usize,
        px.width as usize,
        spec.mode.channels(),
    );
    Array3::from_shape_vec(shape, px.data).context("decoded buffer does not match image shape")
}
