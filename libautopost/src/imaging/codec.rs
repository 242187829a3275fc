//! Pixel-level work behind a trait
//!
//! | Operation | Implementation |
//! |---|---|
//! | Read size and color mode | header only, via `ImageReader::into_decoder` |
//! | Decode | `image` crate, format guessed from content |
//! | Transparency | composited onto white |
//! | Resize | `imageops::resize` with `Lanczos3`, fit within bounds, never upscale |
//! | Encode | `JpegEncoder`, stepping through qualities on one resized buffer |

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageDecoder, ImageReader, Rgb, RgbImage};
use std::path::Path;

use crate::error::ImageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Largest size with the same aspect ratio that fits within `bounds`
    pub fn fit_within(self, bounds: Dimensions) -> Dimensions {
        if self.width <= bounds.width && self.height <= bounds.height {
            return self;
        }
        let scale = f64::min(
            f64::from(bounds.width) / f64::from(self.width),
            f64::from(bounds.height) / f64::from(self.height),
        );
        Dimensions {
            width: ((f64::from(self.width) * scale).round() as u32).clamp(1, bounds.width),
            height: ((f64::from(self.height) * scale).round() as u32).clamp(1, bounds.height),
        }
    }
}

/// Pixel layout of a source image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorMode {
    Gray,
    GrayAlpha,
    Rgb,
    Rgba,
    Unsupported(String),
}

impl ColorMode {
    fn from_color_type(color: ColorType) -> Self {
        match color {
            ColorType::L8 => ColorMode::Gray,
            ColorType::La8 => ColorMode::GrayAlpha,
            ColorType::Rgb8 => ColorMode::Rgb,
            ColorType::Rgba8 => ColorMode::Rgba,
            other => ColorMode::Unsupported(format!("{:?}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub dimensions: Dimensions,
    pub color: ColorMode,
    pub file_size: u64,
}

/// What [`ImageCodec::normalize`] wrote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoded {
    pub dimensions: Dimensions,
    pub size: u64,
    pub quality: u8,
}

/// Decode, resize and encode primitives
pub trait ImageCodec: Send + Sync {
    /// Read size and color mode of a source image
    fn inspect(&self, path: &Path) -> Result<ImageInfo, ImageError>;

    /// Write `src` to `dest` as an RGB JPEG fitting within `max`
    ///
    /// `qualities` are tried in order on a single decoded and resized image;
    /// the first encoding of at most `max_bytes` is written. When none fits,
    /// the last attempt is written and returned so the caller can reject it.
    fn normalize(
        &self,
        src: &Path,
        dest: &Path,
        max: Dimensions,
        qualities: &[u8],
        max_bytes: u64,
    ) -> Result<Encoded, ImageError>;
}

/// [`ImageCodec`] backed by the `image` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCrateCodec;

impl ImageCrateCodec {
    pub fn new() -> Self {
        Self
    }
}

fn open(path: &Path) -> Result<ImageReader<std::io::BufReader<std::fs::File>>, ImageError> {
    if !path.is_file() {
        return Err(ImageError::NotFound(path.to_path_buf()));
    }
    let decode_error = |reason: String| ImageError::Decode {
        path: path.to_path_buf(),
        reason,
    };
    ImageReader::open(path)
        .map_err(|e| decode_error(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| decode_error(e.to_string()))
}

fn decode(path: &Path) -> Result<DynamicImage, ImageError> {
    open(path)?.decode().map_err(|e| ImageError::Decode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Composite any alpha channel onto a white background
fn flatten_to_rgb(image: DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = u16::from(a);
        let blend = |c: u8| ((u16::from(c) * alpha + 255 * (255 - alpha)) / 255) as u8;
        rgb.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }
    rgb
}

impl ImageCodec for ImageCrateCodec {
    fn inspect(&self, path: &Path) -> Result<ImageInfo, ImageError> {
        let file_size = std::fs::metadata(path)
            .map_err(|_| ImageError::NotFound(path.to_path_buf()))?
            .len();
        let decoder = open(path)?.into_decoder().map_err(|e| ImageError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let (width, height) = decoder.dimensions();

        Ok(ImageInfo {
            dimensions: Dimensions::new(width, height),
            color: ColorMode::from_color_type(decoder.color_type()),
            file_size,
        })
    }

    fn normalize(
        &self,
        src: &Path,
        dest: &Path,
        max: Dimensions,
        qualities: &[u8],
        max_bytes: u64,
    ) -> Result<Encoded, ImageError> {
        let encode_error = |reason: String| ImageError::Encode {
            path: dest.to_path_buf(),
            reason,
        };
        let Some((&last, _)) = qualities.split_last() else {
            return Err(encode_error("no JPEG quality to try".to_string()));
        };

        let rgb = flatten_to_rgb(decode(src)?);
        let source = Dimensions::new(rgb.width(), rgb.height());
        let target = source.fit_within(max);
        let rgb = if target == source {
            rgb
        } else {
            image::imageops::resize(&rgb, target.width, target.height, FilterType::Lanczos3)
        };

        let mut buffer = Vec::new();
        let mut quality = last;
        for &attempt in qualities {
            buffer.clear();
            quality = attempt;
            JpegEncoder::new_with_quality(&mut buffer, attempt)
                .encode(rgb.as_raw(), target.width, target.height, ColorType::Rgb8.into())
                .map_err(|e| encode_error(e.to_string()))?;
            if buffer.len() as u64 <= max_bytes {
                break;
            }
        }
        std::fs::write(dest, &buffer).map_err(|e| encode_error(e.to_string()))?;

        Ok(Encoded {
            dimensions: target,
            size: buffer.len() as u64,
            quality,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba, RgbaImage};
    use tempfile::TempDir;

    #[test]
    fn test_fit_within_keeps_aspect_ratio() {
        let bounds = Dimensions::new(1080, 1350);
        assert_eq!(Dimensions::new(2000, 1000).fit_within(bounds), Dimensions::new(1080, 540));
        assert_eq!(Dimensions::new(1000, 3000).fit_within(bounds), Dimensions::new(450, 1350));
        assert_eq!(Dimensions::new(800, 600).fit_within(bounds), Dimensions::new(800, 600));
    }

    #[test]
    fn test_inspect_reports_color_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.png");
        RgbaImage::from_pixel(400, 500, Rgba([0, 0, 0, 255])).save(&path).unwrap();

        let info = ImageCrateCodec::new().inspect(&path).unwrap();
        assert_eq!(info.dimensions, Dimensions::new(400, 500));
        assert_eq!(info.color, ColorMode::Rgba);
        assert!(info.file_size > 0);
    }

    #[test]
    fn test_inspect_flags_sixteen_bit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deep.png");
        let deep: ImageBuffer<Rgb<u16>, Vec<u16>> = ImageBuffer::from_pixel(400, 400, Rgb([1, 2, 3]));
        DynamicImage::ImageRgb16(deep).save(&path).unwrap();

        let info = ImageCrateCodec::new().inspect(&path).unwrap();
        assert!(matches!(info.color, ColorMode::Unsupported(_)));
    }

    #[test]
    fn test_normalize_flattens_transparency_onto_white() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("clear.png");
        let dest = dir.path().join("out.jpg");
        RgbaImage::from_pixel(400, 400, Rgba([255, 0, 0, 0])).save(&src).unwrap();

        let encoded = ImageCrateCodec::new()
            .normalize(&src, &dest, Dimensions::new(1080, 1080), &[95], u64::MAX)
            .unwrap();
        assert_eq!(encoded.dimensions, Dimensions::new(400, 400));
        assert_eq!(encoded.size, std::fs::metadata(&dest).unwrap().len());

        let out = image::open(&dest).unwrap().to_rgb8();
        let Rgb([r, g, b]) = *out.get_pixel(200, 200);
        assert!(r > 240 && g > 240 && b > 240, "expected white, got {r},{g},{b}");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("slide-1.jpg");
        std::fs::write(&src, b"definitely not a jpeg").unwrap();

        let result = ImageCrateCodec::new().normalize(
            &src,
            &dir.path().join("out.jpg"),
            Dimensions::new(1080, 1080),
            &[95],
            u64::MAX,
        );
        assert!(matches!(result, Err(ImageError::Decode { .. })));
    }

    #[test]
    fn test_inspect_reads_only_the_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cut.png");
        RgbImage::from_fn(600, 700, |x, y| Rgb([x as u8, y as u8, 7]))
            .save(&path)
            .unwrap();
        // Keep the signature, IHDR and the start of the pixel data only
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..64]).unwrap();

        let info = ImageCrateCodec::new().inspect(&path).unwrap();
        assert_eq!(info.dimensions, Dimensions::new(600, 700));
        assert_eq!(info.color, ColorMode::Rgb);
        assert!(image::open(&path).is_err());
    }

    #[test]
    fn test_normalize_steps_quality_on_one_buffer() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("noise.png");
        let dest = dir.path().join("out.jpg");
        RgbImage::from_fn(800, 800, |x, y| {
            Rgb([(x * 7 + y * 13) as u8, (x * y) as u8, (x ^ y) as u8])
        })
        .save(&src)
        .unwrap();
        let codec = ImageCrateCodec::new();

        let best = codec
            .normalize(&src, &dest, Dimensions::new(1080, 1080), &[95], u64::MAX)
            .unwrap();
        let worst = codec
            .normalize(&src, &dest, Dimensions::new(1080, 1080), &[10], u64::MAX)
            .unwrap();
        assert!(worst.size < best.size);

        // A limit between the two is met by stepping down, and the fitting attempt is written
        let limit = worst.size + (best.size - worst.size) / 2;
        let encoded = codec
            .normalize(&src, &dest, Dimensions::new(1080, 1080), &[95, 10], limit)
            .unwrap();
        assert_eq!(encoded.quality, 10);
        assert!(encoded.size <= limit);
        assert_eq!(encoded.size, std::fs::metadata(&dest).unwrap().len());

        // Nothing fits: the last attempt is still reported for the caller to reject
        let encoded = codec
            .normalize(&src, &dest, Dimensions::new(1080, 1080), &[95, 10], 1)
            .unwrap();
        assert_eq!(encoded.quality, 10);
        assert!(encoded.size > 1);
    }

    #[test]
    fn test_missing_file() {
        let result = ImageCrateCodec::new().inspect(Path::new("/nonexistent/slide.png"));
        assert!(matches!(result, Err(ImageError::NotFound(_))));
    }
}
