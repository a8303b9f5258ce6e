//! Frame type and image processing — YUV conversion, dark detection, preview scaling.

use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

/// A camera frame, already converted to RGB.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let pixels = (self.image.width() * self.image.height()) as usize;
        if pixels == 0 {
            return 0.0;
        }
        self.image.pixels().map(|p| luma(p.0) as f32).sum::<f32>() / pixels as f32
    }

    pub fn is_dark(&self, threshold_pct: f32) -> bool {
        let gray: Vec<u8> = self.image.pixels().map(|p| luma(p.0)).collect();
        is_dark_frame(&gray, threshold_pct)
    }
}

/// Pixel layouts the camera pipeline may hand over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Android camera default: full Y plane, then interleaved V/U at quarter resolution.
    Nv21,
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Packed 8-bit RGB.
    Rgb24,
    /// 8-bit grayscale.
    Grey,
}

#[derive(Debug, Error)]
#[error("unknown pixel format {0:?} (expected nv21, yuyv, rgb24 or grey)")]
pub struct UnknownPixelFormat(pub String);

impl std::str::FromStr for PixelFormat {
    type Err = UnknownPixelFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nv21" => Ok(Self::Nv21),
            "yuyv" | "yuy2" => Ok(Self::Yuyv),
            "rgb24" | "rgb" => Ok(Self::Rgb24),
            "grey" | "gray" => Ok(Self::Grey),
            _ => Err(UnknownPixelFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid {format:?} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
    #[error("{format:?} requires even dimensions, got {width}x{height}")]
    OddDimensions {
        format: PixelFormat,
        width: u32,
        height: u32,
    },
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("frame source: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert a raw buffer in `format` to RGB.
pub fn to_rgb(
    buf: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<RgbImage, FrameError> {
    let pixels = (width as usize) * (height as usize);
    let check = |expected: usize| {
        if buf.len() < expected {
            Err(FrameError::InvalidLength {
                format,
                expected,
                actual: buf.len(),
            })
        } else {
            Ok(())
        }
    };

    let data = match format {
        PixelFormat::Rgb24 => {
            check(pixels * 3)?;
            buf[..pixels * 3].to_vec()
        }
        PixelFormat::Grey => {
            check(pixels)?;
            buf[..pixels].iter().flat_map(|&y| [y, y, y]).collect()
        }
        PixelFormat::Yuyv => return yuyv_to_rgb(buf, width, height),
        PixelFormat::Nv21 => return nv21_to_rgb(buf, width, height),
    };

    // Length was checked above, so the buffer always fits.
    RgbImage::from_raw(width, height, data).ok_or(FrameError::InvalidLength {
        format,
        expected: pixels * 3,
        actual: 0,
    })
}

/// Convert NV21 (Y plane + interleaved VU plane) to RGB.
pub fn nv21_to_rgb(nv21: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    if width % 2 != 0 || height % 2 != 0 {
        return Err(FrameError::OddDimensions {
            format: PixelFormat::Nv21,
            width,
            height,
        });
    }
    let w = width as usize;
    let h = height as usize;
    let expected = w * h * 3 / 2;
    if nv21.len() < expected {
        return Err(FrameError::InvalidLength {
            format: PixelFormat::Nv21,
            expected,
            actual: nv21.len(),
        });
    }

    let (y_plane, vu_plane) = nv21.split_at(w * h);
    let mut out = RgbImage::new(width, height);
    for (x, y, px) in out.enumerate_pixels_mut() {
        let (x, y) = (x as usize, y as usize);
        let vu = (y / 2) * w + (x / 2) * 2;
        px.0 = yuv_to_rgb(y_plane[y * w + x], vu_plane[vu + 1], vu_plane[vu]);
    }
    Ok(out)
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    if width % 2 != 0 {
        return Err(FrameError::OddDimensions {
            format: PixelFormat::Yuyv,
            width,
            height,
        });
    }
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            format: PixelFormat::Yuyv,
            expected,
            actual: yuyv.len(),
        });
    }

    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        data.extend_from_slice(&yuv_to_rgb(y0, u, v));
        data.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    RgbImage::from_raw(width, height, data).ok_or(FrameError::InvalidLength {
        format: PixelFormat::Yuyv,
        expected,
        actual: yuyv.len(),
    })
}

/// BT.601 limited-range YUV to RGB, integer arithmetic.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

fn luma(rgb: [u8; 3]) -> u8 {
    ((77 * rgb[0] as u32 + 150 * rgb[1] as u32 + 29 * rgb[2] as u32) >> 8) as u8
}

/// Check if a frame is dark.
///
/// Returns true if more than `threshold_pct` of pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

/// Decode an encoded photo (JPEG, PNG, ...) to RGB.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, FrameError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Downscale `image` to fit within `max_width` x `max_height`, keeping aspect.
///
/// Returns the preview and the factors that map preview coordinates back to
/// the source image. Images that already fit are returned unchanged.
pub fn fit_preview(image: &RgbImage, max_width: u32, max_height: u32) -> (RgbImage, f32, f32) {
    let (w, h) = image.dimensions();
    if (w <= max_width && h <= max_height) || w == 0 || h == 0 {
        return (image.clone(), 1.0, 1.0);
    }
    let scale = (max_width as f32 / w as f32).min(max_height as f32 / h as f32);
    let nw = ((w as f32 * scale).round() as u32).max(1);
    let nh = ((h as f32 * scale).round() as u32).max(1);
    let preview = imageops::resize(image, nw, nh, FilterType::Triangle);
    (preview, w as f32 / nw as f32, h as f32 / nh as f32)
}

/// Mirror horizontally, as front-camera previews are displayed.
pub fn mirror(image: &RgbImage) -> RgbImage {
    imageops::flip_horizontal(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuv_black_white_gray() {
        assert_eq!(yuv_to_rgb(16, 128, 128), [0, 0, 0]);
        assert_eq!(yuv_to_rgb(235, 128, 128), [255, 255, 255]);
        assert_eq!(yuv_to_rgb(128, 128, 128), [130, 130, 130]);
    }

    #[test]
    fn test_nv21_to_rgb_2x2() {
        // Y plane: top row black, bottom row white. One neutral VU pair.
        let nv21 = vec![16, 16, 235, 235, 128, 128];
        let rgb = nv21_to_rgb(&nv21, 2, 2).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(1, 0).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(0, 1).0, [255, 255, 255]);
        assert_eq!(rgb.get_pixel(1, 1).0, [255, 255, 255]);
    }

    #[test]
    fn test_nv21_uses_v_before_u() {
        // Strong V (red difference) must push red up, not blue.
        let nv21 = vec![128, 128, 128, 128, 240, 128];
        let rgb = nv21_to_rgb(&nv21, 2, 2).unwrap();
        let [r, _, b] = rgb.get_pixel(0, 0).0;
        assert!(r > b, "r={r} b={b}");
    }

    #[test]
    fn test_nv21_rejects_short_and_odd() {
        assert!(matches!(
            nv21_to_rgb(&[0; 5], 2, 2),
            Err(FrameError::InvalidLength {
                expected: 6,
                actual: 5,
                ..
            })
        ));
        assert!(matches!(
            nv21_to_rgb(&[0; 64], 3, 2),
            Err(FrameError::OddDimensions { .. })
        ));
    }

    #[test]
    fn test_yuyv_to_rgb() {
        // 2x1 image: [Y0=16, U=128, Y1=235, V=128]
        let rgb = yuyv_to_rgb(&[16, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_rgb(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_grey_expands_to_rgb() {
        let rgb = to_rgb(&[7, 9], 2, 1, PixelFormat::Grey).unwrap();
        assert_eq!(rgb.get_pixel(1, 0).0, [9, 9, 9]);
    }

    #[test]
    fn test_pixel_format_names() {
        assert_eq!("NV21".parse::<PixelFormat>().unwrap(), PixelFormat::Nv21);
        assert_eq!("yuy2".parse::<PixelFormat>().unwrap(), PixelFormat::Yuyv);
        assert_eq!(" gray ".parse::<PixelFormat>().unwrap(), PixelFormat::Grey);
        assert!("bayer".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_dark_frame_thresholds() {
        assert!(is_dark_frame(&vec![0u8; 1000], 0.95));
        assert!(!is_dark_frame(&vec![128u8; 1000], 0.95));
        assert!(is_dark_frame(&[], 0.95));

        let mut mostly_dark = vec![10u8; 960];
        mostly_dark.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&mostly_dark, 0.95));
    }

    #[test]
    fn test_fit_preview_scales_down_keeping_aspect() {
        let img = RgbImage::new(1280, 960);
        let (preview, sx, sy) = fit_preview(&img, 640, 480);
        assert_eq!(preview.dimensions(), (640, 480));
        assert!((sx - 2.0).abs() < 1e-6 && (sy - 2.0).abs() < 1e-6);

        let small = RgbImage::new(320, 240);
        let (same, sx, _) = fit_preview(&small, 640, 480);
        assert_eq!(same.dimensions(), (320, 240));
        assert_eq!(sx, 1.0);
    }

    #[test]
    fn test_mirror_flips_columns() {
        let mut img = RgbImage::new(3, 1);
        img.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        let flipped = mirror(&img);
        assert_eq!(flipped.get_pixel(2, 0).0, [255, 0, 0]);
        assert_eq!(flipped.get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_frame_brightness() {
        let frame = Frame::new(RgbImage::from_pixel(4, 4, image::Rgb([0, 0, 0])), 1);
        assert_eq!(frame.avg_brightness(), 0.0);
        assert!(frame.is_dark(0.95));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"not an image"), Err(FrameError::Decode(_))));
    }
}
