//! Decoded image types and the assembler that builds them from raw decoder
//! output.

use core::ops::Range;

use crate::error::HeicError;
use crate::layout::{PixelLayout, Subsampling};
use crate::metadata::{ColorModel, ImageMetadata};

#[cfg(feature = "rgb")]
use rgb::AsPixels as _;

/// A fully decoded HEIC image. Owns its pixel bytes.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodedImage {
    YCbCr(YCbCrImage),
    Gray(GrayImage),
    /// Premultiplied RGBA.
    Rgba(RgbaImage),
    /// Straight-alpha RGBA.
    Nrgba(RgbaImage),
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        match self {
            Self::YCbCr(i) => i.width,
            Self::Gray(i) => i.width,
            Self::Rgba(i) | Self::Nrgba(i) => i.width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Self::YCbCr(i) => i.height,
            Self::Gray(i) => i.height,
            Self::Rgba(i) | Self::Nrgba(i) => i.height,
        }
    }

    pub fn color_model(&self) -> ColorModel {
        match self {
            Self::YCbCr(i) => ColorModel::YCbCr(i.subsampling),
            Self::Gray(_) => ColorModel::Gray,
            Self::Rgba(_) => ColorModel::Rgba,
            Self::Nrgba(_) => ColorModel::Nrgba,
        }
    }

    /// The whole backing buffer, padding included.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::YCbCr(i) => &i.buf,
            Self::Gray(i) => &i.pixels,
            Self::Rgba(i) | Self::Nrgba(i) => &i.pixels,
        }
    }

    /// Take the backing buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::YCbCr(i) => i.buf,
            Self::Gray(i) => i.pixels,
            Self::Rgba(i) | Self::Nrgba(i) => i.pixels,
        }
    }
}

/// Planar Y'CbCr image. All three planes live in one buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct YCbCrImage {
    buf: Vec<u8>,
    y_range: Range<usize>,
    cb_range: Range<usize>,
    cr_range: Range<usize>,
    pub width: u32,
    pub height: u32,
    pub y_stride: usize,
    pub c_stride: usize,
    pub subsampling: Subsampling,
}

impl YCbCrImage {
    pub fn y(&self) -> &[u8] {
        &self.buf[self.y_range.clone()]
    }

    pub fn cb(&self) -> &[u8] {
        &self.buf[self.cb_range.clone()]
    }

    pub fn cr(&self) -> &[u8] {
        &self.buf[self.cr_range.clone()]
    }

    /// Chroma plane dimensions.
    pub fn chroma_dims(&self) -> (u32, u32) {
        self.subsampling.chroma_dims(self.width, self.height)
    }

    /// Index into [`Self::y`] of the luma sample at `(x, y)`.
    pub fn y_offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.y_stride + x as usize
    }

    /// Index into [`Self::cb`] / [`Self::cr`] of the chroma sample covering
    /// luma position `(x, y)`.
    pub fn c_offset(&self, x: u32, y: u32) -> usize {
        let (cx, cy) = match self.subsampling {
            Subsampling::S420 => (x / 2, y / 2),
            Subsampling::S422 => (x / 2, y),
            Subsampling::S444 => (x, y),
        };
        cy as usize * self.c_stride + cx as usize
    }

    /// Zero-copy view of the luma plane.
    #[cfg(feature = "imgref")]
    pub fn luma_imgref(&self) -> imgref::ImgRef<'_, u8> {
        imgref::ImgRef::new_stride(
            self.y(),
            self.width as usize,
            self.height as usize,
            self.y_stride,
        )
    }
}

/// 8-bit grayscale image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrayImage {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
}

impl GrayImage {
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Row `y` without stride padding.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.pixels[start..start + self.width as usize]
    }

    #[cfg(feature = "imgref")]
    pub fn as_imgref(&self) -> imgref::ImgRef<'_, u8> {
        imgref::ImgRef::new_stride(
            &self.pixels[..],
            self.width as usize,
            self.height as usize,
            self.stride,
        )
    }
}

/// Interleaved 8-bit RGBA image. Whether color is premultiplied is carried by
/// the [`DecodedImage`] variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RgbaImage {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
}

impl RgbaImage {
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Row `y` without stride padding, 4 bytes per pixel.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.pixels[start..start + self.width as usize * 4]
    }

    /// Row `y` as typed pixels.
    #[cfg(feature = "rgb")]
    pub fn rgba_row(&self, y: u32) -> &[rgb::RGBA8] {
        self.row(y).as_pixels()
    }

    /// Zero-copy view as typed RGBA pixels.
    #[cfg(feature = "imgref")]
    pub fn as_imgref(&self) -> imgref::ImgRef<'_, rgb::RGBA8> {
        let pixels: &[rgb::RGBA8] = self.pixels.as_pixels();
        imgref::ImgRef::new_stride(
            pixels,
            self.width as usize,
            self.height as usize,
            self.stride / 4,
        )
    }
}

/// Wrap raw decoder output into a typed image.
///
/// `bytes` must be exactly `layout.total_len()` long and the layout must
/// describe `meta`'s dimensions; anything else is treated as corruption.
pub(crate) fn assemble(
    meta: &ImageMetadata,
    layout: &PixelLayout,
    bytes: Vec<u8>,
) -> Result<DecodedImage, HeicError> {
    if bytes.len() != layout.total_len() {
        return Err(HeicError::SizeMismatch {
            expected: layout.total_len(),
            actual: bytes.len(),
        });
    }
    if layout.width() != meta.width || layout.height() != meta.height {
        return Err(HeicError::Corrupt(format!(
            "layout is {}x{} but image is {}x{}",
            layout.width(),
            layout.height(),
            meta.width,
            meta.height
        )));
    }
    if layout.color_model() != meta.color_model()? {
        return Err(HeicError::Corrupt(
            "layout color model does not match metadata".into(),
        ));
    }

    let planes = layout.planes();
    let (width, height) = (meta.width, meta.height);
    let image = match layout.color_model() {
        ColorModel::YCbCr(subsampling) => {
            let [y, cb, cr] = planes else {
                return Err(HeicError::Corrupt(format!(
                    "YCbCr layout has {} planes",
                    planes.len()
                )));
            };
            DecodedImage::YCbCr(YCbCrImage {
                y_range: y.range(),
                cb_range: cb.range(),
                cr_range: cr.range(),
                y_stride: y.stride,
                c_stride: cb.stride,
                width,
                height,
                subsampling,
                buf: bytes,
            })
        }
        ColorModel::Gray => DecodedImage::Gray(GrayImage {
            stride: planes[0].stride,
            width,
            height,
            pixels: bytes,
        }),
        ColorModel::Rgba => DecodedImage::Rgba(RgbaImage {
            stride: planes[0].stride,
            width,
            height,
            pixels: bytes,
        }),
        ColorModel::Nrgba => DecodedImage::Nrgba(RgbaImage {
            stride: planes[0].stride,
            width,
            height,
            pixels: bytes,
        }),
    };
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::resolve;
    use crate::metadata::{Chroma, Colorspace};

    fn meta(colorspace: Colorspace, chroma: Chroma, premultiplied: bool) -> ImageMetadata {
        ImageMetadata {
            width: 5,
            height: 3,
            colorspace,
            chroma,
            premultiplied_alpha: premultiplied,
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn ycbcr_planes_are_sliced_in_order() {
        let m = meta(Colorspace::YCbCr, Chroma::C420, false);
        let layout = resolve(&m).unwrap();
        let img = assemble(&m, &layout, pattern(layout.total_len())).unwrap();
        let DecodedImage::YCbCr(ycc) = img else {
            panic!("expected YCbCr");
        };
        assert_eq!(ycc.y().len(), 48);
        assert_eq!(ycc.cb().len(), 32);
        assert_eq!(ycc.cr().len(), 32);
        assert_eq!(ycc.y()[0], 0);
        assert_eq!(ycc.cb()[0], 48);
        assert_eq!(ycc.cr()[0], 80);
        assert_eq!((ycc.y_stride, ycc.c_stride), (16, 16));
        assert_eq!(ycc.chroma_dims(), (3, 2));
        assert_eq!(ycc.y_offset(4, 2), 36);
        assert_eq!(ycc.c_offset(4, 2), 18);
    }

    #[test]
    fn rgba_variant_follows_premultiplied_flag() {
        let straight = meta(Colorspace::Rgb, Chroma::InterleavedRgba, false);
        let layout = resolve(&straight).unwrap();
        let img = assemble(&straight, &layout, pattern(layout.total_len())).unwrap();
        assert_eq!(img.color_model(), ColorModel::Nrgba);
        assert_eq!((img.width(), img.height()), (5, 3));

        let premul = meta(Colorspace::Rgb, Chroma::InterleavedRgba, true);
        let layout = resolve(&premul).unwrap();
        let img = assemble(&premul, &layout, pattern(layout.total_len())).unwrap();
        let DecodedImage::Rgba(rgba) = img else {
            panic!("expected premultiplied RGBA");
        };
        assert_eq!(rgba.stride, 32);
        assert_eq!(rgba.row(1).len(), 20);
        assert_eq!(rgba.row(1)[0], 32);
    }

    #[cfg(feature = "rgb")]
    #[test]
    fn rgba_rows_as_typed_pixels() {
        let m = meta(Colorspace::Rgb, Chroma::InterleavedRgba, false);
        let layout = resolve(&m).unwrap();
        let img = assemble(&m, &layout, pattern(layout.total_len())).unwrap();
        let DecodedImage::Nrgba(rgba) = img else {
            panic!("expected straight-alpha RGBA");
        };
        let row = rgba.rgba_row(2);
        assert_eq!(row.len(), 5);
        assert_eq!(row[0], rgb::RGBA8::new(64, 65, 66, 67));
        assert_eq!(row[4], rgb::RGBA8::new(80, 81, 82, 83));
    }

    #[test]
    fn gray_rows_skip_padding() {
        let m = meta(Colorspace::Monochrome, Chroma::Monochrome, false);
        let layout = resolve(&m).unwrap();
        let img = assemble(&m, &layout, pattern(layout.total_len())).unwrap();
        let DecodedImage::Gray(gray) = img else {
            panic!("expected gray");
        };
        assert_eq!(gray.row(2), &[32, 33, 34, 35, 36]);
    }

    #[test]
    fn short_buffer_is_corruption() {
        let m = meta(Colorspace::YCbCr, Chroma::C444, false);
        let layout = resolve(&m).unwrap();
        let err = assemble(&m, &layout, pattern(layout.total_len() - 1)).unwrap_err();
        assert!(matches!(err, HeicError::SizeMismatch { .. }));
    }

    #[test]
    fn mismatched_dimensions_are_corruption() {
        let m = meta(Colorspace::YCbCr, Chroma::C444, false);
        let layout = resolve(&m).unwrap();
        let other = ImageMetadata { width: 6, ..m };
        let err = assemble(&other, &layout, pattern(layout.total_len())).unwrap_err();
        assert!(matches!(err, HeicError::Corrupt(_)));
    }

    #[test]
    fn into_bytes_returns_whole_buffer() {
        let m = meta(Colorspace::YCbCr, Chroma::C422, false);
        let layout = resolve(&m).unwrap();
        let img = assemble(&m, &layout, pattern(layout.total_len())).unwrap();
        assert_eq!(img.as_bytes().len(), layout.total_len());
        assert_eq!(img.into_bytes().len(), layout.total_len());
    }
}
