//! Buffer layout for decoder output.
//!
//! The sandboxed decoder writes its planes back to back with every row padded
//! to a 16-byte stride. The native path copies into the same layout, so both
//! backends hand the assembler identical shapes.

use crate::error::HeicError;
use crate::metadata::{ColorModel, ImageMetadata};

/// Row stride alignment in bytes.
pub const STRIDE_ALIGN: usize = 16;

/// Round `x` up to the next multiple of 16.
#[inline]
pub const fn align16(x: usize) -> usize {
    (x + (STRIDE_ALIGN - 1)) & !(STRIDE_ALIGN - 1)
}

/// Chroma subsampling of a planar YCbCr image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Subsampling {
    /// Chroma halved in both directions.
    S420,
    /// Chroma halved horizontally.
    S422,
    /// Full-resolution chroma.
    S444,
}

impl Subsampling {
    /// Chroma plane dimensions for a luma plane of `width` x `height`.
    pub fn chroma_dims(self, width: u32, height: u32) -> (u32, u32) {
        let half = |v: u32| v.div_ceil(2);
        match self {
            Self::S420 => (half(width), half(height)),
            Self::S422 => (half(width), height),
            Self::S444 => (width, height),
        }
    }
}

/// One plane within the output buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Plane {
    /// Width in samples (pixels for interleaved RGBA).
    pub width: u32,
    pub height: u32,
    /// Meaningful bytes per row.
    pub row_bytes: usize,
    /// Distance in bytes between row starts.
    pub stride: usize,
    /// Byte offset of the plane within the buffer.
    pub offset: usize,
    /// `stride * height`.
    pub len: usize,
}

impl Plane {
    fn new(width: u32, height: u32, bytes_per_sample: usize, offset: usize) -> Option<Self> {
        let row_bytes = (width as usize).checked_mul(bytes_per_sample)?;
        let stride = row_bytes.checked_add(STRIDE_ALIGN - 1)? & !(STRIDE_ALIGN - 1);
        let len = stride.checked_mul(height as usize)?;
        offset.checked_add(len)?;
        Some(Self {
            width,
            height,
            row_bytes,
            stride,
            offset,
            len,
        })
    }

    /// Byte range of this plane within the output buffer.
    pub fn range(&self) -> core::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Shape of the raw decoder output for one image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelLayout {
    model: ColorModel,
    width: u32,
    height: u32,
    planes: Vec<Plane>,
    total: usize,
}

impl PixelLayout {
    pub fn color_model(&self) -> ColorModel {
        self.model
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Planes in buffer order: Y, Cb, Cr for YCbCr, otherwise one plane.
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Total bytes the decoder writes.
    pub fn total_len(&self) -> usize {
        self.total
    }

    pub fn subsampling(&self) -> Option<Subsampling> {
        match self.model {
            ColorModel::YCbCr(s) => Some(s),
            _ => None,
        }
    }
}

/// Compute the output layout for `meta`.
///
/// Fails with [`HeicError::UnsupportedLayout`] for any colorspace/chroma
/// pairing without a layout policy.
pub fn resolve(meta: &ImageMetadata) -> Result<PixelLayout, HeicError> {
    meta.check_dimensions()?;
    let model = meta.color_model()?;
    let (width, height) = (meta.width, meta.height);
    let too_large = || HeicError::DimensionsTooLarge { width, height };

    let planes = match model {
        ColorModel::YCbCr(subsampling) => {
            let (cw, ch) = subsampling.chroma_dims(width, height);
            let y = Plane::new(width, height, 1, 0).ok_or_else(too_large)?;
            let cb = Plane::new(cw, ch, 1, y.len).ok_or_else(too_large)?;
            let cr = Plane::new(cw, ch, 1, cb.offset + cb.len).ok_or_else(too_large)?;
            vec![y, cb, cr]
        }
        ColorModel::Gray => vec![Plane::new(width, height, 1, 0).ok_or_else(too_large)?],
        ColorModel::Rgba | ColorModel::Nrgba => {
            vec![Plane::new(width, height, 4, 0).ok_or_else(too_large)?]
        }
    };

    let total = planes
        .last()
        .map(|p| p.offset + p.len)
        .unwrap_or_default();
    // The sandboxed module addresses its output with 32-bit pointers.
    if u32::try_from(total).is_err() {
        return Err(too_large());
    }

    Ok(PixelLayout {
        model,
        width,
        height,
        planes,
        total,
    })
}
