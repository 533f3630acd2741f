//! Image metadata as reported by the decoder's metadata pass.

use crate::error::HeicError;
use crate::layout::Subsampling;

/// Colorspace reported by libheif.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Colorspace {
    YCbCr,
    Rgb,
    Monochrome,
    Undefined,
}

impl Colorspace {
    /// Map a raw `heif_colorspace` code. Unknown codes become `Undefined`.
    pub(crate) fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::YCbCr,
            1 => Self::Rgb,
            2 => Self::Monochrome,
            _ => Self::Undefined,
        }
    }

    pub(crate) fn to_raw(self) -> u32 {
        match self {
            Self::YCbCr => 0,
            Self::Rgb => 1,
            Self::Monochrome => 2,
            Self::Undefined => 99,
        }
    }
}

/// Chroma format reported by libheif.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Chroma {
    C420,
    C422,
    C444,
    InterleavedRgba,
    Monochrome,
    Undefined,
}

impl Chroma {
    /// Map a raw `heif_chroma` code. Unknown codes become `Undefined`.
    pub(crate) fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Monochrome,
            1 => Self::C420,
            2 => Self::C422,
            3 => Self::C444,
            11 => Self::InterleavedRgba,
            _ => Self::Undefined,
        }
    }

    pub(crate) fn to_raw(self) -> u32 {
        match self {
            Self::Monochrome => 0,
            Self::C420 => 1,
            Self::C422 => 2,
            Self::C444 => 3,
            Self::InterleavedRgba => 11,
            Self::Undefined => 99,
        }
    }
}

/// Output color model of a decoded image.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColorModel {
    /// Planar Y'CbCr with the given chroma subsampling.
    YCbCr(Subsampling),
    /// Single 8-bit luma channel.
    Gray,
    /// Interleaved 8-bit RGBA, color premultiplied by alpha.
    Rgba,
    /// Interleaved 8-bit RGBA, straight (non-premultiplied) alpha.
    Nrgba,
}

impl ColorModel {
    /// Resolve the colorspace/chroma pairing into a color model.
    ///
    /// The two fields are only meaningful together: `Rgb` must come with
    /// interleaved RGBA, `Monochrome` with monochrome chroma, and `YCbCr` with
    /// one of the three planar subsamplings.
    pub fn from_pairing(
        colorspace: Colorspace,
        chroma: Chroma,
        premultiplied_alpha: bool,
    ) -> Result<Self, HeicError> {
        match (colorspace, chroma) {
            (Colorspace::YCbCr, Chroma::C420) => Ok(Self::YCbCr(Subsampling::S420)),
            (Colorspace::YCbCr, Chroma::C422) => Ok(Self::YCbCr(Subsampling::S422)),
            (Colorspace::YCbCr, Chroma::C444) => Ok(Self::YCbCr(Subsampling::S444)),
            (Colorspace::Monochrome, Chroma::Monochrome) => Ok(Self::Gray),
            (Colorspace::Rgb, Chroma::InterleavedRgba) if premultiplied_alpha => Ok(Self::Rgba),
            (Colorspace::Rgb, Chroma::InterleavedRgba) => Ok(Self::Nrgba),
            _ => Err(HeicError::UnsupportedLayout { colorspace, chroma }),
        }
    }

    /// Whether color samples are premultiplied by alpha.
    pub fn is_premultiplied(&self) -> bool {
        matches!(self, Self::Rgba)
    }
}

/// Dimensions and color description of a HEIC primary image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub colorspace: Colorspace,
    pub chroma: Chroma,
    pub premultiplied_alpha: bool,
}

impl ImageMetadata {
    /// Build metadata from the five raw result slots written by the decoder.
    pub(crate) fn from_raw_slots(slots: [u32; 5]) -> Self {
        let [width, height, colorspace, chroma, premultiplied] = slots;
        Self {
            width,
            height,
            colorspace: Colorspace::from_raw(colorspace),
            chroma: Chroma::from_raw(chroma),
            premultiplied_alpha: premultiplied != 0,
        }
    }

    /// Color model this image decodes to.
    pub fn color_model(&self) -> Result<ColorModel, HeicError> {
        ColorModel::from_pairing(self.colorspace, self.chroma, self.premultiplied_alpha)
    }

    pub(crate) fn check_dimensions(&self) -> Result<(), HeicError> {
        if self.width == 0 || self.height == 0 {
            return Err(HeicError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}
