//! # zenheic
//!
//! HEIC decoder built on libheif, without linking libheif at build time.
//!
//! ## Backends
//!
//! - **Sandboxed** (always present): libheif compiled to WebAssembly, bundled
//!   into the crate and run under wasmtime. Each decode gets a fresh module
//!   instance, so decodes are isolated and run in parallel.
//! - **Native** (optional): a system libheif found at runtime with `dlopen`.
//!   Used automatically when it loads, unless [`force_sandboxed`] or the
//!   `ZENHEIC_FORCE_SANDBOX` environment variable says otherwise.
//!
//! Both backends produce the same output: planar Y'CbCr, gray, or interleaved
//! RGBA with rows padded to 16-byte strides.
//!
//! ## Non-Goals
//!
//! - Encoding
//! - Color conversion (Y'CbCr stays Y'CbCr)
//! - Image sequences, thumbnails, auxiliary images, and EXIF/XMP
//! - HDR output (high bit depth sources decode to 8 bits)
//!
//! ## Usage
//!
//! ```no_run
//! use zenheic::{DecodedImage, Unstoppable};
//!
//! let data = std::fs::read("photo.heic")?;
//!
//! // Dimensions without decoding
//! let meta = zenheic::decode_config(&data)?;
//! println!("{}x{} {:?}", meta.width, meta.height, meta.color_model()?);
//!
//! match zenheic::decode(&data, Unstoppable)? {
//!     DecodedImage::YCbCr(img) => println!("luma stride {}", img.y_stride),
//!     other => println!("{:?}", other.color_model()),
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(unsafe_code)]

mod backend;
mod decode;
mod error;
mod image;
mod layout;
mod limits;
mod metadata;

use std::io::Read;

// Re-exports
pub use backend::native::{LIBHEIF_PATH_ENV, Version as LibheifVersion};
pub use backend::{
    BackendKind, BackendPreference, FORCE_SANDBOX_ENV, NativeBackend, SandboxBackend,
    active_backend, force_sandboxed, is_native_available, is_sandboxed_forced, native_error,
};
pub use decode::{DecodeRequest, MAX_HEADER_SIZE};
pub use enough::{Stop, StopReason, Unstoppable};
pub use error::HeicError;
pub use image::{DecodedImage, GrayImage, RgbaImage, YCbCrImage};
pub use layout::{
    PixelLayout, Plane, STRIDE_ALIGN, Subsampling, align16, resolve as resolve_layout,
};
pub use limits::Limits;
pub use metadata::{Chroma, ColorModel, Colorspace, ImageMetadata};

/// Magic for format registries: `?` matches any byte.
pub const SIGNATURE: &[u8; 12] = b"????ftypheic";

/// Whether `data` starts with [`SIGNATURE`].
pub fn matches_signature(data: &[u8]) -> bool {
    data.len() >= SIGNATURE.len()
        && SIGNATURE
            .iter()
            .zip(data)
            .all(|(&want, &got)| want == b'?' || want == got)
}

/// Decode a HEIC image on the automatically selected backend.
pub fn decode(data: &[u8], stop: impl Stop) -> Result<DecodedImage, HeicError> {
    DecodeRequest::new(data).decode(stop)
}

/// Read dimensions and color description. The sandboxed backend looks at no
/// more than [`MAX_HEADER_SIZE`] bytes; the native one parses the whole file.
pub fn decode_config(data: &[u8]) -> Result<ImageMetadata, HeicError> {
    DecodeRequest::new(data).config()
}

/// [`decode`] from a byte source. The whole source is read first.
pub fn decode_reader(reader: impl Read, stop: impl Stop) -> Result<DecodedImage, HeicError> {
    let data = decode::read_input(reader, None)?;
    decode(&data, stop)
}

/// [`decode_config`] from a byte source. Reads at most [`MAX_HEADER_SIZE`]
/// bytes on the sandboxed backend and the whole source on the native one.
pub fn decode_config_reader(reader: impl Read) -> Result<ImageMetadata, HeicError> {
    let active = backend::resolve(BackendPreference::Auto);
    let bound = match &active {
        Ok(active) => active.as_backend().config_bound(),
        Err(_) => Some(MAX_HEADER_SIZE),
    };
    let data = decode::read_input(reader, bound)?;
    active?.as_backend().config_metadata(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_wildcards_box_size() {
        assert!(matches_signature(b"\0\0\0\x18ftypheic\0\0\0\0"));
        assert!(matches_signature(b"abcdftypheic"));
        assert!(!matches_signature(b"\0\0\0\x18ftypavif"));
        assert!(!matches_signature(b"\0\0\0\x18ftyphei"));
        assert!(!matches_signature(b""));
    }
}
