//! System libheif, loaded at runtime.
//!
//! Nothing is linked at build time. [`NativeBackend::shared`] searches the
//! usual library names once per process (see [`LIBHEIF_PATH_ENV`] to point at
//! a specific file) and binds the entry points into a capability table.
//!
//! Each decode builds its own context → handle → image chain. The guards
//! borrow from one another, so they are released in reverse order on every
//! path, and the pixel planes are copied out before the image is released.
//! The context reads the caller's bytes in place; its guard borrows the input
//! slice for as long as the context lives.

#![allow(unsafe_code)]

mod discovery;
mod ffi;

use core::ffi::{c_int, c_void};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use std::path::Path;
use std::sync::OnceLock;

use enough::Stop;

use crate::backend::{Admission, BackendKind, DecodeMode, HeifBackend, RawDecode, RawPixels};
use crate::error::HeicError;
use crate::image::DecodedImage;
use crate::layout::{self, PixelLayout, Plane};
use crate::limits::Limits;
use crate::metadata::{ColorModel, ImageMetadata};

pub use discovery::LIBHEIF_PATH_ENV;
pub use ffi::Version;

use ffi::{HeifContext, HeifDecodingOptions, HeifImage, HeifImageHandle, LibHeif};

const COLORSPACE_YCBCR: c_int = 0;
const COLORSPACE_RGB: c_int = 1;
const COLORSPACE_UNDEFINED: c_int = 99;
const CHROMA_420: c_int = 1;
const CHROMA_INTERLEAVED_RGBA: c_int = 11;
const CHROMA_UNDEFINED: c_int = 99;

/// Native libheif backend.
pub struct NativeBackend {
    lib: LibHeif,
}

impl core::fmt::Debug for NativeBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NativeBackend")
            .field("version", &self.lib.version)
            .finish_non_exhaustive()
    }
}

impl NativeBackend {
    /// Search the default locations for libheif.
    pub fn load() -> Result<Self, HeicError> {
        discovery::first_match(&discovery::candidates(), LibHeif::bind)
            .map(|lib| Self { lib })
            .map_err(HeicError::BackendUnavailable)
    }

    /// Load libheif from a specific file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, HeicError> {
        discovery::open(path.as_ref())
            .and_then(LibHeif::bind)
            .map(|lib| Self { lib })
            .map_err(HeicError::BackendUnavailable)
    }

    /// The process-wide backend. The library is searched for once; a failure
    /// is cached and returned to every later caller.
    pub fn shared() -> Result<&'static NativeBackend, HeicError> {
        static SHARED: OnceLock<Result<NativeBackend, String>> = OnceLock::new();
        SHARED
            .get_or_init(|| {
                NativeBackend::load().map_err(|e| {
                    log::debug!("native libheif unavailable: {e}");
                    match e {
                        HeicError::BackendUnavailable(reason) => reason,
                        other => other.to_string(),
                    }
                })
            })
            .as_ref()
            .map_err(|reason| HeicError::BackendUnavailable(reason.clone()))
    }

    pub fn version(&self) -> Version {
        self.lib.version
    }

    /// Decode a HEIC image.
    pub fn decode(&self, data: &[u8], stop: impl Stop) -> Result<DecodedImage, HeicError> {
        self.decode_image(data, &Admission::new(None, &stop))
    }

    /// Decode a HEIC image within `limits`.
    pub fn decode_with_limits(
        &self,
        data: &[u8],
        limits: &Limits,
        stop: impl Stop,
    ) -> Result<DecodedImage, HeicError> {
        self.decode_image(data, &Admission::new(Some(limits), &stop))
    }

    /// Read dimensions and color description. libheif parses the whole
    /// container, so `data` must be the complete file.
    pub fn decode_config(&self, data: &[u8]) -> Result<ImageMetadata, HeicError> {
        self.config_metadata(data)
    }
}

impl HeifBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn run(
        &self,
        input: &[u8],
        mode: DecodeMode,
        admission: &Admission<'_>,
    ) -> Result<RawDecode, HeicError> {
        let lib = &self.lib;
        if input.is_empty() {
            return Err(HeicError::DecodeFailed);
        }
        let input_len = c_int::try_from(input.len()).unwrap_or(c_int::MAX);
        // SAFETY: the pointer and length describe `input`.
        let filetype = unsafe { (lib.check_filetype)(input.as_ptr(), input_len) };
        if filetype != ffi::FILETYPE_YES_SUPPORTED {
            log::trace!("heif_check_filetype returned {filetype}");
            return Err(HeicError::DecodeFailed);
        }

        let context = Context::read(lib, input)?;
        let handle = context.primary_handle()?;
        let (colorspace, chroma) = handle.decoding_colorspace()?;
        let metadata = ImageMetadata::from_raw_slots([
            handle.width(),
            handle.height(),
            colorspace as u32,
            chroma as u32,
            u32::from(handle.is_premultiplied()),
        ]);
        metadata.check_dimensions()?;

        if mode == DecodeMode::Metadata {
            return Ok(RawDecode {
                metadata,
                pixels: None,
            });
        }

        let layout = layout::resolve(&metadata)?;
        admission.admit(&metadata, &layout)?;

        let options = Options::new(lib)?;
        log::trace!(
            "native decode of {}x{} into {} bytes",
            metadata.width,
            metadata.height,
            layout.total_len()
        );
        let image = handle.decode(
            metadata.colorspace.to_raw() as c_int,
            metadata.chroma.to_raw() as c_int,
            &options,
        )?;
        let bytes = copy_planes(&image, &layout)?;

        Ok(RawDecode {
            metadata,
            pixels: Some(RawPixels { layout, bytes }),
        })
    }
}

fn decode_error(step: &str, err: ffi::HeifError) -> HeicError {
    log::debug!("{step}: {}", err.message());
    HeicError::DecodeFailed
}

/// Map the library's preferred decoding target onto one the resolver
/// accepts.
fn normalize_colorspace(colorspace: c_int, chroma: c_int) -> (c_int, c_int) {
    if colorspace == COLORSPACE_UNDEFINED || chroma == CHROMA_UNDEFINED {
        (COLORSPACE_YCBCR, CHROMA_420)
    } else if colorspace == COLORSPACE_RGB {
        (COLORSPACE_RGB, CHROMA_INTERLEAVED_RGBA)
    } else {
        (colorspace, chroma)
    }
}

/// A decoding context reading `'input` in place.
struct Context<'input> {
    lib: &'input LibHeif,
    ptr: NonNull<HeifContext>,
    _input: PhantomData<&'input [u8]>,
}

impl<'input> Context<'input> {
    fn read(lib: &'input LibHeif, input: &'input [u8]) -> Result<Self, HeicError> {
        // SAFETY: no preconditions.
        let ptr = NonNull::new(unsafe { (lib.context_alloc)() })
            .ok_or_else(|| HeicError::MemoryFault("heif_context_alloc returned null".into()))?;
        let context = Self {
            lib,
            ptr,
            _input: PhantomData,
        };
        // SAFETY: the context is live and `input` outlives it.
        let err = unsafe {
            (lib.context_read_from_memory_without_copy)(
                ptr.as_ptr(),
                input.as_ptr().cast::<c_void>(),
                input.len(),
                ptr::null(),
            )
        };
        if !err.is_ok() {
            return Err(decode_error("heif_context_read_from_memory_without_copy", err));
        }
        Ok(context)
    }

    fn primary_handle(&self) -> Result<Handle<'_>, HeicError> {
        let mut raw: *mut HeifImageHandle = ptr::null_mut();
        // SAFETY: the context is live; `raw` is a valid out-pointer.
        let err = unsafe {
            (self.lib.context_get_primary_image_handle)(self.ptr.as_ptr(), &mut raw)
        };
        if !err.is_ok() {
            return Err(decode_error("heif_context_get_primary_image_handle", err));
        }
        let ptr = NonNull::new(raw).ok_or(HeicError::DecodeFailed)?;
        Ok(Handle {
            lib: self.lib,
            ptr,
            _context: PhantomData,
        })
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        // SAFETY: allocated by heif_context_alloc, freed once.
        unsafe { (self.lib.context_free)(self.ptr.as_ptr()) }
    }
}

/// The primary image handle of a [`Context`].
struct Handle<'ctx> {
    lib: &'ctx LibHeif,
    ptr: NonNull<HeifImageHandle>,
    _context: PhantomData<&'ctx Context<'ctx>>,
}

impl Handle<'_> {
    fn width(&self) -> u32 {
        // SAFETY: the handle is live.
        let w = unsafe { (self.lib.handle_get_width)(self.ptr.as_ptr()) };
        u32::try_from(w).unwrap_or(0)
    }

    fn height(&self) -> u32 {
        // SAFETY: the handle is live.
        let h = unsafe { (self.lib.handle_get_height)(self.ptr.as_ptr()) };
        u32::try_from(h).unwrap_or(0)
    }

    fn is_premultiplied(&self) -> bool {
        // SAFETY: the handle is live.
        unsafe { (self.lib.handle_is_premultiplied_alpha)(self.ptr.as_ptr()) != 0 }
    }

    /// Raw colorspace and chroma to decode to. Libraries without the
    /// preferred-colorspace query always get YCbCr 4:2:0.
    fn decoding_colorspace(&self) -> Result<(c_int, c_int), HeicError> {
        let Some(query) = self.lib.handle_get_preferred_decoding_colorspace else {
            return Ok((COLORSPACE_YCBCR, CHROMA_420));
        };
        let (mut colorspace, mut chroma) = (COLORSPACE_UNDEFINED, CHROMA_UNDEFINED);
        // SAFETY: the handle is live; both out-pointers are valid.
        let err = unsafe { query(self.ptr.as_ptr(), &mut colorspace, &mut chroma) };
        if !err.is_ok() {
            return Err(decode_error(
                "heif_image_handle_get_preferred_decoding_colorspace",
                err,
            ));
        }
        Ok(normalize_colorspace(colorspace, chroma))
    }

    fn decode(
        &self,
        colorspace: c_int,
        chroma: c_int,
        options: &Options<'_>,
    ) -> Result<Image<'_>, HeicError> {
        let mut raw: *mut HeifImage = ptr::null_mut();
        // SAFETY: handle and options are live; `raw` is a valid out-pointer.
        let err = unsafe {
            (self.lib.decode_image)(
                self.ptr.as_ptr(),
                &mut raw,
                colorspace,
                chroma,
                options.ptr.as_ptr(),
            )
        };
        if !err.is_ok() {
            if let Some(ptr) = NonNull::new(raw) {
                // SAFETY: an image returned alongside an error is still owned by us.
                unsafe { (self.lib.image_release)(ptr.as_ptr()) }
            }
            return Err(decode_error("heif_decode_image", err));
        }
        let ptr = NonNull::new(raw).ok_or(HeicError::DecodeFailed)?;
        Ok(Image {
            lib: self.lib,
            ptr,
            _handle: PhantomData,
        })
    }
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        // SAFETY: obtained from the context, released once.
        unsafe { (self.lib.handle_release)(self.ptr.as_ptr()) }
    }
}

/// A decoded image owned by the library.
struct Image<'h> {
    lib: &'h LibHeif,
    ptr: NonNull<HeifImage>,
    _handle: PhantomData<&'h Handle<'h>>,
}

impl Image<'_> {
    /// Start of `channel` and its stride. The memory stays valid while
    /// `self` lives.
    fn plane(&self, channel: c_int) -> Result<(*const u8, usize), HeicError> {
        let mut stride: c_int = 0;
        // SAFETY: the image is live; `stride` is a valid out-pointer.
        let data = unsafe {
            (self.lib.image_get_plane_readonly)(self.ptr.as_ptr(), channel, &mut stride)
        };
        if data.is_null() {
            return Err(HeicError::Corrupt(format!("image has no channel {channel}")));
        }
        let stride = usize::try_from(stride)
            .map_err(|_| HeicError::Corrupt(format!("channel {channel} has stride {stride}")))?;
        Ok((data, stride))
    }

    /// Width and height of `channel` in samples, as the library sized it.
    fn channel_dims(&self, channel: c_int) -> (c_int, c_int) {
        // SAFETY: the image is live.
        unsafe {
            (
                (self.lib.image_get_width)(self.ptr.as_ptr(), channel),
                (self.lib.image_get_height)(self.ptr.as_ptr(), channel),
            )
        }
    }
}

impl Drop for Image<'_> {
    fn drop(&mut self) {
        // SAFETY: returned by heif_decode_image, released once.
        unsafe { (self.lib.image_release)(self.ptr.as_ptr()) }
    }
}

/// Decoding options for one call.
struct Options<'lib> {
    lib: &'lib LibHeif,
    ptr: NonNull<HeifDecodingOptions>,
}

impl<'lib> Options<'lib> {
    fn new(lib: &'lib LibHeif) -> Result<Self, HeicError> {
        // SAFETY: no preconditions.
        let ptr = NonNull::new(unsafe { (lib.decoding_options_alloc)() }).ok_or_else(|| {
            HeicError::MemoryFault("heif_decoding_options_alloc returned null".into())
        })?;
        // SAFETY: freshly allocated options; the field exists from version 2.
        unsafe {
            let options = ptr.as_ptr();
            if (*options).version >= 2 {
                (*options).convert_hdr_to_8bit = 1;
            }
        }
        Ok(Self { lib, ptr })
    }
}

impl Drop for Options<'_> {
    fn drop(&mut self) {
        // SAFETY: allocated by heif_decoding_options_alloc, freed once.
        unsafe { (self.lib.decoding_options_free)(self.ptr.as_ptr()) }
    }
}

fn channels(model: ColorModel) -> &'static [c_int] {
    match model {
        ColorModel::YCbCr(_) => &[ffi::CHANNEL_Y, ffi::CHANNEL_CB, ffi::CHANNEL_CR],
        ColorModel::Gray => &[ffi::CHANNEL_Y],
        ColorModel::Rgba | ColorModel::Nrgba => &[ffi::CHANNEL_INTERLEAVED],
    }
}

/// Copy every plane of `image` into a buffer shaped like `layout`.
fn copy_planes(image: &Image<'_>, layout: &PixelLayout) -> Result<Vec<u8>, HeicError> {
    let mut out = vec![0u8; layout.total_len()];
    for (plane, &channel) in layout.planes().iter().zip(channels(layout.color_model())) {
        check_plane_dims(channel, image.channel_dims(channel), plane)?;
        let (src, src_stride) = image.plane(channel)?;
        copy_plane(src, src_stride, plane, &mut out[plane.range()], channel)?;
    }
    Ok(out)
}

/// The library's plane must cover the one the layout expects, or the row
/// copy would read past it.
fn check_plane_dims(
    channel: c_int,
    (width, height): (c_int, c_int),
    plane: &Plane,
) -> Result<(), HeicError> {
    let covers = |got: c_int, want: u32| u32::try_from(got).is_ok_and(|got| got >= want);
    if covers(width, plane.width) && covers(height, plane.height) {
        Ok(())
    } else {
        Err(HeicError::Corrupt(format!(
            "channel {channel} is {width}x{height}, expected {}x{}",
            plane.width, plane.height
        )))
    }
}

fn copy_plane(
    src: *const u8,
    src_stride: usize,
    plane: &Plane,
    dst: &mut [u8],
    channel: c_int,
) -> Result<(), HeicError> {
    if src_stride < plane.row_bytes {
        return Err(HeicError::Corrupt(format!(
            "channel {channel} stride {src_stride} is shorter than a {}-byte row",
            plane.row_bytes
        )));
    }
    for (y, row) in dst.chunks_exact_mut(plane.stride).enumerate() {
        // SAFETY: the library plane has at least `plane.height` rows of
        // `src_stride` bytes (checked by `check_plane_dims`), and
        // `row_bytes <= src_stride`.
        let src_row = unsafe {
            core::slice::from_raw_parts(src.add(y * src_stride), plane.row_bytes)
        };
        row[..plane.row_bytes].copy_from_slice(src_row);
    }
    Ok(())
}
