//! libheif C API, bound at runtime.
//!
//! Only the handful of entry points the decoder needs are resolved. They are
//! copied out of the library into a plain table of function pointers once;
//! the [`Library`] is kept alongside so the pointers stay valid.

use core::ffi::{CStr, c_char, c_int, c_void};
use core::fmt;
use core::marker::{PhantomData, PhantomPinned};

use libloading::Library;

/// `heif_filetype_yes_supported`
pub(crate) const FILETYPE_YES_SUPPORTED: c_int = 1;

/// `heif_channel_*`
pub(crate) const CHANNEL_Y: c_int = 0;
pub(crate) const CHANNEL_CB: c_int = 1;
pub(crate) const CHANNEL_CR: c_int = 2;
pub(crate) const CHANNEL_INTERLEAVED: c_int = 10;

macro_rules! opaque {
    ($($name:ident),*) => {$(
        #[repr(C)]
        pub(crate) struct $name {
            _data: [u8; 0],
            _marker: PhantomData<(*mut u8, PhantomPinned)>,
        }
    )*};
}

opaque!(HeifContext, HeifImageHandle, HeifImage);

/// `struct heif_error`, returned by value.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct HeifError {
    pub code: c_int,
    pub subcode: c_int,
    pub message: *const c_char,
}

impl HeifError {
    pub(crate) fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// The library's static description of the error.
    pub(crate) fn message(&self) -> String {
        if self.message.is_null() {
            return format!("error {}/{}", self.code, self.subcode);
        }
        // SAFETY: libheif error messages are static NUL-terminated strings.
        unsafe { CStr::from_ptr(self.message) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Leading fields of `struct heif_decoding_options`, common to every
/// options version. Only ever accessed through a pointer from
/// `heif_decoding_options_alloc`.
#[repr(C)]
#[allow(dead_code)]
pub(crate) struct HeifDecodingOptions {
    pub version: u8,
    pub ignore_transformations: u8,
    pub start_progress: *const c_void,
    pub on_progress: *const c_void,
    pub end_progress: *const c_void,
    pub progress_user_data: *mut c_void,
    /// Present from options version 2.
    pub convert_hdr_to_8bit: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    /// First release with `heif_image_handle_get_preferred_decoding_colorspace`.
    pub(crate) const PREFERRED_COLORSPACE: Version = Version {
        major: 1,
        minor: 17,
    };
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

pub(crate) type CheckFiletype = unsafe extern "C" fn(*const u8, c_int) -> c_int;
pub(crate) type ContextAlloc = unsafe extern "C" fn() -> *mut HeifContext;
pub(crate) type ContextFree = unsafe extern "C" fn(*mut HeifContext);
pub(crate) type ContextReadFromMemoryWithoutCopy =
    unsafe extern "C" fn(*mut HeifContext, *const c_void, usize, *const c_void) -> HeifError;
pub(crate) type ContextGetPrimaryImageHandle =
    unsafe extern "C" fn(*mut HeifContext, *mut *mut HeifImageHandle) -> HeifError;
pub(crate) type HandleGetInt = unsafe extern "C" fn(*const HeifImageHandle) -> c_int;
pub(crate) type HandleGetPreferredDecodingColorspace =
    unsafe extern "C" fn(*const HeifImageHandle, *mut c_int, *mut c_int) -> HeifError;
pub(crate) type HandleRelease = unsafe extern "C" fn(*const HeifImageHandle);
pub(crate) type DecodingOptionsAlloc = unsafe extern "C" fn() -> *mut HeifDecodingOptions;
pub(crate) type DecodingOptionsFree = unsafe extern "C" fn(*mut HeifDecodingOptions);
pub(crate) type DecodeImage = unsafe extern "C" fn(
    *const HeifImageHandle,
    *mut *mut HeifImage,
    c_int,
    c_int,
    *const HeifDecodingOptions,
) -> HeifError;
pub(crate) type ImageGetPlaneReadonly =
    unsafe extern "C" fn(*const HeifImage, c_int, *mut c_int) -> *const u8;
pub(crate) type ImageGetChannelInt = unsafe extern "C" fn(*const HeifImage, c_int) -> c_int;
pub(crate) type ImageRelease = unsafe extern "C" fn(*const HeifImage);
type GetVersionNumber = unsafe extern "C" fn() -> c_int;

/// Resolved libheif entry points.
pub(crate) struct LibHeif {
    pub version: Version,
    pub check_filetype: CheckFiletype,
    pub context_alloc: ContextAlloc,
    pub context_free: ContextFree,
    pub context_read_from_memory_without_copy: ContextReadFromMemoryWithoutCopy,
    pub context_get_primary_image_handle: ContextGetPrimaryImageHandle,
    pub handle_get_width: HandleGetInt,
    pub handle_get_height: HandleGetInt,
    pub handle_is_premultiplied_alpha: HandleGetInt,
    /// Absent before libheif 1.17.
    pub handle_get_preferred_decoding_colorspace: Option<HandleGetPreferredDecodingColorspace>,
    pub handle_release: HandleRelease,
    pub decoding_options_alloc: DecodingOptionsAlloc,
    pub decoding_options_free: DecodingOptionsFree,
    pub decode_image: DecodeImage,
    pub image_get_plane_readonly: ImageGetPlaneReadonly,
    /// Per-channel sample counts; -1 for a missing channel.
    pub image_get_width: ImageGetChannelInt,
    pub image_get_height: ImageGetChannelInt,
    pub image_release: ImageRelease,
    _library: Library,
}

/// Copy one symbol out of `library`.
///
/// # Safety
///
/// `T` must be the function pointer type matching the C declaration of
/// `name`.
unsafe fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T, String> {
    // SAFETY: forwarded to the caller.
    unsafe { library.get::<T>(name.as_bytes()) }
        .map(|sym| *sym)
        .map_err(|e| format!("missing symbol `{name}`: {e}"))
}

impl LibHeif {
    /// Resolve the capability table from a loaded library.
    pub(crate) fn bind(library: Library) -> Result<Self, String> {
        // SAFETY: every type below mirrors the libheif header for the symbol.
        unsafe {
            let major: GetVersionNumber = symbol(&library, "heif_get_version_number_major")?;
            let minor: GetVersionNumber = symbol(&library, "heif_get_version_number_minor")?;
            let version = Version {
                major: major().max(0) as u32,
                minor: minor().max(0) as u32,
            };
            let missing = |e: String| format!("libheif {version}: {e}");

            let handle_get_preferred_decoding_colorspace =
                if version >= Version::PREFERRED_COLORSPACE {
                    Some(
                        symbol(
                            &library,
                            "heif_image_handle_get_preferred_decoding_colorspace",
                        )
                        .map_err(missing)?,
                    )
                } else {
                    None
                };

            Ok(Self {
                version,
                check_filetype: symbol(&library, "heif_check_filetype").map_err(missing)?,
                context_alloc: symbol(&library, "heif_context_alloc").map_err(missing)?,
                context_free: symbol(&library, "heif_context_free").map_err(missing)?,
                context_read_from_memory_without_copy: symbol(
                    &library,
                    "heif_context_read_from_memory_without_copy",
                )
                .map_err(missing)?,
                context_get_primary_image_handle: symbol(
                    &library,
                    "heif_context_get_primary_image_handle",
                )
                .map_err(missing)?,
                handle_get_width: symbol(&library, "heif_image_handle_get_width")
                    .map_err(missing)?,
                handle_get_height: symbol(&library, "heif_image_handle_get_height")
                    .map_err(missing)?,
                handle_is_premultiplied_alpha: symbol(
                    &library,
                    "heif_image_handle_is_premultiplied_alpha",
                )
                .map_err(missing)?,
                handle_get_preferred_decoding_colorspace,
                handle_release: symbol(&library, "heif_image_handle_release").map_err(missing)?,
                decoding_options_alloc: symbol(&library, "heif_decoding_options_alloc")
                    .map_err(missing)?,
                decoding_options_free: symbol(&library, "heif_decoding_options_free")
                    .map_err(missing)?,
                decode_image: symbol(&library, "heif_decode_image").map_err(missing)?,
                image_get_plane_readonly: symbol(&library, "heif_image_get_plane_readonly")
                    .map_err(missing)?,
                image_get_width: symbol(&library, "heif_image_get_width").map_err(missing)?,
                image_get_height: symbol(&library, "heif_image_get_height").map_err(missing)?,
                image_release: symbol(&library, "heif_image_release").map_err(missing)?,
                _library: library,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering_gates_colorspace_query() {
        let old = Version {
            major: 1,
            minor: 16,
        };
        let new = Version {
            major: 1,
            minor: 17,
        };
        let next_major = Version { major: 2, minor: 0 };
        assert!(old < Version::PREFERRED_COLORSPACE);
        assert!(new >= Version::PREFERRED_COLORSPACE);
        assert!(next_major >= Version::PREFERRED_COLORSPACE);
        assert_eq!(new.to_string(), "1.17");
    }

    #[test]
    fn null_error_message_falls_back_to_codes() {
        let err = HeifError {
            code: 2,
            subcode: 100,
            message: core::ptr::null(),
        };
        assert!(!err.is_ok());
        assert_eq!(err.message(), "error 2/100");
    }
}
