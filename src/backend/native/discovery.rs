//! Locating a system libheif.

use std::ffi::OsString;
use std::path::Path;

use libloading::Library;

/// Overrides the candidate list with a single path.
pub const LIBHEIF_PATH_ENV: &str = "ZENHEIC_LIBHEIF_PATH";

#[cfg(target_os = "macos")]
const CANDIDATES: &[&str] = &[
    "libheif.1.dylib",
    "libheif.dylib",
    "/opt/homebrew/lib/libheif.dylib",
    "/usr/local/lib/libheif.dylib",
];

#[cfg(windows)]
const CANDIDATES: &[&str] = &["libheif.dll", "heif.dll"];

#[cfg(not(any(target_os = "macos", windows)))]
const CANDIDATES: &[&str] = &["libheif.so.1", "libheif.so"];

/// Library names tried in order: the environment override, then the
/// platform defaults.
pub(crate) fn candidates() -> Vec<OsString> {
    let mut names = Vec::with_capacity(CANDIDATES.len() + 1);
    if let Some(path) = std::env::var_os(LIBHEIF_PATH_ENV).filter(|p| !p.is_empty()) {
        names.push(path);
    }
    names.extend(CANDIDATES.iter().map(OsString::from));
    names
}

/// Open one library file.
pub(crate) fn open(path: &Path) -> Result<Library, String> {
    if cfg!(all(target_os = "linux", target_feature = "crt-static")) {
        return Err("not a dynamic binary".into());
    }
    // SAFETY: libheif runs no initializers with preconditions on load.
    unsafe { Library::new(path) }.map_err(|e| format!("{}: {e}", path.display()))
}

/// Open the first candidate that loads and binds. On total failure the last
/// error is returned.
pub(crate) fn first_match<T>(
    names: &[OsString],
    mut bind: impl FnMut(Library) -> Result<T, String>,
) -> Result<T, String> {
    let mut last = String::from("no libheif candidates to try");
    for name in names {
        match open(Path::new(name)).and_then(&mut bind) {
            Ok(found) => {
                log::debug!("loaded libheif from {}", Path::new(name).display());
                return Ok(found);
            }
            Err(e) => {
                log::debug!("libheif candidate rejected: {e}");
                last = e;
            }
        }
    }
    Err(last)
}
