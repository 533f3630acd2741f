//! Execution backends and backend selection.
//!
//! Two backends implement the same decode semantics:
//!
//! - [`SandboxBackend`]: libheif compiled to WebAssembly and run under
//!   wasmtime. Bundled with the crate, needs nothing from the host.
//! - [`NativeBackend`]: the system libheif, loaded with `dlopen` at first use.
//!
//! [`resolve`] picks one per call. The native library is loaded once per
//! process and the outcome (including the failure reason) is cached.

pub(crate) mod marshal;
pub mod native;
pub mod sandbox;

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use enough::Stop;

use crate::error::HeicError;
use crate::image::{DecodedImage, assemble};
use crate::layout::PixelLayout;
use crate::limits::Limits;
use crate::metadata::ImageMetadata;

pub use native::NativeBackend;
pub use sandbox::SandboxBackend;

/// Environment variable that forces the sandboxed backend when set to
/// anything other than empty or `0`.
pub const FORCE_SANDBOX_ENV: &str = "ZENHEIC_FORCE_SANDBOX";

/// Which backend a request should run on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BackendPreference {
    /// Native when available and not forced off, otherwise sandboxed.
    #[default]
    Auto,
    Sandboxed,
    /// Native only; fails with [`HeicError::BackendUnavailable`] when the
    /// library could not be loaded.
    Native,
}

/// The backend that served (or would serve) a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Sandboxed,
    Native,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DecodeMode {
    Metadata,
    Full,
}

/// Raw result of a backend run, before assembly.
#[derive(Debug)]
pub(crate) struct RawDecode {
    pub metadata: ImageMetadata,
    pub pixels: Option<RawPixels>,
}

#[derive(Debug)]
pub(crate) struct RawPixels {
    pub layout: PixelLayout,
    pub bytes: Vec<u8>,
}

/// Gate between the metadata pass and the pixel pass.
pub(crate) struct Admission<'a> {
    limits: Option<&'a Limits>,
    stop: &'a dyn Stop,
}

impl<'a> Admission<'a> {
    pub(crate) fn new(limits: Option<&'a Limits>, stop: &'a dyn Stop) -> Self {
        Self { limits, stop }
    }

    /// Checked before any input crosses the boundary.
    pub(crate) fn admit_input(&self, len: usize) -> Result<(), HeicError> {
        if let Some(limits) = self.limits {
            limits.check_input(len)?;
        }
        self.stop.check()?;
        Ok(())
    }

    /// Checked once the output shape is known, before pixel memory exists.
    pub(crate) fn admit(
        &self,
        meta: &ImageMetadata,
        layout: &PixelLayout,
    ) -> Result<(), HeicError> {
        if let Some(limits) = self.limits {
            limits.check(meta.width, meta.height)?;
            limits.check_memory(layout.total_len())?;
        }
        self.stop.check()?;
        Ok(())
    }
}

/// Common surface of the two backends.
pub(crate) trait HeifBackend {
    fn kind(&self) -> BackendKind;

    fn run(
        &self,
        input: &[u8],
        mode: DecodeMode,
        admission: &Admission<'_>,
    ) -> Result<RawDecode, HeicError>;

    fn decode_image(
        &self,
        input: &[u8],
        admission: &Admission<'_>,
    ) -> Result<DecodedImage, HeicError> {
        admission.admit_input(input.len())?;
        let raw = self.run(input, DecodeMode::Full, admission)?;
        let pixels = raw.pixels.ok_or_else(|| {
            HeicError::Corrupt("backend returned no pixels for a full decode".into())
        })?;
        assemble(&raw.metadata, &pixels.layout, pixels.bytes)
    }

    fn decode_metadata(&self, input: &[u8]) -> Result<ImageMetadata, HeicError> {
        let admission = Admission::new(None, &enough::Unstoppable);
        let raw = self.run(input, DecodeMode::Metadata, &admission)?;
        Ok(raw.metadata)
    }

    /// How many leading bytes the metadata pass is given. `None` is the
    /// whole input.
    fn config_bound(&self) -> Option<usize> {
        None
    }

    /// Metadata pass over the part of `data` allowed by [`config_bound`].
    ///
    /// [`config_bound`]: HeifBackend::config_bound
    fn config_metadata(&self, data: &[u8]) -> Result<ImageMetadata, HeicError> {
        let input = match self.config_bound() {
            Some(bound) => &data[..data.len().min(bound)],
            None => data,
        };
        self.decode_metadata(input)
    }
}

/// A resolved backend.
#[derive(Clone, Copy)]
pub(crate) enum ActiveBackend {
    Sandboxed(&'static SandboxBackend),
    Native(&'static NativeBackend),
}

impl ActiveBackend {
    pub(crate) fn as_backend(&self) -> &dyn HeifBackend {
        match self {
            Self::Sandboxed(b) => *b,
            Self::Native(b) => *b,
        }
    }
}

static FORCE_SANDBOXED: AtomicBool = AtomicBool::new(false);
static FORCE_SANDBOXED_ENV: OnceLock<bool> = OnceLock::new();
static SELECTION_LOGGED: AtomicBool = AtomicBool::new(false);

/// Force (or stop forcing) the sandboxed backend for `Auto` requests.
///
/// Intended for diagnostics and tests.
pub fn force_sandboxed(force: bool) {
    FORCE_SANDBOXED.store(force, Ordering::Relaxed);
}

/// Whether `Auto` requests are currently pinned to the sandboxed backend,
/// either through [`force_sandboxed`] or the environment.
pub fn is_sandboxed_forced() -> bool {
    FORCE_SANDBOXED.load(Ordering::Relaxed)
        || *FORCE_SANDBOXED_ENV.get_or_init(|| {
            std::env::var_os(FORCE_SANDBOX_ENV)
                .is_some_and(|v| !v.is_empty() && v != "0")
        })
}

/// Whether a compatible native libheif was found.
pub fn is_native_available() -> bool {
    NativeBackend::shared().is_ok()
}

/// Why the native libheif could not be loaded, if it could not.
pub fn native_error() -> Option<HeicError> {
    NativeBackend::shared().err()
}

/// Which backend an `Auto` request would run on.
pub fn active_backend() -> Result<BackendKind, HeicError> {
    Ok(resolve(BackendPreference::Auto)?.as_backend().kind())
}

pub(crate) fn resolve(preference: BackendPreference) -> Result<ActiveBackend, HeicError> {
    let active = match preference {
        BackendPreference::Sandboxed => ActiveBackend::Sandboxed(SandboxBackend::bundled()?),
        BackendPreference::Native => ActiveBackend::Native(NativeBackend::shared()?),
        BackendPreference::Auto => match NativeBackend::shared() {
            Ok(native) if !is_sandboxed_forced() => ActiveBackend::Native(native),
            _ => ActiveBackend::Sandboxed(SandboxBackend::bundled()?),
        },
    };
    if preference == BackendPreference::Auto && !SELECTION_LOGGED.swap(true, Ordering::Relaxed) {
        match active {
            ActiveBackend::Native(n) => {
                log::debug!("using native libheif {}", n.version());
            }
            ActiveBackend::Sandboxed(_) => match native_error() {
                Some(e) if !is_sandboxed_forced() => {
                    log::debug!("using sandboxed libheif ({e})");
                }
                _ => log::debug!("using sandboxed libheif"),
            },
        }
    }
    Ok(active)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::marshal::tests::FakeBoundary;
    use crate::backend::marshal;
    use std::sync::Mutex;

    /// Backend that runs the marshaler over a fresh fake boundary per call.
    struct FakeBackend {
        last: Mutex<Option<(usize, usize)>>,
    }

    impl HeifBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Sandboxed
        }

        fn run(
            &self,
            input: &[u8],
            mode: DecodeMode,
            admission: &Admission<'_>,
        ) -> Result<RawDecode, HeicError> {
            let mut boundary = FakeBoundary::new();
            let result = marshal::run(&mut boundary, input, mode, admission);
            *self.last.lock().unwrap() = Some((boundary.allocated.len(), boundary.freed.len()));
            result
        }
    }

    fn fake() -> FakeBackend {
        FakeBackend {
            last: Mutex::new(None),
        }
    }

    /// Records the length of every input handed to the metadata pass.
    struct SeenLen {
        bound: Option<usize>,
        seen: Mutex<Vec<usize>>,
    }

    impl HeifBackend for SeenLen {
        fn kind(&self) -> BackendKind {
            BackendKind::Native
        }

        fn run(
            &self,
            input: &[u8],
            mode: DecodeMode,
            admission: &Admission<'_>,
        ) -> Result<RawDecode, HeicError> {
            self.seen.lock().unwrap().push(input.len());
            fake().run(&input[..input.len().min(16)], mode, admission)
        }

        fn config_bound(&self) -> Option<usize> {
            self.bound
        }
    }

    #[test]
    fn unbounded_config_sees_whole_input() {
        let data = vec![0u8; crate::decode::MAX_HEADER_SIZE * 3];
        let whole = SeenLen {
            bound: None,
            seen: Mutex::new(Vec::new()),
        };
        whole.config_metadata(&data).unwrap();
        assert_eq!(*whole.seen.lock().unwrap(), [data.len()]);

        let header = SeenLen {
            bound: Some(crate::decode::MAX_HEADER_SIZE),
            seen: Mutex::new(Vec::new()),
        };
        header.config_metadata(&data).unwrap();
        header.config_metadata(&data[..100]).unwrap();
        assert_eq!(
            *header.seen.lock().unwrap(),
            [crate::decode::MAX_HEADER_SIZE, 100]
        );
    }

    #[test]
    fn decode_image_assembles_fake_output() {
        let backend = fake();
        let admission = Admission::new(None, &enough::Unstoppable);
        let image = backend.decode_image(b"anything", &admission).unwrap();
        assert_eq!((image.width(), image.height()), (6, 4));
        assert_eq!(backend.last.lock().unwrap().unwrap(), (3, 3));
    }

    #[test]
    fn metadata_and_full_decode_agree() {
        let backend = fake();
        let admission = Admission::new(None, &enough::Unstoppable);
        let meta = backend.decode_metadata(b"anything").unwrap();
        let image = backend.decode_image(b"anything", &admission).unwrap();
        assert_eq!(meta.width, image.width());
        assert_eq!(meta.height, image.height());
        assert_eq!(meta.color_model().unwrap(), image.color_model());
    }

    #[test]
    fn input_limit_applies_before_any_allocation() {
        let backend = fake();
        let limits = Limits {
            max_input_bytes: Some(4),
            ..Default::default()
        };
        let admission = Admission::new(Some(&limits), &enough::Unstoppable);
        let err = backend.decode_image(b"too long", &admission).unwrap_err();
        assert!(matches!(err, HeicError::LimitExceeded(_)));
        assert!(backend.last.lock().unwrap().is_none());
    }

    #[test]
    fn native_status_is_consistent() {
        assert_eq!(is_native_available(), native_error().is_none());
    }

    #[test]
    fn force_flag_toggles() {
        force_sandboxed(true);
        assert!(is_sandboxed_forced());
        force_sandboxed(false);
        let from_env = is_sandboxed_forced();
        assert_eq!(FORCE_SANDBOXED_ENV.get(), Some(&from_env));
    }
}
