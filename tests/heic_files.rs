//! Decoding of real HEIC files.
//!
//! Files are looked up in `tests/data/`; a test whose file or backend is
//! missing prints why and passes.

use std::io::{self, Read};
use std::path::PathBuf;

use enough::Unstoppable;
use zenheic::*;

/// First libheif that reports a preferred decoding colorspace.
const PREFERRED_COLORSPACE: LibheifVersion = LibheifVersion {
    major: 1,
    minor: 17,
};

fn load(name: &str) -> Option<Vec<u8>> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data")
        .join(name);
    match std::fs::read(&path) {
        Ok(data) => Some(data),
        Err(_) => {
            eprintln!("skipping: {} not found", path.display());
            None
        }
    }
}

fn sandbox() -> Option<&'static SandboxBackend> {
    match SandboxBackend::bundled() {
        Ok(b) => Some(b),
        Err(e) => {
            eprintln!("skipping: {e}");
            None
        }
    }
}

fn native() -> Option<&'static NativeBackend> {
    match NativeBackend::shared() {
        Ok(b) => Some(b),
        Err(e) => {
            eprintln!("skipping: {e}");
            None
        }
    }
}

#[derive(Clone, Copy)]
enum Backend {
    Sandboxed(&'static SandboxBackend),
    Native(&'static NativeBackend),
}

impl Backend {
    fn name(self) -> &'static str {
        match self {
            Self::Sandboxed(_) => "sandboxed",
            Self::Native(_) => "native",
        }
    }

    fn decode(self, data: &[u8]) -> Result<DecodedImage, HeicError> {
        match self {
            Self::Sandboxed(b) => b.decode(data, Unstoppable),
            Self::Native(b) => b.decode(data, Unstoppable),
        }
    }

    fn config(self, data: &[u8]) -> Result<ImageMetadata, HeicError> {
        match self {
            Self::Sandboxed(b) => b.decode_config(data),
            Self::Native(b) => b.decode_config(data),
        }
    }
}

/// All backends usable in this environment.
fn backends() -> Vec<Backend> {
    let mut out = Vec::new();
    out.extend(sandbox().map(Backend::Sandboxed));
    out.extend(native().map(Backend::Native));
    out
}

/// Hands out at most 128 bytes per read.
struct Trickle<'a>(&'a [u8]);

impl Read for Trickle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(128).min(self.0.len());
        buf[..n].copy_from_slice(&self.0[..n]);
        self.0 = &self.0[n..];
        Ok(n)
    }
}

#[test]
fn config_of_512_square() {
    let Some(data) = load("test.heic") else { return };
    for backend in backends() {
        let name = backend.name();
        let meta = backend
            .config(&data)
            .unwrap_or_else(|e| panic!("{name}: {e}"));
        assert_eq!((meta.width, meta.height), (512, 512), "{name}");
    }
}

#[test]
fn every_file_decodes_like_its_config() {
    for file in ["test.heic", "test8.heic", "test12.heic", "gray.heic"] {
        let Some(data) = load(file) else { continue };
        for backend in backends() {
            let name = backend.name();
            let meta = backend
                .config(&data)
                .unwrap_or_else(|e| panic!("{file} on {name}: {e}"));
            let image = backend
                .decode(&data)
                .unwrap_or_else(|e| panic!("{file} on {name}: {e}"));
            assert_eq!((image.width(), image.height()), (meta.width, meta.height));
            assert_eq!(image.color_model(), meta.color_model().unwrap());
            let layout = resolve_layout(&meta).unwrap();
            assert_eq!(image.as_bytes().len(), layout.total_len(), "{file} on {name}");
        }
    }
}

#[test]
fn gray_file_is_gray() {
    let Some(data) = load("gray.heic") else { return };
    for backend in backends() {
        let image = backend.decode(&data).unwrap();
        let expected = match backend {
            // Without the preferred-colorspace query everything decodes as 4:2:0.
            Backend::Native(n) if n.version() < PREFERRED_COLORSPACE => {
                ColorModel::YCbCr(Subsampling::S420)
            }
            _ => ColorModel::Gray,
        };
        assert_eq!(image.color_model(), expected, "{}", backend.name());
    }
}

#[test]
fn backends_agree() {
    let (Some(s), Some(n)) = (sandbox(), native()) else {
        return;
    };
    for file in ["test.heic", "test8.heic", "gray.heic"] {
        let Some(data) = load(file) else { continue };
        let a = s.decode(&data, Unstoppable).unwrap();
        let b = n.decode(&data, Unstoppable).unwrap();
        assert_eq!((a.width(), a.height()), (b.width(), b.height()), "{file}");
        assert_eq!(
            a.color_model().is_premultiplied(),
            b.color_model().is_premultiplied(),
            "{file}"
        );
    }
}

#[test]
fn config_reader_reads_header_in_small_chunks() {
    let Some(data) = load("test8.heic") else { return };
    if sandbox().is_none() && native().is_none() {
        return;
    }
    let from_reader = decode_config_reader(Trickle(&data)).unwrap();
    let image = decode(&data, Unstoppable).unwrap();
    assert_eq!(
        (from_reader.width, from_reader.height),
        (image.width(), image.height())
    );
}

#[test]
fn native_config_reads_past_header_bound() {
    let Some(data) = load("test.heic") else { return };
    let Some(n) = native() else { return };
    if data.len() <= MAX_HEADER_SIZE {
        eprintln!("skipping: test.heic fits in {MAX_HEADER_SIZE} bytes");
        return;
    }
    let image = n.decode(&data, Unstoppable).unwrap();
    let direct = n.decode_config(&data).unwrap();
    let request = DecodeRequest::new(&data)
        .with_backend(BackendPreference::Native)
        .config()
        .unwrap();
    for meta in [direct, request] {
        assert_eq!((meta.width, meta.height), (image.width(), image.height()));
        assert_eq!(meta.color_model().unwrap(), image.color_model());
    }
}

#[test]
fn config_reader_on_native_reads_whole_source() {
    let Some(data) = load("test.heic") else { return };
    if native().is_none() || is_sandboxed_forced() {
        return;
    }
    let meta = decode_config_reader(Trickle(&data)).unwrap();
    assert_eq!((meta.width, meta.height), (512, 512));
}

#[test]
fn truncated_file_fails() {
    let Some(data) = load("test.heic") else { return };
    let cut = &data[..data.len() / 3];
    for backend in backends() {
        match backend.decode(cut) {
            Err(HeicError::DecodeFailed) => {}
            other => panic!("{}: expected DecodeFailed, got {other:?}", backend.name()),
        }
    }
}

fn decode_ten_at_once(backend: Backend, data: &[u8]) {
    let expected = backend.decode(data).unwrap();
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..10)
            .map(|_| s.spawn(|| backend.decode(data).unwrap()))
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), expected, "{}", backend.name());
        }
    });
}

#[test]
fn parallel_decodes_are_identical() {
    let Some(data) = load("test.heic") else { return };
    let Some(backend) = sandbox() else { return };
    decode_ten_at_once(Backend::Sandboxed(backend), &data);
}

#[test]
fn native_parallel_decodes_are_identical() {
    let Some(data) = load("test.heic") else { return };
    let Some(backend) = native() else { return };
    decode_ten_at_once(Backend::Native(backend), &data);
}
