//! libheif compiled to WebAssembly, hosted by wasmtime.
//!
//! The module is compiled and linked once per process. Every decode then
//! instantiates it afresh in its own [`Store`], so concurrent decodes never
//! share a linear memory and run fully in parallel.
//!
//! Module contract (exports):
//!
//! | export | signature |
//! |---|---|
//! | `memory` | linear memory |
//! | `malloc` | `(size: i32) -> i32` |
//! | `free` | `(ptr: i32)` |
//! | `decode` | `(in, in_len, metadata_only, width*, height*, colorspace*, chroma*, premultiplied*, out) -> i32` |
//!
//! `decode` returns non-zero on success. With `metadata_only` set it fills the
//! five result slots and ignores `out`; otherwise it also writes the pixels
//! to `out` in the layout computed by [`crate::layout::resolve`]. An optional
//! `_initialize` export is run after instantiation.

use std::borrow::Cow;
use std::sync::OnceLock;

use enough::Stop;
use wasmtime::{Engine, InstancePre, Linker, Memory, Module, Store, TypedFunc};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use zune_inflate::DeflateDecoder;

use crate::backend::marshal::{self, Boundary, DecodeCall, ForeignBuffer};
use crate::backend::{Admission, BackendKind, DecodeMode, HeifBackend, RawDecode};
use crate::decode::MAX_HEADER_SIZE;
use crate::error::HeicError;
use crate::image::DecodedImage;
use crate::limits::Limits;
use crate::metadata::ImageMetadata;

/// The module embedded by `build.rs`; empty when none was available.
static BUNDLED_MODULE: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/heif.wasm.gz"));

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const REQUIRED_EXPORTS: [&str; 4] = ["memory", "malloc", "free", "decode"];

type DecodeParams = (u32, u32, u32, u32, u32, u32, u32, u32, u32);

struct SandboxState {
    wasi: WasiP1Ctx,
}

/// Sandboxed libheif backend.
pub struct SandboxBackend {
    engine: Engine,
    pre: InstancePre<SandboxState>,
}

impl core::fmt::Debug for SandboxBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SandboxBackend").finish_non_exhaustive()
    }
}

fn unavailable(context: &str) -> impl Fn(wasmtime::Error) -> HeicError + '_ {
    move |e| HeicError::BackendUnavailable(format!("{context}: {e:#}"))
}

fn inflate(bytes: &[u8]) -> Result<Cow<'_, [u8]>, HeicError> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        return Ok(Cow::Borrowed(bytes));
    }
    DeflateDecoder::new(bytes)
        .decode_gzip()
        .map(Cow::Owned)
        .map_err(|e| HeicError::BackendUnavailable(format!("failed to inflate module: {e:?}")))
}

impl SandboxBackend {
    /// The process-wide backend built from the bundled module.
    ///
    /// The first caller compiles the module; concurrent callers wait for it.
    /// A failure is cached and returned to every later caller.
    pub fn bundled() -> Result<&'static SandboxBackend, HeicError> {
        static BUNDLED: OnceLock<Result<SandboxBackend, String>> = OnceLock::new();
        BUNDLED
            .get_or_init(|| {
                if BUNDLED_MODULE.is_empty() {
                    return Err("no sandbox module was bundled at build time \
                                (set ZENHEIC_WASM or run wasm/build.sh)"
                        .into());
                }
                SandboxBackend::from_module_bytes(BUNDLED_MODULE).map_err(|e| match e {
                    HeicError::BackendUnavailable(reason) => reason,
                    other => other.to_string(),
                })
            })
            .as_ref()
            .map_err(|reason| HeicError::BackendUnavailable(reason.clone()))
    }

    /// Build a backend from module bytes: gzip-compressed wasm, raw wasm, or
    /// WAT text.
    pub fn from_module_bytes(bytes: &[u8]) -> Result<Self, HeicError> {
        let wasm = inflate(bytes)?;
        let engine = Engine::default();
        let module = Module::new(&engine, &wasm).map_err(unavailable("failed to compile module"))?;

        for name in REQUIRED_EXPORTS {
            if module.get_export(name).is_none() {
                return Err(HeicError::BackendUnavailable(format!(
                    "module does not export `{name}`"
                )));
            }
        }

        let mut linker: Linker<SandboxState> = Linker::new(&engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut SandboxState| &mut state.wasi)
            .map_err(unavailable("failed to link WASI"))?;
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(unavailable("failed to stub imports"))?;
        let pre = linker
            .instantiate_pre(&module)
            .map_err(unavailable("failed to link module"))?;

        log::debug!("sandbox module ready ({} bytes)", wasm.len());
        Ok(Self { engine, pre })
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

    /// Read dimensions and color description from the first
    /// [`MAX_HEADER_SIZE`](crate::MAX_HEADER_SIZE) bytes.
    pub fn decode_config(&self, data: &[u8]) -> Result<ImageMetadata, HeicError> {
        self.config_metadata(data)
    }
}

impl HeifBackend for SandboxBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sandboxed
    }

    fn config_bound(&self) -> Option<usize> {
        Some(MAX_HEADER_SIZE)
    }

    fn run(
        &self,
        input: &[u8],
        mode: DecodeMode,
        admission: &Admission<'_>,
    ) -> Result<RawDecode, HeicError> {
        let mut session = Session::new(self)?;
        marshal::run(&mut session, input, mode, admission)
    }
}

/// One module instance, alive for a single decode.
struct Session {
    store: Store<SandboxState>,
    memory: Memory,
    malloc: TypedFunc<u32, u32>,
    free: TypedFunc<u32, ()>,
    decode: TypedFunc<DecodeParams, i32>,
}

impl Session {
    fn new(backend: &SandboxBackend) -> Result<Self, HeicError> {
        let wasi = WasiCtxBuilder::new().build_p1();
        let mut store = Store::new(&backend.engine, SandboxState { wasi });
        let instance = backend
            .pre
            .instantiate(&mut store)
            .map_err(|e| HeicError::SandboxTrap(format!("instantiation failed: {e:#}")))?;

        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            init.call(&mut store, ())
                .map_err(|e| HeicError::SandboxTrap(format!("_initialize: {e:#}")))?;
        }

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| HeicError::BackendUnavailable("`memory` is not a memory".into()))?;
        let malloc = instance
            .get_typed_func::<u32, u32>(&mut store, "malloc")
            .map_err(unavailable("`malloc` has the wrong signature"))?;
        let free = instance
            .get_typed_func::<u32, ()>(&mut store, "free")
            .map_err(unavailable("`free` has the wrong signature"))?;
        let decode = instance
            .get_typed_func::<DecodeParams, i32>(&mut store, "decode")
            .map_err(unavailable("`decode` has the wrong signature"))?;

        Ok(Self {
            store,
            memory,
            malloc,
            free,
            decode,
        })
    }
}

impl Boundary for Session {
    fn allocate(&mut self, len: u32) -> Result<ForeignBuffer, HeicError> {
        let ptr = self
            .malloc
            .call(&mut self.store, len)
            .map_err(|e| HeicError::MemoryFault(format!("malloc({len}) trapped: {e:#}")))?;
        if ptr == 0 {
            return Err(HeicError::MemoryFault(format!("malloc({len}) returned null")));
        }
        Ok(ForeignBuffer::new(ptr, len))
    }

    fn free(&mut self, buf: ForeignBuffer) {
        if let Err(e) = self.free.call(&mut self.store, buf.ptr()) {
            log::warn!("free({:#x}) of {} bytes trapped: {e:#}", buf.ptr(), buf.len());
        }
    }

    fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<(), HeicError> {
        self.memory
            .write(&mut self.store, addr as usize, bytes)
            .map_err(|_| {
                HeicError::MemoryFault(format!(
                    "write of {} bytes at {addr:#x} is out of bounds",
                    bytes.len()
                ))
            })
    }

    fn read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), HeicError> {
        self.memory
            .read(&self.store, addr as usize, out)
            .map_err(|_| {
                HeicError::MemoryFault(format!(
                    "read of {} bytes at {addr:#x} is out of bounds",
                    out.len()
                ))
            })
    }

    fn decode(&mut self, call: &DecodeCall) -> Result<bool, HeicError> {
        let params: DecodeParams = (
            call.input.ptr(),
            call.input.len(),
            u32::from(call.metadata_only),
            call.slot(0),
            call.slot(1),
            call.slot(2),
            call.slot(3),
            call.slot(4),
            call.output.map_or(0, |out| out.ptr()),
        );
        let ret = self
            .decode
            .call(&mut self.store, params)
            .map_err(|e| HeicError::SandboxTrap(format!("{e:#}")))?;
        Ok(ret != 0)
    }
}
