//! Boundary marshaling for decoders that live in foreign memory.
//!
//! A [`Boundary`] provides the primitive operations of a backend whose memory
//! is not ours: allocate, free, write, read, and the decode call itself. The
//! marshaler sequences those primitives into the two-pass decode protocol:
//!
//! 1. copy the input into foreign memory,
//! 2. call `decode` in metadata mode and read back the five result slots,
//! 3. resolve the output layout and allocate an output buffer of that size,
//! 4. call `decode` again with the output pointer and read the pixels back.
//!
//! Every buffer allocated through a [`Scope`] is freed when the scope drops,
//! so the success path and every error path release the same set.

use crate::backend::{Admission, DecodeMode, RawDecode, RawPixels};
use crate::error::HeicError;
use crate::layout;
use crate::metadata::ImageMetadata;

/// Number of `u32` result slots written by `decode`: width, height,
/// colorspace, chroma, premultiplied alpha.
pub(crate) const RESULT_SLOTS: usize = 5;
const RESULT_BYTES: u32 = (RESULT_SLOTS * 4) as u32;

/// Opaque handle to a block of foreign memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ForeignBuffer {
    ptr: u32,
    len: u32,
}

impl ForeignBuffer {
    pub(crate) fn new(ptr: u32, len: u32) -> Self {
        Self { ptr, len }
    }

    /// Address in the backend's address space.
    pub(crate) fn ptr(&self) -> u32 {
        self.ptr
    }

    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    /// Address of `offset` within this buffer, if it lies inside it.
    fn addr(&self, offset: u32, len: usize) -> Result<u32, HeicError> {
        let end = u64::from(offset) + len as u64;
        if end > u64::from(self.len) {
            return Err(HeicError::MemoryFault(format!(
                "access of {len} bytes at offset {offset} overruns buffer of {} bytes",
                self.len
            )));
        }
        Ok(self.ptr + offset)
    }
}

/// Arguments of one `decode` call.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DecodeCall {
    pub input: ForeignBuffer,
    pub metadata_only: bool,
    /// Base of the five consecutive little-endian `u32` result slots.
    pub results: ForeignBuffer,
    pub output: Option<ForeignBuffer>,
}

impl DecodeCall {
    /// Address of result slot `index`.
    pub(crate) fn slot(&self, index: usize) -> u32 {
        self.results.ptr() + (index as u32) * 4
    }
}

/// Primitive operations of a backend with its own address space.
pub(crate) trait Boundary {
    /// Allocate `len` bytes of foreign memory.
    fn allocate(&mut self, len: u32) -> Result<ForeignBuffer, HeicError>;

    /// Release a buffer. Failures cannot be reported to anyone useful, so
    /// implementations log them.
    fn free(&mut self, buf: ForeignBuffer);

    fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<(), HeicError>;

    fn read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), HeicError>;

    /// Run the decoder. `Ok(false)` means the decoder rejected the input.
    fn decode(&mut self, call: &DecodeCall) -> Result<bool, HeicError>;
}

/// Allocation scope: every buffer handed out is freed on drop, newest first.
pub(crate) struct Scope<'b, B: Boundary> {
    boundary: &'b mut B,
    live: Vec<ForeignBuffer>,
}

impl<'b, B: Boundary> Scope<'b, B> {
    pub(crate) fn new(boundary: &'b mut B) -> Self {
        Self {
            boundary,
            live: Vec::new(),
        }
    }

    pub(crate) fn allocate(&mut self, len: u32) -> Result<ForeignBuffer, HeicError> {
        let buf = self.boundary.allocate(len)?;
        self.live.push(buf);
        Ok(buf)
    }

    pub(crate) fn write(
        &mut self,
        buf: ForeignBuffer,
        offset: u32,
        bytes: &[u8],
    ) -> Result<(), HeicError> {
        let addr = buf.addr(offset, bytes.len())?;
        self.boundary.write(addr, bytes)
    }

    pub(crate) fn read(
        &mut self,
        buf: ForeignBuffer,
        offset: u32,
        len: usize,
    ) -> Result<Vec<u8>, HeicError> {
        let addr = buf.addr(offset, len)?;
        let mut out = vec![0u8; len];
        self.boundary.read(addr, &mut out)?;
        Ok(out)
    }

    pub(crate) fn decode(&mut self, call: &DecodeCall) -> Result<bool, HeicError> {
        self.boundary.decode(call)
    }
}

impl<B: Boundary> Drop for Scope<'_, B> {
    fn drop(&mut self) {
        while let Some(buf) = self.live.pop() {
            self.boundary.free(buf);
        }
    }
}

fn read_metadata<B: Boundary>(
    scope: &mut Scope<'_, B>,
    results: ForeignBuffer,
) -> Result<ImageMetadata, HeicError> {
    let raw = scope.read(results, 0, RESULT_BYTES as usize)?;
    let mut slots = [0u32; RESULT_SLOTS];
    for (slot, bytes) in slots.iter_mut().zip(raw.chunks_exact(4)) {
        *slot = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    Ok(ImageMetadata::from_raw_slots(slots))
}

/// Run the two-pass decode protocol against `boundary`.
pub(crate) fn run<B: Boundary>(
    boundary: &mut B,
    input: &[u8],
    mode: DecodeMode,
    admission: &Admission<'_>,
) -> Result<RawDecode, HeicError> {
    if input.is_empty() {
        return Err(HeicError::DecodeFailed);
    }
    let input_len = u32::try_from(input.len())
        .map_err(|_| HeicError::LimitExceeded(format!("input of {} bytes", input.len())))?;

    let mut scope = Scope::new(boundary);

    let in_buf = scope.allocate(input_len)?;
    scope.write(in_buf, 0, input)?;
    let results = scope.allocate(RESULT_BYTES)?;
    scope.write(results, 0, &[0u8; RESULT_BYTES as usize])?;

    let mut call = DecodeCall {
        input: in_buf,
        metadata_only: true,
        results,
        output: None,
    };
    log::trace!("metadata pass over {input_len} input bytes");
    if !scope.decode(&call)? {
        return Err(HeicError::DecodeFailed);
    }
    let metadata = read_metadata(&mut scope, results)?;
    metadata.check_dimensions()?;

    if mode == DecodeMode::Metadata {
        return Ok(RawDecode {
            metadata,
            pixels: None,
        });
    }

    let layout = layout::resolve(&metadata)?;
    admission.admit(&metadata, &layout)?;

    // resolve() keeps the total within 32 bits
    let out_len = layout.total_len() as u32;
    let out_buf = scope.allocate(out_len)?;
    call.metadata_only = false;
    call.output = Some(out_buf);
    log::trace!(
        "pixel pass for {}x{} into {out_len} bytes",
        metadata.width,
        metadata.height
    );
    if !scope.decode(&call)? {
        return Err(HeicError::DecodeFailed);
    }
    if read_metadata(&mut scope, results)? != metadata {
        return Err(HeicError::Corrupt(
            "metadata changed between decode passes".into(),
        ));
    }
    let bytes = scope.read(out_buf, 0, layout.total_len())?;
    drop(scope);

    Ok(RawDecode {
        metadata,
        pixels: Some(RawPixels { layout, bytes }),
    })
}
