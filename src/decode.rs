use std::io::Read;

use enough::Stop;

use crate::backend::{self, Admission, BackendPreference};
use crate::error::HeicError;
use crate::image::DecodedImage;
use crate::limits::Limits;
use crate::metadata::ImageMetadata;

/// Bytes the sandboxed backend reads for a configuration request. The
/// native backend needs the whole file.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Drain `reader`, or only its first `bound` bytes. Short reads are fine.
pub(crate) fn read_input<R: Read>(
    mut reader: R,
    bound: Option<usize>,
) -> Result<Vec<u8>, HeicError> {
    let mut data = Vec::new();
    match bound {
        Some(bound) => {
            reader.take(bound as u64).read_to_end(&mut data)?;
        }
        None => {
            reader.read_to_end(&mut data)?;
        }
    }
    Ok(data)
}

/// A configured decode of one HEIC buffer.
///
/// ```no_run
/// use zenheic::{BackendPreference, DecodeRequest, Limits, Unstoppable};
///
/// let data: &[u8] = &[]; // HEIC bytes
/// let limits = Limits {
///     max_pixels: Some(64_000_000),
///     ..Default::default()
/// };
/// let image = DecodeRequest::new(data)
///     .with_limits(&limits)
///     .with_backend(BackendPreference::Sandboxed)
///     .decode(Unstoppable)?;
/// println!("{}x{}", image.width(), image.height());
/// # Ok::<(), zenheic::HeicError>(())
/// ```
#[derive(Clone, Copy, Debug)]
pub struct DecodeRequest<'a> {
    data: &'a [u8],
    limits: Option<&'a Limits>,
    backend: BackendPreference,
}

impl<'a> DecodeRequest<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            limits: None,
            backend: BackendPreference::Auto,
        }
    }

    pub fn with_limits(mut self, limits: &'a Limits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_backend(mut self, backend: BackendPreference) -> Self {
        self.backend = backend;
        self
    }

    /// Decode the primary image.
    pub fn decode(self, stop: impl Stop) -> Result<DecodedImage, HeicError> {
        let active = backend::resolve(self.backend)?;
        active
            .as_backend()
            .decode_image(self.data, &Admission::new(self.limits, &stop))
    }

    /// Read the primary image's dimensions and color description without
    /// decoding pixels. The sandboxed backend looks at the first
    /// [`MAX_HEADER_SIZE`] bytes only.
    pub fn config(self) -> Result<ImageMetadata, HeicError> {
        let active = backend::resolve(self.backend)?;
        let meta = active.as_backend().config_metadata(self.data)?;
        if let Some(limits) = self.limits {
            limits.check(meta.width, meta.height)?;
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

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

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("disk on fire"))
        }
    }

    #[test]
    fn header_read_stops_at_bound() {
        let data = vec![7u8; MAX_HEADER_SIZE + 5000];
        let header = read_input(Trickle(&data), Some(MAX_HEADER_SIZE)).unwrap();
        assert_eq!(header.len(), MAX_HEADER_SIZE);
        let full = read_input(Trickle(&data), None).unwrap();
        assert_eq!(full.len(), data.len());
    }

    #[test]
    fn short_input_is_read_whole() {
        let header = read_input(Trickle(b"tiny"), Some(MAX_HEADER_SIZE)).unwrap();
        assert_eq!(header, b"tiny");
    }

    #[test]
    fn reader_errors_surface() {
        let err = read_input(Broken, None).unwrap_err();
        assert!(matches!(err, HeicError::InputRead(_)));
        assert!(err.to_string().contains("disk on fire"));
    }
}
