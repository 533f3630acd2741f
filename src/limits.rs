/// Resource limits for decode operations.
///
/// All fields default to `None` (no limit). Dimensions are checked after the
/// metadata pass, before any pixel memory is allocated on either side of the
/// backend boundary.
#[derive(Clone, Debug, Default)]
pub struct Limits {
    pub max_width: Option<u64>,
    pub max_height: Option<u64>,
    /// Maximum pixel count (width * height).
    pub max_pixels: Option<u64>,
    /// Maximum bytes for the decoded pixel buffer.
    pub max_memory_bytes: Option<u64>,
    /// Maximum size of the encoded input.
    pub max_input_bytes: Option<u64>,
}

impl Limits {
    /// Check dimensions against limits. Returns Ok(()) or LimitExceeded error.
    pub(crate) fn check(&self, width: u32, height: u32) -> Result<(), crate::HeicError> {
        if let Some(max_w) = self.max_width {
            if u64::from(width) > max_w {
                return Err(crate::HeicError::LimitExceeded(format!(
                    "width {width} exceeds limit {max_w}"
                )));
            }
        }
        if let Some(max_h) = self.max_height {
            if u64::from(height) > max_h {
                return Err(crate::HeicError::LimitExceeded(format!(
                    "height {height} exceeds limit {max_h}"
                )));
            }
        }
        if let Some(max_px) = self.max_pixels {
            let pixels = u64::from(width) * u64::from(height);
            if pixels > max_px {
                return Err(crate::HeicError::LimitExceeded(format!(
                    "pixel count {pixels} exceeds limit {max_px}"
                )));
            }
        }
        Ok(())
    }

    /// Check that the output buffer size is within memory limits.
    pub(crate) fn check_memory(&self, bytes: usize) -> Result<(), crate::HeicError> {
        if let Some(max_mem) = self.max_memory_bytes {
            if bytes as u64 > max_mem {
                return Err(crate::HeicError::LimitExceeded(format!(
                    "allocation {bytes} bytes exceeds memory limit {max_mem}"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn check_input(&self, bytes: usize) -> Result<(), crate::HeicError> {
        if let Some(max_in) = self.max_input_bytes {
            if bytes as u64 > max_in {
                return Err(crate::HeicError::LimitExceeded(format!(
                    "input of {bytes} bytes exceeds limit {max_in}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_allow_everything() {
        let limits = Limits::default();
        assert!(limits.check(u32::MAX, u32::MAX).is_ok());
        assert!(limits.check_memory(usize::MAX).is_ok());
        assert!(limits.check_input(usize::MAX).is_ok());
    }

    #[test]
    fn pixel_limit_is_product() {
        let limits = Limits {
            max_pixels: Some(100),
            ..Default::default()
        };
        assert!(limits.check(10, 10).is_ok());
        assert!(matches!(
            limits.check(11, 10),
            Err(crate::HeicError::LimitExceeded(_))
        ));
    }

    #[test]
    fn input_limit() {
        let limits = Limits {
            max_input_bytes: Some(16),
            ..Default::default()
        };
        assert!(limits.check_input(16).is_ok());
        assert!(limits.check_input(17).is_err());
    }
}
