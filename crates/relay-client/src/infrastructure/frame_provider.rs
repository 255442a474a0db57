//! [`FrameProvider`] implementations.
//!
//! Real screen capture is platform specific and not part of this crate.  The
//! providers here either refuse every request or serve one fixed, already
//! encoded frame (handy for demos and tests).

use std::path::Path;

use crate::application::frame_stream::{FrameError, FrameProvider};

/// Answers every frame request with [`FrameError::Unavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableFrameProvider;

impl FrameProvider for UnavailableFrameProvider {
    fn capture(&self, _quality: u8) -> Result<Vec<u8>, FrameError> {
        Err(FrameError::Unavailable)
    }
}

/// Serves the same encoded frame on every request, whatever the quality.
#[derive(Debug, Clone)]
pub struct StaticFrameProvider {
    frame: Vec<u8>,
}

impl StaticFrameProvider {
    pub fn new(frame: impl Into<Vec<u8>>) -> Self {
        Self {
            frame: frame.into(),
        }
    }

    /// Loads the frame from an image file.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self::new(std::fs::read(path)?))
    }
}

impl FrameProvider for StaticFrameProvider {
    fn capture(&self, _quality: u8) -> Result<Vec<u8>, FrameError> {
        if self.frame.is_empty() {
            return Err(FrameError::Capture("no frame loaded".to_string()));
        }
        Ok(self.frame.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_provider_refuses() {
        assert!(matches!(
            UnavailableFrameProvider.capture(50),
            Err(FrameError::Unavailable)
        ));
    }

    #[test]
    fn test_static_provider_repeats_frame() {
        let provider = StaticFrameProvider::new(vec![1, 2, 3]);
        assert_eq!(provider.capture(10).expect("frame"), vec![1, 2, 3]);
        assert_eq!(provider.capture(90).expect("frame"), vec![1, 2, 3]);
    }

    #[test]
    fn test_static_provider_without_frame_fails() {
        assert!(matches!(
            StaticFrameProvider::new(Vec::new()).capture(50),
            Err(FrameError::Capture(_))
        ));
    }
}
