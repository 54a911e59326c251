//! Progress reporting and cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::tensor::Tensor;

/// Phase of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    /// Models loaded.
    Ready,
    EncodingPrompt,
    /// Encoding the init image of an image-to-image run.
    EncodingImg2Img,
    RunningUnet,
    /// Decoding a per-step preview.
    RunningVae,
    Done,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Ready => "Ready",
            ProgressStatus::EncodingPrompt => "Encoding prompt",
            ProgressStatus::EncodingImg2Img => "Encoding input image",
            ProgressStatus::RunningUnet => "Running UNET",
            ProgressStatus::RunningVae => "Running VAE",
            ProgressStatus::Done => "Done",
        }
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressPayload {
    pub status: ProgressStatus,
    /// 1-based denoising step, for `RunningUnet` and `RunningVae`.
    pub step: Option<usize>,
    pub total_steps: Option<usize>,
    /// Decoded previews in `[0, 1]`, for `RunningVae`.
    pub images: Option<Vec<Tensor>>,
}

impl ProgressPayload {
    pub fn status(status: ProgressStatus) -> Self {
        Self {
            status,
            step: None,
            total_steps: None,
            images: None,
        }
    }

    pub fn step(status: ProgressStatus, step: usize, total_steps: usize) -> Self {
        Self {
            status,
            step: Some(step),
            total_steps: Some(total_steps),
            images: None,
        }
    }

    pub fn with_images(mut self, images: Vec<Tensor>) -> Self {
        self.images = Some(images);
        self
    }
}

/// Shared flag that stops a running generation after its current step.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_builders() {
        let p = ProgressPayload::status(ProgressStatus::Done);
        assert_eq!(p.step, None);
        assert!(p.images.is_none());

        let p = ProgressPayload::step(ProgressStatus::RunningVae, 2, 5)
            .with_images(vec![Tensor::zeros(&[1, 3, 8, 8])]);
        assert_eq!(p.step, Some(2));
        assert_eq!(p.total_steps, Some(5));
        assert_eq!(p.images.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let handle = token.clone();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn status_display() {
        assert_eq!(ProgressStatus::RunningUnet.to_string(), "Running UNET");
        assert_eq!(ProgressStatus::EncodingImg2Img.as_str(), "Encoding input image");
    }
}
