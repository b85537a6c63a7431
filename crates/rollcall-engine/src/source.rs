//! Frame acquisition and presentation seams used by capture and recognition.

use image::DynamicImage;
use rollcall_core::Region;
use rollcall_hw::CameraStream;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("frame acquisition failed: {0}")]
pub struct AcquisitionError(pub String);

/// Blocking source of frames, one per call.
pub trait FrameSource {
    fn acquire(&mut self) -> Result<DynamicImage, AcquisitionError>;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn acquire(&mut self) -> Result<DynamicImage, AcquisitionError> {
        (**self).acquire()
    }
}

impl FrameSource for CameraStream<'_> {
    fn acquire(&mut self) -> Result<DynamicImage, AcquisitionError> {
        let frame = self
            .next_frame()
            .map_err(|e| AcquisitionError(e.to_string()))?;
        frame.into_image().map_err(|e| AcquisitionError(e.to_string()))
    }
}

/// A labelled box drawn over a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub region: Region,
    pub label: String,
}

/// Presentation hook. Not required for correctness.
pub trait Presenter {
    fn render(&mut self, frame: &DynamicImage, overlays: &[Overlay]);
}

/// No-op presenter.
impl Presenter for () {
    fn render(&mut self, _frame: &DynamicImage, _overlays: &[Overlay]) {}
}
