//! Test doubles for frame sources and detectors.

use crate::source::{AcquisitionError, FrameSource};
use image::{DynamicImage, GrayImage, Luma};
use rollcall_core::{DetectorError, FaceDetector, Region};
use std::collections::VecDeque;

pub const FRAME_WIDTH: u32 = 160;
pub const FRAME_HEIGHT: u32 = 120;
pub const FACE_REGION: Region = Region {
    x: 40,
    y: 20,
    width: 60,
    height: 60,
};

/// Mid-gray frame with no face.
pub fn blank_frame() -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, Luma([128])))
}

/// Mid-gray frame whose [`FACE_REGION`] is filled with `shade`.
pub fn face_frame(shade: u8) -> DynamicImage {
    let mut img = GrayImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, Luma([128]));
    for y in FACE_REGION.y as u32..FACE_REGION.y as u32 + FACE_REGION.height {
        for x in FACE_REGION.x as u32..FACE_REGION.x as u32 + FACE_REGION.width {
            img.put_pixel(x, y, Luma([shade]));
        }
    }
    DynamicImage::ImageLuma8(img)
}

/// Yields queued frames in order, then fails like an unplugged camera.
pub struct ScriptedSource {
    frames: VecDeque<DynamicImage>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<DynamicImage>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ScriptedSource {
    fn acquire(&mut self) -> Result<DynamicImage, AcquisitionError> {
        self.frames
            .pop_front()
            .ok_or_else(|| AcquisitionError("no more frames".to_string()))
    }
}

/// Reports the same regions for every frame.
pub struct FixedDetector {
    regions: Vec<Region>,
}

impl FixedDetector {
    pub fn new(regions: Vec<Region>) -> Self {
        Self { regions }
    }
}

impl FaceDetector for FixedDetector {
    fn detect(&mut self, _frame: &DynamicImage) -> Result<Vec<Region>, DetectorError> {
        Ok(self.regions.clone())
    }
}

/// Replays one scripted result per frame, then reports no faces.
pub struct ScriptedDetector {
    results: VecDeque<Result<Vec<Region>, DetectorError>>,
}

impl ScriptedDetector {
    pub fn new(results: Vec<Result<Vec<Region>, DetectorError>>) -> Self {
        Self {
            results: results.into(),
        }
    }
}

impl FaceDetector for ScriptedDetector {
    fn detect(&mut self, _frame: &DynamicImage) -> Result<Vec<Region>, DetectorError> {
        self.results.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}
