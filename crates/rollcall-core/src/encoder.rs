//! Luminance feature encoder.
//!
//! Crops a face region, converts it to 8-bit luminance, resizes it to a fixed
//! canonical size and flattens it row-major into a [`FeatureVector`]. Training
//! and inference must use the same geometry, which is why the encoder is
//! persisted inside the model file.

use crate::types::{FeatureVector, Region};
use image::imageops::{self, FilterType};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Named constants ---
pub const CANONICAL_WIDTH: u32 = 100;
pub const CANONICAL_HEIGHT: u32 = 100;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("invalid region {0:?}: no pixels to encode")]
    InvalidRegion(Region),
}

/// Deterministic region → vector mapping with a fixed output geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureEncoder {
    pub width: u32,
    pub height: u32,
}

impl Default for FeatureEncoder {
    fn default() -> Self {
        Self {
            width: CANONICAL_WIDTH,
            height: CANONICAL_HEIGHT,
        }
    }
}

impl FeatureEncoder {
    /// Length of every vector this encoder produces.
    pub fn dimension(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Encode a whole image (an already cropped face region).
    pub fn encode(&self, region: &DynamicImage) -> Result<FeatureVector, EncoderError> {
        if region.width() == 0 || region.height() == 0 {
            return Err(EncoderError::InvalidRegion(Region::new(
                0,
                0,
                region.width(),
                region.height(),
            )));
        }

        let gray = region.to_luma8();
        let resized = imageops::resize(&gray, self.width, self.height, FilterType::Triangle);
        let values = resized.into_raw().into_iter().map(f32::from).collect();

        Ok(FeatureVector { values })
    }

    /// Crop `region` out of `frame` and encode it.
    pub fn encode_region(
        &self,
        frame: &DynamicImage,
        region: &Region,
    ) -> Result<FeatureVector, EncoderError> {
        let crop = crop(frame, region)?;
        self.encode(&crop)
    }
}

/// Copy the pixels of `region` out of `frame`, clipped to the frame bounds.
pub fn crop(frame: &DynamicImage, region: &Region) -> Result<DynamicImage, EncoderError> {
    let clipped = region
        .clip(frame.width(), frame.height())
        .ok_or(EncoderError::InvalidRegion(*region))?;

    Ok(frame.crop_imm(
        clipped.x as u32,
        clipped.y as u32,
        clipped.width,
        clipped.height,
    ))
}
