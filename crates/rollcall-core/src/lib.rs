//! rollcall-core — Face encoding, classification and detection.
//!
//! Turns face regions into fixed-length luminance vectors, classifies them with
//! a persisted 1-nearest-neighbor model, and finds face regions in frames using
//! SCRFD via ONNX Runtime.

pub mod classifier;
pub mod detector;
pub mod encoder;
pub mod types;

pub use classifier::{ClassifierError, NearestNeighborModel, TrainingEntry};
pub use detector::{DetectorError, FaceDetector, ScrfdDetector};
pub use encoder::{EncoderError, FeatureEncoder};
pub use types::{FeatureVector, Identity, Prediction, Region};
