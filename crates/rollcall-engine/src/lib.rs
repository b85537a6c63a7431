//! rollcall-engine — Enrollment, training and attendance recognition.
//!
//! Ties the core encoder/classifier/detector to the on-disk state: the
//! enrollment store, the trained model file and the attendance ledger.
//! Frame acquisition and presentation are injected through [`FrameSource`]
//! and [`Presenter`], so everything here runs against scripted frames in tests.

pub mod capture;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod source;
pub mod store;
pub mod training;

#[cfg(test)]
mod testing;

pub use capture::{capture_sample, CaptureOutcome, CaptureSession, CaptureState};
pub use config::{Config, ConfigError};
pub use engine::{
    AttendanceEvent, Disposition, EngineError, EngineState, FrameReport, RecognitionEngine,
    SessionSummary, StopReason,
};
pub use ledger::{AttendanceLedger, AttendanceRecord, LedgerError};
pub use source::{AcquisitionError, FrameSource, Overlay, Presenter};
pub use store::{EnrollmentStore, Sample, StoreError};
pub use training::{train, train_and_save};
