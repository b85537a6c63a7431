//! Enrollment capture: stream frames until one face region is found, then
//! store exactly that region as a sample.

use crate::engine::{Disposition, EngineError};
use crate::source::FrameSource;
use crate::store::{EnrollmentStore, Sample};
use image::DynamicImage;
use rollcall_core::{encoder, FaceDetector, Identity};
use std::sync::atomic::{AtomicBool, Ordering};

/// Where a capture session stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureState {
    /// No face yet; `frames` frames examined so far.
    Searching { frames: usize },
    /// A sample was stored. Terminal.
    Captured(Sample),
}

/// Result of [`capture_sample`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Captured(Sample),
    /// Stopped before any face was seen. Nothing was stored.
    Aborted { frames: usize },
}

/// Single-sample capture for one identity.
pub struct CaptureSession<'a> {
    store: &'a EnrollmentStore,
    identity: Identity,
    state: CaptureState,
}

impl<'a> CaptureSession<'a> {
    pub fn new(store: &'a EnrollmentStore, identity: impl Into<Identity>) -> Self {
        Self {
            store,
            identity: identity.into(),
            state: CaptureState::Searching { frames: 0 },
        }
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Feed one frame. Stores the first region inside the frame and transitions to
    /// `Captured`; frames after that are ignored.
    pub fn step<D: FaceDetector>(
        &mut self,
        frame: &DynamicImage,
        detector: &mut D,
    ) -> Result<&CaptureState, EngineError> {
        let frames = match self.state {
            CaptureState::Searching { frames } => frames + 1,
            CaptureState::Captured(_) => return Ok(&self.state),
        };
        self.state = CaptureState::Searching { frames };

        let regions = detector.detect(frame)?;
        if regions.len() > 1 {
            tracing::debug!(faces = regions.len(), "multiple faces; storing the first usable one");
        }

        // Regions that fall entirely outside the frame are skipped, not fatal.
        let usable = regions.iter().find_map(|region| match encoder::crop(frame, region) {
            Ok(face) => Some((region, face)),
            Err(e) => {
                tracing::warn!(error = %e, "skipping region");
                None
            }
        });
        let Some((region, face)) = usable else {
            tracing::trace!(frames, "no usable face in frame");
            return Ok(&self.state);
        };

        let sample = self.store.add_sample(&self.identity, &face)?;
        tracing::info!(identity = %self.identity, frames, ?region, "captured enrollment sample");

        self.state = CaptureState::Captured(sample);
        Ok(&self.state)
    }
}

/// Capture one sample for `identity` from `source`.
///
/// Frames without a usable face are skipped, as are frames where detection fails.
/// Returns `Aborted` when `stop` is raised first; a failing source is an error
/// and leaves the store untouched.
pub fn capture_sample<S: FrameSource, D: FaceDetector>(
    source: &mut S,
    detector: &mut D,
    store: &EnrollmentStore,
    identity: &str,
    stop: &AtomicBool,
) -> Result<CaptureOutcome, EngineError> {
    let mut session = CaptureSession::new(store, identity);
    tracing::info!(identity, "enrollment capture started");

    loop {
        if stop.load(Ordering::SeqCst) {
            let frames = match session.state() {
                CaptureState::Searching { frames } => *frames,
                CaptureState::Captured(_) => 0,
            };
            tracing::info!(identity, frames, "enrollment capture aborted");
            return Ok(CaptureOutcome::Aborted { frames });
        }

        let frame = source.acquire()?;
        match session.step(&frame, detector) {
            Ok(CaptureState::Captured(sample)) => return Ok(CaptureOutcome::Captured(sample.clone())),
            Ok(CaptureState::Searching { .. }) => {}
            Err(e) if matches!(e.disposition(), Disposition::SkipFrame | Disposition::SkipRegion) => {
                tracing::warn!(error = %e, "skipping frame");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::AcquisitionError;
    use crate::testing::{blank_frame, face_frame, FixedDetector, ScriptedDetector, ScriptedSource, FACE_REGION};
    use rollcall_core::{DetectorError, Region};

    #[test]
    fn test_captures_first_face_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnrollmentStore::open(dir.path()).unwrap();

        let mut source = ScriptedSource::new(vec![blank_frame(), blank_frame(), face_frame(90), face_frame(90)]);
        let mut detector = ScriptedDetector::new(vec![
            Ok(vec![]),
            Ok(vec![]),
            Ok(vec![FACE_REGION, Region::new(0, 0, 10, 10)]),
        ]);

        let outcome =
            capture_sample(&mut source, &mut detector, &store, "alice", &AtomicBool::new(false)).unwrap();
        let CaptureOutcome::Captured(sample) = outcome else {
            panic!("expected a capture, got {outcome:?}");
        };
        assert_eq!(sample.identity, "alice");
        assert_eq!(store.sample_count("alice").unwrap(), 1);
        // The fourth frame was never pulled.
        assert_eq!(source.remaining(), 1);

        let stored = sample.load_image().unwrap();
        assert_eq!((stored.width(), stored.height()), (FACE_REGION.width, FACE_REGION.height));
        assert_eq!(stored.to_luma8().get_pixel(5, 5).0[0], 90);
    }

    #[test]
    fn test_stop_before_face_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnrollmentStore::open(dir.path()).unwrap();
        let mut source = ScriptedSource::new(vec![face_frame(90)]);
        let mut detector = FixedDetector::new(vec![FACE_REGION]);

        let outcome =
            capture_sample(&mut source, &mut detector, &store, "alice", &AtomicBool::new(true)).unwrap();
        assert_eq!(outcome, CaptureOutcome::Aborted { frames: 0 });
        assert!(store.list_identities().unwrap().is_empty());
    }

    #[test]
    fn test_source_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnrollmentStore::open(dir.path()).unwrap();
        let mut source = ScriptedSource::new(vec![blank_frame()]);
        let mut detector = FixedDetector::new(vec![]);

        let err = capture_sample(&mut source, &mut detector, &store, "bob", &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, EngineError::Acquisition(AcquisitionError(_))));
        assert!(store.list_identities().unwrap().is_empty());
    }

    #[test]
    fn test_detector_failure_skips_frame() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnrollmentStore::open(dir.path()).unwrap();
        let mut source = ScriptedSource::new(vec![face_frame(90), face_frame(90)]);
        let mut detector = ScriptedDetector::new(vec![
            Err(DetectorError::InferenceFailed("boom".into())),
            Ok(vec![FACE_REGION]),
        ]);

        let outcome =
            capture_sample(&mut source, &mut detector, &store, "carol", &AtomicBool::new(false)).unwrap();
        assert!(matches!(outcome, CaptureOutcome::Captured(_)));
    }

    #[test]
    fn test_region_outside_frame_moves_to_next_frame() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnrollmentStore::open(dir.path()).unwrap();
        let mut source = ScriptedSource::new(vec![face_frame(90), face_frame(90)]);
        let mut detector = ScriptedDetector::new(vec![
            Ok(vec![Region::new(5000, 5000, 10, 10)]),
            Ok(vec![FACE_REGION]),
        ]);

        let outcome =
            capture_sample(&mut source, &mut detector, &store, "frank", &AtomicBool::new(false)).unwrap();
        assert!(matches!(outcome, CaptureOutcome::Captured(_)));
        assert_eq!(source.remaining(), 0);
        assert_eq!(store.sample_count("frank").unwrap(), 1);
    }

    #[test]
    fn test_first_usable_region_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnrollmentStore::open(dir.path()).unwrap();
        let mut session = CaptureSession::new(&store, "gina");
        let mut detector = FixedDetector::new(vec![Region::new(-500, -500, 10, 10), FACE_REGION]);

        session.step(&face_frame(70), &mut detector).unwrap();
        let CaptureState::Captured(sample) = session.state() else {
            panic!("expected a capture, got {:?}", session.state());
        };
        let stored = sample.load_image().unwrap();
        assert_eq!((stored.width(), stored.height()), (FACE_REGION.width, FACE_REGION.height));
    }

    #[test]
    fn test_session_is_terminal_after_capture() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnrollmentStore::open(dir.path()).unwrap();
        let mut session = CaptureSession::new(&store, "dave");
        let mut detector = FixedDetector::new(vec![FACE_REGION]);

        session.step(&blank_frame(), &mut FixedDetector::new(vec![])).unwrap();
        assert_eq!(session.state(), &CaptureState::Searching { frames: 1 });

        session.step(&face_frame(10), &mut detector).unwrap();
        assert!(matches!(session.state(), CaptureState::Captured(_)));
        session.step(&face_frame(10), &mut detector).unwrap();
        assert_eq!(store.sample_count("dave").unwrap(), 1);
    }

    #[test]
    fn test_invalid_identity_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnrollmentStore::open(dir.path()).unwrap();
        let mut source = ScriptedSource::new(vec![face_frame(90)]);
        let mut detector = FixedDetector::new(vec![FACE_REGION]);

        let err = capture_sample(&mut source, &mut detector, &store, "../x", &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
    }
}
