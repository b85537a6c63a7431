//! Recognition engine: the streaming detect → classify → record loop.
//!
//! Single-threaded and synchronous. Each iteration pulls one frame, finds face
//! regions, classifies every region independently, and marks attendance for
//! identities not seen earlier in this session and not already in the ledger.

use crate::ledger::{AttendanceLedger, LedgerError};
use crate::source::{AcquisitionError, FrameSource, Overlay, Presenter};
use crate::store::StoreError;
use chrono::NaiveDateTime;
use image::DynamicImage;
use rollcall_core::{
    ClassifierError, DetectorError, EncoderError, FaceDetector, Identity, NearestNeighborModel,
    Prediction, Region,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error("enrollment store error: {0}")]
    Store(#[from] StoreError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("engine stopped")]
    Stopped,
}

/// How a caller should treat an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Drop the offending region; the rest of the frame continues.
    SkipRegion,
    /// Drop the current frame; the stream continues.
    SkipFrame,
    /// The stream is over. State recorded so far stays valid.
    EndStream,
    /// The current phase cannot proceed.
    Fatal,
}

impl EngineError {
    pub fn disposition(&self) -> Disposition {
        match self {
            EngineError::Encoder(_)
            | EngineError::Classifier(ClassifierError::DimensionMismatch { .. }) => {
                Disposition::SkipRegion
            }
            EngineError::Detector(_) => Disposition::SkipFrame,
            EngineError::Acquisition(_) | EngineError::Stopped => Disposition::EndStream,
            EngineError::Classifier(_) | EngineError::Store(_) | EngineError::Ledger(_) => {
                Disposition::Fatal
            }
        }
    }
}

/// Engine lifecycle. Per-frame states are visible to the presenter and in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Streaming,
    Detecting,
    Classifying,
    Recording,
    Stopped,
}

/// An attendance row written during this session.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceEvent {
    pub identity: Identity,
    pub time: NaiveDateTime,
    pub region: Region,
    pub distance: f64,
}

/// Everything that happened while processing one frame.
#[derive(Debug, Default)]
pub struct FrameReport {
    pub regions: Vec<Region>,
    pub predictions: Vec<(Region, Prediction)>,
    pub marked: Vec<AttendanceEvent>,
    /// Regions dropped by per-region errors.
    pub skipped: Vec<(Region, EngineError)>,
    /// Ledger writes that failed. The identity still counts as seen.
    pub ledger_errors: Vec<(Identity, LedgerError)>,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    StreamEnded(String),
}

/// Totals for one run of the streaming loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub frames: usize,
    pub faces: usize,
    pub marked: Vec<AttendanceEvent>,
    pub skipped_regions: usize,
    pub skipped_frames: usize,
    pub ledger_failures: usize,
    pub reason: StopReason,
}

fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Streaming recognizer over an injected model, ledger, frame source and detector.
pub struct RecognitionEngine<S, D, P = ()> {
    model: NearestNeighborModel,
    ledger: AttendanceLedger,
    source: S,
    detector: D,
    presenter: P,
    seen: HashSet<Identity>,
    state: EngineState,
    clock: fn() -> NaiveDateTime,
}

impl<S: FrameSource, D: FaceDetector> RecognitionEngine<S, D> {
    pub fn new(model: NearestNeighborModel, ledger: AttendanceLedger, source: S, detector: D) -> Self {
        Self {
            model,
            ledger,
            source,
            detector,
            presenter: (),
            seen: HashSet::new(),
            state: EngineState::Idle,
            clock: local_now,
        }
    }

    /// Load the persisted model and ledger, then build an idle engine.
    ///
    /// A missing or corrupt model is fatal: nothing is created.
    pub fn open(model_path: &Path, ledger_path: &Path, source: S, detector: D) -> Result<Self, EngineError> {
        let model = NearestNeighborModel::load(model_path)?;
        let ledger = AttendanceLedger::load(ledger_path)?;
        Ok(Self::new(model, ledger, source, detector))
    }
}

impl<S: FrameSource, D: FaceDetector, P: Presenter> RecognitionEngine<S, D, P> {
    pub fn with_presenter<Q: Presenter>(self, presenter: Q) -> RecognitionEngine<S, D, Q> {
        RecognitionEngine {
            model: self.model,
            ledger: self.ledger,
            source: self.source,
            detector: self.detector,
            presenter,
            seen: self.seen,
            state: self.state,
            clock: self.clock,
        }
    }

    /// Replace the timestamp source used for attendance rows.
    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn ledger(&self) -> &AttendanceLedger {
        &self.ledger
    }

    pub fn model(&self) -> &NearestNeighborModel {
        &self.model
    }

    /// Identities seen in this session, whether or not their mark persisted.
    pub fn seen(&self) -> &HashSet<Identity> {
        &self.seen
    }

    /// Enter `Stopped`. No ledger writes happen afterwards.
    pub fn stop(&mut self) {
        self.state = EngineState::Stopped;
    }

    /// Process exactly one frame.
    pub fn step(&mut self) -> Result<FrameReport, EngineError> {
        if self.state == EngineState::Stopped {
            return Err(EngineError::Stopped);
        }

        self.state = EngineState::Streaming;
        let frame = match self.source.acquire() {
            Ok(frame) => frame,
            Err(e) => {
                self.state = EngineState::Stopped;
                return Err(e.into());
            }
        };

        self.state = EngineState::Detecting;
        let regions = match self.detector.detect(&frame) {
            Ok(regions) => regions,
            Err(e) => {
                self.state = EngineState::Streaming;
                return Err(e.into());
            }
        };

        let mut report = FrameReport {
            regions,
            ..FrameReport::default()
        };
        tracing::debug!(faces = report.regions.len(), "frame processed");

        if !report.regions.is_empty() {
            self.state = EngineState::Classifying;
            for region in &report.regions {
                match self.classify(&frame, region) {
                    Ok(prediction) => {
                        tracing::debug!(
                            identity = %prediction.identity,
                            distance = prediction.distance,
                            ?region,
                            "classified region"
                        );
                        report.predictions.push((*region, prediction));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, ?region, "skipping region");
                        report.skipped.push((*region, e));
                    }
                }
            }

            self.state = EngineState::Recording;
            self.record(&mut report);
        }

        let overlays: Vec<Overlay> = report
            .predictions
            .iter()
            .map(|(region, p)| Overlay {
                region: *region,
                label: p.identity.clone(),
            })
            .collect();
        self.presenter.render(&frame, &overlays);

        self.state = EngineState::Streaming;
        Ok(report)
    }

    /// Run until `stop` is set or the frame source fails.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<SessionSummary, EngineError> {
        tracing::info!(
            entries = self.model.len(),
            identities = self.model.identities().len(),
            already_marked = self.ledger.len(),
            "recognition started"
        );

        let mut summary = SessionSummary {
            frames: 0,
            faces: 0,
            marked: Vec::new(),
            skipped_regions: 0,
            skipped_frames: 0,
            ledger_failures: 0,
            reason: StopReason::Cancelled,
        };

        loop {
            if stop.load(Ordering::SeqCst) {
                self.stop();
                summary.reason = StopReason::Cancelled;
                break;
            }

            match self.step() {
                Ok(report) => {
                    summary.frames += 1;
                    summary.faces += report.regions.len();
                    summary.skipped_regions += report.skipped.len();
                    summary.ledger_failures += report.ledger_errors.len();
                    summary.marked.extend(report.marked);
                }
                Err(e) => match e.disposition() {
                    Disposition::SkipRegion | Disposition::SkipFrame => {
                        tracing::warn!(error = %e, "skipping frame");
                        summary.frames += 1;
                        summary.skipped_frames += 1;
                    }
                    Disposition::EndStream => {
                        tracing::info!(reason = %e, "stream ended");
                        summary.reason = StopReason::StreamEnded(e.to_string());
                        break;
                    }
                    Disposition::Fatal => {
                        self.stop();
                        return Err(e);
                    }
                },
            }
        }

        self.state = EngineState::Stopped;
        tracing::info!(
            frames = summary.frames,
            faces = summary.faces,
            marked = summary.marked.len(),
            ledger_failures = summary.ledger_failures,
            "recognition stopped"
        );
        Ok(summary)
    }

    fn classify(&self, frame: &DynamicImage, region: &Region) -> Result<Prediction, EngineError> {
        // The model's own encoder guarantees train/inference geometry match.
        let vector = self.model.encoder().encode_region(frame, region)?;
        Ok(self.model.predict(&vector)?)
    }

    fn record(&mut self, report: &mut FrameReport) {
        let now = (self.clock)();

        for (region, prediction) in &report.predictions {
            let identity = &prediction.identity;
            // Seen is updated regardless of the ledger outcome.
            if !self.seen.insert(identity.clone()) {
                continue;
            }
            if self.ledger.is_marked(identity) {
                tracing::info!(identity = %identity, "already marked");
                continue;
            }

            match self.ledger.mark(identity, now) {
                Ok(true) => report.marked.push(AttendanceEvent {
                    identity: identity.clone(),
                    time: now,
                    region: *region,
                    distance: prediction.distance,
                }),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(identity = %identity, error = %e, "failed to persist attendance");
                    report.ledger_errors.push((identity.clone(), e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{capture_sample, CaptureOutcome};
    use crate::store::EnrollmentStore;
    use crate::testing::{face_frame, FixedDetector, ScriptedSource, FACE_REGION};
    use crate::training;
    use chrono::NaiveDate;
    use rollcall_core::FeatureEncoder;
    use std::fs;

    fn nine_am() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 18)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    const ALICE: u8 = 40;
    const BOB: u8 = 200;

    /// Enroll alice and bob through the capture path and train a model.
    fn enrolled_model(root: &Path) -> NearestNeighborModel {
        let store = EnrollmentStore::open(root.join("dataset")).unwrap();
        let never = AtomicBool::new(false);
        for (name, seed) in [("alice", ALICE), ("bob", BOB)] {
            let mut source = ScriptedSource::new(vec![face_frame(seed)]);
            let mut detector = FixedDetector::new(vec![FACE_REGION]);
            let outcome = capture_sample(&mut source, &mut detector, &store, name, &never).unwrap();
            assert!(matches!(outcome, CaptureOutcome::Captured(_)));
        }
        training::train(&store, FeatureEncoder::default()).unwrap()
    }

    fn engine(
        model: NearestNeighborModel,
        ledger_path: &Path,
        frames: Vec<DynamicImage>,
        regions: Vec<Region>,
    ) -> RecognitionEngine<ScriptedSource, FixedDetector> {
        let ledger = AttendanceLedger::load(ledger_path).unwrap();
        RecognitionEngine::new(
            model,
            ledger,
            ScriptedSource::new(frames),
            FixedDetector::new(regions),
        )
        .with_clock(nine_am)
    }

    #[test]
    fn test_marks_once_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("attendance.csv");
        let model = enrolled_model(dir.path());

        // Slightly perturbed alice face: closer to alice than to bob.
        let probe = face_frame(ALICE + 3);
        let mut eng = engine(model, &ledger_path, vec![probe.clone(), probe], vec![FACE_REGION]);

        let first = eng.step().unwrap();
        assert_eq!(first.marked.len(), 1);
        assert_eq!(first.marked[0].identity, "alice");
        assert_eq!(eng.state(), EngineState::Streaming);

        let second = eng.step().unwrap();
        assert_eq!(second.predictions.len(), 1);
        assert!(second.marked.is_empty());

        assert_eq!(
            fs::read_to_string(&ledger_path).unwrap(),
            "Name,Time\nalice,2026-10-18 09:00:00\n"
        );
    }

    #[test]
    fn test_cross_run_dedup_from_persisted_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("attendance.csv");
        fs::write(&ledger_path, "Name,Time\nbob,2026-10-17 08:00:00\n").unwrap();
        let model = enrolled_model(dir.path());

        let mut eng = engine(model, &ledger_path, vec![face_frame(BOB)], vec![FACE_REGION]);
        let report = eng.step().unwrap();

        assert_eq!(report.predictions[0].1.identity, "bob");
        assert!(report.marked.is_empty());
        assert!(eng.seen().contains("bob"));
        assert_eq!(
            fs::read_to_string(&ledger_path).unwrap(),
            "Name,Time\nbob,2026-10-17 08:00:00\n"
        );
    }

    #[test]
    fn test_frame_without_faces_is_not_classified() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("attendance.csv");
        let model = enrolled_model(dir.path());

        let mut eng = engine(model, &ledger_path, vec![face_frame(ALICE)], vec![]);
        let report = eng.step().unwrap();
        assert!(report.regions.is_empty());
        assert!(report.predictions.is_empty());
        assert!(!ledger_path.exists());
    }

    #[test]
    fn test_bad_region_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("attendance.csv");
        let model = enrolled_model(dir.path());

        let outside = Region::new(5000, 5000, 10, 10);
        let mut eng = engine(
            model,
            &ledger_path,
            vec![face_frame(ALICE)],
            vec![outside, FACE_REGION],
        );
        let report = eng.step().unwrap();

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, outside);
        assert_eq!(report.skipped[0].1.disposition(), Disposition::SkipRegion);
        assert_eq!(report.marked.len(), 1);
        assert_eq!(report.marked[0].identity, "alice");
    }

    #[test]
    fn test_same_identity_twice_in_one_frame_marks_once() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("attendance.csv");
        let model = enrolled_model(dir.path());

        let mut eng = engine(
            model,
            &ledger_path,
            vec![face_frame(ALICE)],
            vec![FACE_REGION, FACE_REGION],
        );
        let report = eng.step().unwrap();
        assert_eq!(report.predictions.len(), 2);
        assert_eq!(report.marked.len(), 1);
        assert_eq!(AttendanceLedger::load(&ledger_path).unwrap().len(), 1);
    }

    #[test]
    fn test_run_ends_on_acquisition_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("attendance.csv");
        let model = enrolled_model(dir.path());

        let frames = vec![face_frame(ALICE), face_frame(BOB), face_frame(ALICE)];
        let mut eng = engine(model, &ledger_path, frames, vec![FACE_REGION]);
        let summary = eng.run(&AtomicBool::new(false)).unwrap();

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.faces, 3);
        let names: Vec<_> = summary.marked.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert!(matches!(summary.reason, StopReason::StreamEnded(_)));
        assert_eq!(eng.state(), EngineState::Stopped);

        // Stopped is terminal.
        assert!(matches!(eng.step(), Err(EngineError::Stopped)));
        assert_eq!(eng.ledger().len(), 2);
    }

    #[test]
    fn test_run_honours_stop_flag() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("attendance.csv");
        let model = enrolled_model(dir.path());

        let mut eng = engine(model, &ledger_path, vec![face_frame(ALICE)], vec![FACE_REGION]);
        let summary = eng.run(&AtomicBool::new(true)).unwrap();
        assert_eq!(summary.frames, 0);
        assert_eq!(summary.reason, StopReason::Cancelled);
        assert!(!ledger_path.exists());
    }

    #[test]
    fn test_ledger_failure_still_marks_seen() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("attendance.csv");
        let model = enrolled_model(dir.path());

        let frames = vec![face_frame(ALICE), face_frame(ALICE)];
        let mut eng = engine(model, &ledger_path, frames, vec![FACE_REGION]);
        fs::create_dir(&ledger_path).unwrap();

        let first = eng.step().unwrap();
        assert_eq!(first.ledger_errors.len(), 1);
        assert!(first.marked.is_empty());
        assert!(eng.seen().contains("alice"));

        // No second ledger attempt for an identity already seen.
        let second = eng.step().unwrap();
        assert!(second.ledger_errors.is_empty());
    }

    #[test]
    fn test_open_without_model_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let result = RecognitionEngine::open(
            &dir.path().join("knn_model.json"),
            &dir.path().join("attendance.csv"),
            ScriptedSource::new(vec![]),
            FixedDetector::new(vec![]),
        );
        let err = result.err().unwrap();
        assert!(matches!(
            err,
            EngineError::Classifier(ClassifierError::ModelNotFound(_))
        ));
        assert_eq!(err.disposition(), Disposition::Fatal);
        assert!(!dir.path().join("attendance.csv").exists());
    }

    #[test]
    fn test_open_with_saved_model() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("knn_model.json");
        enrolled_model(dir.path()).save(&model_path).unwrap();

        let mut eng = RecognitionEngine::open(
            &model_path,
            &dir.path().join("attendance.csv"),
            ScriptedSource::new(vec![face_frame(BOB)]),
            FixedDetector::new(vec![FACE_REGION]),
        )
        .unwrap();
        assert_eq!(eng.state(), EngineState::Idle);
        let report = eng.step().unwrap();
        assert_eq!(report.marked[0].identity, "bob");
    }

    #[test]
    fn test_presenter_receives_overlays() {
        struct Recorder(Vec<Vec<Overlay>>);
        impl Presenter for Recorder {
            fn render(&mut self, _frame: &DynamicImage, overlays: &[Overlay]) {
                self.0.push(overlays.to_vec());
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let model = enrolled_model(dir.path());
        let mut eng = engine(
            model,
            &dir.path().join("attendance.csv"),
            vec![face_frame(BOB)],
            vec![FACE_REGION],
        )
        .with_presenter(Recorder(Vec::new()));
        eng.step().unwrap();

        assert_eq!(
            eng.presenter.0,
            vec![vec![Overlay {
                region: FACE_REGION,
                label: "bob".to_string()
            }]]
        );
    }
}
