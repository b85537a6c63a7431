//! 1-nearest-neighbor face classifier.
//!
//! The model is the full list of (feature vector, identity) training pairs;
//! nearest-neighbor search has no compressed form. Every query resolves to some
//! identity: there is no distance threshold and no "unknown" class. When two
//! training vectors are equidistant from the query, the one inserted first wins.

use crate::encoder::FeatureEncoder;
use crate::types::{FeatureVector, Prediction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Format tag written into every model file.
pub const MODEL_FORMAT: &str = "rollcall-knn/1";

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("empty training set: {0}")]
    EmptyTrainingSet(String),
    #[error("model file not found: {0} — run `rollcall train` first")]
    ModelNotFound(String),
    #[error("model file {path} is corrupt: {reason}")]
    ModelCorrupt { path: String, reason: String },
    #[error("feature vector has {actual} values, model expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("model I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("model serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One labelled training vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingEntry {
    pub identity: String,
    #[serde(flatten)]
    pub vector: FeatureVector,
}

/// On-disk envelope (owned, for reading).
#[derive(Deserialize)]
struct ModelFile {
    format: String,
    encoder: FeatureEncoder,
    trained_at: DateTime<Utc>,
    checksum: String,
    entries: Vec<TrainingEntry>,
}

/// On-disk envelope (borrowed, for writing).
#[derive(Serialize)]
struct ModelFileRef<'a> {
    format: &'a str,
    encoder: FeatureEncoder,
    trained_at: &'a DateTime<Utc>,
    checksum: String,
    entries: &'a [TrainingEntry],
}

/// Trained nearest-neighbor model. Read-only once built.
#[derive(Debug, Clone)]
pub struct NearestNeighborModel {
    encoder: FeatureEncoder,
    entries: Vec<TrainingEntry>,
    trained_at: DateTime<Utc>,
}

impl NearestNeighborModel {
    /// Build a model from training pairs, in insertion order.
    ///
    /// Every vector must have been produced by `encoder`.
    pub fn fit(
        encoder: FeatureEncoder,
        entries: Vec<TrainingEntry>,
    ) -> Result<Self, ClassifierError> {
        if entries.is_empty() {
            return Err(ClassifierError::EmptyTrainingSet(
                "no training samples".to_string(),
            ));
        }

        let expected = encoder.dimension();
        if let Some(bad) = entries.iter().find(|e| e.vector.len() != expected) {
            return Err(ClassifierError::DimensionMismatch {
                expected,
                actual: bad.vector.len(),
            });
        }

        let model = Self {
            encoder,
            entries,
            trained_at: Utc::now(),
        };

        tracing::info!(
            entries = model.entries.len(),
            identities = model.identities().len(),
            dimension = expected,
            "fitted nearest-neighbor model"
        );

        Ok(model)
    }

    /// Encoder geometry the model was trained with. Inference must use it too.
    pub fn encoder(&self) -> FeatureEncoder {
        self.encoder
    }

    pub fn entries(&self) -> &[TrainingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    /// Distinct identities present in the training set.
    pub fn identities(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|e| e.identity.as_str()).collect()
    }

    /// Return the identity of the nearest training vector under Euclidean distance.
    pub fn predict(&self, probe: &FeatureVector) -> Result<Prediction, ClassifierError> {
        let expected = self.encoder.dimension();
        if probe.len() != expected {
            return Err(ClassifierError::DimensionMismatch {
                expected,
                actual: probe.len(),
            });
        }

        let mut best: Option<(usize, f64)> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            let d = probe.squared_distance(&entry.vector);
            // Strict `<` keeps the earliest entry on ties.
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((i, d));
            }
        }

        let (index, squared) = best.ok_or_else(|| {
            ClassifierError::EmptyTrainingSet("model has no entries".to_string())
        })?;

        Ok(Prediction {
            identity: self.entries[index].identity.clone(),
            distance: squared.sqrt(),
            index,
        })
    }

    /// Persist the model, replacing any existing file in one rename.
    pub fn save(&self, path: &Path) -> Result<(), ClassifierError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let envelope = ModelFileRef {
            format: MODEL_FORMAT,
            encoder: self.encoder,
            trained_at: &self.trained_at,
            checksum: checksum(&self.entries),
            entries: &self.entries,
        };

        let tmp = temp_path(path);
        let written = write_envelope(&tmp, &envelope)
            .and_then(|()| fs::rename(&tmp, path).map_err(ClassifierError::from));
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %tmp.display(), error = %cleanup, "failed to remove temp model file");
                }
            }
            return Err(e);
        }

        tracing::info!(
            path = %path.display(),
            entries = self.entries.len(),
            "saved model"
        );
        Ok(())
    }

    /// Load a model written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ClassifierError::ModelNotFound(path.display().to_string()));
            }
            Err(e) => return Err(ClassifierError::Io(e)),
        };

        let corrupt = |reason: String| ClassifierError::ModelCorrupt {
            path: path.display().to_string(),
            reason,
        };

        let file: ModelFile = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;

        if file.format != MODEL_FORMAT {
            return Err(corrupt(format!(
                "unsupported format {:?} (expected {MODEL_FORMAT:?})",
                file.format
            )));
        }
        if file.entries.is_empty() {
            return Err(corrupt("no training entries".to_string()));
        }
        let expected = file.encoder.dimension();
        if let Some(bad) = file.entries.iter().find(|e| e.vector.len() != expected) {
            return Err(corrupt(format!(
                "entry for {:?} has {} values, encoder expects {expected}",
                bad.identity,
                bad.vector.len()
            )));
        }
        if checksum(&file.entries) != file.checksum {
            return Err(corrupt("checksum mismatch".to_string()));
        }

        tracing::info!(
            path = %path.display(),
            entries = file.entries.len(),
            trained_at = %file.trained_at,
            "loaded model"
        );

        Ok(Self {
            encoder: file.encoder,
            entries: file.entries,
            trained_at: file.trained_at,
        })
    }
}

/// SHA-256 over identities and little-endian vector bytes, hex encoded.
fn checksum(entries: &[TrainingEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update((entry.identity.len() as u64).to_le_bytes());
        hasher.update(entry.identity.as_bytes());
        for v in &entry.vector.values {
            hasher.update(v.to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

fn write_envelope(tmp: &Path, envelope: &ModelFileRef<'_>) -> Result<(), ClassifierError> {
    let mut writer = BufWriter::new(File::create(tmp)?);
    serde_json::to_writer(&mut writer, envelope)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tiny 2x2 encoder so test vectors stay readable.
    fn enc() -> FeatureEncoder {
        FeatureEncoder { width: 2, height: 2 }
    }

    fn entry(identity: &str, values: [f32; 4]) -> TrainingEntry {
        TrainingEntry {
            identity: identity.into(),
            vector: FeatureVector::new(values.to_vec()),
        }
    }

    fn sample_model() -> NearestNeighborModel {
        NearestNeighborModel::fit(
            enc(),
            vec![
                entry("alice", [10.0, 10.0, 10.0, 10.0]),
                entry("bob", [200.0, 200.0, 200.0, 200.0]),
                entry("alice", [20.0, 10.0, 10.0, 10.0]),
                entry("carol", [100.0, 0.0, 100.0, 0.0]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_self_recall() {
        let model = sample_model();
        for e in model.entries() {
            let p = model.predict(&e.vector).unwrap();
            assert_eq!(p.identity, e.identity);
            assert_eq!(p.distance, 0.0);
        }
    }

    #[test]
    fn test_nearest_wins() {
        let model = sample_model();
        let p = model.predict(&FeatureVector::new(vec![190.0, 210.0, 200.0, 195.0])).unwrap();
        assert_eq!(p.identity, "bob");
        assert_eq!(p.index, 1);
    }

    #[test]
    fn test_no_threshold_far_query_still_classified() {
        let model = sample_model();
        let p = model
            .predict(&FeatureVector::new(vec![-1e6, -1e6, -1e6, -1e6]))
            .unwrap();
        assert_eq!(p.identity, "alice");
        assert!(p.distance > 1e6);
    }

    #[test]
    fn test_tie_break_lowest_insertion_index() {
        let model = NearestNeighborModel::fit(
            enc(),
            vec![
                entry("zed", [0.0, 0.0, 0.0, 2.0]),
                entry("amy", [0.0, 0.0, 2.0, 0.0]),
            ],
        )
        .unwrap();
        // Equidistant from both entries.
        let p = model.predict(&FeatureVector::new(vec![0.0; 4])).unwrap();
        assert_eq!(p.identity, "zed");
        assert_eq!(p.index, 0);
    }

    #[test]
    fn test_predict_dimension_mismatch() {
        let model = sample_model();
        let err = model.predict(&FeatureVector::new(vec![1.0; 3])).unwrap_err();
        assert!(matches!(
            err,
            ClassifierError::DimensionMismatch { expected: 4, actual: 3 }
        ));
    }

    #[test]
    fn test_fit_empty() {
        let err = NearestNeighborModel::fit(enc(), vec![]).unwrap_err();
        assert!(matches!(err, ClassifierError::EmptyTrainingSet(_)));
    }

    #[test]
    fn test_fit_rejects_wrong_length() {
        let bad = TrainingEntry {
            identity: "x".into(),
            vector: FeatureVector::new(vec![0.0; 5]),
        };
        let err = NearestNeighborModel::fit(enc(), vec![bad]).unwrap_err();
        assert!(matches!(err, ClassifierError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_identities() {
        let model = sample_model();
        let ids: Vec<_> = model.identities().into_iter().collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_save_load_preserves_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("knn_model.json");
        let model = sample_model();
        model.save(&path).unwrap();

        let loaded = NearestNeighborModel::load(&path).unwrap();
        assert_eq!(loaded.encoder(), model.encoder());
        assert_eq!(loaded.entries(), model.entries());
        assert_eq!(loaded.trained_at(), model.trained_at());
        for e in model.entries() {
            assert_eq!(
                loaded.predict(&e.vector).unwrap(),
                model.predict(&e.vector).unwrap()
            );
        }
        assert!(!dir.path().join("models").join("knn_model.json.tmp").exists());
    }

    #[test]
    fn test_failed_save_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory at the target path makes the final rename fail.
        let path = dir.path().join("knn_model.json");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"x").unwrap();

        assert!(sample_model().save(&path).is_err());
        assert!(!temp_path(&path).exists());
        assert!(path.join("keep").exists());
    }

    #[test]
    fn test_save_replaces_existing_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knn_model.json");
        sample_model().save(&path).unwrap();

        let replacement =
            NearestNeighborModel::fit(enc(), vec![entry("dave", [1.0, 2.0, 3.0, 4.0])]).unwrap();
        replacement.save(&path).unwrap();

        let loaded = NearestNeighborModel::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.identities().into_iter().collect::<Vec<_>>(), vec!["dave"]);
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = NearestNeighborModel::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ClassifierError::ModelNotFound(_)));
    }

    #[test]
    fn test_load_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knn_model.json");
        fs::write(&path, b"\x80\x04pickle").unwrap();
        let err = NearestNeighborModel::load(&path).unwrap_err();
        assert!(matches!(err, ClassifierError::ModelCorrupt { .. }));
    }

    #[test]
    fn test_load_tampered_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knn_model.json");
        sample_model().save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replacen("\"bob\"", "\"mallory\"", 1)).unwrap();

        let err = NearestNeighborModel::load(&path).unwrap_err();
        assert!(
            matches!(&err, ClassifierError::ModelCorrupt { reason, .. } if reason.contains("checksum")),
            "{err}"
        );
    }

    #[test]
    fn test_load_wrong_format_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knn_model.json");
        sample_model().save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replacen(MODEL_FORMAT, "rollcall-knn/0", 1)).unwrap();

        let err = NearestNeighborModel::load(&path).unwrap_err();
        assert!(matches!(err, ClassifierError::ModelCorrupt { .. }));
    }
}
