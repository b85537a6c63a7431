//! Build a nearest-neighbor model from everything in the enrollment store.

use crate::engine::EngineError;
use crate::store::EnrollmentStore;
use rollcall_core::{ClassifierError, FeatureEncoder, NearestNeighborModel, TrainingEntry};
use std::path::Path;

/// Encode every stored sample and fit a model.
///
/// Identities are visited in label order and samples in insertion order, so
/// the same store always yields the same entry order. Samples that fail to
/// decode or encode are skipped with a warning; an identity left with no
/// usable sample makes training fail.
pub fn train(store: &EnrollmentStore, encoder: FeatureEncoder) -> Result<NearestNeighborModel, EngineError> {
    let identities = store.list_identities()?;
    if identities.is_empty() {
        return Err(ClassifierError::EmptyTrainingSet(format!(
            "no identities enrolled under {}",
            store.root().display()
        ))
        .into());
    }

    let mut entries = Vec::new();
    for identity in &identities {
        let before = entries.len();
        for sample in store.samples_for(identity)? {
            let image = match sample.load_image() {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(identity = %identity, error = %e, "skipping unreadable sample");
                    continue;
                }
            };
            match encoder.encode(&image) {
                Ok(vector) => entries.push(TrainingEntry {
                    identity: identity.clone(),
                    vector,
                }),
                Err(e) => {
                    tracing::warn!(identity = %identity, path = %sample.path.display(), error = %e, "skipping sample");
                }
            }
        }

        let count = entries.len() - before;
        if count == 0 {
            return Err(ClassifierError::EmptyTrainingSet(format!(
                "identity {identity:?} has no usable samples"
            ))
            .into());
        }
        tracing::debug!(identity = %identity, samples = count, "encoded identity");
    }

    Ok(NearestNeighborModel::fit(encoder, entries)?)
}

/// Train and persist. On failure any existing model file is left untouched.
pub fn train_and_save(store: &EnrollmentStore, model_path: &Path) -> Result<NearestNeighborModel, EngineError> {
    let model = train(store, FeatureEncoder::default())?;
    model.save(model_path)?;
    tracing::info!(
        path = %model_path.display(),
        entries = model.len(),
        identities = model.identities().len(),
        "training complete"
    );
    Ok(model)
}
