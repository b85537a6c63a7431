//! Enrollment store: one directory per identity, one image file per sample.
//!
//! Layout: `<root>/<identity>/<NNNNNN>-<uuid>.png`. The zero-padded prefix is
//! the per-identity insertion order, so listing a directory in name order
//! replays samples in the order they were captured. Re-enrolling an existing
//! identity adds samples; nothing is ever replaced or deduplicated.

use image::{DynamicImage, ImageFormat};
use rollcall_core::Identity;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid identity label {0:?}: must be non-empty and usable as a directory name")]
    InvalidIdentity(String),
    #[error("enrollment store I/O at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sample image {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// One stored face sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub identity: Identity,
    pub path: PathBuf,
}

impl Sample {
    /// Decode the sample image from disk.
    pub fn load_image(&self) -> Result<DynamicImage, StoreError> {
        image::open(&self.path).map_err(|source| StoreError::Image {
            path: self.path.display().to_string(),
            source,
        })
    }
}

/// Directory-backed collection of labelled face samples.
#[derive(Debug, Clone)]
pub struct EnrollmentStore {
    root: PathBuf,
}

impl EnrollmentStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store one sample under `identity`, creating the identity if absent.
    pub fn add_sample(&self, identity: &str, region: &DynamicImage) -> Result<Sample, StoreError> {
        let identity = validate_identity(identity)?;
        let dir = self.root.join(identity);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let existing = list_sample_paths(&dir)?;
        if !existing.is_empty() {
            tracing::warn!(
                identity,
                existing = existing.len(),
                "identity already enrolled; adding another sample"
            );
        }

        let next = existing
            .iter()
            .filter_map(|p| sequence_of(p))
            .max()
            .map_or(1, |n| n + 1);
        let path = dir.join(format!("{next:06}-{}.png", Uuid::new_v4().simple()));

        region
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|source| StoreError::Image {
                path: path.display().to_string(),
                source,
            })?;

        tracing::info!(identity, path = %path.display(), "stored sample");

        Ok(Sample {
            identity: identity.to_string(),
            path,
        })
    }

    /// All enrolled identities, in label order.
    ///
    /// Directories whose names are not valid labels (for example with
    /// leading or trailing whitespace) are skipped with a warning.
    pub fn list_identities(&self) -> Result<BTreeSet<Identity>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(io_err(&self.root))?;

        let mut identities = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.root))?;
            let is_dir = entry.file_type().map_err(io_err(&entry.path()))?.is_dir();
            if !is_dir {
                continue;
            }
            match entry.file_name().into_string() {
                // Only labels `samples_for` can resolve back to this directory.
                Ok(name) if validate_identity(&name).is_ok_and(|label| label == name) => {
                    identities.insert(name);
                }
                Ok(name) => {
                    tracing::warn!(name = %name, "skipping identity directory with an invalid label");
                }
                Err(name) => {
                    tracing::warn!(?name, "skipping identity directory with non-UTF-8 name");
                }
            }
        }
        Ok(identities)
    }

    /// Samples for `identity` in insertion order.
    ///
    /// Images are decoded lazily through [`Sample::load_image`]; call again to
    /// restart the sequence. An unknown identity yields an empty sequence.
    pub fn samples_for(
        &self,
        identity: &str,
    ) -> Result<impl Iterator<Item = Sample> + '_, StoreError> {
        let identity = validate_identity(identity)?.to_string();
        let dir = self.root.join(&identity);
        let paths = if dir.is_dir() {
            list_sample_paths(&dir)?
        } else {
            Vec::new()
        };

        Ok(paths.into_iter().map(move |path| Sample {
            identity: identity.clone(),
            path,
        }))
    }

    /// Number of image files stored for `identity`.
    pub fn sample_count(&self, identity: &str) -> Result<usize, StoreError> {
        Ok(self.samples_for(identity)?.count())
    }
}

/// Reject labels that cannot be a single directory component.
fn validate_identity(identity: &str) -> Result<&str, StoreError> {
    let trimmed = identity.trim();
    let invalid = trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidIdentity(identity.to_string()));
    }
    Ok(trimmed)
}

/// Image files in `dir`, sorted by file name.
fn list_sample_paths(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if path.is_file() && ImageFormat::from_path(&path).is_ok() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Parse the `NNNNNN` insertion prefix of a sample file name.
fn sequence_of(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let (seq, _) = stem.split_once('-')?;
    seq.parse().ok()
}
