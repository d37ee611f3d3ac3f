//! Core types and error definitions for patch_dataset.

use data_contracts::VolumeValidationError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type ImageId = u32;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: VolumeValidationError,
    },
    #[error("volume data has {actual} voxels, dims {dims:?} need {expected}")]
    ShapeMismatch {
        dims: [usize; 3],
        expected: usize,
        actual: usize,
    },
    #[error("raw volume {path} is {bytes} bytes, not a whole number of f32 voxels")]
    RawLength { path: PathBuf, bytes: usize },
    #[error("no volume with id {0}")]
    UnknownId(ImageId),
    #[error("auxiliary labels requested but volume set has none")]
    MissingAuxLabels,
    #[error(transparent)]
    Sampling(#[from] SamplingError),
}

/// Failures of the patch sampler. Every retry loop is bounded and ends in one of these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SamplingError {
    #[error("volume set is empty")]
    EmptySet,
    #[error("no volume in the set contains a positive voxel")]
    NoPositiveImage,
    #[error("no positive slice window fits a patch of depth {patch_depth}")]
    NoPositiveSlices { patch_depth: usize },
    #[error("no label-free patch found after {attempts} attempts")]
    NoNegativePatch { attempts: usize },
    #[error("no positive patch found after {attempts} attempts")]
    NoPositivePatch { attempts: usize },
    #[error("patch shapes differ within a batch: {first:?} vs {other:?}")]
    MixedPatchShapes { first: [usize; 3], other: [usize; 3] },
}

/// Which split a patch is drawn for. Validation never receives artificial positives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitRole {
    Training,
    Validation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AugmentMode {
    /// Random transforms on every draw.
    Online,
    /// Deterministic transforms keyed by image id and slice window.
    Offline,
}

/// Target volume for the auxiliary output head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxTarget {
    /// Train the auxiliary head on the main label.
    Label,
    /// Train it on the set's auxiliary label volumes.
    AuxLabel,
}
