use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeManifestSchemaVersion {
    V1,
}

/// One image/label pair stored as raw little-endian `f32` voxels in `[depth, height, width]` order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeEntry {
    pub id: u32,
    pub dims: [usize; 3],
    pub image: PathBuf,
    pub label: PathBuf,
    #[serde(default)]
    pub aux_label: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeManifest {
    pub schema_version: VolumeManifestSchemaVersion,
    /// Relative entry paths resolve against this directory (or the manifest's own directory when unset).
    #[serde(default)]
    pub root: Option<PathBuf>,
    pub entries: Vec<VolumeEntry>,
}

#[derive(Debug, Error, PartialEq)]
pub enum VolumeValidationError {
    #[error("volume {id} has an empty axis: {dims:?}")]
    EmptyDims { id: u32, dims: [usize; 3] },
    #[error("volume id {0} listed more than once")]
    DuplicateId(u32),
    #[error("volume {0} is missing an image or label path")]
    MissingPath(u32),
    #[error("manifest lists no volumes")]
    Empty,
}

impl VolumeEntry {
    pub fn voxel_count(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn validate(&self) -> Result<(), VolumeValidationError> {
        if self.dims.contains(&0) {
            return Err(VolumeValidationError::EmptyDims {
                id: self.id,
                dims: self.dims,
            });
        }
        let empty = |p: &PathBuf| p.as_os_str().is_empty();
        if empty(&self.image) || empty(&self.label) || self.aux_label.as_ref().is_some_and(empty) {
            return Err(VolumeValidationError::MissingPath(self.id));
        }
        Ok(())
    }
}

impl VolumeManifest {
    pub fn validate(&self) -> Result<(), VolumeValidationError> {
        if self.entries.is_empty() {
            return Err(VolumeValidationError::Empty);
        }
        let mut seen = HashSet::new();
        for entry in &self.entries {
            entry.validate()?;
            if !seen.insert(entry.id) {
                return Err(VolumeValidationError::DuplicateId(entry.id));
            }
        }
        Ok(())
    }

    pub fn entry(&self, id: u32) -> Option<&VolumeEntry> {
        self.entries.iter().find(|e| e.id == id)
    }
}
