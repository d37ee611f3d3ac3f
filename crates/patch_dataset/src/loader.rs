//! Full-volume loading. Loaders are order-preserving and return one volume per id.

use crate::types::{DatasetError, DatasetResult, ImageId};
use crate::volume::{Volume, VolumePair};
use data_contracts::{VolumeEntry, VolumeManifest};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Loaded volumes, index-aligned with `ids`.
#[derive(Debug, Clone, Default)]
pub struct VolumeSet {
    pub ids: Vec<ImageId>,
    pub images: Vec<Volume>,
    pub labels: Vec<Volume>,
    pub aux_labels: Option<Vec<Volume>>,
}

impl VolumeSet {
    pub fn from_pairs(ids: Vec<ImageId>, pairs: Vec<VolumePair>) -> Self {
        let has_aux = !pairs.is_empty() && pairs.iter().all(|p| p.aux_label.is_some());
        let mut set = VolumeSet {
            ids,
            aux_labels: has_aux.then(Vec::new),
            ..Default::default()
        };
        for pair in pairs {
            set.images.push(pair.image);
            set.labels.push(pair.label);
            if let (Some(aux), Some(list)) = (pair.aux_label, set.aux_labels.as_mut()) {
                list.push(aux);
            }
        }
        set
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn position(&self, id: ImageId) -> Option<usize> {
        self.ids.iter().position(|i| *i == id)
    }

    /// Clones the volumes at `index` into a pair.
    pub fn pair(&self, index: usize) -> VolumePair {
        VolumePair {
            image: self.images[index].clone(),
            label: self.labels[index].clone(),
            aux_label: self.aux_labels.as_ref().map(|a| a[index].clone()),
        }
    }

    /// Pair restricted to a depth window, without cloning the full volumes.
    pub fn slab(&self, index: usize, window: std::ops::Range<usize>) -> VolumePair {
        VolumePair {
            image: self.images[index].slab(window.clone()),
            label: self.labels[index].slab(window.clone()),
            aux_label: self.aux_labels.as_ref().map(|a| a[index].slab(window)),
        }
    }

    /// Concatenates two sets. Auxiliary labels survive only when both sides carry them.
    pub fn merged(&self, other: &VolumeSet) -> VolumeSet {
        let aux_labels = match (&self.aux_labels, &other.aux_labels) {
            (Some(a), Some(b)) => Some(a.iter().chain(b).cloned().collect()),
            _ => None,
        };
        VolumeSet {
            ids: self.ids.iter().chain(&other.ids).copied().collect(),
            images: self.images.iter().chain(&other.images).cloned().collect(),
            labels: self.labels.iter().chain(&other.labels).cloned().collect(),
            aux_labels,
        }
    }
}

pub trait VolumeLoader {
    fn load(&self, ids: &[ImageId]) -> DatasetResult<VolumeSet>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryLoader {
    volumes: HashMap<ImageId, VolumePair>,
}

impl InMemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ImageId, pair: VolumePair) {
        self.volumes.insert(id, pair);
    }

    pub fn with(mut self, id: ImageId, pair: VolumePair) -> Self {
        self.insert(id, pair);
        self
    }
}

impl VolumeLoader for InMemoryLoader {
    fn load(&self, ids: &[ImageId]) -> DatasetResult<VolumeSet> {
        let pairs = ids
            .iter()
            .map(|id| {
                self.volumes
                    .get(id)
                    .cloned()
                    .ok_or(DatasetError::UnknownId(*id))
            })
            .collect::<DatasetResult<Vec<_>>>()?;
        Ok(VolumeSet::from_pairs(ids.to_vec(), pairs))
    }
}

/// Reads volumes listed in a JSON [`VolumeManifest`] from raw little-endian `f32` files.
#[derive(Debug, Clone)]
pub struct ManifestLoader {
    manifest: VolumeManifest,
    base: PathBuf,
}

impl ManifestLoader {
    pub fn from_path(path: &Path) -> DatasetResult<Self> {
        let raw = fs::read_to_string(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: VolumeManifest =
            serde_json::from_str(&raw).map_err(|source| DatasetError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        manifest.validate().map_err(|source| DatasetError::Manifest {
            path: path.to_path_buf(),
            source,
        })?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let base = match &manifest.root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => dir.join(root),
            None => dir.to_path_buf(),
        };
        Ok(Self { manifest, base })
    }

    pub fn manifest(&self) -> &VolumeManifest {
        &self.manifest
    }

    fn read_entry(&self, entry: &VolumeEntry) -> DatasetResult<VolumePair> {
        let image = read_raw_volume(&self.base.join(&entry.image), entry.dims)?;
        let label = read_raw_volume(&self.base.join(&entry.label), entry.dims)?;
        let aux_label = entry
            .aux_label
            .as_ref()
            .map(|p| read_raw_volume(&self.base.join(p), entry.dims))
            .transpose()?;
        Ok(VolumePair {
            image,
            label,
            aux_label,
        })
    }
}

impl VolumeLoader for ManifestLoader {
    fn load(&self, ids: &[ImageId]) -> DatasetResult<VolumeSet> {
        let entries = ids
            .iter()
            .map(|id| self.manifest.entry(*id).ok_or(DatasetError::UnknownId(*id)))
            .collect::<DatasetResult<Vec<_>>>()?;
        let pairs = entries
            .par_iter()
            .map(|entry| self.read_entry(entry))
            .collect::<DatasetResult<Vec<_>>>()?;
        tracing::debug!(count = pairs.len(), base = %self.base.display(), "loaded volumes");
        Ok(VolumeSet::from_pairs(ids.to_vec(), pairs))
    }
}

pub fn read_raw_volume(path: &Path, dims: [usize; 3]) -> DatasetResult<Volume> {
    let bytes = fs::read(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.len() % 4 != 0 {
        return Err(DatasetError::RawLength {
            path: path.to_path_buf(),
            bytes: bytes.len(),
        });
    }
    let data = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Volume::new(dims, data)
}

pub fn write_raw_volume(path: &Path, volume: &Volume) -> DatasetResult<()> {
    let bytes: Vec<u8> = volume.data().iter().flat_map(|v| v.to_le_bytes()).collect();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| DatasetError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, bytes).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}
