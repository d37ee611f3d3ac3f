//! Volume loading, slice indexing, augmentation, and patch sampling for segmentation training.
//!
//! This crate provides:
//! - `Volume`/`VolumePair`: dense voxel grids with crop, slab, rescale and in-plane transforms
//! - `VolumeLoader` implementations for in-memory sets and JSON manifests of raw volumes
//! - `SliceIndex`: per-slice label positivity used to find positive and negative windows
//! - Online and offline augmenters
//! - `PatchSampler`: positive/negative patch draws with bounded retries
//! - `assemble`: Burn batch construction

pub mod aug;
pub mod batch;
pub mod index;
pub mod loader;
pub mod sampler;
pub mod types;
pub mod volume;

pub use aug::{AugmentConfig, AugmentedSlab, OfflineAugment, OfflineAugmenter, OnlineAugment, OnlineAugmenter};
pub use batch::{assemble, class_weight_auto, PatchBatch};
pub use index::SliceIndex;
pub use loader::{read_raw_volume, write_raw_volume, InMemoryLoader, ManifestLoader, VolumeLoader, VolumeSet};
pub use sampler::{preprocess, resize_to_unet_shape, Patch, PatchSampler, SamplerConfig};
pub use types::*;
pub use volume::{Volume, VolumePair};
