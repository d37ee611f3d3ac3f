//! Patch sampling biased toward positive or negative examples.
//!
//! Every draw picks a full volume, cuts a slice window, augments it, then crops a
//! patch (or rescales the window when the patch does not fit). Draws that come out
//! with the wrong label content are retried up to `max_retries` times.

use crate::aug::{OfflineAugment, OfflineAugmenter, OnlineAugment, OnlineAugmenter};
use crate::index::SliceIndex;
use crate::loader::VolumeSet;
use crate::types::{AugmentMode, AuxTarget, DatasetError, DatasetResult, SamplingError, SplitRole};
use crate::volume::{Volume, VolumePair};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplerConfig {
    /// Patch extent `[depth, height, width]`; planar networks use depth 1.
    pub patch_size: [usize; 3],
    /// Chance that a drawn patch is positive.
    pub positive_probability: f64,
    pub augment: AugmentMode,
    /// Share of positive training draws served from the artificial pool (offline mode).
    pub artificial_fraction: f64,
    /// Keep the full window plane and resize it to a network-compatible shape instead of cropping.
    pub variable_patch_size: bool,
    /// Network depth; variable-size patches are resized to multiples of `2^unet_depth`.
    pub unet_depth: usize,
    /// Per-patch z-score normalisation of the image channel at batch assembly.
    pub normalize: bool,
    /// Add the image's Laplacian as a second input channel.
    pub aux_input: bool,
    pub aux_target: AuxTarget,
    pub max_retries: usize,
    /// Intensity window mapped to `[0, 1]` before anything else; `None` leaves values as loaded.
    pub intensity_window: Option<(f32, f32)>,
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            patch_size: [16, 64, 64],
            positive_probability: 0.5,
            augment: AugmentMode::Online,
            artificial_fraction: 0.0,
            variable_patch_size: false,
            unet_depth: 4,
            normalize: true,
            aux_input: false,
            aux_target: AuxTarget::Label,
            max_retries: 64,
            intensity_window: None,
            seed: None,
        }
    }
}

/// One training example. `aux_label` is the auxiliary head target.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub image: Volume,
    pub label: Volume,
    pub aux_label: Volume,
    pub aux_input: Option<Volume>,
}

impl Patch {
    pub fn dims(&self) -> [usize; 3] {
        self.image.dims()
    }

    pub fn is_positive(&self) -> bool {
        self.label.has_positive()
    }
}

/// Clamps intensities to `window` and maps them to `[0, 1]`.
pub fn preprocess(image: &Volume, window: Option<(f32, f32)>) -> Volume {
    match window {
        Some((lo, hi)) if hi > lo => image.map(|v| (v.clamp(lo, hi) - lo) / (hi - lo)),
        _ => image.clone(),
    }
}

/// Resizes the plane to the nearest multiples of `2^depth` (at least one multiple).
pub fn resize_to_unet_shape(volume: &Volume, depth: usize) -> Volume {
    let factor = 1usize << depth;
    let round = |n: usize| (((n + factor / 2) / factor).max(1)) * factor;
    let [d, h, w] = volume.dims();
    volume.rescale([d, round(h), round(w)])
}

pub struct PatchSampler {
    cfg: SamplerConfig,
    index: SliceIndex,
    online: Box<dyn OnlineAugment>,
    offline: Box<dyn OfflineAugment>,
    rng: StdRng,
}

impl PatchSampler {
    pub fn new(cfg: SamplerConfig, index: SliceIndex) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self {
            cfg,
            index,
            online: Box::new(OnlineAugmenter::default()),
            offline: Box::new(OfflineAugmenter::default()),
            rng,
        }
    }

    pub fn with_online(mut self, augmenter: impl OnlineAugment + 'static) -> Self {
        self.online = Box::new(augmenter);
        self
    }

    pub fn with_offline(mut self, augmenter: impl OfflineAugment + 'static) -> Self {
        self.offline = Box::new(augmenter);
        self
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.cfg
    }

    pub fn index(&self) -> &SliceIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut SliceIndex {
        &mut self.index
    }

    /// Restarts the random stream from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// A fresh seed drawn from the sampler's own stream.
    pub fn draw_seed(&mut self) -> u64 {
        self.rng.random()
    }

    /// Draws `n` patches, each positive with probability `positive_probability`.
    pub fn sample_batch(
        &mut self,
        set: &VolumeSet,
        n: usize,
        role: SplitRole,
    ) -> DatasetResult<Vec<Patch>> {
        (0..n).map(|_| self.sample(set, role)).collect()
    }

    pub fn sample(&mut self, set: &VolumeSet, role: SplitRole) -> DatasetResult<Patch> {
        if self.rng.random_bool(self.cfg.positive_probability.clamp(0.0, 1.0)) {
            self.sample_positive(set, role)
        } else {
            self.sample_negative(set, role)
        }
    }

    /// A patch without positive label voxels. In variable-size mode the label is not checked.
    pub fn sample_negative(&mut self, set: &VolumeSet, role: SplitRole) -> DatasetResult<Patch> {
        if set.is_empty() {
            return Err(SamplingError::EmptySet.into());
        }
        let [pd, _, _] = self.cfg.patch_size;
        for attempt in 0..self.cfg.max_retries {
            let i = self.rng.random_range(0..set.len());
            let depth = set.images[i].depth();
            let slab = match self.cfg.augment {
                AugmentMode::Online => {
                    let start = self.rng.random_range(0..=depth.saturating_sub(pd));
                    let slab = set.slab(i, start..start + pd);
                    self.online.augment(slab, &mut self.rng)
                }
                AugmentMode::Offline => {
                    let starts = self.index.negative_starts(set.ids[i], pd);
                    if starts.is_empty() {
                        debug!(id = set.ids[i], attempt, ?role, "no negative window, resampling");
                        continue;
                    }
                    let start = starts[self.rng.random_range(0..starts.len())];
                    self.offline.slab(set, i, start..start + pd, &mut self.rng)?
                }
            };
            if self.cfg.variable_patch_size {
                let patch = self.whole(slab)?;
                return Ok(self.finish(patch));
            }
            let corner = self.random_corner(slab.dims());
            let patch = self.cut(slab, corner)?;
            if !patch.label.has_positive() {
                return Ok(self.finish(patch));
            }
            debug!(id = set.ids[i], attempt, ?role, "negative patch contained foreground, resampling");
        }
        Err(SamplingError::NoNegativePatch {
            attempts: self.cfg.max_retries,
        }
        .into())
    }

    /// A patch with at least one positive label voxel.
    pub fn sample_positive(&mut self, set: &VolumeSet, role: SplitRole) -> DatasetResult<Patch> {
        if set.is_empty() {
            return Err(SamplingError::EmptySet.into());
        }
        let positive: Vec<usize> = (0..set.len())
            .filter(|i| self.index.has_positive(set.ids[*i]))
            .collect();
        let artificial = role == SplitRole::Training
            && self.cfg.augment == AugmentMode::Offline
            && self.cfg.artificial_fraction > 0.0;
        if positive.is_empty() && !artificial {
            return Err(SamplingError::NoPositiveImage.into());
        }
        let [pd, _, _] = self.cfg.patch_size;
        // Image first, then one of its windows, so every positive image is equally likely.
        let windows: Vec<(usize, Vec<usize>)> = positive
            .into_iter()
            .map(|i| (i, self.index.positive_starts(set.ids[i], pd)))
            .filter(|(_, starts)| !starts.is_empty())
            .collect();

        for attempt in 0..self.cfg.max_retries {
            let slab = match self.draw_artificial(artificial)? {
                Some(slab) => slab,
                None => {
                    if windows.is_empty() {
                        return Err(SamplingError::NoPositiveSlices { patch_depth: pd }.into());
                    }
                    let (i, starts) = &windows[self.rng.random_range(0..windows.len())];
                    let (i, start) = (*i, starts[self.rng.random_range(0..starts.len())]);
                    match self.cfg.augment {
                        AugmentMode::Online => {
                            let slab = set.slab(i, start..start + pd);
                            self.online.augment(slab, &mut self.rng)
                        }
                        AugmentMode::Offline => {
                            self.offline.slab(set, i, start..start + pd, &mut self.rng)?
                        }
                    }
                }
            };

            let voxels = slab.label.positive_voxels();
            if voxels.is_empty() {
                debug!(attempt, "positive window lost its foreground, resampling");
                continue;
            }
            if self.cfg.variable_patch_size {
                let patch = self.whole(slab)?;
                return Ok(self.finish(patch));
            }
            let voxel = voxels[self.rng.random_range(0..voxels.len())];
            let corner = self.corner_around(slab.dims(), voxel);
            let patch = self.cut(slab, corner)?;
            if patch.label.has_positive() {
                return Ok(self.finish(patch));
            }
            debug!(attempt, "positive patch came out empty, resampling");
        }
        Err(SamplingError::NoPositivePatch {
            attempts: self.cfg.max_retries,
        }
        .into())
    }

    fn draw_artificial(&mut self, enabled: bool) -> DatasetResult<Option<VolumePair>> {
        if !enabled || !self.rng.random_bool(self.cfg.artificial_fraction.clamp(0.0, 1.0)) {
            return Ok(None);
        }
        self.offline.artificial_positive(&mut self.rng)
    }

    fn random_corner(&mut self, dims: [usize; 3]) -> [usize; 3] {
        let mut corner = [0; 3];
        for axis in 1..3 {
            let room = dims[axis].saturating_sub(self.cfg.patch_size[axis]);
            corner[axis] = self.rng.random_range(0..=room);
        }
        corner
    }

    /// In-plane corner whose patch contains `voxel`, kept inside the slab.
    fn corner_around(&mut self, dims: [usize; 3], voxel: [usize; 3]) -> [usize; 3] {
        let mut corner = [0; 3];
        for axis in 1..3 {
            let p = self.cfg.patch_size[axis];
            if p > dims[axis] {
                continue;
            }
            let lo = (voxel[axis] + 1).saturating_sub(p);
            let hi = voxel[axis].min(dims[axis] - p);
            corner[axis] = self.rng.random_range(lo..=hi);
        }
        corner
    }

    /// Crops `patch_size` at `corner`, or rescales the whole slab when the patch does not fit.
    fn cut(&self, slab: VolumePair, corner: [usize; 3]) -> DatasetResult<Patch> {
        let size = self.cfg.patch_size;
        let aux = self.aux_volume(&slab)?;
        let patch = if slab.image.fits(size) {
            Patch {
                image: slab.image.crop(corner, size),
                label: slab.label.crop(corner, size),
                aux_label: aux.crop(corner, size),
                aux_input: None,
            }
        } else {
            Patch {
                image: slab.image.rescale(size),
                label: slab.label.rescale(size).binarize(),
                aux_label: aux.rescale(size).binarize(),
                aux_input: None,
            }
        };
        Ok(patch)
    }

    fn aux_volume(&self, slab: &VolumePair) -> DatasetResult<Volume> {
        match self.cfg.aux_target {
            AuxTarget::Label => Ok(slab.label.clone()),
            AuxTarget::AuxLabel => slab.aux_label.clone().ok_or(DatasetError::MissingAuxLabels),
        }
    }

    /// Variable-size mode keeps the whole slab.
    fn whole(&self, slab: VolumePair) -> DatasetResult<Patch> {
        let aux_label = self.aux_volume(&slab)?;
        Ok(Patch {
            image: slab.image,
            label: slab.label,
            aux_label,
            aux_input: None,
        })
    }

    fn finish(&self, mut patch: Patch) -> Patch {
        patch.image = preprocess(&patch.image, self.cfg.intensity_window);
        if self.cfg.variable_patch_size {
            let depth = self.cfg.unet_depth;
            patch.image = resize_to_unet_shape(&patch.image, depth);
            patch.label = resize_to_unet_shape(&patch.label, depth).binarize();
            patch.aux_label = resize_to_unet_shape(&patch.aux_label, depth).binarize();
        }
        if self.cfg.aux_input {
            patch.aux_input = Some(patch.image.laplacian());
        }
        patch
    }
}
