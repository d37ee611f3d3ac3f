//! Online and offline augmentation of image/label pairs.

use crate::loader::VolumeSet;
use crate::types::DatasetResult;
use crate::volume::{Volume, VolumePair};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Probabilities and strengths for the random transforms. All-zero is the identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AugmentConfig {
    pub flip_prob: f32,
    /// Probability of an in-plane 90° rotation.
    pub rot90_prob: f32,
    pub intensity_jitter_prob: f32,
    /// Max relative brightness/contrast change.
    pub intensity_jitter_strength: f32,
    pub noise_prob: f32,
    /// Max absolute uniform noise, relative to the image's intensity span.
    pub noise_strength: f32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            flip_prob: 0.0,
            rot90_prob: 0.0,
            intensity_jitter_prob: 0.0,
            intensity_jitter_strength: 0.1,
            noise_prob: 0.0,
            noise_strength: 0.02,
        }
    }
}

impl AugmentConfig {
    pub fn is_identity(&self) -> bool {
        self.flip_prob <= 0.0
            && self.rot90_prob <= 0.0
            && self.intensity_jitter_prob <= 0.0
            && self.noise_prob <= 0.0
    }

    fn apply(&self, pair: VolumePair, rng: &mut dyn rand::RngCore) -> VolumePair {
        let mut pair = maybe_flip(pair, self.flip_prob, rng);
        pair = maybe_rot90(pair, self.rot90_prob, rng);
        maybe_jitter(
            &mut pair.image,
            self.intensity_jitter_prob,
            self.intensity_jitter_strength,
            rng,
        );
        maybe_noise(&mut pair.image, self.noise_prob, self.noise_strength, rng);
        pair
    }
}

/// Random transforms applied to a slab right after it is cut from the full volume.
pub trait OnlineAugment {
    fn augment(&mut self, pair: VolumePair, rng: &mut dyn rand::RngCore) -> VolumePair;
}

#[derive(Debug, Clone, Default)]
pub struct OnlineAugmenter {
    cfg: AugmentConfig,
}

impl OnlineAugmenter {
    pub fn new(cfg: AugmentConfig) -> Self {
        Self { cfg }
    }
}

impl OnlineAugment for OnlineAugmenter {
    fn augment(&mut self, pair: VolumePair, rng: &mut dyn rand::RngCore) -> VolumePair {
        self.cfg.apply(pair, rng)
    }
}

/// A slab served by an offline augmenter.
pub type AugmentedSlab = VolumePair;

/// Serves slice windows of loaded volumes under a fixed set of precomputed transforms.
pub trait OfflineAugment {
    /// Slab `window` of volume `index` in `set`, under one of the augmenter's transforms.
    fn slab(
        &mut self,
        set: &VolumeSet,
        index: usize,
        window: Range<usize>,
        rng: &mut dyn rand::RngCore,
    ) -> DatasetResult<AugmentedSlab>;

    /// A synthetic positive example, or `None` when the augmenter has none.
    fn artificial_positive(
        &mut self,
        rng: &mut dyn rand::RngCore,
    ) -> DatasetResult<Option<AugmentedSlab>>;
}

/// Offline augmenter with `variants` deterministic transforms per (id, window).
///
/// Variant 0 is the untouched slab; variant `k > 0` replays `cfg` from a seed mixed
/// from the id, the window start and `k`, so the same key always yields the same slab.
#[derive(Debug, Clone)]
pub struct OfflineAugmenter {
    cfg: AugmentConfig,
    variants: usize,
    seed: u64,
    artificial: Vec<AugmentedSlab>,
}

impl Default for OfflineAugmenter {
    fn default() -> Self {
        Self::new(AugmentConfig::default(), 1, 0)
    }
}

impl OfflineAugmenter {
    pub fn new(cfg: AugmentConfig, variants: usize, seed: u64) -> Self {
        Self {
            cfg,
            variants: variants.max(1),
            seed,
            artificial: Vec::new(),
        }
    }

    /// Adds synthetic positives; slabs without a positive label voxel are skipped.
    pub fn with_artificial(mut self, slabs: impl IntoIterator<Item = AugmentedSlab>) -> Self {
        self.artificial
            .extend(slabs.into_iter().filter(|s| s.label.has_positive()));
        self
    }

    pub fn artificial_len(&self) -> usize {
        self.artificial.len()
    }

    fn variant_seed(&self, id: u32, start: usize, variant: usize) -> u64 {
        self.seed
            ^ (id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (start as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
            ^ variant as u64
    }
}

impl OfflineAugment for OfflineAugmenter {
    fn slab(
        &mut self,
        set: &VolumeSet,
        index: usize,
        window: Range<usize>,
        rng: &mut dyn rand::RngCore,
    ) -> DatasetResult<AugmentedSlab> {
        let slab = set.slab(index, window.clone());
        let variant = rng.random_range(0..self.variants);
        if variant == 0 || self.cfg.is_identity() {
            return Ok(slab);
        }
        let mut local = StdRng::seed_from_u64(self.variant_seed(set.ids[index], window.start, variant));
        Ok(self.cfg.apply(slab, &mut local))
    }

    fn artificial_positive(
        &mut self,
        rng: &mut dyn rand::RngCore,
    ) -> DatasetResult<Option<AugmentedSlab>> {
        if self.artificial.is_empty() {
            return Ok(None);
        }
        let i = rng.random_range(0..self.artificial.len());
        Ok(Some(self.artificial[i].clone()))
    }
}

pub(crate) fn maybe_flip(pair: VolumePair, prob: f32, rng: &mut dyn rand::RngCore) -> VolumePair {
    if prob <= 0.0 {
        return pair;
    }
    let mut pair = pair;
    if rng.random_range(0.0..1.0) < prob {
        pair = pair.map_geometry(Volume::flip_x);
    }
    if rng.random_range(0.0..1.0) < prob {
        pair = pair.map_geometry(Volume::flip_y);
    }
    pair
}

pub(crate) fn maybe_rot90(pair: VolumePair, prob: f32, rng: &mut dyn rand::RngCore) -> VolumePair {
    if prob <= 0.0 || rng.random_range(0.0..1.0) >= prob {
        return pair;
    }
    pair.map_geometry(Volume::rot90)
}

pub(crate) fn maybe_jitter(
    image: &mut Volume,
    prob: f32,
    strength: f32,
    rng: &mut dyn rand::RngCore,
) {
    if prob <= 0.0 || strength <= 0.0 {
        return;
    }
    if rng.random_range(0.0..1.0) >= prob {
        return;
    }
    let bright = 1.0 + rng.random_range(-strength..strength);
    let contrast = 1.0 + rng.random_range(-strength..strength);
    let mean = (image.sum() / image.data().len().max(1) as f64) as f32;
    image.map_in_place(|v| ((v - mean) * contrast + mean) * bright);
}

pub(crate) fn maybe_noise(
    image: &mut Volume,
    prob: f32,
    strength: f32,
    rng: &mut dyn rand::RngCore,
) {
    if prob <= 0.0 || strength <= 0.0 {
        return;
    }
    if rng.random_range(0.0..1.0) >= prob {
        return;
    }
    let (lo, hi) = image
        .data()
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let amplitude = strength * (hi - lo).max(1.0);
    image.map_in_place(|v| v + rng.random_range(-amplitude..amplitude));
}
