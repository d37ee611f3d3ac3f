use crate::loader::VolumeSet;
use crate::types::ImageId;
use crate::volume::Volume;
use rayon::prelude::*;
use std::collections::HashMap;

/// Per-volume record of which depth slices contain a positive label voxel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceIndex {
    slices: HashMap<ImageId, Vec<bool>>,
}

fn slice_flags(label: &Volume) -> Vec<bool> {
    (0..label.depth())
        .map(|z| label.slice_has_positive(z))
        .collect()
}

impl SliceIndex {
    pub fn build(set: &VolumeSet) -> Self {
        let mut index = Self::default();
        index.update(&set.ids, &set.labels);
        index
    }

    /// Recomputes the entries for `ids`, replacing whatever was stored before.
    pub fn update(&mut self, ids: &[ImageId], labels: &[Volume]) {
        let flags: Vec<Vec<bool>> = labels.par_iter().map(slice_flags).collect();
        for (id, f) in ids.iter().zip(flags) {
            self.slices.insert(*id, f);
        }
    }

    pub fn slices(&self, id: ImageId) -> Option<&[bool]> {
        self.slices.get(&id).map(Vec::as_slice)
    }

    pub fn has_positive(&self, id: ImageId) -> bool {
        self.slices(id).is_some_and(|s| s.iter().any(|p| *p))
    }

    /// Starts of `depth`-slice windows that fit and contain at least one positive slice.
    pub fn positive_starts(&self, id: ImageId, depth: usize) -> Vec<usize> {
        self.starts(id, depth, |window| window.iter().any(|p| *p))
    }

    /// Window starts whose first slice is negative.
    pub fn negative_starts(&self, id: ImageId, depth: usize) -> Vec<usize> {
        self.starts(id, depth, |window| !window[0])
    }

    fn starts(&self, id: ImageId, depth: usize, keep: impl Fn(&[bool]) -> bool) -> Vec<usize> {
        let Some(slices) = self.slices(id) else {
            return Vec::new();
        };
        if slices.is_empty() {
            return Vec::new();
        }
        // A volume no deeper than the window offers one window covering all of it.
        if slices.len() <= depth {
            return if keep(slices) { vec![0] } else { Vec::new() };
        }
        let depth = depth.max(1);
        (0..=slices.len() - depth)
            .filter(|z| keep(&slices[*z..*z + depth]))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}
