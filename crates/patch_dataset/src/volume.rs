//! Dense `f32` volumes in `[depth, height, width]` order and the geometric ops the sampler needs.

use crate::types::{DatasetError, DatasetResult};
use image::imageops::FilterType;
use image::{ImageBuffer, Luma};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    dims: [usize; 3],
    data: Vec<f32>,
}

impl Volume {
    pub fn new(dims: [usize; 3], data: Vec<f32>) -> DatasetResult<Self> {
        let expected = dims.iter().product();
        if data.len() != expected {
            return Err(DatasetError::ShapeMismatch {
                dims,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dims, data })
    }

    pub fn zeros(dims: [usize; 3]) -> Self {
        Self {
            dims,
            data: vec![0.0; dims.iter().product()],
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn depth(&self) -> usize {
        self.dims[0]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    fn offset(&self, z: usize, y: usize, x: usize) -> usize {
        (z * self.dims[1] + y) * self.dims[2] + x
    }

    pub fn get(&self, z: usize, y: usize, x: usize) -> f32 {
        self.data[self.offset(z, y, x)]
    }

    pub fn set(&mut self, z: usize, y: usize, x: usize, value: f32) {
        let i = self.offset(z, y, x);
        self.data[i] = value;
    }

    fn plane(&self, z: usize) -> &[f32] {
        let n = self.dims[1] * self.dims[2];
        &self.data[z * n..(z + 1) * n]
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().map(|v| *v as f64).sum()
    }

    pub fn has_positive(&self) -> bool {
        self.data.iter().any(|v| *v > 0.0)
    }

    pub fn slice_has_positive(&self, z: usize) -> bool {
        self.plane(z).iter().any(|v| *v > 0.0)
    }

    pub fn positive_count(&self) -> usize {
        self.data.iter().filter(|v| **v > 0.0).count()
    }

    /// Coordinates `[z, y, x]` of every voxel above zero.
    pub fn positive_voxels(&self) -> Vec<[usize; 3]> {
        let [_, h, w] = self.dims;
        self.data
            .iter()
            .enumerate()
            .filter(|(_, v)| **v > 0.0)
            .map(|(i, _)| [i / (h * w), (i / w) % h, i % w])
            .collect()
    }

    /// Slices `window` along depth, keeping the full plane.
    pub fn slab(&self, window: Range<usize>) -> Volume {
        let n = self.dims[1] * self.dims[2];
        let end = window.end.min(self.dims[0]);
        let start = window.start.min(end);
        Volume {
            dims: [end - start, self.dims[1], self.dims[2]],
            data: self.data[start * n..end * n].to_vec(),
        }
    }

    /// Whether a `size` box starting at the origin fits on every axis.
    pub fn fits(&self, size: [usize; 3]) -> bool {
        self.dims.iter().zip(size).all(|(d, s)| s <= *d)
    }

    /// Crops `size` voxels starting at `corner`. The caller keeps the box inside the volume.
    pub fn crop(&self, corner: [usize; 3], size: [usize; 3]) -> Volume {
        let [cz, cy, cx] = corner;
        let mut data = Vec::with_capacity(size.iter().product());
        for z in cz..cz + size[0] {
            for y in cy..cy + size[1] {
                let start = self.offset(z, y, cx);
                data.extend_from_slice(&self.data[start..start + size[2]]);
            }
        }
        Volume { dims: size, data }
    }

    /// Resamples to `target`: linear in-plane, nearest-neighbour along depth.
    pub fn rescale(&self, target: [usize; 3]) -> Volume {
        if target == self.dims {
            return self.clone();
        }
        let [td, th, tw] = target;
        let mut data = Vec::with_capacity(target.iter().product());
        for z in 0..td {
            let src = (z * self.dims[0]) / td.max(1);
            data.extend(resize_plane(self.plane(src), self.dims[1], self.dims[2], th, tw));
        }
        Volume { dims: target, data }
    }

    /// Maps every voxel above zero to 1 and everything else to 0.
    pub fn binarize(&self) -> Volume {
        self.map(|v| if v > 0.0 { 1.0 } else { 0.0 })
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Volume {
        Volume {
            dims: self.dims,
            data: self.data.iter().map(|v| f(*v)).collect(),
        }
    }

    pub fn map_in_place(&mut self, mut f: impl FnMut(f32) -> f32) {
        for v in self.data.iter_mut() {
            *v = f(*v);
        }
    }

    pub fn flip_x(&self) -> Volume {
        let [d, h, w] = self.dims;
        self.remap([d, h, w], |z, y, x| [z, y, w - 1 - x])
    }

    pub fn flip_y(&self) -> Volume {
        let [d, h, w] = self.dims;
        self.remap([d, h, w], |z, y, x| [z, h - 1 - y, x])
    }

    /// Rotates every plane by 90° counter-clockwise; height and width swap.
    pub fn rot90(&self) -> Volume {
        let [d, h, w] = self.dims;
        self.remap([d, w, h], |z, y, x| [z, x, w - 1 - y])
    }

    fn remap(&self, dims: [usize; 3], src: impl Fn(usize, usize, usize) -> [usize; 3]) -> Volume {
        let mut data = Vec::with_capacity(self.data.len());
        for z in 0..dims[0] {
            for y in 0..dims[1] {
                for x in 0..dims[2] {
                    let [sz, sy, sx] = src(z, y, x);
                    data.push(self.get(sz, sy, sx));
                }
            }
        }
        Volume { dims, data }
    }

    /// In-plane 4-neighbour discrete Laplacian with replicated borders.
    pub fn laplacian(&self) -> Volume {
        let [d, h, w] = self.dims;
        let mut data = Vec::with_capacity(self.data.len());
        for z in 0..d {
            for y in 0..h {
                for x in 0..w {
                    let c = self.get(z, y, x);
                    let up = self.get(z, y.saturating_sub(1), x);
                    let down = self.get(z, (y + 1).min(h - 1), x);
                    let left = self.get(z, y, x.saturating_sub(1));
                    let right = self.get(z, y, (x + 1).min(w - 1));
                    data.push(up + down + left + right - 4.0 * c);
                }
            }
        }
        Volume { dims: self.dims, data }
    }
}

/// Linear resize of one plane through `image`. Values are mapped to `[0, 1]` around the
/// call because float resampling clamps to that range.
fn resize_plane(plane: &[f32], h: usize, w: usize, th: usize, tw: usize) -> Vec<f32> {
    if h == 0 || w == 0 {
        return vec![0.0; th * tw];
    }
    let (lo, hi) = plane
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let span = hi - lo;
    if span <= f32::EPSILON {
        return vec![lo; th * tw];
    }
    let scaled: Vec<f32> = plane.iter().map(|v| (v - lo) / span).collect();
    let Some(buf) = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(w as u32, h as u32, scaled) else {
        return vec![lo; th * tw];
    };
    let resized = image::imageops::resize(&buf, tw as u32, th as u32, FilterType::Triangle);
    resized.into_raw().into_iter().map(|v| v * span + lo).collect()
}

/// An image with its label and optional auxiliary label, all of one shape.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumePair {
    pub image: Volume,
    pub label: Volume,
    pub aux_label: Option<Volume>,
}

impl VolumePair {
    pub fn dims(&self) -> [usize; 3] {
        self.image.dims()
    }

    pub fn slab(&self, window: Range<usize>) -> VolumePair {
        VolumePair {
            image: self.image.slab(window.clone()),
            label: self.label.slab(window.clone()),
            aux_label: self.aux_label.as_ref().map(|v| v.slab(window)),
        }
    }

    /// Applies the same geometric transform to every member.
    pub fn map_geometry(self, f: impl Fn(&Volume) -> Volume) -> VolumePair {
        VolumePair {
            image: f(&self.image),
            label: f(&self.label),
            aux_label: self.aux_label.as_ref().map(&f),
        }
    }
}
