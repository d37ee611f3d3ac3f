//! Stacking sampled patches into Burn tensors.

use crate::sampler::Patch;
use crate::types::{DatasetResult, SamplingError};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Channel-stacked batch in `[n, channels, depth, height, width]` layout.
#[derive(Debug, Clone)]
pub struct PatchBatch<B: Backend> {
    /// Image channel, plus the auxiliary input channel when present.
    pub images: Tensor<B, 5>,
    pub labels: Tensor<B, 5>,
    pub aux_labels: Tensor<B, 5>,
    /// `[n, 1]`: 1 where the label patch holds a positive voxel.
    pub presence: Tensor<B, 2>,
}

impl<B: Backend> PatchBatch<B> {
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn zscore(values: &[f32]) -> impl Iterator<Item = f32> + '_ {
    let n = values.len().max(1) as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let std = var.sqrt();
    let scale = if std > 1e-6 { 1.0 / std } else { 1.0 };
    values.iter().map(move |v| (v - mean) * scale)
}

/// Stacks `patches` into one batch. All patches must share a shape; the auxiliary
/// input channel is taken as is, only the image channel is normalised.
pub fn assemble<B: Backend>(
    patches: &[Patch],
    normalize: bool,
    device: &B::Device,
) -> DatasetResult<PatchBatch<B>> {
    let Some(first) = patches.first() else {
        return Err(SamplingError::EmptySet.into());
    };
    let [d, h, w] = first.dims();
    for patch in patches {
        if patch.dims() != first.dims() {
            return Err(SamplingError::MixedPatchShapes {
                first: first.dims(),
                other: patch.dims(),
            }
            .into());
        }
    }
    let n = patches.len();
    let channels = if first.aux_input.is_some() { 2 } else { 1 };
    let voxels = d * h * w;

    let mut images_buf = Vec::with_capacity(n * channels * voxels);
    let mut labels_buf = Vec::with_capacity(n * voxels);
    let mut aux_buf = Vec::with_capacity(n * voxels);
    let mut presence_buf = Vec::with_capacity(n);
    for patch in patches {
        if normalize {
            images_buf.extend(zscore(patch.image.data()));
        } else {
            images_buf.extend_from_slice(patch.image.data());
        }
        if channels == 2 {
            match &patch.aux_input {
                Some(aux) => images_buf.extend_from_slice(aux.data()),
                None => images_buf.extend(std::iter::repeat(0.0).take(voxels)),
            }
        }
        labels_buf.extend_from_slice(patch.label.data());
        aux_buf.extend_from_slice(patch.aux_label.data());
        presence_buf.push(if patch.is_positive() { 1.0 } else { 0.0 });
    }

    let images = Tensor::<B, 1>::from_floats(images_buf.as_slice(), device)
        .reshape([n, channels, d, h, w]);
    let labels = Tensor::<B, 1>::from_floats(labels_buf.as_slice(), device).reshape([n, 1, d, h, w]);
    let aux_labels = Tensor::<B, 1>::from_floats(aux_buf.as_slice(), device).reshape([n, 1, d, h, w]);
    let presence = Tensor::<B, 1>::from_floats(presence_buf.as_slice(), device).reshape([n, 1]);
    Ok(PatchBatch {
        images,
        labels,
        aux_labels,
        presence,
    })
}

/// Negative-to-positive voxel ratio over the label patches, used as the weight of
/// the positive class in weighted cross-entropy. 1.0 when no voxel is positive.
pub fn class_weight_auto(patches: &[Patch]) -> f64 {
    let (pos, total) = patches.iter().fold((0usize, 0usize), |(pos, total), p| {
        (pos + p.label.positive_count(), total + p.label.data().len())
    });
    if pos == 0 {
        return 1.0;
    }
    (total - pos) as f64 / pos as f64
}
