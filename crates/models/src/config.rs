//! Structural choices for the U-Net, resolved once when the plan is built.

use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Spatial dimensionality of the network.
///
/// Both variants run on `[batch, channels, depth, height, width]` tensors; a planar
/// network sees depth 1 and uses `1×k×k` kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialDims {
    Two,
    Three,
}

impl SpatialDims {
    /// Kernel extent for a `k`-wide convolution in this dimensionality.
    pub fn kernel(&self, k: usize) -> [usize; 3] {
        match self {
            SpatialDims::Two => [1, k, k],
            SpatialDims::Three => [k, k, k],
        }
    }

    pub fn rank(&self) -> usize {
        match self {
            SpatialDims::Two => 2,
            SpatialDims::Three => 3,
        }
    }
}

/// How a level hands its skip tensor to the next level down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Downsample {
    /// 2×2 in-plane max pooling.
    MaxPool,
    /// 3-kernel convolution with in-plane stride 2.
    StridedConv,
}

/// How a level brings the deeper result back to its own resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Upsample {
    /// Nearest-neighbour upsampling followed by a 2-kernel convolution.
    Resize,
    /// 2×2 transposed convolution with stride 2.
    Transposed,
    /// No upsampling. Rejected for volumetric networks, and for planar networks
    /// that downsample at all.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockMode {
    Plain,
    /// Concatenate the block input to its output along channels.
    Residual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    LeakyRelu,
    Gelu,
    Tanh,
}

impl Activation {
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Relu => activation::relu(x),
            Activation::LeakyRelu => activation::leaky_relu(x, 0.01),
            Activation::Gelu => activation::gelu(x),
            Activation::Tanh => activation::tanh(x),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UNetConfig {
    pub dims: SpatialDims,
    /// Input channels (image, plus the auxiliary input channel when enabled).
    pub in_channels: usize,
    pub out_channels: usize,
    /// Feature maps produced by the first conv block.
    pub start_channels: usize,
    /// Number of downsampling steps; 0 builds a single pair of conv blocks.
    pub depth: usize,
    /// Channel growth per level down. Widths are truncated after every step.
    pub growth_rate: f64,
    pub activation: Activation,
    /// Dropout after the first convolution of the bottom blocks (and every block
    /// when `dropout_every_level` is set).
    pub dropout: f64,
    pub dropout_every_level: bool,
    pub batch_norm: bool,
    pub downsample: Downsample,
    pub upsample: Upsample,
    pub block_mode: BlockMode,
    /// Build the auxiliary decoder path and output head.
    pub aux_head: bool,
    pub convs_per_block: usize,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            dims: SpatialDims::Three,
            in_channels: 1,
            out_channels: 1,
            start_channels: 64,
            depth: 4,
            growth_rate: 2.0,
            activation: Activation::Relu,
            dropout: 0.5,
            dropout_every_level: false,
            batch_norm: true,
            downsample: Downsample::MaxPool,
            upsample: Upsample::Resize,
            block_mode: BlockMode::Plain,
            aux_head: true,
            convs_per_block: 2,
        }
    }
}

/// Width of the conv blocks `level` steps below the top.
///
/// Growth is applied one level at a time and truncated each step, so a
/// non-integer rate compounds the rounding.
pub fn level_width(start: usize, rate: f64, level: usize) -> usize {
    let mut width = start;
    for _ in 0..level {
        width = (width as f64 * rate) as usize;
    }
    width
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_width_truncates_every_step() {
        assert_eq!(level_width(16, 2.0, 0), 16);
        assert_eq!(level_width(16, 2.0, 3), 128);
        // 10 -> 15 -> 22
        assert_eq!(level_width(10, 1.5, 2), 22);
        assert_eq!(level_width(3, 1.5, 2), 6);
    }

    #[test]
    fn planar_kernels_are_flat() {
        assert_eq!(SpatialDims::Two.kernel(3), [1, 3, 3]);
        assert_eq!(SpatialDims::Three.kernel(3), [3, 3, 3]);
    }
}
