//! Backend-free description of the U-Net.
//!
//! `UNetConfig::plan` walks the levels recursively and records every layer together
//! with the shape it produces. The Burn modules in [`crate::unet`] are lowered from
//! this tree, and the shape bookkeeping can be checked without allocating weights.

use crate::config::{level_width, Activation, BlockMode, Downsample, SpatialDims, UNetConfig, Upsample};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ArchitectureResult<T> = Result<T, ArchitectureError>;

#[derive(Debug, Error, PartialEq)]
pub enum ArchitectureError {
    #[error("a {dims:?} U-Net of depth {depth} cannot be built without upsampling")]
    UpsamplingRequired { dims: SpatialDims, depth: usize },
    #[error("input shape {0:?} has an empty axis")]
    InvalidShape(NodeShape),
    #[error("zero channels at level {level} (start {start}, growth {rate})")]
    ZeroChannels { level: usize, start: usize, rate: f64 },
    #[error("planar networks need an input depth of 1, got {0}")]
    PlanarDepth(usize),
    #[error("in-plane size {height}x{width} is not divisible by {factor} (depth {depth})")]
    SpatialNotDivisible {
        height: usize,
        width: usize,
        factor: usize,
        depth: usize,
    },
    #[error("convs_per_block must be at least 1")]
    EmptyBlock,
    #[error("network expects {expected} input channels, input shape has {actual}")]
    ChannelMismatch { expected: usize, actual: usize },
}

/// Channel count and spatial extent of a tensor at one node of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeShape {
    pub channels: usize,
    pub depth: usize,
    pub height: usize,
    pub width: usize,
}

impl NodeShape {
    pub fn new(channels: usize, depth: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            depth,
            height,
            width,
        }
    }

    pub fn spatial(&self) -> [usize; 3] {
        [self.depth, self.height, self.width]
    }

    fn with_channels(self, channels: usize) -> Self {
        Self { channels, ..self }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvPlan {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: [usize; 3],
    pub stride: [usize; 3],
    /// `None` leaves the convolution linear.
    pub activation: Option<Activation>,
}

impl ConvPlan {
    pub fn parameter_count(&self) -> usize {
        let taps: usize = self.kernel.iter().product();
        self.in_channels * self.out_channels * taps + self.out_channels
    }
}

/// A conv block: `convs.len()` convolutions, each followed by optional batch
/// norm, with dropout after the first one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockPlan {
    pub convs: Vec<ConvPlan>,
    pub batch_norm: bool,
    pub dropout: Option<f64>,
    pub residual: bool,
    pub input: NodeShape,
    pub output: NodeShape,
}

impl BlockPlan {
    pub fn parameter_count(&self) -> usize {
        let convs: usize = self.convs.iter().map(ConvPlan::parameter_count).sum();
        let norms = if self.batch_norm {
            self.convs.iter().map(|c| 2 * c.out_channels).sum()
        } else {
            0
        };
        convs + norms
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownPlan {
    MaxPool { output: NodeShape },
    StridedConv { conv: ConvPlan, output: NodeShape },
}

impl DownPlan {
    pub fn output(&self) -> NodeShape {
        match self {
            DownPlan::MaxPool { output } | DownPlan::StridedConv { output, .. } => *output,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpPlan {
    Resize { conv: ConvPlan, output: NodeShape },
    Transposed { conv: ConvPlan, output: NodeShape },
}

impl UpPlan {
    pub fn output(&self) -> NodeShape {
        match self {
            UpPlan::Resize { output, .. } | UpPlan::Transposed { output, .. } => *output,
        }
    }

    pub fn conv(&self) -> &ConvPlan {
        match self {
            UpPlan::Resize { conv, .. } | UpPlan::Transposed { conv, .. } => conv,
        }
    }
}

/// The auxiliary decoder path of one level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxBranch {
    pub up: UpPlan,
    pub decoder: BlockPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerLevel {
    pub level: usize,
    pub encoder: BlockPlan,
    pub down: DownPlan,
    pub inner: LevelPlan,
    pub up: UpPlan,
    pub decoder: BlockPlan,
    pub aux: Option<AuxBranch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LevelPlan {
    Inner(Box<InnerLevel>),
    /// Bottom of the U. Main and auxiliary blocks both read the raw input and
    /// do not share weights.
    Terminal {
        level: usize,
        main: BlockPlan,
        aux: Option<BlockPlan>,
    },
}

impl LevelPlan {
    pub fn main_output(&self) -> NodeShape {
        match self {
            LevelPlan::Inner(inner) => inner.decoder.output,
            LevelPlan::Terminal { main, .. } => main.output,
        }
    }

    pub fn aux_output(&self) -> Option<NodeShape> {
        match self {
            LevelPlan::Inner(inner) => inner.aux.as_ref().map(|a| a.decoder.output),
            LevelPlan::Terminal { aux, .. } => aux.as_ref().map(|a| a.output),
        }
    }

    /// Channels produced by the conv blocks at the bottom of the U.
    pub fn bottleneck_channels(&self) -> usize {
        match self {
            LevelPlan::Inner(inner) => inner.inner.bottleneck_channels(),
            LevelPlan::Terminal { main, .. } => main.convs.last().map_or(0, |c| c.out_channels),
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            LevelPlan::Inner(inner) => 1 + inner.inner.depth(),
            LevelPlan::Terminal { .. } => 0,
        }
    }

    pub fn parameter_count(&self) -> usize {
        match self {
            LevelPlan::Inner(inner) => {
                let down = match &inner.down {
                    DownPlan::StridedConv { conv, .. } => conv.parameter_count(),
                    DownPlan::MaxPool { .. } => 0,
                };
                let aux = inner.aux.as_ref().map_or(0, |a| {
                    a.up.conv().parameter_count() + a.decoder.parameter_count()
                });
                inner.encoder.parameter_count()
                    + down
                    + inner.inner.parameter_count()
                    + inner.up.conv().parameter_count()
                    + inner.decoder.parameter_count()
                    + aux
            }
            LevelPlan::Terminal { main, aux, .. } => {
                main.parameter_count() + aux.as_ref().map_or(0, BlockPlan::parameter_count)
            }
        }
    }
}

/// Full description of a U-Net: the recursive level tree plus the sigmoid heads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitecturePlan {
    pub dims: SpatialDims,
    pub input: NodeShape,
    pub levels: LevelPlan,
    pub main_head: ConvPlan,
    pub aux_head: Option<ConvPlan>,
}

impl ArchitecturePlan {
    pub fn output_shape(&self) -> NodeShape {
        self.levels
            .main_output()
            .with_channels(self.main_head.out_channels)
    }

    pub fn aux_output_shape(&self) -> Option<NodeShape> {
        let head = self.aux_head.as_ref()?;
        self.levels
            .aux_output()
            .map(|shape| shape.with_channels(head.out_channels))
    }

    pub fn bottleneck_channels(&self) -> usize {
        self.levels.bottleneck_channels()
    }

    pub fn aux_enabled(&self) -> bool {
        self.aux_head.is_some()
    }

    pub fn depth(&self) -> usize {
        self.levels.depth()
    }

    pub fn parameter_count(&self) -> usize {
        self.levels.parameter_count()
            + self.main_head.parameter_count()
            + self.aux_head.as_ref().map_or(0, ConvPlan::parameter_count)
    }
}

impl UNetConfig {
    /// Build the architecture plan for inputs of the given shape.
    ///
    /// Height and width must be divisible by `2^depth` so every upsampled tensor
    /// lines up with its skip connection.
    pub fn plan(&self, input: NodeShape) -> ArchitectureResult<ArchitecturePlan> {
        self.validate(input)?;
        let builder = PlanBuilder { cfg: self };
        let levels = builder.level(input, self.start_channels, self.depth, 0)?;
        let main_head = builder.head(levels.main_output().channels);
        let aux_head = levels
            .aux_output()
            .map(|shape| builder.head(shape.channels));
        Ok(ArchitecturePlan {
            dims: self.dims,
            input,
            levels,
            main_head,
            aux_head,
        })
    }

    fn validate(&self, input: NodeShape) -> ArchitectureResult<()> {
        let downsamples = self.depth > 0;
        if self.upsample == Upsample::Disabled
            && (self.dims == SpatialDims::Three || downsamples)
        {
            return Err(ArchitectureError::UpsamplingRequired {
                dims: self.dims,
                depth: self.depth,
            });
        }
        if input.channels == 0 || input.depth == 0 || input.height == 0 || input.width == 0 {
            return Err(ArchitectureError::InvalidShape(input));
        }
        if input.channels != self.in_channels {
            return Err(ArchitectureError::ChannelMismatch {
                expected: self.in_channels,
                actual: input.channels,
            });
        }
        if self.dims == SpatialDims::Two && input.depth != 1 {
            return Err(ArchitectureError::PlanarDepth(input.depth));
        }
        if self.convs_per_block == 0 {
            return Err(ArchitectureError::EmptyBlock);
        }
        for level in 0..=self.depth {
            if level_width(self.start_channels, self.growth_rate, level) == 0 {
                return Err(ArchitectureError::ZeroChannels {
                    level,
                    start: self.start_channels,
                    rate: self.growth_rate,
                });
            }
        }
        let factor = 1usize << self.depth;
        if input.height % factor != 0 || input.width % factor != 0 {
            return Err(ArchitectureError::SpatialNotDivisible {
                height: input.height,
                width: input.width,
                factor,
                depth: self.depth,
            });
        }
        Ok(())
    }
}

struct PlanBuilder<'a> {
    cfg: &'a UNetConfig,
}

impl PlanBuilder<'_> {
    fn level(
        &self,
        input: NodeShape,
        width: usize,
        remaining: usize,
        level: usize,
    ) -> ArchitectureResult<LevelPlan> {
        let every_level = self.cfg.dropout_every_level;
        if remaining == 0 {
            let main = self.block(input, width, true);
            let aux = self.cfg.aux_head.then(|| self.block(input, width, true));
            return Ok(LevelPlan::Terminal { level, main, aux });
        }

        let encoder = self.block(input, width, every_level);
        let skip = encoder.output;
        let down = self.down(skip, width);
        let next_width = (width as f64 * self.cfg.growth_rate) as usize;
        let inner = self.level(down.output(), next_width, remaining - 1, level + 1)?;

        let up = self.up(inner.main_output(), width)?;
        let merged = skip.with_channels(skip.channels + up.output().channels);
        let decoder = self.block(merged, width, every_level);

        let aux = match inner.aux_output() {
            Some(inner_aux) => {
                let up = self.up(inner_aux, width)?;
                let merged = skip.with_channels(skip.channels + up.output().channels);
                let decoder = self.block(merged, width, every_level);
                Some(AuxBranch { up, decoder })
            }
            None => None,
        };

        Ok(LevelPlan::Inner(Box::new(InnerLevel {
            level,
            encoder,
            down,
            inner,
            up,
            decoder,
            aux,
        })))
    }

    fn block(&self, input: NodeShape, width: usize, with_dropout: bool) -> BlockPlan {
        let kernel = self.cfg.dims.kernel(3);
        let convs = (0..self.cfg.convs_per_block)
            .map(|i| ConvPlan {
                in_channels: if i == 0 { input.channels } else { width },
                out_channels: width,
                kernel,
                stride: [1, 1, 1],
                activation: Some(self.cfg.activation),
            })
            .collect();
        let residual = self.cfg.block_mode == BlockMode::Residual;
        let out_channels = if residual {
            input.channels + width
        } else {
            width
        };
        let dropout = (with_dropout && self.cfg.dropout > 0.0).then_some(self.cfg.dropout);
        BlockPlan {
            convs,
            batch_norm: self.cfg.batch_norm,
            dropout,
            residual,
            input,
            output: input.with_channels(out_channels),
        }
    }

    fn down(&self, input: NodeShape, width: usize) -> DownPlan {
        match self.cfg.downsample {
            Downsample::MaxPool => DownPlan::MaxPool {
                output: NodeShape {
                    height: input.height / 2,
                    width: input.width / 2,
                    ..input
                },
            },
            Downsample::StridedConv => DownPlan::StridedConv {
                conv: ConvPlan {
                    in_channels: input.channels,
                    out_channels: width,
                    kernel: self.cfg.dims.kernel(3),
                    stride: [1, 2, 2],
                    activation: None,
                },
                output: NodeShape {
                    channels: width,
                    depth: input.depth,
                    height: input.height.div_ceil(2),
                    width: input.width.div_ceil(2),
                },
            },
        }
    }

    fn up(&self, input: NodeShape, width: usize) -> ArchitectureResult<UpPlan> {
        let output = NodeShape {
            channels: width,
            depth: input.depth,
            height: input.height * 2,
            width: input.width * 2,
        };
        match self.cfg.upsample {
            Upsample::Resize => Ok(UpPlan::Resize {
                conv: ConvPlan {
                    in_channels: input.channels,
                    out_channels: width,
                    kernel: [1, 2, 2],
                    stride: [1, 1, 1],
                    activation: Some(self.cfg.activation),
                },
                output,
            }),
            Upsample::Transposed => Ok(UpPlan::Transposed {
                conv: ConvPlan {
                    in_channels: input.channels,
                    out_channels: width,
                    kernel: [1, 2, 2],
                    stride: [1, 2, 2],
                    activation: Some(self.cfg.activation),
                },
                output,
            }),
            Upsample::Disabled => Err(ArchitectureError::UpsamplingRequired {
                dims: self.cfg.dims,
                depth: self.cfg.depth,
            }),
        }
    }

    fn head(&self, in_channels: usize) -> ConvPlan {
        ConvPlan {
            in_channels,
            out_channels: self.cfg.out_channels,
            kernel: [1, 1, 1],
            stride: [1, 1, 1],
            activation: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planar(depth: usize) -> UNetConfig {
        UNetConfig {
            dims: SpatialDims::Two,
            start_channels: 4,
            depth,
            ..Default::default()
        }
    }

    #[test]
    fn terminal_level_builds_twin_blocks() {
        let plan = planar(0).plan(NodeShape::new(1, 1, 8, 8)).unwrap();
        match plan.levels {
            LevelPlan::Terminal { main, aux, .. } => {
                let aux = aux.expect("aux head enabled by default");
                assert_eq!(main, aux);
                assert_eq!(main.dropout, Some(0.5));
            }
            other => panic!("expected terminal level, got {other:?}"),
        }
    }

    #[test]
    fn dropout_only_at_the_bottom_by_default() {
        let plan = planar(1).plan(NodeShape::new(1, 1, 8, 8)).unwrap();
        let LevelPlan::Inner(top) = &plan.levels else {
            panic!("expected inner level");
        };
        assert_eq!(top.encoder.dropout, None);
        assert_eq!(top.decoder.dropout, None);
        let LevelPlan::Terminal { main, .. } = &top.inner else {
            panic!("expected terminal level");
        };
        assert_eq!(main.dropout, Some(0.5));
    }

    #[test]
    fn residual_blocks_grow_by_their_input() {
        let cfg = UNetConfig {
            block_mode: BlockMode::Residual,
            in_channels: 2,
            ..planar(1)
        };
        let plan = cfg.plan(NodeShape::new(2, 1, 8, 8)).unwrap();
        let LevelPlan::Inner(top) = &plan.levels else {
            panic!("expected inner level");
        };
        assert_eq!(top.encoder.output.channels, 2 + 4);
        // skip (6) + upsampled (4)
        assert_eq!(top.decoder.input.channels, 10);
        assert_eq!(top.decoder.output.channels, 14);
    }

    #[test]
    fn disabled_aux_head_drops_every_aux_node() {
        let cfg = UNetConfig {
            aux_head: false,
            ..planar(2)
        };
        let plan = cfg.plan(NodeShape::new(1, 1, 16, 16)).unwrap();
        assert!(!plan.aux_enabled());
        assert!(plan.aux_output_shape().is_none());
        assert!(plan.levels.aux_output().is_none());
    }

    #[test]
    fn input_channels_must_match_the_config() {
        let err = planar(1).plan(NodeShape::new(2, 1, 8, 8)).unwrap_err();
        assert!(matches!(
            err,
            ArchitectureError::ChannelMismatch { expected: 1, actual: 2 }
        ));
    }

    #[test]
    fn odd_sizes_are_rejected() {
        let err = planar(2).plan(NodeShape::new(1, 1, 12, 10)).unwrap_err();
        assert!(matches!(
            err,
            ArchitectureError::SpatialNotDivisible { factor: 4, .. }
        ));
    }
}
