use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv3d, Conv3dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, PaddingConfig3d};
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::module::{interpolate, max_pool2d};
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::Tensor;

use crate::config::{Activation, UNetConfig};
use crate::plan::{
    ArchitecturePlan, ArchitectureResult, BlockPlan, ConvPlan, DownPlan, LevelPlan, NodeShape,
    UpPlan,
};

/// Fold depth into batch so 2D ops can run slice by slice: `[b, c, d, h, w] -> [b*d, c, h, w]`.
fn fold_depth<B: Backend>(x: Tensor<B, 5>) -> (Tensor<B, 4>, usize) {
    let [b, c, d, h, w] = x.dims();
    (x.swap_dims(1, 2).reshape([b * d, c, h, w]), d)
}

fn unfold_depth<B: Backend>(x: Tensor<B, 4>, depth: usize) -> Tensor<B, 5> {
    let [bd, c, h, w] = x.dims();
    x.reshape([bd / depth, depth, c, h, w]).swap_dims(1, 2)
}

fn conv3d<B: Backend>(plan: &ConvPlan, device: &B::Device) -> Conv3d<B> {
    // Odd kernels keep their size; even kernels run valid and the caller pads.
    let pad = |k: usize| if k % 2 == 1 { k / 2 } else { 0 };
    let [kd, kh, kw] = plan.kernel;
    let padding = PaddingConfig3d::Explicit(pad(kd), pad(kh), pad(kw));
    Conv3dConfig::new([plan.in_channels, plan.out_channels], plan.kernel)
        .with_stride(plan.stride)
        .with_padding(padding)
        .init(device)
}

#[derive(Debug, Module)]
pub struct ConvBlock<B: Backend> {
    convs: Vec<Conv3d<B>>,
    norms: Vec<BatchNorm<B, 3>>,
    dropout: Option<Dropout>,
    activation: Ignored<Activation>,
    residual: bool,
}

impl<B: Backend> ConvBlock<B> {
    fn new(plan: &BlockPlan, activation: Activation, device: &B::Device) -> Self {
        let convs = plan.convs.iter().map(|c| conv3d(c, device)).collect();
        let norms = if plan.batch_norm {
            plan.convs
                .iter()
                .map(|c| BatchNormConfig::new(c.out_channels).init(device))
                .collect()
        } else {
            Vec::new()
        };
        Self {
            convs,
            norms,
            dropout: plan.dropout.map(|p| DropoutConfig::new(p).init()),
            activation: Ignored(activation),
            residual: plan.residual,
        }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let mut x = input.clone();
        for (i, conv) in self.convs.iter().enumerate() {
            x = self.activation.apply(conv.forward(x));
            if let Some(norm) = self.norms.get(i) {
                x = norm.forward(x);
            }
            if i == 0 {
                if let Some(dropout) = &self.dropout {
                    x = dropout.forward(x);
                }
            }
        }
        if self.residual {
            Tensor::cat(vec![input, x], 1)
        } else {
            x
        }
    }
}

#[derive(Debug, Module)]
pub struct DownLayer<B: Backend> {
    /// `None` means max pooling.
    strided: Option<Conv3d<B>>,
}

impl<B: Backend> DownLayer<B> {
    fn new(plan: &DownPlan, device: &B::Device) -> Self {
        let strided = match plan {
            DownPlan::MaxPool { .. } => None,
            DownPlan::StridedConv { conv, .. } => Some(conv3d(conv, device)),
        };
        Self { strided }
    }

    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        match &self.strided {
            Some(conv) => conv.forward(x),
            None => {
                let (x, depth) = fold_depth(x);
                unfold_depth(max_pool2d(x, [2, 2], [2, 2], [0, 0], [1, 1]), depth)
            }
        }
    }
}

#[derive(Debug, Module)]
pub struct UpLayer<B: Backend> {
    resize_conv: Option<Conv3d<B>>,
    transposed: Option<ConvTranspose2d<B>>,
    activation: Ignored<Activation>,
}

impl<B: Backend> UpLayer<B> {
    fn new(plan: &UpPlan, activation: Activation, device: &B::Device) -> Self {
        let (resize_conv, transposed) = match plan {
            UpPlan::Resize { conv, .. } => (Some(conv3d(conv, device)), None),
            UpPlan::Transposed { conv, .. } => {
                let layer = ConvTranspose2dConfig::new([conv.in_channels, conv.out_channels], [2, 2])
                    .with_stride([2, 2])
                    .init(device);
                (None, Some(layer))
            }
        };
        Self {
            resize_conv,
            transposed,
            activation: Ignored(activation),
        }
    }

    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let (x, depth) = fold_depth(x);
        let [_, _, h, w] = x.dims();
        if let Some(transposed) = &self.transposed {
            return self
                .activation
                .apply(unfold_depth(transposed.forward(x), depth));
        }
        let x = interpolate(
            x,
            [h * 2, w * 2],
            InterpolateOptions::new(InterpolateMode::Nearest),
        );
        // 2-wide "same" convolution pads only after the data.
        let x = unfold_depth(x.pad((0, 1, 0, 1), 0.0), depth);
        match &self.resize_conv {
            Some(conv) => self.activation.apply(conv.forward(x)),
            None => x,
        }
    }
}

/// One level of the U with everything except the level below it.
#[derive(Debug, Module)]
pub struct LevelBlock<B: Backend> {
    encoder: ConvBlock<B>,
    down: DownLayer<B>,
    up: UpLayer<B>,
    decoder: ConvBlock<B>,
    aux_up: Option<UpLayer<B>>,
    aux_decoder: Option<ConvBlock<B>>,
}

/// Sigmoid maps from both heads. `aux` is `None` when the auxiliary head is disabled.
#[derive(Debug, Clone)]
pub struct UNetOutput<B: Backend> {
    pub main: Tensor<B, 5>,
    pub aux: Option<Tensor<B, 5>>,
}

#[derive(Debug, Module)]
pub struct UNet<B: Backend> {
    levels: Vec<LevelBlock<B>>,
    bottom_main: ConvBlock<B>,
    bottom_aux: Option<ConvBlock<B>>,
    main_head: Conv3d<B>,
    aux_head: Option<Conv3d<B>>,
    plan: Ignored<ArchitecturePlan>,
}

impl<B: Backend> UNet<B> {
    /// Plan the network for `input` and allocate its layers on `device`.
    pub fn new(cfg: &UNetConfig, input: NodeShape, device: &B::Device) -> ArchitectureResult<Self> {
        let plan = cfg.plan(input)?;
        Ok(Self::from_plan(plan, cfg.activation, device))
    }

    pub fn from_plan(plan: ArchitecturePlan, activation: Activation, device: &B::Device) -> Self {
        let mut levels = Vec::with_capacity(plan.depth());
        let mut node = &plan.levels;
        let (bottom_main, bottom_aux) = loop {
            match node {
                LevelPlan::Inner(inner) => {
                    levels.push(LevelBlock {
                        encoder: ConvBlock::new(&inner.encoder, activation, device),
                        down: DownLayer::new(&inner.down, device),
                        up: UpLayer::new(&inner.up, activation, device),
                        decoder: ConvBlock::new(&inner.decoder, activation, device),
                        aux_up: inner
                            .aux
                            .as_ref()
                            .map(|a| UpLayer::new(&a.up, activation, device)),
                        aux_decoder: inner
                            .aux
                            .as_ref()
                            .map(|a| ConvBlock::new(&a.decoder, activation, device)),
                    });
                    node = &inner.inner;
                }
                LevelPlan::Terminal { main, aux, .. } => {
                    break (
                        ConvBlock::new(main, activation, device),
                        aux.as_ref().map(|a| ConvBlock::new(a, activation, device)),
                    );
                }
            }
        };
        let main_head = conv3d(&plan.main_head, device);
        let aux_head = plan.aux_head.as_ref().map(|h| conv3d(h, device));
        Self {
            levels,
            bottom_main,
            bottom_aux,
            main_head,
            aux_head,
            plan: Ignored(plan),
        }
    }

    pub fn plan(&self) -> &ArchitecturePlan {
        &self.plan
    }

    /// Input: `[batch, channels, depth, height, width]`.
    pub fn forward(&self, input: Tensor<B, 5>) -> UNetOutput<B> {
        let (main, aux) = self.forward_level(0, input);
        let main = sigmoid(self.main_head.forward(main));
        let aux = match (aux, &self.aux_head) {
            (Some(aux), Some(head)) => Some(sigmoid(head.forward(aux))),
            _ => None,
        };
        UNetOutput { main, aux }
    }

    fn forward_level(&self, idx: usize, x: Tensor<B, 5>) -> (Tensor<B, 5>, Option<Tensor<B, 5>>) {
        let Some(level) = self.levels.get(idx) else {
            let aux = self.bottom_aux.as_ref().map(|block| block.forward(x.clone()));
            return (self.bottom_main.forward(x), aux);
        };

        let skip = level.encoder.forward(x);
        let (inner_main, inner_aux) = self.forward_level(idx + 1, level.down.forward(skip.clone()));

        let up = level.up.forward(inner_main);
        let main = level
            .decoder
            .forward(Tensor::cat(vec![skip.clone(), up], 1));

        let aux = match (inner_aux, &level.aux_up, &level.aux_decoder) {
            (Some(inner_aux), Some(aux_up), Some(aux_decoder)) => {
                let up = aux_up.forward(inner_aux);
                Some(aux_decoder.forward(Tensor::cat(vec![skip, up], 1)))
            }
            _ => None,
        };
        (main, aux)
    }
}
