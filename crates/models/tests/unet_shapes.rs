use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use models::{
    ArchitectureError, BlockMode, Downsample, NodeShape, SpatialDims, UNet, UNetConfig, Upsample,
};

type TestBackend = NdArray<f32>;

fn small(dims: SpatialDims, depth: usize) -> UNetConfig {
    UNetConfig {
        dims,
        start_channels: 4,
        depth,
        dropout: 0.0,
        ..Default::default()
    }
}

fn min_max(t: Tensor<TestBackend, 5>) -> (f32, f32) {
    let min = t.clone().min().into_data().to_vec::<f32>().unwrap_or_default()[0];
    let max = t.max().into_data().to_vec::<f32>().unwrap_or_default()[0];
    (min, max)
}

#[test]
fn plan_output_matches_input_for_every_depth() {
    for depth in 0..=4 {
        let input = NodeShape::new(1, 1, 32, 32);
        let plan = small(SpatialDims::Two, depth).plan(input).unwrap();
        assert_eq!(plan.depth(), depth);
        assert_eq!(plan.output_shape(), input);
        assert_eq!(plan.aux_output_shape(), Some(input));
        assert_eq!(plan.bottleneck_channels(), 4 << depth);
    }
}

#[test]
fn growth_rate_sets_bottleneck_width() {
    let cfg = UNetConfig {
        growth_rate: 1.5,
        start_channels: 10,
        ..small(SpatialDims::Two, 2)
    };
    let plan = cfg.plan(NodeShape::new(1, 1, 16, 16)).unwrap();
    assert_eq!(plan.bottleneck_channels(), 22);
}

#[test]
fn volumetric_network_requires_upsampling() {
    let cfg = UNetConfig {
        upsample: Upsample::Disabled,
        ..small(SpatialDims::Three, 0)
    };
    let err = cfg.plan(NodeShape::new(1, 4, 8, 8)).unwrap_err();
    assert!(matches!(
        err,
        ArchitectureError::UpsamplingRequired {
            dims: SpatialDims::Three,
            ..
        }
    ));
}

#[test]
fn planar_single_level_builds_without_upsampling() {
    let cfg = UNetConfig {
        upsample: Upsample::Disabled,
        ..small(SpatialDims::Two, 0)
    };
    let plan = cfg.plan(NodeShape::new(1, 1, 8, 8)).unwrap();
    assert_eq!(plan.output_shape(), NodeShape::new(1, 1, 8, 8));
}

#[test]
fn planar_forward_keeps_spatial_shape() {
    let device = Default::default();
    let input = NodeShape::new(2, 1, 16, 16);
    let cfg = UNetConfig {
        in_channels: 2,
        ..small(SpatialDims::Two, 2)
    };
    let model = UNet::<TestBackend>::new(&cfg, input, &device).unwrap();
    let x = Tensor::<TestBackend, 5>::random(
        [3, 2, 1, 16, 16],
        burn::tensor::Distribution::Default,
        &device,
    );
    let out = model.forward(x);
    assert_eq!(out.main.dims(), [3, 1, 1, 16, 16]);
    let aux = out.aux.expect("aux head enabled");
    assert_eq!(aux.dims(), [3, 1, 1, 16, 16]);

    let (lo, hi) = min_max(out.main);
    assert!(lo >= 0.0 && hi <= 1.0);
}

#[test]
fn volumetric_forward_with_strided_and_transposed_layers() {
    let device = Default::default();
    let input = NodeShape::new(1, 3, 8, 8);
    let cfg = UNetConfig {
        downsample: Downsample::StridedConv,
        upsample: Upsample::Transposed,
        block_mode: BlockMode::Residual,
        aux_head: false,
        ..small(SpatialDims::Three, 2)
    };
    let model = UNet::<TestBackend>::new(&cfg, input, &device).unwrap();
    let x = Tensor::<TestBackend, 5>::zeros([1, 1, 3, 8, 8], &device);
    let out = model.forward(x);
    assert_eq!(out.main.dims(), [1, 1, 3, 8, 8]);
    assert!(out.aux.is_none());
}
