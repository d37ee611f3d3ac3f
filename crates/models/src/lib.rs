//! U-Net segmentation models for the volumetric training pipeline.
//!
//! The crate has two layers:
//! - `plan`: a backend-free, recursive description of the network (`UNetConfig::plan`).
//!   It checks the configuration against an input shape and records every layer's shape.
//! - `unet`: Burn modules lowered from a plan. `UNet::forward` returns the main
//!   segmentation map and, when enabled, the auxiliary map, both after sigmoid.
//!
//! Planar and volumetric networks share one code path: tensors are always
//! `[batch, channels, depth, height, width]` and planar kernels have depth extent 1.

pub mod config;
pub mod plan;
pub mod unet;

pub use config::{
    level_width, Activation, BlockMode, Downsample, SpatialDims, UNetConfig, Upsample,
};
pub use plan::{ArchitectureError, ArchitecturePlan, ArchitectureResult, LevelPlan, NodeShape};
pub use unet::{UNet, UNetOutput};

pub mod prelude {
    pub use super::{
        ArchitectureError, ArchitecturePlan, NodeShape, SpatialDims, UNet, UNetConfig, UNetOutput,
    };
}
