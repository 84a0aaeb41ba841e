//! # Optical Flow Segmentation Library
//!
//! This library segments moving regions of a video. Dense optical flow is computed between pairs
//! of consecutive frames, thresholded by magnitude and cleaned up with morphological operators,
//! and the resulting motion mask is rendered either as a binary image or coloured by the flow
//! direction.
//!
//! The easiest way to use the library is to import its prelude:
//!
//! ```
//! use flowseg::prelude::v1::*;
//! ```
//!
//! Frames and all derived grids are [`opencv`](https://crates.io/crates/opencv) `Mat`s.

pub mod error;
pub mod flow;
pub mod frame;
pub mod mask;
pub mod pipeline;
pub mod properties;
pub mod render;

pub use error::{Error, Result};

pub mod prelude {
    pub mod v1 {
        pub use crate::{
            error::{Error, Result},
            flow::{FarnebackEstimator, FlowEstimator, FlowField},
            frame::{frame_dim, prepare_gray, scaled_dim},
            mask::{MotionMask, MotionMaskBuilder, MotionRegion, PolarDecomposition},
            pipeline::{
                CancellationCheck, FrameSink, FrameSource, NeverCancel, PipelineStage,
                RunSummary, SegmentationConfig, SegmentationPipeline,
            },
            properties::{Properties, Property, PropertyMut},
            render::{FrameRenderer, RenderMode},
        };
    }
}
