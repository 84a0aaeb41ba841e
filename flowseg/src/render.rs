//! # Motion mask rendering

use crate::error::{Error, Result};
use crate::frame::frame_dim;
use crate::mask::{MotionMask, FOREGROUND};
use opencv::core::{self, Mat, Vector, CV_32F, CV_8U};
use opencv::imgproc;
use opencv::prelude::*;

/// Multiplier taking unit range HSV channels to bytes.
pub const BYTE_SCALE: f64 = 255.0;

/// How the motion mask is presented.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderMode {
    /// Single channel image, 255 where motion is present.
    Binary,
    /// BGR image, hue encodes flow direction and value encodes presence of motion.
    FlowColor,
}

impl RenderMode {
    pub fn from_binary_flag(binary: bool) -> Self {
        if binary {
            Self::Binary
        } else {
            Self::FlowColor
        }
    }
}

/// Turns motion masks into displayable frames.
#[derive(Clone, Copy, Debug)]
pub struct FrameRenderer {
    mode: RenderMode,
}

impl FrameRenderer {
    pub fn new(mode: RenderMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    /// Render the mask at its own dimensions.
    ///
    /// # Arguments
    ///
    /// * `mask` - cleaned up motion mask.
    /// * `angle` - scaled flow direction, co-sized with the mask. Ignored in binary mode.
    pub fn render(&self, mask: &MotionMask, angle: &Mat) -> Result<Mat> {
        match self.mode {
            RenderMode::Binary => {
                let mut output = Mat::default();
                mask.as_mat().convert_to(&mut output, CV_8U, 1.0, 0.0)?;
                Ok(output)
            }
            RenderMode::FlowColor => {
                let hsv = self.compose_hsv(mask, angle)?;
                let mut output = Mat::default();
                imgproc::cvt_color(&hsv, &mut output, imgproc::COLOR_HSV2BGR, 0)?;
                Ok(output)
            }
        }
    }

    /// Compose the 8-bit HSV image of the flow colored mode.
    ///
    /// Hue is the scaled angle, saturation is full and value is the mask.
    pub fn compose_hsv(&self, mask: &MotionMask, angle: &Mat) -> Result<Mat> {
        let (left, right) = (mask.dim(), frame_dim(angle));

        if left != right {
            return Err(Error::DimensionMismatch { left, right });
        }

        let mut hue = Mat::default();
        angle.convert_to(&mut hue, CV_32F, 1.0, 0.0)?;

        let saturation = Mat::ones_size(hue.size()?, CV_32F)?.to_mat()?;

        let mut value = Mat::default();
        mask.as_mat()
            .convert_to(&mut value, CV_32F, 1.0 / FOREGROUND as f64, 0.0)?;

        let mut channels = Vector::<Mat>::new();
        channels.push(hue);
        channels.push(saturation);
        channels.push(value);

        let mut hsv = Mat::default();
        core::merge(&channels, &mut hsv)?;

        let mut hsv8 = Mat::default();
        hsv.convert_to(&mut hsv8, CV_8U, BYTE_SCALE, 0.0)?;

        Ok(hsv8)
    }
}
