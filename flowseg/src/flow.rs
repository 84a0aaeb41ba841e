//! # Dense optical flow estimation

use crate::error::{Error, Result};
use crate::frame::frame_dim;
use crate::properties::{Properties, PropertyMut};
use anyhow::anyhow;
use log::*;
use nalgebra as na;
use opencv::core::{Mat, Point2f, Scalar, CV_32FC2};
use opencv::prelude::*;
use opencv::video::{calc_optical_flow_farneback, OPTFLOW_FARNEBACK_GAUSSIAN};

/// Image scale between consecutive pyramid levels.
pub const DEFAULT_PYR_SCALE: f64 = 0.5;
/// Number of pyramid levels, including the initial image.
pub const DEFAULT_LEVELS: usize = 4;
/// Averaging window size.
pub const DEFAULT_WIN_SIZE: usize = 25;
/// Iterations at each pyramid level.
pub const DEFAULT_ITERATIONS: usize = 2;
/// Pixel neighborhood used for polynomial expansion.
pub const DEFAULT_POLY_N: usize = 7;
/// Gaussian standard deviation used to smooth derivatives for polynomial expansion.
pub const DEFAULT_POLY_SIGMA: f64 = 1.2;
/// Use a Gaussian window instead of a box filter.
pub const DEFAULT_GAUSSIAN_WINDOW: bool = true;

/// Dense optical flow field.
///
/// Holds one `(dx, dy)` displacement per pixel of the frame pair it was computed from.
pub struct FlowField {
    flow: Mat,
}

impl FlowField {
    /// Wrap a two-channel 32-bit float matrix.
    pub fn from_mat(flow: Mat) -> Result<Self> {
        if flow.typ() != CV_32FC2 {
            return Err(Error::Other(anyhow!(
                "flow field must be of CV_32FC2 type, got {}",
                flow.typ()
            )));
        }

        Ok(Self { flow })
    }

    /// Create a flow field by evaluating `f(x, y)` at every pixel.
    ///
    /// # Arguments
    ///
    /// * `width` - width of the field.
    /// * `height` - height of the field.
    /// * `f` - motion at given coordinates.
    pub fn from_fn(
        width: usize,
        height: usize,
        mut f: impl FnMut(usize, usize) -> na::Vector2<f32>,
    ) -> Result<Self> {
        let mut flow =
            Mat::new_rows_cols_with_default(height as _, width as _, CV_32FC2, Scalar::all(0.0))?;

        for y in 0..height {
            for x in 0..width {
                let motion = f(x, y);
                let pt = flow.at_2d_mut::<Point2f>(y as _, x as _)?;
                pt.x = motion.x;
                pt.y = motion.y;
            }
        }

        Ok(Self { flow })
    }

    /// Get width and height of the flow field.
    pub fn dim(&self) -> (usize, usize) {
        frame_dim(&self.flow)
    }

    /// Get number of vectors in the field.
    ///
    /// This is the same as `width * height`
    pub fn size(&self) -> usize {
        let (w, h) = self.dim();
        w * h
    }

    /// Get motion at coordinates.
    ///
    /// Coordinates outside the field yield zero motion.
    ///
    /// # Arguments
    ///
    /// * `x` - horizontal coordinate.
    /// * `y` - vertical coordinate.
    pub fn get_motion(&self, x: usize, y: usize) -> na::Vector2<f32> {
        self.flow
            .at_2d::<Point2f>(y as _, x as _)
            .map(|pt| na::Vector2::new(pt.x, pt.y))
            .unwrap_or_else(|_| na::Vector2::zeros())
    }

    /// Iterate every element of the flow field in row-major order.
    ///
    /// The resulting iterator yields `(x, y, motion)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, na::Vector2<f32>)> + '_ {
        let (width, height) = self.dim();
        (0..height).flat_map(move |y| (0..width).map(move |x| (x, y, self.get_motion(x, y))))
    }

    /// Underlying two-channel matrix.
    pub fn as_mat(&self) -> &Mat {
        &self.flow
    }
}

/// Dense optical flow estimator.
pub trait FlowEstimator {
    /// Estimate per-pixel displacement from `prev` to `next`.
    ///
    /// Both frames must be single-channel and of identical dimensions. The resulting field has
    /// the same dimensions as the inputs.
    fn estimate_flow(&mut self, prev: &Mat, next: &Mat) -> Result<FlowField>;
}

/// Gunnar Farneback's polynomial expansion based flow estimator.
///
/// The defaults are the tuned constants used for segmentation, changing them alters the output.
#[derive(Clone, Debug, PartialEq)]
pub struct FarnebackEstimator {
    pyr_scale: f64,
    levels: usize,
    win_size: usize,
    iterations: usize,
    poly_n: usize,
    poly_sigma: f64,
    gaussian_window: bool,
}

impl Default for FarnebackEstimator {
    fn default() -> Self {
        Self {
            pyr_scale: DEFAULT_PYR_SCALE,
            levels: DEFAULT_LEVELS,
            win_size: DEFAULT_WIN_SIZE,
            iterations: DEFAULT_ITERATIONS,
            poly_n: DEFAULT_POLY_N,
            poly_sigma: DEFAULT_POLY_SIGMA,
            gaussian_window: DEFAULT_GAUSSIAN_WINDOW,
        }
    }
}

impl Properties for FarnebackEstimator {
    fn props_mut(&mut self) -> Vec<(&str, PropertyMut)> {
        vec![
            ("pyr_scale", PropertyMut::float(&mut self.pyr_scale, 0.1, 0.9)),
            ("levels", PropertyMut::usize(&mut self.levels, 1, 10)),
            ("win_size", PropertyMut::usize(&mut self.win_size, 3, 101)),
            ("iterations", PropertyMut::usize(&mut self.iterations, 1, 20)),
            ("poly_n", PropertyMut::usize(&mut self.poly_n, 5, 7)),
            ("poly_sigma", PropertyMut::float(&mut self.poly_sigma, 0.5, 3.0)),
            ("gaussian_window", PropertyMut::bool(&mut self.gaussian_window)),
        ]
    }
}

impl FarnebackEstimator {
    pub fn pyr_scale(self, pyr_scale: f64) -> Self {
        Self { pyr_scale, ..self }
    }

    pub fn levels(self, levels: usize) -> Self {
        Self { levels, ..self }
    }

    pub fn win_size(self, win_size: usize) -> Self {
        Self { win_size, ..self }
    }

    pub fn iterations(self, iterations: usize) -> Self {
        Self { iterations, ..self }
    }

    pub fn poly_n(self, poly_n: usize) -> Self {
        Self { poly_n, ..self }
    }

    pub fn poly_sigma(self, poly_sigma: f64) -> Self {
        Self { poly_sigma, ..self }
    }

    pub fn gaussian_window(self, gaussian_window: bool) -> Self {
        Self {
            gaussian_window,
            ..self
        }
    }

    fn flags(&self) -> i32 {
        if self.gaussian_window {
            OPTFLOW_FARNEBACK_GAUSSIAN
        } else {
            0
        }
    }
}

impl FlowEstimator for FarnebackEstimator {
    fn estimate_flow(&mut self, prev: &Mat, next: &Mat) -> Result<FlowField> {
        let (left, right) = (frame_dim(prev), frame_dim(next));

        if left != right {
            return Err(Error::DimensionMismatch { left, right });
        }

        if prev.channels() != 1 || next.channels() != 1 {
            return Err(Error::Other(anyhow!(
                "flow estimation requires single-channel frames"
            )));
        }

        let mut flow = Mat::default();

        calc_optical_flow_farneback(
            prev,
            next,
            &mut flow,
            self.pyr_scale,
            self.levels as _,
            self.win_size as _,
            self.iterations as _,
            self.poly_n as _,
            self.poly_sigma,
            self.flags(),
        )?;

        trace!("estimated {}x{} flow field", left.0, left.1);

        FlowField::from_mat(flow)
    }
}
