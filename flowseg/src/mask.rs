//! # Motion mask extraction
//!
//! A flow field is split into magnitude and direction. Magnitude is thresholded into a binary
//! mask, which is then cleaned up by a fixed dilate, erode, dilate sequence of rectangular
//! structuring elements. The erosion removes every blob smaller than its element, the final
//! dilation restores surviving regions to roughly their original extent.

use crate::error::{Error, Result};
use crate::flow::FlowField;
use crate::frame::frame_dim;
use crate::properties::{Properties, PropertyMut};
use anyhow::anyhow;
use opencv::core::{self, Mat, Point, Size, Vector, BORDER_CONSTANT, CV_32F, CV_8U, CV_8UC1};
use opencv::imgproc;
use opencv::prelude::*;

/// Magnitude above which a pixel is considered moving.
pub const DEFAULT_MAGNITUDE_THRESHOLD: f64 = 2.0;
/// Radius of the dilation joining fragmented motion.
pub const DEFAULT_NOISE_DILATE_RADIUS: usize = 2;
/// Radius of the erosion removing small blobs.
pub const DEFAULT_EROSION_RADIUS: usize = 12;
/// Radius of the dilation restoring surviving regions.
pub const DEFAULT_RESTORE_DILATE_RADIUS: usize = 10;
/// Factor mapping flow direction in degrees into the hue range of 8-bit HSV images.
pub const ANGLE_SCALE: f32 = (1.0 / 360.0) * (180.0 / 255.0);
/// Value of foreground pixels.
pub const FOREGROUND: u8 = 255;

/// Flow field in polar form.
pub struct PolarDecomposition {
    /// Length of each flow vector.
    pub magnitude: Mat,
    /// Direction of each flow vector, in degrees multiplied by [`ANGLE_SCALE`].
    pub angle: Mat,
}

/// Single channel mask of moving pixels, each either 0 or [`FOREGROUND`].
pub struct MotionMask {
    mask: Mat,
}

/// 8-connected region of foreground pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotionRegion {
    /// Number of pixels in the region.
    pub area: usize,
    /// Top-left corner of the bounding box.
    pub min: (usize, usize),
    /// Bottom-right corner of the bounding box, inclusive.
    pub max: (usize, usize),
}

impl MotionMask {
    /// Wrap an 8-bit single channel matrix.
    pub fn from_mat(mask: Mat) -> Result<Self> {
        if mask.typ() != CV_8UC1 {
            return Err(Error::Other(anyhow!(
                "motion mask must be of CV_8UC1 type, got {}",
                mask.typ()
            )));
        }

        Ok(Self { mask })
    }

    /// Get width and height of the mask.
    pub fn dim(&self) -> (usize, usize) {
        frame_dim(&self.mask)
    }

    /// Check whether the pixel at given coordinates is moving.
    pub fn is_moving(&self, x: usize, y: usize) -> bool {
        self.mask
            .at_2d::<u8>(y as _, x as _)
            .map(|v| *v != 0)
            .unwrap_or(false)
    }

    /// Number of moving pixels.
    pub fn moving_pixels(&self) -> Result<usize> {
        Ok(core::count_non_zero(&self.mask)? as usize)
    }

    /// Underlying matrix.
    pub fn as_mat(&self) -> &Mat {
        &self.mask
    }

    pub fn into_mat(self) -> Mat {
        self.mask
    }

    /// Find all 8-connected moving regions.
    ///
    /// Regions are returned in scan order of their top-most, left-most pixel.
    pub fn regions(&self) -> Vec<MotionRegion> {
        let (width, height) = self.dim();

        let mut map = (0..height)
            .map(|y| (0..width).map(|x| self.is_moving(x, y)).collect::<Vec<_>>())
            .collect::<Vec<_>>();

        let mut regions = vec![];

        for y in 0..height {
            for x in 0..width {
                if !map[y][x] {
                    continue;
                }

                let mut region = MotionRegion {
                    area: 0,
                    min: (x, y),
                    max: (x, y),
                };

                map[y][x] = false;
                let mut to_fill = vec![(x, y); 1];

                while let Some((x, y)) = to_fill.pop() {
                    region.area += 1;
                    region.min = (region.min.0.min(x), region.min.1.min(y));
                    region.max = (region.max.0.max(x), region.max.1.max(y));

                    let neighbor_offs = (-1..=1).flat_map(|x| (-1..=1).map(move |y| (x, y)));

                    // Go through each neighbor and add any unvisited moving pixels.
                    for (x, y) in neighbor_offs
                        .map(|(ox, oy)| (x as isize + ox, y as isize + oy))
                        .filter(|&(ox, oy)| {
                            (0..width as isize).contains(&ox) && (0..height as isize).contains(&oy)
                        })
                        .map(|(x, y)| (x as usize, y as usize))
                    {
                        if map[y][x] {
                            to_fill.push((x, y));
                            map[y][x] = false;
                        }
                    }
                }

                regions.push(region);
            }
        }

        regions
    }
}

/// Single morphological operation with a square structuring element of size `2 * r + 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MorphOp {
    Dilate(usize),
    Erode(usize),
}

impl MorphOp {
    /// Apply the operation to `src`.
    ///
    /// The element is anchored at its center. Pixels outside the image never contribute, so an
    /// image filled with a single value is left unchanged.
    pub fn apply(self, src: &Mat) -> Result<Mat> {
        let radius = match self {
            Self::Dilate(r) | Self::Erode(r) => r as i32,
        };

        let element = imgproc::get_structuring_element(
            imgproc::MORPH_RECT,
            Size::new(2 * radius + 1, 2 * radius + 1),
            Point::new(radius, radius),
        )?;

        let mut dst = Mat::default();
        let anchor = Point::new(-1, -1);
        let border = imgproc::morphology_default_border_value()?;

        match self {
            Self::Dilate(_) => {
                imgproc::dilate(src, &mut dst, &element, anchor, 1, BORDER_CONSTANT, border)?
            }
            Self::Erode(_) => {
                imgproc::erode(src, &mut dst, &element, anchor, 1, BORDER_CONSTANT, border)?
            }
        }

        Ok(dst)
    }
}

/// Builds cleaned up motion masks out of flow fields.
#[derive(Clone, Debug, PartialEq)]
pub struct MotionMaskBuilder {
    threshold: f64,
    noise_dilate: usize,
    erosion: usize,
    restore_dilate: usize,
}

impl Default for MotionMaskBuilder {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MAGNITUDE_THRESHOLD,
            noise_dilate: DEFAULT_NOISE_DILATE_RADIUS,
            erosion: DEFAULT_EROSION_RADIUS,
            restore_dilate: DEFAULT_RESTORE_DILATE_RADIUS,
        }
    }
}

impl Properties for MotionMaskBuilder {
    fn props_mut(&mut self) -> Vec<(&str, PropertyMut)> {
        vec![
            ("threshold", PropertyMut::float(&mut self.threshold, 0.0, 100.0)),
            ("noise_dilate", PropertyMut::usize(&mut self.noise_dilate, 0, 50)),
            ("erosion", PropertyMut::usize(&mut self.erosion, 0, 50)),
            ("restore_dilate", PropertyMut::usize(&mut self.restore_dilate, 0, 50)),
        ]
    }
}

impl MotionMaskBuilder {
    pub fn threshold(self, threshold: f64) -> Self {
        Self { threshold, ..self }
    }

    pub fn noise_dilate(self, noise_dilate: usize) -> Self {
        Self {
            noise_dilate,
            ..self
        }
    }

    pub fn erosion(self, erosion: usize) -> Self {
        Self { erosion, ..self }
    }

    pub fn restore_dilate(self, restore_dilate: usize) -> Self {
        Self {
            restore_dilate,
            ..self
        }
    }

    /// Morphological sequence applied after thresholding, in order.
    pub fn morph_sequence(&self) -> [MorphOp; 3] {
        [
            MorphOp::Dilate(self.noise_dilate),
            MorphOp::Erode(self.erosion),
            MorphOp::Dilate(self.restore_dilate),
        ]
    }

    /// Convert a flow field into magnitude and scaled angle.
    pub fn decompose(&self, flow: &FlowField) -> Result<PolarDecomposition> {
        let mut parts = Vector::<Mat>::new();
        core::split(flow.as_mat(), &mut parts)?;
        let (dx, dy) = (parts.get(0)?, parts.get(1)?);

        let mut magnitude = Mat::default();
        let mut degrees = Mat::default();
        core::cart_to_polar(&dx, &dy, &mut magnitude, &mut degrees, true)?;

        let mut angle = Mat::default();
        degrees.convert_to(&mut angle, CV_32F, ANGLE_SCALE as f64, 0.0)?;

        Ok(PolarDecomposition { magnitude, angle })
    }

    /// Mark pixels whose magnitude exceeds the threshold.
    pub fn threshold_magnitude(&self, magnitude: &Mat) -> Result<Mat> {
        let mut binary = Mat::default();
        imgproc::threshold(
            magnitude,
            &mut binary,
            self.threshold,
            FOREGROUND as f64,
            imgproc::THRESH_BINARY,
        )?;

        let mut mask = Mat::default();
        binary.convert_to(&mut mask, CV_8U, 1.0, 0.0)?;

        Ok(mask)
    }

    /// Run the morphological sequence over a binary mask.
    pub fn refine(&self, mask: Mat) -> Result<MotionMask> {
        let mask = self
            .morph_sequence()
            .into_iter()
            .try_fold(mask, |mask, op| op.apply(&mask))?;

        MotionMask::from_mat(mask)
    }

    /// Build a motion mask and the scaled flow direction from a flow field.
    pub fn build_mask(&self, flow: &FlowField) -> Result<(MotionMask, Mat)> {
        let PolarDecomposition { magnitude, angle } = self.decompose(flow)?;
        let mask = self.refine(self.threshold_magnitude(&magnitude)?)?;
        Ok((mask, angle))
    }
}
