//! # Frame preparation

use crate::error::{Error, Result};
use anyhow::anyhow;
use opencv::core::{Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;

/// Get width and height of a frame.
pub fn frame_dim(frame: &Mat) -> (usize, usize) {
    (frame.cols().max(0) as usize, frame.rows().max(0) as usize)
}

/// Scale frame dimensions by a factor.
///
/// Fractional pixels are truncated, matching how output sizes are derived from the source
/// resolution.
pub fn scaled_dim((width, height): (usize, usize), scale: f64) -> (usize, usize) {
    (
        (width as f64 * scale) as usize,
        (height as f64 * scale) as usize,
    )
}

/// Downscale a frame to computation size and convert it to grayscale.
///
/// # Arguments
///
/// * `frame` - BGR, BGRA or single-channel frame.
/// * `scale` - factor applied to both dimensions.
pub fn prepare_gray(frame: &Mat, scale: f64) -> Result<Mat> {
    let (w, h) = frame_dim(frame);

    if w == 0 || h == 0 {
        return Err(Error::Other(anyhow!("cannot prepare an empty frame")));
    }

    let mut resized = Mat::default();
    imgproc::resize(
        frame,
        &mut resized,
        Size::new(0, 0),
        scale,
        scale,
        imgproc::INTER_LINEAR,
    )?;

    let code = match resized.channels() {
        1 => return Ok(resized),
        3 => imgproc::COLOR_BGR2GRAY,
        4 => imgproc::COLOR_BGRA2GRAY,
        n => return Err(Error::Other(anyhow!("unsupported channel count {n}"))),
    };

    let mut gray = Mat::default();
    imgproc::cvt_color(&resized, &mut gray, code, 0)?;

    Ok(gray)
}


#[cfg(test)]
mod tests {
    use super::test_frames::*;
    use super::*;

    #[test]
    fn scaled_dim_truncates() {
        assert_eq!(scaled_dim((101, 50), 0.6), (60, 30));
        assert_eq!(scaled_dim((640, 480), 1.0), (640, 480));
        assert_eq!(scaled_dim((1, 1), 0.5), (0, 0));
    }

    #[test]
    fn prepare_downscales_and_converts() {
        let frame = bgr_frame(100, 50, |x, _| (x * 2) as u8);
        let gray = prepare_gray(&frame, 0.6).unwrap();

        assert_eq!(frame_dim(&gray), (60, 30));
        assert_eq!(gray.channels(), 1);
    }

    #[test]
    fn prepare_keeps_gray_frames() {
        let frame = gray_frame(40, 30, |_, _| 77);
        let gray = prepare_gray(&frame, 1.0).unwrap();

        assert_eq!(frame_dim(&gray), (40, 30));
        assert_eq!(*gray.at_2d::<u8>(10, 10).unwrap(), 77);
    }

    #[test]
    fn prepare_rejects_empty() {
        assert!(prepare_gray(&Mat::default(), 1.0).is_err());
    }
}
