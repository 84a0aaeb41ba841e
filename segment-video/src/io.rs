//! OpenCV backed frame source and sinks.

use anyhow::anyhow;
use flowseg::prelude::v1::*;
use log::*;
use opencv::core::{Mat, Size};
use opencv::highgui;
use opencv::prelude::*;
use opencv::videoio::*;
use std::path::{Path, PathBuf};

/// Frame rate of written videos.
pub const OUTPUT_FPS: f64 = 30.0;

/// Key codes that stop the run.
const QUIT_KEYS: [i32; 2] = ['q' as i32, 27];

/// Video file decoded through OpenCV.
pub struct VideoFileSource {
    capture: VideoCapture,
}

impl VideoFileSource {
    pub fn open(path: &str) -> Result<Self> {
        let capture = VideoCapture::from_file(path, CAP_ANY)?;

        if !capture.is_opened()? {
            return Err(Error::SourceUnavailable(format!("unable to open {path}")));
        }

        Ok(Self { capture })
    }

    /// Resolution reported by the container.
    pub fn resolution(&self) -> Result<(usize, usize)> {
        Ok((
            self.capture.get(CAP_PROP_FRAME_WIDTH)? as usize,
            self.capture.get(CAP_PROP_FRAME_HEIGHT)? as usize,
        ))
    }

    pub fn framerate(&self) -> Option<f64> {
        self.capture.get(CAP_PROP_FPS).ok().filter(|fps| *fps > 0.0)
    }
}

impl FrameSource for VideoFileSource {
    fn read_frame(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();

        if !self.capture.read(&mut frame)? || frame_dim(&frame).0 == 0 {
            return Ok(None);
        }

        Ok(Some(frame))
    }
}

/// Motion-JPEG encoded video file.
///
/// The writer is opened on the first emitted frame and takes its size from it.
/// Every later frame must match that size, since OpenCV drops mismatched frames
/// without reporting it.
pub struct VideoFileSink {
    writer: Option<(VideoWriter, (usize, usize))>,
    path: PathBuf,
    is_color: bool,
}

impl VideoFileSink {
    /// Prepare the file, along with any missing parent directories.
    ///
    /// # Arguments
    ///
    /// * `path` - output file.
    /// * `is_color` - whether frames have three channels.
    pub fn create(path: impl AsRef<Path>, is_color: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if path.to_str().is_none() {
            return Err(Error::Config(format!("non UTF-8 output path {path:?}")));
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::Other(e.into()))?;
        }

        Ok(Self {
            writer: None,
            path,
            is_color,
        })
    }

    fn open(&self, dim: (usize, usize)) -> Result<VideoWriter> {
        let name = self.path.to_string_lossy();

        let writer = VideoWriter::new(
            &name,
            VideoWriter::fourcc('M', 'J', 'P', 'G')?,
            OUTPUT_FPS,
            Size::new(dim.0 as _, dim.1 as _),
            self.is_color,
        )?;

        if !writer.is_opened()? {
            return Err(Error::Other(anyhow!("unable to open {name} for writing")));
        }

        info!("writing {}x{} video to {}", dim.0, dim.1, self.path.display());

        Ok(writer)
    }
}

impl FrameSink for VideoFileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn emit(&mut self, frame: &Mat) -> Result<()> {
        let dim = frame_dim(frame);

        if self.writer.is_none() {
            self.writer = Some((self.open(dim)?, dim));
        }

        match &mut self.writer {
            Some((_, expected)) if *expected != dim => Err(Error::DimensionMismatch {
                left: *expected,
                right: dim,
            }),
            Some((writer, _)) => Ok(writer.write(frame)?),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some((mut writer, _)) = self.writer.take() {
            writer.release()?;
            debug!("closed {}", self.path.display());
        }
        Ok(())
    }
}

/// HighGUI window showing every emitted frame.
pub struct WindowSink {
    title: String,
}

impl WindowSink {
    pub fn new(title: &str) -> Result<Self> {
        highgui::named_window(title, highgui::WINDOW_AUTOSIZE)?;

        Ok(Self {
            title: title.to_string(),
        })
    }
}

impl FrameSink for WindowSink {
    fn name(&self) -> &str {
        "display"
    }

    fn emit(&mut self, frame: &Mat) -> Result<()> {
        highgui::imshow(&self.title, frame)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        highgui::destroy_all_windows()?;
        Ok(())
    }
}

/// Stops the run when `q` or Esc is pressed in a HighGUI window.
///
/// Polling also lets the window process its events.
pub struct KeyboardCancel;

impl CancellationCheck for KeyboardCancel {
    fn should_stop(&mut self) -> Result<bool> {
        let key = highgui::wait_key(1)?;
        Ok(QUIT_KEYS.contains(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    fn output_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("segment-video-{}", std::process::id()))
            .join(name)
    }

    fn frame(width: usize, height: usize) -> Mat {
        Mat::new_rows_cols_with_default(height as _, width as _, CV_8UC3, Scalar::all(90.0))
            .unwrap()
    }

    #[test]
    fn writer_takes_size_from_first_frame() {
        let path = output_path("sized.avi");
        let mut sink = VideoFileSink::create(&path, true).unwrap();

        for _ in 0..3 {
            sink.emit(&frame(64, 48)).unwrap();
        }
        sink.close().unwrap();

        let capture = VideoCapture::from_file(path.to_str().unwrap(), CAP_ANY).unwrap();
        assert!(capture.is_opened().unwrap());
        assert_eq!(capture.get(CAP_PROP_FRAME_WIDTH).unwrap() as usize, 64);
        assert_eq!(capture.get(CAP_PROP_FRAME_HEIGHT).unwrap() as usize, 48);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn resized_frames_are_rejected() {
        let path = output_path("rotated.avi");
        let mut sink = VideoFileSink::create(&path, true).unwrap();

        sink.emit(&frame(64, 48)).unwrap();

        match sink.emit(&frame(48, 64)) {
            Err(Error::DimensionMismatch { left, right }) => {
                assert_eq!(left, (64, 48));
                assert_eq!(right, (48, 64));
            }
            r => panic!("unexpected result {:?}", r),
        }

        sink.close().unwrap();
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn no_file_without_frames() {
        let path = output_path("empty.avi");
        let mut sink = VideoFileSink::create(&path, false).unwrap();
        sink.close().unwrap();
        assert!(!path.exists());
    }
}
