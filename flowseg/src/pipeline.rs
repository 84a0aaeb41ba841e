//! # Segmentation pipeline
//!
//! The pipeline pulls frames from a [`FrameSource`], skipping every other frame, and for each
//! processed pair estimates flow, builds the motion mask, renders it, scales it to the output size
//! and hands it to every [`FrameSink`]. A [`CancellationCheck`] is polled after each emitted frame.

use crate::error::{Error, Result};
use crate::flow::{FarnebackEstimator, FlowEstimator};
use crate::frame::{frame_dim, prepare_gray, scaled_dim};
use crate::mask::MotionMaskBuilder;
use crate::properties::{apply_assignment, Properties};
use crate::render::{FrameRenderer, RenderMode};
use anyhow::anyhow;
use log::*;
use opencv::core::{Mat, Size};
use opencv::imgproc;
use std::time::{Duration, Instant};

/// Default downscale factor applied before flow estimation.
pub const DEFAULT_COMPUTE_SIZE: f64 = 0.6;
/// Default scale of the output relative to the source resolution.
pub const DEFAULT_FINAL_SIZE: f64 = 1.0;

/// Sequential supplier of frames.
pub trait FrameSource {
    /// Read the next frame.
    ///
    /// End of stream is reported as `Ok(None)`, not as an error.
    fn read_frame(&mut self) -> Result<Option<Mat>>;
}

/// Consumer of rendered frames.
pub trait FrameSink {
    /// Name used in error reports.
    fn name(&self) -> &str;

    /// Accept a frame. Frames arrive in processing order.
    fn emit(&mut self, frame: &Mat) -> Result<()>;

    /// Flush and release the sink. Called exactly once, after the last frame.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Cooperative stop request, polled once per processed frame.
pub trait CancellationCheck {
    fn should_stop(&mut self) -> Result<bool>;
}

/// Cancellation check that never requests a stop.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverCancel;

impl CancellationCheck for NeverCancel {
    fn should_stop(&mut self) -> Result<bool> {
        Ok(false)
    }
}

/// Sizing and output options of a run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentationConfig {
    /// Factor applied to both frame dimensions before flow estimation.
    pub compute_size: f64,
    /// Factor applied to the source resolution to get the output resolution.
    pub final_size: f64,
    /// Emit the bare mask instead of the flow colored image.
    pub binary_output: bool,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            compute_size: DEFAULT_COMPUTE_SIZE,
            final_size: DEFAULT_FINAL_SIZE,
            binary_output: false,
        }
    }
}

impl SegmentationConfig {
    pub fn compute_size(self, compute_size: f64) -> Self {
        Self {
            compute_size,
            ..self
        }
    }

    pub fn final_size(self, final_size: f64) -> Self {
        Self { final_size, ..self }
    }

    pub fn binary_output(self, binary_output: bool) -> Self {
        Self {
            binary_output,
            ..self
        }
    }

    /// Check that both scale factors are usable.
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("compute size", self.compute_size),
            ("final size", self.final_size),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(Error::Config(format!(
                    "{name} must be a positive number, got {v}"
                )));
            }
        }

        Ok(())
    }

    /// Output resolution for a given source resolution.
    pub fn output_dim(&self, source: (usize, usize)) -> Result<(usize, usize)> {
        match scaled_dim(source, self.final_size) {
            (0, _) | (_, 0) => Err(Error::Config(format!(
                "final size {} leaves no pixels of a {}x{} source",
                self.final_size, source.0, source.1
            ))),
            dim => Ok(dim),
        }
    }
}

/// Lifecycle of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStage {
    Init,
    Running,
    Draining,
    Terminated,
}

/// State carried between cycles.
struct PipelineState {
    previous: Mat,
    index: usize,
}

/// Outcome of a completed run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    /// Number of processed frame pairs.
    pub cycles: usize,
    /// Whether the run was stopped by the cancellation check.
    pub cancelled: bool,
    /// Wall time spent from the first read until the sinks were closed.
    pub elapsed: Duration,
}

impl RunSummary {
    /// Average time taken to produce one output frame.
    pub fn average_cycle_time(&self) -> Option<Duration> {
        match self.cycles {
            0 => None,
            n => Some(match u32::try_from(n) {
                Ok(n) => self.elapsed / n,
                Err(_) => self.elapsed.div_f64(n as f64),
            }),
        }
    }
}

/// Frame stream orchestrator.
pub struct SegmentationPipeline<E = FarnebackEstimator> {
    config: SegmentationConfig,
    estimator: E,
    mask_builder: MotionMaskBuilder,
    renderer: FrameRenderer,
    stage: PipelineStage,
}

impl SegmentationPipeline<FarnebackEstimator> {
    /// Create a pipeline with the default Farneback estimator.
    pub fn new(config: SegmentationConfig) -> Result<Self> {
        Self::with_estimator(config, FarnebackEstimator::default())
    }
}

impl<E: FlowEstimator + Properties> SegmentationPipeline<E> {
    /// Apply a `name=value` tuning override to the estimator or the mask builder.
    pub fn set_prop(&mut self, assignment: &str) -> Result<()> {
        apply_assignment(
            &mut [
                &mut self.estimator as &mut dyn Properties,
                &mut self.mask_builder,
            ],
            assignment,
        )
    }

    /// Log every tuning property.
    pub fn log_props(&mut self) {
        for (name, prop) in self
            .estimator
            .props()
            .into_iter()
            .chain(self.mask_builder.props())
        {
            debug!("{name} = {prop}");
        }
    }
}

impl<E: FlowEstimator> SegmentationPipeline<E> {
    /// Create a pipeline with a custom flow estimator.
    pub fn with_estimator(config: SegmentationConfig, estimator: E) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            estimator,
            mask_builder: MotionMaskBuilder::default(),
            renderer: FrameRenderer::new(RenderMode::from_binary_flag(config.binary_output)),
            stage: PipelineStage::Init,
        })
    }

    pub fn mask_builder(self, mask_builder: MotionMaskBuilder) -> Self {
        Self {
            mask_builder,
            ..self
        }
    }

    pub fn config(&self) -> &SegmentationConfig {
        &self.config
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Produce the output frame for a pair of prepared grayscale frames.
    ///
    /// # Arguments
    ///
    /// * `prev` - earlier frame, at computation size.
    /// * `next` - later frame, at computation size.
    /// * `output_dim` - width and height of the returned frame.
    pub fn process_pair(
        &mut self,
        prev: &Mat,
        next: &Mat,
        output_dim: (usize, usize),
    ) -> Result<Mat> {
        let flow = self.estimator.estimate_flow(prev, next)?;
        let (mask, angle) = self.mask_builder.build_mask(&flow)?;

        if log_enabled!(Level::Debug) {
            let regions = mask.regions();
            debug!(
                "{} moving regions, largest {} px",
                regions.len(),
                regions.iter().map(|r| r.area).max().unwrap_or(0)
            );
        }

        let rendered = self.renderer.render(&mask, &angle)?;

        let mut output = Mat::default();
        imgproc::resize(
            &rendered,
            &mut output,
            Size::new(output_dim.0 as _, output_dim.1 as _),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        Ok(output)
    }

    /// Run the pipeline until the source is exhausted or cancellation is requested.
    ///
    /// Sinks are closed before returning, also when the run fails. A pipeline runs only once.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        sinks: &mut [&mut dyn FrameSink],
        cancel: &mut dyn CancellationCheck,
    ) -> Result<RunSummary> {
        if self.stage != PipelineStage::Init {
            return Err(Error::Other(anyhow!("pipeline has already run")));
        }

        let start = Instant::now();

        let outcome = match self.init(source) {
            Ok((state, output_dim)) => self.run_cycles(source, sinks, cancel, state, output_dim),
            Err(e) => Err(e),
        };

        self.stage = PipelineStage::Draining;
        let drained = Self::drain(sinks);
        self.stage = PipelineStage::Terminated;

        let (cycles, cancelled) = outcome?;
        drained?;

        let summary = RunSummary {
            cycles,
            cancelled,
            elapsed: start.elapsed(),
        };

        info!("processed {} frame pairs in {:?}", cycles, summary.elapsed);

        Ok(summary)
    }

    fn init(&mut self, source: &mut dyn FrameSource) -> Result<(PipelineState, (usize, usize))> {
        let first = source
            .read_frame()?
            .ok_or_else(|| Error::SourceUnavailable("no initial frame".into()))?;

        let source_dim = frame_dim(&first);

        if source_dim.0 == 0 || source_dim.1 == 0 {
            return Err(Error::SourceUnavailable("initial frame is empty".into()));
        }

        let output_dim = self.config.output_dim(source_dim)?;

        let compute_size = self.config.compute_size;

        // Resizing rounds to the nearest pixel.
        if (source_dim.0 as f64 * compute_size).round() < 1.0
            || (source_dim.1 as f64 * compute_size).round() < 1.0
        {
            return Err(Error::Config(format!(
                "compute size {} leaves no pixels of a {}x{} source",
                compute_size, source_dim.0, source_dim.1
            )));
        }

        let state = PipelineState {
            previous: prepare_gray(&first, compute_size)?,
            index: 0,
        };

        let compute_dim = frame_dim(&state.previous);

        info!(
            "source {}x{}, computing at {}x{}, output {}x{}",
            source_dim.0, source_dim.1, compute_dim.0, compute_dim.1, output_dim.0, output_dim.1
        );

        self.stage = PipelineStage::Running;

        Ok((state, output_dim))
    }

    fn run_cycles(
        &mut self,
        source: &mut dyn FrameSource,
        sinks: &mut [&mut dyn FrameSink],
        cancel: &mut dyn CancellationCheck,
        mut state: PipelineState,
        output_dim: (usize, usize),
    ) -> Result<(usize, bool)> {
        let mut cycles = 0;

        loop {
            let next = source.read_frame()?;
            // Every other frame is skipped.
            let _ = source.read_frame()?;

            let next = match next {
                Some(frame) => prepare_gray(&frame, self.config.compute_size)?,
                None => break,
            };

            let output = self.process_pair(&state.previous, &next, output_dim)?;

            for sink in sinks.iter_mut() {
                sink.emit(&output).map_err(|e| Error::SinkWrite {
                    sink: sink.name().to_string(),
                    source: Box::new(e),
                })?;
            }

            cycles += 1;
            debug!("emitted frame {}", state.index);

            if cancel.should_stop()? {
                info!("stop requested after {} frame pairs", cycles);
                return Ok((cycles, true));
            }

            state = PipelineState {
                previous: next,
                index: state.index + 1,
            };
        }

        info!("end of stream");

        Ok((cycles, false))
    }

    fn drain(sinks: &mut [&mut dyn FrameSink]) -> Result<()> {
        let mut result = Ok(());

        for sink in sinks.iter_mut() {
            if let Err(e) = sink.close() {
                warn!("failed to close {} sink: {}", sink.name(), e);

                if result.is_ok() {
                    result = Err(Error::SinkWrite {
                        sink: sink.name().to_string(),
                        source: Box::new(e),
                    });
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::test_frames::bgr_frame;
    use crate::mask::MotionMask;
    use assert_approx_eq::assert_approx_eq;
    use opencv::prelude::*;
    use std::collections::VecDeque;

    struct VecSource {
        frames: VecDeque<Mat>,
        reads: usize,
    }

    impl VecSource {
        fn new(frames: impl IntoIterator<Item = Mat>) -> Self {
            Self {
                frames: frames.into_iter().collect(),
                reads: 0,
            }
        }
    }

    impl FrameSource for VecSource {
        fn read_frame(&mut self) -> Result<Option<Mat>> {
            self.reads += 1;
            Ok(self.frames.pop_front())
        }
    }

    #[derive(Default)]
    struct CollectSink {
        frames: Vec<Mat>,
        closed: usize,
        fail_on: Option<usize>,
    }

    impl FrameSink for CollectSink {
        fn name(&self) -> &str {
            "collect"
        }

        fn emit(&mut self, frame: &Mat) -> Result<()> {
            if self.fail_on == Some(self.frames.len()) {
                return Err(Error::Other(anyhow!("disk full")));
            }
            self.frames.push(frame.clone());
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.closed += 1;
            Ok(())
        }
    }

    struct CancelAfter {
        polls: usize,
        limit: usize,
    }

    impl CancellationCheck for CancelAfter {
        fn should_stop(&mut self) -> Result<bool> {
            self.polls += 1;
            Ok(self.polls >= self.limit)
        }
    }

    const WIDTH: usize = 320;
    const HEIGHT: usize = 240;
    const SIDE: usize = 60;

    /// Textured square on a flat dark background.
    fn square_frame(left: usize, top: usize) -> Mat {
        bgr_frame(WIDTH, HEIGHT, move |x, y| {
            if (left..left + SIDE).contains(&x) && (top..top + SIDE).contains(&y) {
                let (u, v) = ((x - left) as f32, (y - top) as f32);
                (140.0 + 45.0 * (u / 4.0).sin() + 45.0 * (v / 5.0).cos()) as u8
            } else {
                20
            }
        })
    }

    fn static_frames(n: usize) -> impl Iterator<Item = Mat> {
        (0..n).map(|_| {
            bgr_frame(96, 64, |x, y| {
                let (dx, dy) = (x as f32 - 48.0, y as f32 - 32.0);
                (30.0 + 150.0 * (-(dx * dx + dy * dy) / 300.0).exp()) as u8
            })
        })
    }

    fn run_static(n: usize, config: SegmentationConfig) -> (Result<RunSummary>, CollectSink) {
        let mut pipeline = SegmentationPipeline::new(config).unwrap();
        let mut source = VecSource::new(static_frames(n));
        let mut sink = CollectSink::default();
        let result = pipeline.run(&mut source, &mut [&mut sink], &mut NeverCancel);
        (result, sink)
    }

    /// Run `frames` through a full size binary pipeline and check the single
    /// output against a square that moved from `(130, 90)` to `(134, 90)`.
    fn assert_square_segmented(frames: Vec<Mat>) {
        let config = SegmentationConfig::default()
            .compute_size(1.0)
            .binary_output(true);
        let mut pipeline = SegmentationPipeline::new(config).unwrap();

        let mut source = VecSource::new(frames);
        let mut sink = CollectSink::default();

        let summary = pipeline
            .run(&mut source, &mut [&mut sink], &mut NeverCancel)
            .unwrap();

        assert_eq!(summary.cycles, 1);
        assert_eq!(sink.frames.len(), 1);

        let output = sink.frames.pop().unwrap();
        assert_eq!(frame_dim(&output), (WIDTH, HEIGHT));

        let mask = MotionMask::from_mat(output).unwrap();
        assert!(mask.is_moving(134 + SIDE / 2, 90 + SIDE / 2));

        let regions = mask.regions();
        assert_eq!(regions.len(), 1, "{:?}", regions);

        let region = regions[0];
        assert!(region.area >= SIDE * SIDE / 2, "{:?}", region);

        // Edges stay close to the square's new extent.
        let slack = 8;
        let edges = [
            (region.min.0, 134),
            (region.min.1, 90),
            (region.max.0, 134 + SIDE - 1),
            (region.max.1, 90 + SIDE - 1),
        ];
        for (got, want) in edges {
            assert!(got.abs_diff(want) <= slack, "{:?}", region);
        }
    }

    #[test]
    fn translating_square_is_segmented() {
        assert_square_segmented(vec![
            square_frame(130, 90),
            square_frame(134, 90),
            square_frame(138, 90),
        ]);
    }

    #[test]
    fn two_frame_clip_yields_one_output() {
        assert_square_segmented(vec![square_frame(130, 90), square_frame(134, 90)]);
    }

    #[test]
    fn every_other_frame_is_skipped() {
        for (n, cycles) in [(7, 3), (6, 3), (3, 1), (2, 1), (1, 0)] {
            let (result, sink) = run_static(n, Default::default());
            let summary = result.unwrap();
            assert_eq!(summary.cycles, cycles, "{n} frames");
            assert_eq!(sink.frames.len(), cycles);
            assert_eq!(sink.closed, 1);
        }
    }

    #[test]
    fn empty_source_is_unavailable() {
        let (result, sink) = run_static(0, Default::default());
        assert!(matches!(result, Err(Error::SourceUnavailable(_))));
        assert_eq!(sink.closed, 1);
    }

    #[test]
    fn cancellation_stops_before_next_cycle() {
        let mut pipeline = SegmentationPipeline::new(Default::default()).unwrap();
        let mut source = VecSource::new(static_frames(11));
        let mut sink = CollectSink::default();
        let mut cancel = CancelAfter { polls: 0, limit: 2 };

        let summary = pipeline
            .run(&mut source, &mut [&mut sink], &mut cancel)
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.cycles, 2);
        assert_eq!(sink.frames.len(), 2);
        assert_eq!(sink.closed, 1);
        // One initial read, then two reads per cycle.
        assert_eq!(source.reads, 5);
        assert_eq!(pipeline.stage(), PipelineStage::Terminated);
    }

    #[test]
    fn sink_failure_is_fatal_and_drains() {
        let mut pipeline = SegmentationPipeline::new(Default::default()).unwrap();
        let mut source = VecSource::new(static_frames(7));
        let mut failing = CollectSink {
            fail_on: Some(1),
            ..Default::default()
        };
        let mut other = CollectSink::default();

        let result = pipeline.run(&mut source, &mut [&mut failing, &mut other], &mut NeverCancel);

        match result {
            Err(Error::SinkWrite { sink, .. }) => assert_eq!(sink, "collect"),
            r => panic!("unexpected result {:?}", r.map(|_| ())),
        }
        assert_eq!(failing.frames.len(), 1);
        assert_eq!(other.frames.len(), 1);
        assert_eq!(failing.closed, 1);
        assert_eq!(other.closed, 1);
    }

    #[test]
    fn output_is_scaled_and_colored() {
        let config = SegmentationConfig::default()
            .compute_size(0.5)
            .final_size(0.5);
        let (result, sink) = run_static(3, config);

        assert_eq!(result.unwrap().cycles, 1);
        let output = &sink.frames[0];
        assert_eq!(frame_dim(output), (48, 32));
        assert_eq!(output.channels(), 3);
    }

    #[test]
    fn invalid_sizes_are_rejected() {
        for config in [
            SegmentationConfig::default().compute_size(0.0),
            SegmentationConfig::default().final_size(-1.0),
            SegmentationConfig::default().final_size(f64::NAN),
        ] {
            assert!(matches!(
                SegmentationPipeline::new(config),
                Err(Error::Config(_))
            ));
        }

        for config in [
            SegmentationConfig::default().final_size(0.001),
            SegmentationConfig::default().compute_size(0.001),
        ] {
            let (result, sink) = run_static(3, config);
            assert!(matches!(result, Err(Error::Config(_))));
            assert!(sink.frames.is_empty());
            assert_eq!(sink.closed, 1);
        }
    }

    #[test]
    fn pipeline_runs_once() {
        let mut pipeline = SegmentationPipeline::new(Default::default()).unwrap();
        assert_eq!(pipeline.stage(), PipelineStage::Init);

        let mut sink = CollectSink::default();
        pipeline
            .run(
                &mut VecSource::new(static_frames(3)),
                &mut [&mut sink],
                &mut NeverCancel,
            )
            .unwrap();
        assert_eq!(pipeline.stage(), PipelineStage::Terminated);

        assert!(pipeline
            .run(
                &mut VecSource::new(static_frames(3)),
                &mut [&mut sink],
                &mut NeverCancel,
            )
            .is_err());
    }

    #[test]
    fn tuning_overrides_route_to_owner() {
        let mut pipeline = SegmentationPipeline::new(Default::default()).unwrap();
        pipeline.set_prop("win_size=15").unwrap();
        pipeline.set_prop("threshold=3.5").unwrap();
        assert!(matches!(
            pipeline.set_prop("bogus=1"),
            Err(Error::Config(_))
        ));
        assert_eq!(pipeline.mask_builder, MotionMaskBuilder::default().threshold(3.5));
        assert_eq!(pipeline.estimator, FarnebackEstimator::default().win_size(15));
    }

    #[test]
    fn average_cycle_time() {
        let summary = RunSummary {
            cycles: 4,
            cancelled: false,
            elapsed: Duration::from_millis(8),
        };
        assert_eq!(summary.average_cycle_time(), Some(Duration::from_millis(2)));

        let empty = RunSummary { cycles: 0, ..summary };
        assert_eq!(empty.average_cycle_time(), None);

        let long = RunSummary {
            cycles: 1 << 32,
            elapsed: Duration::from_secs(1 << 32),
            ..summary
        };
        let avg = long.average_cycle_time().unwrap();
        assert_approx_eq!(avg.as_secs_f64(), 1.0, 1e-6);
    }
}
