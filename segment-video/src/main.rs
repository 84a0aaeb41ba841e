//! Segment moving regions of a video using dense optical flow.

use anyhow::{anyhow, Result};
use clap::{crate_version, Arg, ArgMatches, Command};
use flowseg::pipeline::{DEFAULT_COMPUTE_SIZE, DEFAULT_FINAL_SIZE};
use flowseg::prelude::v1::*;
use log::*;

mod io;

use io::{KeyboardCancel, VideoFileSink, VideoFileSource, WindowSink};

fn parse_factor(matches: &ArgMatches, name: &str) -> Result<f64> {
    let value = matches
        .value_of(name)
        .ok_or_else(|| anyhow!("missing value for {name}"))?;

    value
        .parse::<f64>()
        .map_err(|_| Error::Config(format!("{name} expects a number, got `{value}`")).into())
}

fn main() -> Result<()> {
    env_logger::init();

    let compute_size = DEFAULT_COMPUTE_SIZE.to_string();
    let final_size = DEFAULT_FINAL_SIZE.to_string();

    let matches = Command::new("segment-video")
        .version(crate_version!())
        .about("Segments moving regions of a video using Farneback optical flow")
        .arg(
            Arg::new("save")
                .short('s')
                .value_name("SAVE_FILEPATH")
                .help("Write the segmentation to a motion-JPEG video")
                .takes_value(true),
        )
        .arg(
            Arg::new("compute-size")
                .short('c')
                .value_name("COMPUTE_SIZE")
                .help("Scale applied to frames before computing optical flow")
                .takes_value(true)
                .default_value(&compute_size),
        )
        .arg(
            Arg::new("final-size")
                .short('f')
                .value_name("FINAL_SIZE")
                .help("Scale of the output relative to the input resolution")
                .takes_value(true)
                .default_value(&final_size),
        )
        .arg(
            Arg::new("binary")
                .short('b')
                .help("Output the binary motion mask instead of flow colors"),
        )
        .arg(
            Arg::new("prop")
                .short('p')
                .value_name("NAME=VALUE")
                .help("Override a flow or mask tuning property")
                .takes_value(true)
                .multiple_occurrences(true),
        )
        .arg(
            Arg::new("input")
                .value_name("VIDEO_FILEPATH")
                .required(true),
        )
        .get_matches();

    let input = matches
        .value_of("input")
        .ok_or_else(|| anyhow!("Expected video filepath argument after options"))?;

    let config = SegmentationConfig::default()
        .compute_size(parse_factor(&matches, "compute-size")?)
        .final_size(parse_factor(&matches, "final-size")?)
        .binary_output(matches.is_present("binary"));

    let mut pipeline = SegmentationPipeline::new(config)?;

    for assignment in matches.values_of("prop").into_iter().flatten() {
        pipeline.set_prop(assignment)?;
    }

    pipeline.log_props();

    let mut source = VideoFileSource::open(input)?;

    if let Some(fps) = source.framerate() {
        debug!("source runs at {fps} fps");
    }

    let (width, height) = source.resolution()?;
    debug!("container reports {width}x{height}");

    // Created only on request, so a run without -s leaves no file behind.
    let mut file = match matches.value_of("save") {
        Some(path) => Some(VideoFileSink::create(path, !config.binary_output)?),
        None => None,
    };

    let mut display = WindowSink::new("Segmentation")?;

    let mut sinks: Vec<&mut dyn FrameSink> = vec![];

    if let Some(file) = file.as_mut() {
        sinks.push(file);
    }

    sinks.push(&mut display);

    let summary = pipeline.run(&mut source, &mut sinks, &mut KeyboardCancel)?;

    if let Some(avg) = summary.average_cycle_time() {
        info!(
            "Average computational time of segmented image: {:.4}s",
            avg.as_secs_f64()
        );
    }

    Ok(())
}
