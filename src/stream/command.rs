//! Encoder command construction.
//!
//! Arguments are assembled in fixed stages: input, video filter, video codec,
//! audio codec, output format, destination. The encoder treats anything after
//! the output format as part of the output target, so the filter stage must
//! never move past it and the destination is always the final argument.

use crate::error::{StreamError, StreamResult};
use crate::models::{Resolution, StreamConfig};
use std::fmt;
use std::path::Path;

pub const OUTPUT_FORMAT: &str = "flv";
const AUDIO_SAMPLE_RATE: u32 = 44100;

/// An ordered argument list for the encoder, with the positions of the
/// stages callers care about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderCommand {
    args: Vec<String>,
    filter_index: Option<usize>,
    format_index: usize,
    destination_index: usize,
}

impl EncoderCommand {
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Index of the `-vf` flag, when scaling was requested.
    pub fn filter_index(&self) -> Option<usize> {
        self.filter_index
    }

    /// Index of the `-f` flag.
    pub fn format_index(&self) -> usize {
        self.format_index
    }

    pub fn destination_index(&self) -> usize {
        self.destination_index
    }

    pub fn destination(&self) -> &str {
        &self.args[self.destination_index]
    }
}

impl fmt::Display for EncoderCommand {
    /// Renders the arguments with the stream key masked, for logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, arg) in self.args.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            if index == self.destination_index {
                let shown = arg.rsplit_once('/').map_or("", |(base, _)| base);
                write!(f, "{shown}/****")?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct ArgStage(Vec<String>);

impl ArgStage {
    fn flag(mut self, flag: &str) -> Self {
        self.0.push(flag.to_string());
        self
    }

    fn push(mut self, flag: &str, value: impl ToString) -> Self {
        self.0.push(flag.to_string());
        self.0.push(value.to_string());
        self
    }
}

/// Builds the encoder invocation that pushes `source` to the configured ingest.
pub fn build_command(config: &StreamConfig, source: &Path) -> StreamResult<EncoderCommand> {
    validate(config)?;
    let destination = destination_url(config);

    // (1) input source, read at native frame rate
    let input = ArgStage::default()
        .flag("-re")
        .push("-i", source.display());

    // (2) video filter
    let filter = match config.resolution {
        Resolution::Native => None,
        Resolution::Scaled { width, height } => {
            Some(ArgStage::default().push("-vf", format!("scale={width}:{height}")))
        }
    };

    // (3) video codec, bitrate, framerate
    let video_kbps = config.video_bitrate_kbps;
    let video = ArgStage::default()
        .push("-c:v", "libx264")
        .push("-preset", "veryfast")
        .push("-tune", "zerolatency")
        .push("-b:v", format!("{video_kbps}k"))
        .push("-maxrate", format!("{video_kbps}k"))
        .push("-bufsize", format!("{}k", video_kbps.saturating_mul(2)))
        .push("-r", config.framerate)
        .push("-g", config.framerate.saturating_mul(2))
        .push("-pix_fmt", "yuv420p");

    // (4) audio codec, bitrate
    let audio = ArgStage::default()
        .push("-c:a", "aac")
        .push("-b:a", format!("{}k", config.audio_bitrate_kbps))
        .push("-ar", AUDIO_SAMPLE_RATE)
        .push("-ac", 2);

    let mut args = vec!["-hide_banner".to_string(), "-loglevel".into(), "error".into()];
    args.extend(input.0);

    let filter_index = filter.map(|stage| {
        let index = args.len();
        args.extend(stage.0);
        index
    });
    args.extend(video.0);
    args.extend(audio.0);

    // (5) output container format
    let format_index = args.len();
    args.push("-f".into());
    args.push(OUTPUT_FORMAT.into());

    // (6) destination
    let destination_index = args.len();
    args.push(destination);

    Ok(EncoderCommand {
        args,
        filter_index,
        format_index,
        destination_index,
    })
}

/// Joins the ingest URL and the stream key.
pub fn destination_url(config: &StreamConfig) -> String {
    format!(
        "{}/{}",
        config.rtmp_url.trim().trim_end_matches('/'),
        config.stream_key.trim()
    )
}

fn validate(config: &StreamConfig) -> StreamResult<()> {
    if config.stream_key.trim().is_empty() {
        return Err(StreamError::Config("stream key is empty".into()));
    }
    if config.rtmp_url.trim().is_empty() {
        return Err(StreamError::Config("RTMP URL is empty".into()));
    }
    if let Resolution::Scaled { width, height } = config.resolution
        && (width == 0 || height == 0)
    {
        return Err(StreamError::Config(format!(
            "resolution must be positive, got {width}x{height}"
        )));
    }
    if config.framerate == 0 {
        return Err(StreamError::Config("framerate must be positive".into()));
    }
    if config.video_bitrate_kbps == 0 {
        return Err(StreamError::Config("video bitrate must be positive".into()));
    }
    if config.audio_bitrate_kbps == 0 {
        return Err(StreamError::Config("audio bitrate must be positive".into()));
    }
    Ok(())
}
