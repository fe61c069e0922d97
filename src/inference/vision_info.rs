//! Frame sampling for video inputs.
//!
//! Videos referenced from a message list are probed with `ffprobe`, a subset of frames is
//! selected at a target sampling rate and decoded with `ffmpeg` straight into resized RGB8
//! buffers. Frame counts and output resolutions follow the Qwen-VL rules: frame counts are
//! multiples of the temporal patch size and both sides are multiples of
//! `patch_size * merge_size`, inside a per-frame and a per-video pixel budget.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::inference::message::{video_references, Message};

pub const FRAME_FACTOR: usize = 2;
pub const IMAGE_FACTOR: usize = 32;
pub const VIDEO_MIN_PIXELS: usize = 128 * 32 * 32;
pub const VIDEO_MAX_PIXELS: usize = 768 * 32 * 32;
// 128k token context, 90% of it available for video tokens
pub const VIDEO_TOTAL_PIXELS: usize = 117_964_800;
pub const DEFAULT_FPS: f64 = 2.0;
pub const FPS_MIN_FRAMES: usize = 4;
pub const FPS_MAX_FRAMES: usize = 768;
pub const MAX_RATIO: f64 = 200.0;

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("no video found in the messages")]
    MissingVideo,
    #[error("video file not found: {0}")]
    NotFound(String),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("failed to parse probe output: {0}")]
    ProbeOutput(#[from] serde_json::Error),
    #[error("no video stream found")]
    NoVideoStream,
    #[error("invalid video metadata: {0}")]
    InvalidMetadata(String),
    #[error("nframes should be in interval [{min}, {total}], but got {nframes}")]
    FrameCount {
        min: usize,
        total: usize,
        nframes: usize,
    },
    #[error("absolute aspect ratio must be smaller than {max}, got {ratio}")]
    AspectRatio { max: f64, ratio: f64 },
    #[error("expected {expected} decoded frames, got {decoded}")]
    ShortRead { expected: usize, decoded: usize },
}

/// Sampled frames of one video, `num_frames x height x width x 3` RGB8, row major.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrames {
    pub data: Vec<u8>,
    pub num_frames: usize,
    pub height: usize,
    pub width: usize,
}

impl VideoFrames {
    pub fn frame(&self, index: usize) -> &[u8] {
        let size = self.height * self.width * 3;
        &self.data[index * size..(index + 1) * size]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoMetadata {
    /// Frame rate of the source video.
    pub fps: f64,
    /// Indices of the sampled frames in the source video.
    pub frames_indices: Vec<usize>,
    pub total_num_frames: usize,
    /// Duration in seconds.
    pub duration: f64,
    /// Source resolution, before resizing.
    pub width: usize,
    pub height: usize,
    pub video_backend: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampledVideo {
    pub frames: VideoFrames,
    pub metadata: VideoMetadata,
}

/// Extraction options forwarded to the processor, keyed by option name.
pub type VideoKwargs = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct VisionInfo {
    pub videos: Vec<SampledVideo>,
    pub video_kwargs: VideoKwargs,
}

pub trait VisionInfoExtractor: Send + Sync {
    /// Samples the frames of every video referenced in `messages`.
    fn process_vision_info(&self, messages: &[Message]) -> Result<VisionInfo>;
}

#[derive(Debug, Clone)]
pub struct FrameSamplingConfig {
    pub fps: f64,
    pub min_frames: usize,
    pub max_frames: usize,
    pub frame_factor: usize,
    pub image_factor: usize,
    pub min_pixels: usize,
    pub max_pixels: usize,
    pub total_pixels: usize,
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl Default for FrameSamplingConfig {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            min_frames: FPS_MIN_FRAMES,
            max_frames: FPS_MAX_FRAMES,
            frame_factor: FRAME_FACTOR,
            image_factor: IMAGE_FACTOR,
            min_pixels: VIDEO_MIN_PIXELS,
            max_pixels: VIDEO_MAX_PIXELS,
            total_pixels: VIDEO_TOTAL_PIXELS,
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
        }
    }
}

pub fn round_by_factor(number: f64, factor: usize) -> usize {
    (number / factor as f64).round_ties_even() as usize * factor
}

pub fn ceil_by_factor(number: f64, factor: usize) -> usize {
    (number / factor as f64).ceil() as usize * factor
}

pub fn floor_by_factor(number: f64, factor: usize) -> usize {
    (number / factor as f64).floor() as usize * factor
}

/// Rescales `(height, width)` so both sides are divisible by `factor`, the pixel count stays
/// within `[min_pixels, max_pixels]` and the aspect ratio is kept as closely as possible.
pub fn smart_resize(
    height: usize,
    width: usize,
    factor: usize,
    min_pixels: usize,
    max_pixels: usize,
) -> Result<(usize, usize), VideoError> {
    if height == 0 || width == 0 {
        return Err(VideoError::InvalidMetadata(format!(
            "frame size {width}x{height}"
        )));
    }
    let (h, w) = (height as f64, width as f64);
    let ratio = h.max(w) / h.min(w);
    if ratio > MAX_RATIO {
        return Err(VideoError::AspectRatio {
            max: MAX_RATIO,
            ratio,
        });
    }

    let mut h_bar = factor.max(round_by_factor(h, factor));
    let mut w_bar = factor.max(round_by_factor(w, factor));
    if h_bar * w_bar > max_pixels {
        let beta = (h * w / max_pixels as f64).sqrt();
        h_bar = factor.max(floor_by_factor(h / beta, factor));
        w_bar = factor.max(floor_by_factor(w / beta, factor));
    } else if h_bar * w_bar < min_pixels {
        let beta = (min_pixels as f64 / (h * w)).sqrt();
        h_bar = ceil_by_factor(h * beta, factor);
        w_bar = ceil_by_factor(w * beta, factor);
    }
    Ok((h_bar, w_bar))
}

/// Number of frames to sample from a video of `total_frames` frames recorded at `video_fps`.
pub fn smart_nframes(
    config: &FrameSamplingConfig,
    total_frames: usize,
    video_fps: f64,
) -> Result<usize, VideoError> {
    if video_fps <= 0.0 {
        return Err(VideoError::InvalidMetadata(format!("frame rate {video_fps}")));
    }
    let factor = config.frame_factor;
    let min_frames = ceil_by_factor(config.min_frames as f64, factor);
    let max_frames = floor_by_factor(config.max_frames.min(total_frames) as f64, factor);

    let nframes = total_frames as f64 / video_fps * config.fps;
    let nframes = nframes
        .max(min_frames as f64)
        .min(max_frames as f64)
        .min(total_frames as f64);
    let nframes = floor_by_factor(nframes, factor);

    if nframes < factor || nframes > total_frames {
        return Err(VideoError::FrameCount {
            min: factor,
            total: total_frames,
            nframes,
        });
    }
    Ok(nframes)
}

/// `nframes` evenly spaced frame indices over `[0, total_frames - 1]`.
pub fn frame_indices(total_frames: usize, nframes: usize) -> Vec<usize> {
    if nframes == 0 {
        return Vec::new();
    }
    if nframes == 1 {
        return vec![0];
    }
    let end = total_frames.saturating_sub(1) as f64;
    (0..nframes)
        .map(|i| (i as f64 * end / (nframes - 1) as f64).round_ties_even() as usize)
        .collect()
}

/// Per-frame pixel budget once the per-video budget is shared between `nframes` frames.
pub fn video_max_pixels(config: &FrameSamplingConfig, nframes: usize) -> usize {
    let shared = config.total_pixels as f64 / nframes.max(1) as f64 * config.frame_factor as f64;
    let max_pixels = (config.max_pixels as f64).min(shared);
    let floor = (config.min_pixels as f64 * 1.05).trunc();
    max_pixels.max(floor) as usize
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoProbe {
    pub width: usize,
    pub height: usize,
    pub fps: f64,
    pub total_frames: usize,
    pub duration: f64,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<usize>,
    height: Option<usize>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parses an ffprobe rational such as `30000/1001`.
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num.trim().parse::<f64>().ok()? / den
        }
        None => rate.trim().parse().ok()?,
    };
    (value > 0.0).then_some(value)
}

impl VideoProbe {
    pub fn from_probe_json(json: &str) -> Result<Self, VideoError> {
        let output: ProbeOutput = serde_json::from_str(json)?;
        let stream = output
            .streams
            .into_iter()
            .next()
            .ok_or(VideoError::NoVideoStream)?;

        let width = stream.width.unwrap_or(0);
        let height = stream.height.unwrap_or(0);
        if width == 0 || height == 0 {
            return Err(VideoError::InvalidMetadata(format!(
                "frame size {width}x{height}"
            )));
        }

        let fps = stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
            .ok_or_else(|| VideoError::InvalidMetadata("missing frame rate".into()))?;

        let duration = stream
            .duration
            .as_deref()
            .or(output.format.as_ref().and_then(|f| f.duration.as_deref()))
            .and_then(|d| d.trim().parse::<f64>().ok());

        let total_frames = match stream.nb_frames.as_deref().and_then(|n| n.parse().ok()) {
            Some(n) => n,
            None => match duration {
                Some(duration) => (duration * fps).round() as usize,
                None => return Err(VideoError::InvalidMetadata("missing frame count".into())),
            },
        };
        if total_frames == 0 {
            return Err(VideoError::InvalidMetadata("video has no frames".into()));
        }

        Ok(VideoProbe {
            width,
            height,
            fps,
            total_frames,
            duration: duration.unwrap_or(total_frames as f64 / fps),
        })
    }
}

/// `ffmpeg` filter graph keeping only the frames at `indices`, scaled to `width x height`.
fn select_filter(indices: &BTreeSet<usize>, width: usize, height: usize) -> String {
    let select = indices
        .iter()
        .map(|index| format!("eq(n\\,{index})"))
        .collect::<Vec<_>>()
        .join("+");
    format!("select={select},scale={width}:{height}:flags=bicubic")
}

/// Orders decoded frames (one per unique index, ascending) back into `indices` order.
fn gather_frames(
    decoded: &[u8],
    unique: &BTreeSet<usize>,
    indices: &[usize],
    frame_size: usize,
) -> Result<Vec<u8>, VideoError> {
    let decoded_frames = decoded.len() / frame_size;
    if decoded_frames < unique.len() {
        return Err(VideoError::ShortRead {
            expected: unique.len(),
            decoded: decoded_frames,
        });
    }
    let unique: Vec<usize> = unique.iter().copied().collect();
    let mut data = Vec::with_capacity(indices.len() * frame_size);
    for index in indices {
        // every index is in `unique` by construction
        let position = unique.binary_search(index).unwrap_or_default();
        data.extend_from_slice(&decoded[position * frame_size..(position + 1) * frame_size]);
    }
    Ok(data)
}

fn run(program: &str, args: &[&std::ffi::OsStr]) -> Result<Vec<u8>, VideoError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|source| VideoError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(VideoError::Command {
            program: program.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// Samples video frames with the `ffprobe` and `ffmpeg` command line tools.
#[derive(Debug, Clone, Default)]
pub struct FfmpegVisionExtractor {
    config: FrameSamplingConfig,
}

impl FfmpegVisionExtractor {
    pub fn new(config: FrameSamplingConfig) -> Self {
        Self { config }
    }

    fn resolve(reference: &str) -> Result<PathBuf, VideoError> {
        let path = PathBuf::from(reference.strip_prefix("file://").unwrap_or(reference));
        if !path.is_file() {
            return Err(VideoError::NotFound(reference.to_string()));
        }
        Ok(path)
    }

    pub fn probe(&self, path: &Path) -> Result<VideoProbe, VideoError> {
        let stdout = run(
            &self.config.ffprobe,
            &[
                "-v".as_ref(),
                "error".as_ref(),
                "-select_streams".as_ref(),
                "v:0".as_ref(),
                "-show_entries".as_ref(),
                "stream=width,height,avg_frame_rate,r_frame_rate,nb_frames,duration:format=duration"
                    .as_ref(),
                "-of".as_ref(),
                "json".as_ref(),
                path.as_os_str(),
            ],
        )?;
        VideoProbe::from_probe_json(&String::from_utf8_lossy(&stdout))
    }

    fn decode_frames(
        &self,
        path: &Path,
        indices: &[usize],
        width: usize,
        height: usize,
    ) -> Result<Vec<u8>, VideoError> {
        let unique: BTreeSet<usize> = indices.iter().copied().collect();
        let filter = select_filter(&unique, width, height);
        let stdout = run(
            &self.config.ffmpeg,
            &[
                "-v".as_ref(),
                "error".as_ref(),
                "-nostdin".as_ref(),
                "-i".as_ref(),
                path.as_os_str(),
                "-vf".as_ref(),
                filter.as_ref(),
                "-fps_mode".as_ref(),
                "passthrough".as_ref(),
                "-f".as_ref(),
                "rawvideo".as_ref(),
                "-pix_fmt".as_ref(),
                "rgb24".as_ref(),
                "pipe:1".as_ref(),
            ],
        )?;
        gather_frames(&stdout, &unique, indices, width * height * 3)
    }

    fn fetch_video(&self, reference: &str) -> Result<(SampledVideo, f64), VideoError> {
        let path = Self::resolve(reference)?;
        let probe = self.probe(&path)?;

        let nframes = smart_nframes(&self.config, probe.total_frames, probe.fps)?;
        let indices = frame_indices(probe.total_frames, nframes);
        let max_pixels = video_max_pixels(&self.config, nframes);
        let (height, width) = smart_resize(
            probe.height,
            probe.width,
            self.config.image_factor,
            self.config.min_pixels,
            max_pixels,
        )?;
        debug!(
            "sampling {nframes} of {} frames from {reference} at {width}x{height}",
            probe.total_frames
        );

        let data = self.decode_frames(&path, &indices, width, height)?;
        let sample_fps = nframes as f64 / probe.total_frames as f64 * probe.fps;

        let video = SampledVideo {
            frames: VideoFrames {
                data,
                num_frames: nframes,
                height,
                width,
            },
            metadata: VideoMetadata {
                fps: probe.fps,
                frames_indices: indices,
                total_num_frames: probe.total_frames,
                duration: probe.duration,
                width: probe.width,
                height: probe.height,
                video_backend: "ffmpeg".into(),
            },
        };
        Ok((video, sample_fps))
    }
}

impl VisionInfoExtractor for FfmpegVisionExtractor {
    #[tracing::instrument(level = "info", skip(self, messages))]
    fn process_vision_info(&self, messages: &[Message]) -> Result<VisionInfo> {
        let references = video_references(messages);
        if references.is_empty() {
            return Err(VideoError::MissingVideo.into());
        }

        let mut videos = Vec::with_capacity(references.len());
        let mut sample_fps = Vec::with_capacity(references.len());
        for reference in references {
            let (video, fps) = self.fetch_video(reference)?;
            videos.push(video);
            sample_fps.push(Value::from(fps));
        }

        let mut video_kwargs = VideoKwargs::new();
        video_kwargs.insert("do_sample_frames".into(), Value::Bool(false));
        video_kwargs.insert("fps".into(), Value::Array(sample_fps));
        Ok(VisionInfo {
            videos,
            video_kwargs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::message::ContentPart;

    #[test]
    fn smart_resize_keeps_small_frames_on_factor_grid() {
        assert_eq!(
            smart_resize(360, 640, 32, VIDEO_MIN_PIXELS, VIDEO_MAX_PIXELS).unwrap(),
            (352, 640)
        );
    }

    #[test]
    fn smart_resize_shrinks_to_pixel_budget() {
        let (h, w) = smart_resize(1080, 1920, 32, VIDEO_MIN_PIXELS, VIDEO_MAX_PIXELS).unwrap();
        assert_eq!((h, w), (640, 1152));
        assert!(h * w <= VIDEO_MAX_PIXELS);
    }

    #[test]
    fn smart_resize_grows_to_minimum() {
        let (h, w) = smart_resize(64, 64, 32, VIDEO_MIN_PIXELS, VIDEO_MAX_PIXELS).unwrap();
        assert_eq!((h, w), (384, 384));
        assert!(h * w >= VIDEO_MIN_PIXELS);
    }

    #[test]
    fn smart_resize_rejects_extreme_aspect_ratio() {
        assert!(matches!(
            smart_resize(10, 4000, 32, VIDEO_MIN_PIXELS, VIDEO_MAX_PIXELS),
            Err(VideoError::AspectRatio { .. })
        ));
    }

    #[test]
    fn smart_nframes_follows_target_fps() {
        let config = FrameSamplingConfig::default();
        assert_eq!(smart_nframes(&config, 300, 30.0).unwrap(), 20);
        // one second of video still yields the minimum
        assert_eq!(smart_nframes(&config, 30, 30.0).unwrap(), 4);
        // capped by the number of available frames, on the frame factor
        assert_eq!(smart_nframes(&config, 3, 30.0).unwrap(), 2);
    }

    #[test]
    fn smart_nframes_caps_long_videos() {
        let config = FrameSamplingConfig::default();
        // one hour at 30 fps would ask for 7200 frames
        assert_eq!(smart_nframes(&config, 108_000, 30.0).unwrap(), FPS_MAX_FRAMES);
    }

    #[test]
    fn smart_nframes_rejects_single_frame() {
        let config = FrameSamplingConfig::default();
        assert!(matches!(
            smart_nframes(&config, 1, 30.0),
            Err(VideoError::FrameCount { nframes: 0, .. })
        ));
    }

    #[test]
    fn frame_indices_span_the_video() {
        let indices = frame_indices(300, 20);
        assert_eq!(indices.len(), 20);
        assert_eq!(indices[0], 0);
        assert_eq!(indices[1], 16);
        assert_eq!(indices[19], 299);
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn video_max_pixels_shares_total_budget() {
        let config = FrameSamplingConfig::default();
        assert_eq!(video_max_pixels(&config, 20), VIDEO_MAX_PIXELS);
        assert_eq!(video_max_pixels(&config, 768), 307_200);
    }

    #[test]
    fn parses_ffprobe_output() {
        let json = r#"{
            "programs": [],
            "streams": [{
                "width": 1280,
                "height": 720,
                "r_frame_rate": "30/1",
                "avg_frame_rate": "30000/1001",
                "nb_frames": "299",
                "duration": "9.976633"
            }],
            "format": {"duration": "10.010000"}
        }"#;
        let probe = VideoProbe::from_probe_json(json).unwrap();
        assert_eq!(probe.width, 1280);
        assert_eq!(probe.height, 720);
        assert_eq!(probe.total_frames, 299);
        assert!((probe.fps - 29.97).abs() < 1e-2);
        assert!((probe.duration - 9.976633).abs() < 1e-9);
    }

    #[test]
    fn probe_estimates_frame_count_from_duration() {
        let json = r#"{
            "streams": [{"width": 640, "height": 480, "avg_frame_rate": "0/0", "r_frame_rate": "25/1"}],
            "format": {"duration": "4.0"}
        }"#;
        let probe = VideoProbe::from_probe_json(json).unwrap();
        assert_eq!(probe.fps, 25.0);
        assert_eq!(probe.total_frames, 100);
    }

    #[test]
    fn probe_without_stream_fails() {
        assert!(matches!(
            VideoProbe::from_probe_json(r#"{"streams": []}"#),
            Err(VideoError::NoVideoStream)
        ));
    }

    #[test]
    fn select_filter_escapes_commas() {
        let indices: BTreeSet<usize> = [0, 15, 30].into_iter().collect();
        assert_eq!(
            select_filter(&indices, 64, 32),
            "select=eq(n\\,0)+eq(n\\,15)+eq(n\\,30),scale=64:32:flags=bicubic"
        );
    }

    #[test]
    fn gather_frames_restores_requested_order() {
        let unique: BTreeSet<usize> = [2, 5].into_iter().collect();
        let decoded = vec![1, 1, 1, 2, 2, 2];
        let data = gather_frames(&decoded, &unique, &[2, 2, 5], 3).unwrap();
        assert_eq!(data, vec![1, 1, 1, 1, 1, 1, 2, 2, 2]);

        assert!(matches!(
            gather_frames(&decoded[..3], &unique, &[2, 5], 3),
            Err(VideoError::ShortRead {
                expected: 2,
                decoded: 1
            })
        ));
    }

    #[test]
    fn missing_video_reference_is_an_error() {
        let extractor = FfmpegVisionExtractor::default();
        let messages = vec![Message::user(vec![ContentPart::text("no video")])];
        let err = extractor.process_vision_info(&messages).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VideoError>(),
            Some(VideoError::MissingVideo)
        ));
    }

    #[test]
    fn missing_file_is_reported_before_probing() {
        let extractor = FfmpegVisionExtractor::default();
        let messages = vec![Message::user(vec![ContentPart::video(
            "file:///definitely/not/here.mp4",
        )])];
        let err = extractor.process_vision_info(&messages).unwrap_err();
        assert_eq!(
            err.to_string(),
            "video file not found: file:///definitely/not/here.mp4"
        );
    }
}
