//! RTP to RTMP transcode path
//!
//! One pipeline per peer session: RTP packets are reassembled into media
//! samples, gated on the first VP8 keyframe, muxed into a live WebM stream
//! and piped into an ffmpeg child that publishes FLV to the RTMP
//! destination.

pub mod assembler;
pub mod encoder;
pub mod muxer;
pub mod pipeline;
pub mod vp8;

pub use assembler::{MediaSample, SampleAssembler};
pub use encoder::{EncoderProcess, FfmpegWebmOutput};
pub use muxer::WebmMuxer;
pub use pipeline::{PipelineState, TranscodeOutput, TranscodePipeline};
pub use vp8::{is_keyframe, keyframe_geometry, StreamGeometry};
