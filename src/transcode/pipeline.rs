//! Per-session transcode pipeline
//!
//! Drives the RTP packets of one peer from reassembly through keyframe
//! gating into the muxed output. The pipeline holds no locks of its own;
//! the owning session serializes access to it.

use std::time::Duration;

use tracing::{debug, error, info};
use webrtc::rtp::codecs::opus::OpusPacket;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::packet::Packet;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::transcode::assembler::{MediaSample, SampleAssembler};
use crate::transcode::vp8::{self, StreamGeometry};

/// Where the pipeline delivers muxed media.
///
/// The production implementation is an ffmpeg child behind a WebM muxer;
/// tests substitute an in-memory recorder.
pub trait TranscodeOutput: Send {
    /// Opens the output. Called exactly once, on the first video keyframe.
    fn open(&mut self, geometry: StreamGeometry) -> Result<()>;

    fn is_open(&self) -> bool;

    fn write_audio(&mut self, timestamp_ms: u64, data: &[u8]) -> Result<()>;

    fn write_video(&mut self, timestamp_ms: u64, keyframe: bool, data: &[u8]) -> Result<()>;

    /// Tears the output down. Must be idempotent.
    fn shutdown(&mut self);
}

/// Lifecycle of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No video packet seen yet.
    Uninitialized,
    /// Video is flowing but no keyframe has arrived; nothing is written.
    AwaitingKeyframe,
    /// The output is open and samples are being written.
    Streaming,
    /// The pipeline was torn down; further packets are ignored.
    Terminated,
}

/// Transcode pipeline for a single peer session.
///
/// Each track keeps its own clock, accumulated from the durations of its
/// written samples, so container timestamps stay on the track's own
/// timeline. Samples discarded before the output opens do not advance the
/// clocks; both tracks start near zero once the stream goes live.
pub struct TranscodePipeline {
    session_id: String,
    state: PipelineState,
    audio: SampleAssembler<OpusPacket>,
    video: SampleAssembler<Vp8Packet>,
    audio_clock: Duration,
    video_clock: Duration,
    output: Box<dyn TranscodeOutput>,
}

impl TranscodePipeline {
    pub fn new(
        session_id: impl Into<String>,
        config: &GatewayConfig,
        output: Box<dyn TranscodeOutput>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            state: PipelineState::Uninitialized,
            audio: SampleAssembler::new(
                OpusPacket::default(),
                config.audio_clock_rate,
                config.max_late_packets,
            ),
            video: SampleAssembler::new(
                Vp8Packet::default(),
                config.video_clock_rate,
                config.max_late_packets,
            ),
            audio_clock: Duration::ZERO,
            video_clock: Duration::ZERO,
            output,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Feeds one audio RTP packet through reassembly and, once the stream
    /// is live, into the output.
    ///
    /// After a fatal error the call becomes a no-op, so a reader that is
    /// still draining its track cannot trip over the dead pipeline.
    pub fn handle_audio_packet(&mut self, packet: Packet) -> Result<()> {
        if self.state == PipelineState::Terminated {
            return Ok(());
        }
        self.audio.push(packet);
        loop {
            let sample = match self.audio.pop() {
                Ok(Some(sample)) => sample,
                Ok(None) => return Ok(()),
                Err(e) => return self.terminate(e),
            };
            if self.state == PipelineState::Streaming {
                self.audio_clock += sample.duration;
                let timestamp_ms = self.audio_clock.as_millis() as u64;
                if let Err(e) = self.output.write_audio(timestamp_ms, &sample.data) {
                    return self.terminate(e);
                }
            }
        }
    }

    /// Feeds one video RTP packet. The first keyframe opens the output
    /// with the stream geometry; samples before it are discarded.
    pub fn handle_video_packet(&mut self, packet: Packet) -> Result<()> {
        if self.state == PipelineState::Terminated {
            return Ok(());
        }
        if self.state == PipelineState::Uninitialized {
            debug!(session = %self.session_id, "video flowing, waiting for a keyframe");
            self.state = PipelineState::AwaitingKeyframe;
        }
        self.video.push(packet);
        loop {
            let sample = match self.video.pop() {
                Ok(Some(sample)) => sample,
                Ok(None) => return Ok(()),
                Err(e) => return self.terminate(e),
            };
            if let Err(e) = self.handle_video_sample(&sample) {
                return self.terminate(e);
            }
        }
    }

    fn handle_video_sample(&mut self, sample: &MediaSample) -> Result<()> {
        let keyframe = vp8::is_keyframe(&sample.data);
        if self.state == PipelineState::AwaitingKeyframe {
            if !keyframe {
                return Ok(());
            }
            let geometry = vp8::keyframe_geometry(&sample.data)?;
            info!(session = %self.session_id, %geometry, "keyframe received, opening output");
            self.output.open(geometry)?;
            self.state = PipelineState::Streaming;
        }
        self.video_clock += sample.duration;
        let timestamp_ms = self.video_clock.as_millis() as u64;
        self.output.write_video(timestamp_ms, keyframe, &sample.data)
    }

    /// Closes the output. Later packets are accepted and ignored.
    pub fn shutdown(&mut self) {
        if self.state != PipelineState::Terminated {
            debug!(
                session = %self.session_id,
                audio_dropped = self.audio.dropped(),
                video_dropped = self.video.dropped(),
                "closing transcode pipeline"
            );
            self.state = PipelineState::Terminated;
            self.output.shutdown();
        }
    }

    /// Tears the pipeline down after an unrecoverable error and passes the
    /// error on to the caller.
    fn terminate(&mut self, error: Error) -> Result<()> {
        error!(session = %self.session_id, error = %error, "transcode pipeline failed");
        self.state = PipelineState::Terminated;
        self.output.shutdown();
        Err(error)
    }
}
