//! Live WebM muxing
//!
//! Wraps a forward-only WebM segment writer around any byte sink. The
//! container carries one Opus audio track and one VP8 video track and is
//! written cluster by cluster, so a downstream consumer can decode it
//! while the stream is still live.

use std::io::Write;

use tracing::debug;
use webm::mux::{
    AudioCodecId, AudioTrack, Segment, SegmentBuilder, SegmentMode, VideoCodecId, VideoTrack,
    Writer,
};

use crate::error::{Error, Result};
use crate::transcode::vp8::StreamGeometry;

/// Opus always runs at 48kHz inside the container, independent of what the
/// encoder resamples to downstream.
const OPUS_SAMPLE_RATE: u32 = 48_000;
const OPUS_CHANNELS: u32 = 2;
/// Samples of encoder delay a decoder should trim, written to OpusHead.
const OPUS_PRE_SKIP: u16 = 312;

/// Builds the 19-byte OpusHead block for the audio track codec private
/// data. All multi-byte fields are little-endian.
fn opus_codec_private(sample_rate: u32, channels: u8) -> [u8; 19] {
    let mut head = [0u8; 19];
    head[0..8].copy_from_slice(b"OpusHead");
    head[8] = 1; // version
    head[9] = channels;
    head[10..12].copy_from_slice(&OPUS_PRE_SKIP.to_le_bytes());
    head[12..16].copy_from_slice(&sample_rate.to_le_bytes());
    head[16..18].copy_from_slice(&0i16.to_le_bytes()); // output gain
    head[18] = 0; // channel mapping family 0, mono/stereo
    head
}

/// Muxes depacketized Opus and VP8 samples into a live WebM stream.
///
/// Track numbering follows the add order: audio is track 1, video is
/// track 2. The segment timeline is globally non-decreasing: a block
/// stamped behind the other track's newest block is raised to match,
/// while each track's own timestamps keep their relative order. Nothing
/// reaches the sink until the first frame is added.
pub struct WebmMuxer<W: Write> {
    segment: Segment<W>,
    audio_track: AudioTrack,
    video_track: VideoTrack,
    high_water_ns: u64,
}

impl<W: Write> WebmMuxer<W> {
    /// Builds the container around `sink` with the given video geometry.
    pub fn new(sink: W, geometry: StreamGeometry) -> Result<Self> {
        let writer = Writer::new_non_seek(sink);
        let builder = SegmentBuilder::new(writer)
            .map_err(|e| Error::Muxer(format!("segment builder: {e}")))?
            .set_mode(SegmentMode::Live)
            .map_err(|e| Error::Muxer(format!("live mode: {e}")))?;

        let (builder, audio_track) = builder
            .add_audio_track(OPUS_SAMPLE_RATE, OPUS_CHANNELS, AudioCodecId::Opus, None)
            .map_err(|e| Error::Muxer(format!("audio track: {e}")))?;
        let opus_private = opus_codec_private(OPUS_SAMPLE_RATE, OPUS_CHANNELS as u8);
        let builder = builder
            .set_codec_private(audio_track, &opus_private)
            .map_err(|e| Error::Muxer(format!("audio codec private: {e}")))?;

        let (builder, video_track) = builder
            .add_video_track(geometry.width, geometry.height, VideoCodecId::VP8, None)
            .map_err(|e| Error::Muxer(format!("video track: {e}")))?;

        debug!(%geometry, "webm segment ready");
        Ok(Self {
            segment: builder.build(),
            audio_track,
            video_track,
            high_water_ns: 0,
        })
    }

    /// Appends one Opus frame. Audio blocks are always flagged as
    /// keyframes.
    pub fn write_audio(&mut self, timestamp_ms: u64, data: &[u8]) -> Result<()> {
        let timestamp_ns = self.stamp(timestamp_ms);
        self.segment
            .add_frame(self.audio_track, data, timestamp_ns, true)
            .map_err(|e| Error::Muxer(format!("audio frame at {timestamp_ms}ms: {e}")))
    }

    /// Appends one VP8 frame.
    pub fn write_video(&mut self, timestamp_ms: u64, keyframe: bool, data: &[u8]) -> Result<()> {
        let timestamp_ns = self.stamp(timestamp_ms);
        self.segment
            .add_frame(self.video_track, data, timestamp_ns, keyframe)
            .map_err(|e| Error::Muxer(format!("video frame at {timestamp_ms}ms: {e}")))
    }

    /// Places a track-local timestamp on the segment timeline.
    ///
    /// The segment rejects blocks stamped before the newest written block
    /// regardless of track, while the two tracks run independent clocks;
    /// a straggling write is raised to the high-water mark.
    fn stamp(&mut self, timestamp_ms: u64) -> u64 {
        let timestamp_ns = (timestamp_ms * 1_000_000).max(self.high_water_ns);
        self.high_water_ns = timestamp_ns;
        timestamp_ns
    }

    /// Closes the segment and drops the sink, which closes the pipe when
    /// the sink is a child process stdin.
    pub fn finalize(self) -> Result<()> {
        self.segment
            .finalize(None)
            .map(drop)
            .map_err(|_| Error::Muxer("finalizing segment failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Byte sink the test keeps a handle on while the muxer owns a clone.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    const GEOMETRY: StreamGeometry = StreamGeometry {
        width: 640,
        height: 480,
    };

    #[test]
    fn opus_head_layout() {
        let head = opus_codec_private(48_000, 2);
        assert_eq!(&head[0..8], b"OpusHead");
        assert_eq!(head[8], 1);
        assert_eq!(head[9], 2);
        assert_eq!(u16::from_le_bytes([head[10], head[11]]), 312);
        assert_eq!(
            u32::from_le_bytes([head[12], head[13], head[14], head[15]]),
            48_000
        );
        assert_eq!(head[18], 0);
    }

    #[test]
    fn header_reaches_sink_with_first_frame() {
        let sink = SharedSink::default();
        let mut muxer = WebmMuxer::new(sink.clone(), GEOMETRY).unwrap();
        muxer.write_audio(20, &[0xfc, 0xff, 0xfe]).unwrap();

        let bytes = sink.contents();
        // EBML header magic
        assert_eq!(&bytes[0..4], &[0x1a, 0x45, 0xdf, 0xa3]);
    }

    #[test]
    fn accepts_audio_stamped_behind_the_newest_video_block() {
        let sink = SharedSink::default();
        let mut muxer = WebmMuxer::new(sink, GEOMETRY).unwrap();

        // the opening keyframe lands at 33ms while the audio clock is
        // still at 20ms; the segment must take both
        muxer
            .write_video(
                33,
                true,
                &[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x80, 0x02, 0xe0, 0x01],
            )
            .unwrap();
        muxer.write_audio(20, &[0xfc, 0xff, 0xfe]).unwrap();
        muxer.write_audio(40, &[0xfc, 0xff, 0xfe]).unwrap();
        muxer.write_video(73, false, &[0x11, 0x00, 0x00]).unwrap();

        muxer.finalize().unwrap();
    }

    #[test]
    fn interleaved_frames_finalize_cleanly() {
        let sink = SharedSink::default();
        let mut muxer = WebmMuxer::new(sink.clone(), GEOMETRY).unwrap();
        muxer
            .write_video(
                0,
                true,
                &[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x80, 0x02, 0xe0, 0x01],
            )
            .unwrap();
        muxer.write_audio(20, &[0xfc, 0xff, 0xfe]).unwrap();
        muxer.write_video(33, false, &[0x11, 0x00, 0x00]).unwrap();
        muxer.write_audio(40, &[0xfc, 0xff, 0xfe]).unwrap();

        let streamed = sink.contents().len();
        muxer.finalize().unwrap();
        assert!(streamed > 0);
        assert!(sink.contents().len() >= streamed);
    }
}
