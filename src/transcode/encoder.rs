//! ffmpeg encoder process management
//!
//! Spawns the long-lived ffmpeg child that transcodes the WebM stream on
//! its stdin into H.264/AAC and publishes it as FLV to the RTMP
//! destination. The child's stdin is the backpressure point for the whole
//! pipeline: when the encoder falls behind, writes block instead of
//! buffering media in memory.

use std::process::{Child, ChildStdin, Command, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::EncoderConfig;
use crate::error::{Error, Result};
use crate::transcode::muxer::WebmMuxer;
use crate::transcode::pipeline::TranscodeOutput;
use crate::transcode::vp8::StreamGeometry;

/// Builds the ffmpeg argument list for one RTMP publish.
fn ffmpeg_args(config: &EncoderConfig, destination: &str) -> Vec<String> {
    vec![
        "-loglevel".into(),
        config.log_level.clone(),
        "-re".into(),
        "-i".into(),
        "pipe:0".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        config.preset.clone(),
        "-b:v".into(),
        format!("{}k", config.video_bitrate_kbps),
        "-maxrate".into(),
        format!("{}k", config.video_bitrate_kbps),
        "-bufsize".into(),
        format!("{}k", config.video_bitrate_kbps * 2),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-g".into(),
        config.gop_size.to_string(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        format!("{}k", config.audio_bitrate_kbps),
        "-ac".into(),
        config.audio_channels.to_string(),
        "-ar".into(),
        config.audio_sample_rate.to_string(),
        "-f".into(),
        "flv".into(),
        destination.to_string(),
    ]
}

/// Handle to a running ffmpeg child.
///
/// The child is killed and reaped on shutdown or drop, so an abandoned
/// session cannot leak an encoder.
pub struct EncoderProcess {
    child: Child,
    reaped: bool,
}

impl EncoderProcess {
    /// Spawns ffmpeg publishing to `destination` and returns its stdin.
    ///
    /// stderr is forwarded line by line into the log, which requires an
    /// ambient Tokio runtime.
    pub fn spawn(config: &EncoderConfig, destination: &str) -> Result<(Self, ChildStdin)> {
        let args = ffmpeg_args(config, destination);
        debug!(path = %config.ffmpeg_path, ?args, "starting encoder");
        let mut child = Command::new(&config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Encoder(format!("spawn {}: {e}", config.ffmpeg_path)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Encoder("encoder stdin was not captured".into()))?;
        if let Some(stderr) = child.stderr.take() {
            match tokio::process::ChildStderr::from_std(stderr) {
                Ok(stderr) => {
                    tokio::spawn(forward_stderr(stderr));
                }
                Err(e) => warn!(error = %e, "cannot forward encoder stderr"),
            }
        }
        info!(destination, "encoder started");
        Ok((Self { child, reaped: false }, stdin))
    }

    /// Kills the child and reaps it. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.reaped {
            return;
        }
        self.reaped = true;
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "encoder already gone");
        }
        match self.child.wait() {
            Ok(status) => info!(%status, "encoder exited"),
            Err(e) => warn!(error = %e, "reaping encoder failed"),
        }
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Streams ffmpeg stderr into the log until the child closes it.
async fn forward_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    debug!("ffmpeg: {line}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "reading encoder stderr failed");
                break;
            }
        }
    }
}

/// Production pipeline output: a WebM muxer feeding a spawned ffmpeg child
/// over its stdin.
///
/// Writes go through the synchronous pipe; a slow encoder slows the
/// session down rather than growing an unbounded queue.
pub struct FfmpegWebmOutput {
    config: EncoderConfig,
    destination: String,
    encoder: Option<EncoderProcess>,
    muxer: Option<WebmMuxer<ChildStdin>>,
}

impl FfmpegWebmOutput {
    /// Prepares an output for `destination` without spawning anything yet.
    pub fn new(config: EncoderConfig, destination: impl Into<String>) -> Self {
        Self {
            config,
            destination: destination.into(),
            encoder: None,
            muxer: None,
        }
    }
}

impl TranscodeOutput for FfmpegWebmOutput {
    fn open(&mut self, geometry: StreamGeometry) -> Result<()> {
        if self.is_open() {
            return Err(Error::Encoder("output already open".into()));
        }
        let (encoder, stdin) = EncoderProcess::spawn(&self.config, &self.destination)?;
        self.muxer = Some(WebmMuxer::new(stdin, geometry)?);
        self.encoder = Some(encoder);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.muxer.is_some()
    }

    fn write_audio(&mut self, timestamp_ms: u64, data: &[u8]) -> Result<()> {
        match self.muxer.as_mut() {
            Some(muxer) => muxer.write_audio(timestamp_ms, data),
            None => Err(Error::Muxer("output is not open".into())),
        }
    }

    fn write_video(&mut self, timestamp_ms: u64, keyframe: bool, data: &[u8]) -> Result<()> {
        match self.muxer.as_mut() {
            Some(muxer) => muxer.write_video(timestamp_ms, keyframe, data),
            None => Err(Error::Muxer("output is not open".into())),
        }
    }

    fn shutdown(&mut self) {
        if let Some(muxer) = self.muxer.take() {
            if let Err(e) = muxer.finalize() {
                warn!(error = %e, "webm finalize during shutdown failed");
            }
        }
        if let Some(mut encoder) = self.encoder.take() {
            encoder.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_transcode_to_flv() {
        let config = EncoderConfig::default();
        let args = ffmpeg_args(&config, "rtmp://live.example.com/app/key");

        assert_eq!(args[0], "-loglevel");
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"aac".to_string()));
        assert!(args.contains(&"flv".to_string()));
        assert_eq!(args.last().unwrap(), "rtmp://live.example.com/app/key");
    }

    #[test]
    fn args_read_stdin_in_realtime() {
        let args = ffmpeg_args(&EncoderConfig::default(), "rtmp://x/y");
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "pipe:0");
        assert!(args.contains(&"-re".to_string()));
    }

    #[test]
    fn args_derive_rate_control_from_config() {
        let mut config = EncoderConfig::default();
        config.video_bitrate_kbps = 2500;
        let args = ffmpeg_args(&config, "rtmp://x/y");

        let bitrate = args.iter().position(|a| a == "-b:v").unwrap();
        assert_eq!(args[bitrate + 1], "2500k");
        let bufsize = args.iter().position(|a| a == "-bufsize").unwrap();
        assert_eq!(args[bufsize + 1], "5000k");
    }

    #[test]
    fn writes_require_open() {
        let mut output = FfmpegWebmOutput::new(EncoderConfig::default(), "rtmp://x/y");
        assert!(!output.is_open());
        assert!(output.write_audio(0, &[0]).is_err());
        assert!(output.write_video(0, true, &[0]).is_err());
    }
}
