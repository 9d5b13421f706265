//! Configuration types for the gateway

use serde::{Deserialize, Serialize};

/// Main configuration for the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen address for the signalling HTTP server
    pub listen_addr: String,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// Interval between PLI keyframe requests, in seconds (default: 3)
    pub pli_interval_secs: u64,

    /// Reassembly lateness window, in packets (default: 10)
    ///
    /// How many sequence numbers past a gap to wait before declaring the
    /// gap unrecoverable loss. Larger values tolerate more reordering at
    /// the cost of latency.
    pub max_late_packets: u16,

    /// Video RTP clock rate in Hz (default: 90_000 for VP8)
    pub video_clock_rate: u32,

    /// Audio RTP clock rate in Hz (default: 48_000 for Opus)
    pub audio_clock_rate: u32,

    /// Encoder process settings
    pub encoder: EncoderConfig,

    /// When set, sessions repacketize RTP onto local UDP sockets instead
    /// of running the transcode pipeline
    pub udp_forward: Option<UdpForwardConfig>,
}

/// Settings for the external ffmpeg encode-and-publish process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Path to the ffmpeg binary (default: "ffmpeg", resolved via PATH)
    pub ffmpeg_path: String,

    /// x264 encode preset (default: "veryfast")
    pub preset: String,

    /// Target video bitrate in kbps; maxrate follows it and bufsize is
    /// twice it (default: 3000)
    pub video_bitrate_kbps: u32,

    /// Keyframe interval in output frames (default: 50)
    pub gop_size: u32,

    /// Output audio bitrate in kbps (default: 160)
    pub audio_bitrate_kbps: u32,

    /// Output audio sample rate in Hz (default: 44_100)
    pub audio_sample_rate: u32,

    /// Output audio channel count (default: 2)
    pub audio_channels: u32,

    /// ffmpeg -loglevel value, surfaced through tracing (default: "error")
    pub log_level: String,
}

/// UDP repacketize-forward settings (sibling of the transcode path)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UdpForwardConfig {
    /// Local destination port for audio RTP
    pub audio_port: u16,

    /// Local destination port for video RTP
    pub video_port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5000".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            pli_interval_secs: 3,
            max_late_packets: 10,
            video_clock_rate: 90_000,
            audio_clock_rate: 48_000,
            encoder: EncoderConfig::default(),
            udp_forward: None,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            preset: "veryfast".to_string(),
            video_bitrate_kbps: 3000,
            gop_size: 50,
            audio_bitrate_kbps: 160,
            audio_sample_rate: 44_100,
            audio_channels: 2,
            log_level: "error".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty
    /// - `listen_addr` is not a parseable socket address
    /// - `pli_interval_secs` is zero
    /// - `max_late_packets` is zero
    /// - either clock rate is zero
    /// - the encoder settings fail their own validation
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::InvalidConfig(format!(
                "listen_addr must be a socket address, got {}",
                self.listen_addr
            )));
        }

        if self.pli_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "pli_interval_secs must be non-zero".to_string(),
            ));
        }

        if self.max_late_packets == 0 {
            return Err(Error::InvalidConfig(
                "max_late_packets must be non-zero".to_string(),
            ));
        }

        if self.video_clock_rate == 0 || self.audio_clock_rate == 0 {
            return Err(Error::InvalidConfig(
                "clock rates must be non-zero".to_string(),
            ));
        }

        self.encoder.validate()
    }

    /// Set the signalling listen address
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    /// Replace the STUN server list
    pub fn with_stun_servers(mut self, servers: Vec<String>) -> Self {
        self.stun_servers = servers;
        self
    }

    /// Set the PLI request interval
    pub fn with_pli_interval_secs(mut self, secs: u64) -> Self {
        self.pli_interval_secs = secs;
        self
    }

    /// Enable the UDP forward path
    pub fn with_udp_forward(mut self, audio_port: u16, video_port: u16) -> Self {
        self.udp_forward = Some(UdpForwardConfig {
            audio_port,
            video_port,
        });
        self
    }
}

impl EncoderConfig {
    /// Validate encoder parameters
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.ffmpeg_path.is_empty() {
            return Err(Error::InvalidConfig(
                "ffmpeg_path must not be empty".to_string(),
            ));
        }

        if self.video_bitrate_kbps == 0 {
            return Err(Error::InvalidConfig(
                "video_bitrate_kbps must be non-zero".to_string(),
            ));
        }

        if self.audio_channels == 0 || self.audio_channels > 2 {
            return Err(Error::InvalidConfig(format!(
                "audio_channels must be 1 or 2, got {}",
                self.audio_channels
            )));
        }

        if self.audio_sample_rate == 0 {
            return Err(Error::InvalidConfig(
                "audio_sample_rate must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
