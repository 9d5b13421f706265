//! WebRTC to RTMP media gateway
//!
//! Terminates a browser's WebRTC publish and republishes it as an RTMP
//! stream. One HTTP POST negotiates the session; from then on media flows
//! without further signalling:
//!
//! ```text
//!                 ┌──────────────────────── gateway ───────────────────────┐
//! browser ──RTP──▶ peer session ─▶ sample reassembly ─▶ WebM muxer ─▶ ffmpeg ──▶ RTMP
//!          ◀─PLI──                (per-track ordering)   (Opus+VP8)   (stdin)
//!                 └────────────────────────────────────────────────────────┘
//! ```
//!
//! * [`signaling`] accepts the offer (base64-wrapped JSON) and returns the
//!   answer in the same response; ICE is gathered up front, so no trickle
//!   channel is needed.
//! * [`peer`] owns one session per publisher: receive-only VP8/Opus
//!   transceivers, a read task per track, and periodic keyframe requests.
//! * [`transcode`] reassembles RTP into samples, discovers the stream
//!   geometry from the first keyframe, muxes into live-mode WebM, and pipes
//!   it to a long-lived ffmpeg process that pushes RTMP.
//! * [`session`] is the registry: one dispatch task owns every session and
//!   serializes creates against teardown events.
//! * [`forward`] is the alternative delivery path: raw RTP re-stamped and
//!   forwarded over loopback UDP instead of being transcoded.
//!
//! # Example
//!
//! ```no_run
//! use rtmp_gateway::config::GatewayConfig;
//! use rtmp_gateway::session::SessionRegistry;
//! use rtmp_gateway::signaling;
//!
//! # async fn run() -> rtmp_gateway::Result<()> {
//! let config = GatewayConfig::default();
//! config.validate()?;
//!
//! let registry = SessionRegistry::start(config.clone());
//! signaling::http::serve(registry, &config.listen_addr, std::future::pending::<()>()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod forward;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod transcode;

pub use config::{EncoderConfig, GatewayConfig, UdpForwardConfig};
pub use error::{Error, Result};
pub use session::SessionRegistry;
