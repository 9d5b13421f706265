//! Peer session: one publishing browser and its media fan-in
//!
//! A `PeerSession` owns the peer connection plus whichever media sink the
//! gateway was configured with: the ffmpeg transcode pipeline (default) or
//! the UDP forwarder. It implements [`TransportEvents`], spawning one read
//! task and one keyframe-request task per remote track, and reports terminal
//! failures to the registry as a single `SessionEvent` no matter how many
//! failure paths fire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::forward::UdpForwarder;
use crate::peer::connection::{self, TransportEvents};
use crate::session::registry::EventSender;
use crate::transcode::{FfmpegWebmOutput, TranscodePipeline};

/// Session lifecycle as observed through transport callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Why a session asked the registry to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// The transport reported the connection as failed.
    ConnectionFailed,
    /// The transcode pipeline hit a session-fatal error.
    PipelineFailed,
}

/// Notification from a session to the registry dispatch loop.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: String,
    pub reason: TeardownReason,
}

enum MediaSink {
    Transcode(Arc<Mutex<TranscodePipeline>>),
    Forward(Arc<UdpForwarder>),
}

/// One browser's publishing session.
pub struct PeerSession {
    session_id: String,
    destination: String,
    peer_connection: Arc<RTCPeerConnection>,
    sink: MediaSink,
    state: RwLock<SessionState>,
    teardown_requested: AtomicBool,
    finalized: AtomicBool,
    events: EventSender,
    pli_interval: Duration,
    created_at: SystemTime,
}

impl PeerSession {
    /// Build a peer connection, negotiate an answer for `offer`, and start
    /// listening for tracks. The returned session is live; the registry owns
    /// it from here on.
    pub async fn connect(
        session_id: String,
        offer: RTCSessionDescription,
        destination: String,
        config: &GatewayConfig,
        events: EventSender,
    ) -> Result<(Arc<Self>, RTCSessionDescription)> {
        let peer_connection = connection::build_peer_connection(config).await?;

        let sink = match &config.udp_forward {
            Some(forward) => MediaSink::Forward(Arc::new(UdpForwarder::bind(forward).await?)),
            None => {
                let output = FfmpegWebmOutput::new(config.encoder.clone(), destination.clone());
                MediaSink::Transcode(Arc::new(Mutex::new(TranscodePipeline::new(
                    session_id.clone(),
                    config,
                    Box::new(output),
                ))))
            }
        };

        let session = Arc::new(Self {
            session_id,
            destination,
            peer_connection: Arc::clone(&peer_connection),
            sink,
            state: RwLock::new(SessionState::New),
            teardown_requested: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            events,
            pli_interval: Duration::from_secs(config.pli_interval_secs),
            created_at: SystemTime::now(),
        });

        let events: std::sync::Weak<PeerSession> = Arc::downgrade(&session);
        connection::register_callbacks(&peer_connection, events);

        session.set_state(SessionState::Connecting).await;
        let answer = match connection::negotiate_answer(&peer_connection, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                // Close rather than drop, so the ICE agent does not linger.
                if let Err(close_err) = peer_connection.close().await {
                    warn!("Error closing connection after failed negotiation: {close_err}");
                }
                return Err(e);
            }
        };

        info!(
            session_id = %session.session_id,
            destination = %session.destination,
            "Session negotiated"
        );

        Ok((session, answer))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    async fn set_state(&self, new_state: SessionState) {
        let mut state = self.state.write().await;
        let old_state = *state;

        if old_state != new_state {
            debug!(
                session_id = %self.session_id,
                "Session state transition: {:?} -> {:?}",
                old_state,
                new_state
            );
            *state = new_state;
        }
    }

    /// Release the pipeline and the connection. Idempotent; normally invoked
    /// by the registry when it removes the session from its map.
    pub async fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }

        if let MediaSink::Transcode(pipeline) = &self.sink {
            pipeline.lock().await.shutdown();
        }

        if let Err(e) = self.peer_connection.close().await {
            warn!(session_id = %self.session_id, "Error closing peer connection: {e}");
        }

        let uptime_secs = self
            .created_at
            .elapsed()
            .map(|uptime| uptime.as_secs())
            .unwrap_or(0);

        info!(session_id = %self.session_id, uptime_secs, "Session finalized");
    }

    /// Ask the registry to remove this session. At most one event is emitted
    /// no matter how many failure paths race here.
    async fn request_teardown(&self, reason: TeardownReason) {
        if self.teardown_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!(session_id = %self.session_id, ?reason, "Requesting session teardown");

        let event = SessionEvent {
            session_id: self.session_id.clone(),
            reason,
        };

        if !self.events.send(event).await {
            // The registry is gone; release resources in place so the
            // connection and encoder do not outlive it.
            warn!(session_id = %self.session_id, "Registry unavailable, finalizing in place");
            self.finalize().await;
        }
    }

    async fn handle_packet(&self, kind: RTPCodecType, packet: Packet) -> Result<()> {
        match &self.sink {
            MediaSink::Transcode(pipeline) => {
                let mut pipeline = pipeline.lock().await;
                // Writes into ffmpeg stdin can block on encoder
                // backpressure.
                tokio::task::block_in_place(|| match kind {
                    RTPCodecType::Audio => pipeline.handle_audio_packet(packet),
                    RTPCodecType::Video => pipeline.handle_video_packet(packet),
                    RTPCodecType::Unspecified => Ok(()),
                })
            }
            MediaSink::Forward(forwarder) => {
                forwarder.forward(kind, &packet).await;
                Ok(())
            }
        }
    }

    /// Pull RTP from one track until the transport closes or the sink fails.
    ///
    /// Holding `_pli_guard` keeps the track's keyframe requester alive;
    /// dropping it on exit cancels that task deterministically.
    async fn run_track_reader(
        self: Arc<Self>,
        track: Arc<TrackRemote>,
        _pli_guard: oneshot::Sender<()>,
    ) {
        let kind = track.kind();

        loop {
            let (packet, _attributes) = match track.read_rtp().await {
                Ok(read) => read,
                Err(e) => {
                    debug!(
                        session_id = %self.session_id,
                        %kind,
                        "RTP read ended: {e}"
                    );
                    break;
                }
            };

            if let Err(e) = self.handle_packet(kind, packet).await {
                error!(session_id = %self.session_id, %kind, "Media handling failed: {e}");
                self.request_teardown(TeardownReason::PipelineFailed).await;
                break;
            }
        }

        debug!(session_id = %self.session_id, %kind, "Track reader ended");
    }

    /// Periodically ask the browser for a keyframe on one stream.
    async fn run_keyframe_requests(
        peer_connection: Arc<RTCPeerConnection>,
        media_ssrc: u32,
        interval: Duration,
        mut cancelled: oneshot::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut cancelled => break,
                _ = ticker.tick() => {
                    if let Err(e) =
                        connection::request_keyframe(&peer_connection, media_ssrc).await
                    {
                        debug!(ssrc = media_ssrc, "Keyframe request failed: {e}");
                        break;
                    }
                }
            }
        }

        debug!(ssrc = media_ssrc, "Keyframe requester ended");
    }
}

#[async_trait]
impl TransportEvents for PeerSession {
    async fn on_track_started(self: Arc<Self>, track: Arc<TrackRemote>) {
        info!(
            session_id = %self.session_id,
            kind = %track.kind(),
            ssrc = track.ssrc(),
            "Remote track started"
        );

        let (pli_guard, pli_cancelled) = oneshot::channel();

        tokio::spawn(Self::run_keyframe_requests(
            Arc::clone(&self.peer_connection),
            track.ssrc(),
            self.pli_interval,
            pli_cancelled,
        ));

        tokio::spawn(self.run_track_reader(track, pli_guard));
    }

    async fn on_connection_state_changed(&self, state: RTCPeerConnectionState) {
        let mapped = match state {
            RTCPeerConnectionState::Connecting => SessionState::Connecting,
            RTCPeerConnectionState::Connected => SessionState::Connected,
            RTCPeerConnectionState::Disconnected => SessionState::Disconnected,
            RTCPeerConnectionState::Failed => SessionState::Failed,
            RTCPeerConnectionState::Closed => SessionState::Closed,
            _ => return,
        };

        self.set_state(mapped).await;

        if mapped == SessionState::Failed {
            self.request_teardown(TeardownReason::ConnectionFailed).await;
        }
    }

    async fn on_ice_state_changed(&self, state: RTCIceConnectionState) {
        debug!(session_id = %self.session_id, ?state, "ICE connection state changed");
    }
}
