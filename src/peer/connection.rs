//! WebRTC peer connection construction and negotiation
//!
//! Builds the `RTCPeerConnection` a browser publishes into: a media engine
//! registering exactly the two codecs the gateway consumes, the default
//! interceptor set (NACK, RTCP reports), receive-only transceivers for one
//! audio and one video track, and a non-trickle answer flow that waits for
//! ICE gathering so the whole exchange fits in a single HTTP round trip.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};

/// Payload type offered for VP8 video.
pub const VIDEO_PAYLOAD_TYPE: u8 = 96;

/// Payload type offered for Opus audio.
pub const AUDIO_PAYLOAD_TYPE: u8 = 111;

/// Callbacks the transport delivers to the session that owns a connection.
///
/// Registered once at construction; the connection holds the sink weakly so
/// a torn-down session is dropped even while webrtc-rs still owns the
/// callback closures.
#[async_trait]
pub trait TransportEvents: Send + Sync {
    /// A remote track produced its first packet.
    async fn on_track_started(self: Arc<Self>, track: Arc<TrackRemote>);

    /// The peer connection state machine moved.
    async fn on_connection_state_changed(&self, state: RTCPeerConnectionState);

    /// The ICE transport state machine moved.
    async fn on_ice_state_changed(&self, state: RTCIceConnectionState);
}

/// Build a receive-only peer connection from the gateway configuration.
///
/// The media engine registers VP8 at payload type 96 (90 kHz clock) and
/// Opus at payload type 111 (48 kHz, stereo) and nothing else, so the
/// browser is steered onto the codecs the downstream pipeline understands.
pub async fn build_peer_connection(config: &GatewayConfig) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: config.video_clock_rate,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: VIDEO_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| Error::PeerConnection(format!("Failed to register VP8 codec: {e}")))?;

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: config.audio_clock_rate,
                    channels: 2,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: AUDIO_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| Error::PeerConnection(format!("Failed to register Opus codec: {e}")))?;

    let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
        .map_err(|e| Error::PeerConnection(format!("Failed to register interceptors: {e}")))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(interceptor_registry)
        .build();

    let ice_servers = config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect();

    let rtc_config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let peer_connection = Arc::new(
        api.new_peer_connection(rtc_config)
            .await
            .map_err(|e| Error::PeerConnection(format!("Failed to create peer connection: {e}")))?,
    );

    for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
        peer_connection
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| {
                Error::PeerConnection(format!("Failed to add {kind} transceiver: {e}"))
            })?;
    }

    Ok(peer_connection)
}

/// Wire the connection's callbacks to an event sink.
///
/// The sink is held weakly: once the owning session is dropped the
/// callbacks degrade to no-ops instead of keeping it alive through the
/// connection's internal handler slots.
pub fn register_callbacks(
    peer_connection: &RTCPeerConnection,
    events: Weak<dyn TransportEvents>,
) {
    let track_events = events.clone();
    peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
        let events = track_events.clone();
        Box::pin(async move {
            if let Some(events) = events.upgrade() {
                events.on_track_started(track).await;
            }
        })
    }));

    let state_events = events.clone();
    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                if let Some(events) = events.upgrade() {
                    events.on_connection_state_changed(state).await;
                }
            })
        },
    ));

    peer_connection.on_ice_connection_state_change(Box::new(
        move |state: RTCIceConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                if let Some(events) = events.upgrade() {
                    events.on_ice_state_changed(state).await;
                }
            })
        },
    ));
}

/// Accept a remote offer and produce the local answer.
///
/// Signalling is single-shot, so the answer is not returned until ICE
/// gathering finishes and every candidate is baked into the SDP.
pub async fn negotiate_answer(
    peer_connection: &RTCPeerConnection,
    offer: RTCSessionDescription,
) -> Result<RTCSessionDescription> {
    peer_connection
        .set_remote_description(offer)
        .await
        .map_err(|e| Error::Sdp(format!("Failed to set remote description: {e}")))?;

    let answer = peer_connection
        .create_answer(None)
        .await
        .map_err(|e| Error::Sdp(format!("Failed to create answer: {e}")))?;

    let mut gather_complete = peer_connection.gathering_complete_promise().await;

    peer_connection
        .set_local_description(answer)
        .await
        .map_err(|e| Error::Sdp(format!("Failed to set local description: {e}")))?;

    let _ = gather_complete.recv().await;

    debug!("ICE gathering complete, local answer ready");

    peer_connection
        .local_description()
        .await
        .ok_or_else(|| Error::Sdp("No local description after gathering".to_string()))
}

/// Send a Picture Loss Indication for one received stream.
///
/// The browser responds with a fresh keyframe, which is what allows the
/// pipeline to (re)start decodable output mid-stream.
pub async fn request_keyframe(
    peer_connection: &RTCPeerConnection,
    media_ssrc: u32,
) -> Result<()> {
    peer_connection
        .write_rtcp(&[Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        })])
        .await?;

    Ok(())
}
