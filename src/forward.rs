//! UDP fan-out of received RTP
//!
//! Alternative delivery path to the transcode pipeline: each received packet
//! is re-stamped with a fixed payload type and pushed to a local consumer
//! (typically an ffmpeg or GStreamer process listening on loopback). The
//! consumer may come and go while the session lives, so send failures are
//! never fatal.

use std::io;

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::util::Marshal;

use crate::config::UdpForwardConfig;
use crate::error::Result;

/// Payload type stamped onto forwarded Opus packets.
const FORWARD_AUDIO_PAYLOAD_TYPE: u8 = 111;

/// Payload type stamped onto forwarded VP8 packets.
const FORWARD_VIDEO_PAYLOAD_TYPE: u8 = 96;

/// Largest datagram the forwarder will emit.
const MAX_DATAGRAM: usize = 1500;

/// Repacketizing RTP forwarder over two connected loopback sockets.
pub struct UdpForwarder {
    audio_socket: UdpSocket,
    video_socket: UdpSocket,
}

impl UdpForwarder {
    /// Open one connected socket per track kind.
    pub async fn bind(config: &UdpForwardConfig) -> Result<Self> {
        let audio_socket = connected_socket(config.audio_port).await?;
        let video_socket = connected_socket(config.video_port).await?;

        debug!(
            audio_port = config.audio_port,
            video_port = config.video_port,
            "UDP forwarder bound"
        );

        Ok(Self {
            audio_socket,
            video_socket,
        })
    }

    /// Re-stamp and forward one packet.
    ///
    /// A refused send means nobody is listening on the destination port yet;
    /// the packet is dropped and the next one is tried as usual.
    pub async fn forward(&self, kind: RTPCodecType, packet: &Packet) {
        let (socket, payload_type) = match kind {
            RTPCodecType::Audio => (&self.audio_socket, FORWARD_AUDIO_PAYLOAD_TYPE),
            RTPCodecType::Video => (&self.video_socket, FORWARD_VIDEO_PAYLOAD_TYPE),
            RTPCodecType::Unspecified => return,
        };

        let mut restamped = packet.clone();
        restamped.header.payload_type = payload_type;

        let datagram = match restamped.marshal() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to marshal RTP packet for forwarding: {e}");
                return;
            }
        };

        if datagram.len() > MAX_DATAGRAM {
            warn!(len = datagram.len(), "Dropping oversized RTP packet");
            return;
        }

        match socket.send(&datagram).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                trace!("Forward destination for {kind} refused the packet");
            }
            Err(e) => warn!("Failed to forward {kind} packet: {e}"),
        }
    }
}

async fn connected_socket(port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(("127.0.0.1", port)).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use webrtc::rtp::header::Header;
    use webrtc::util::Unmarshal;

    fn rtp_packet(payload_type: u8, sequence_number: u16) -> Packet {
        Packet {
            header: Header {
                version: 2,
                payload_type,
                sequence_number,
                timestamp: 1234,
                ssrc: 0xdecafbad,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
        }
    }

    async fn listener() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    async fn recv_packet(socket: &UdpSocket) -> Packet {
        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for forwarded packet")
            .unwrap();

        let mut raw = &buf[..len];
        Packet::unmarshal(&mut raw).unwrap()
    }

    #[tokio::test]
    async fn rewrites_payload_types_per_track_kind() {
        let (audio_listener, audio_port) = listener().await;
        let (video_listener, video_port) = listener().await;

        let forwarder = UdpForwarder::bind(&UdpForwardConfig {
            audio_port,
            video_port,
        })
        .await
        .unwrap();

        forwarder
            .forward(RTPCodecType::Audio, &rtp_packet(0, 7))
            .await;
        forwarder
            .forward(RTPCodecType::Video, &rtp_packet(0, 8))
            .await;

        let audio = recv_packet(&audio_listener).await;
        assert_eq!(audio.header.payload_type, 111);
        assert_eq!(audio.header.sequence_number, 7);
        assert_eq!(audio.payload.as_ref(), &[0xde, 0xad, 0xbe, 0xef]);

        let video = recv_packet(&video_listener).await;
        assert_eq!(video.header.payload_type, 96);
        assert_eq!(video.header.sequence_number, 8);
    }

    #[tokio::test]
    async fn original_packet_is_left_untouched() {
        let (audio_listener, audio_port) = listener().await;
        let (_video_listener, video_port) = listener().await;

        let forwarder = UdpForwarder::bind(&UdpForwardConfig {
            audio_port,
            video_port,
        })
        .await
        .unwrap();

        let packet = rtp_packet(42, 9);
        forwarder.forward(RTPCodecType::Audio, &packet).await;

        recv_packet(&audio_listener).await;
        assert_eq!(packet.header.payload_type, 42);
    }

    #[tokio::test]
    async fn refused_sends_are_swallowed() {
        // Ports nobody listens on; the connected sockets surface ICMP
        // refusals as ConnectionRefused on a later send.
        let forwarder = UdpForwarder::bind(&UdpForwardConfig {
            audio_port: 1,
            video_port: 1,
        })
        .await
        .unwrap();

        for seq in 0..4 {
            forwarder
                .forward(RTPCodecType::Audio, &rtp_packet(0, seq))
                .await;
            forwarder
                .forward(RTPCodecType::Video, &rtp_packet(0, seq))
                .await;
        }
    }
}
