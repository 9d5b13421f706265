//! Session description wire codec
//!
//! The browser client exchanges descriptions as base64-wrapped JSON
//! (`{"type":"offer","sdp":"..."}`), the format produced by serializing an
//! `RTCSessionDescription` directly. Decoding rebuilds the description
//! through its typed constructor so the parsed SDP is populated and
//! malformed input is rejected at the signalling edge rather than deep in
//! negotiation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct DescriptionPayload {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
}

/// Encode a session description into the base64 wire form.
pub fn encode(description: &RTCSessionDescription) -> Result<String> {
    let payload = DescriptionPayload {
        kind: description.sdp_type.to_string(),
        sdp: description.sdp.clone(),
    };

    let json = serde_json::to_vec(&payload)
        .map_err(|e| Error::Sdp(format!("Failed to serialize description: {e}")))?;

    Ok(STANDARD.encode(json))
}

/// Decode the base64 wire form back into a typed session description.
pub fn decode(encoded: &str) -> Result<RTCSessionDescription> {
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Sdp(format!("Failed to decode base64 payload: {e}")))?;

    let payload: DescriptionPayload = serde_json::from_slice(&raw)
        .map_err(|e| Error::Sdp(format!("Failed to parse description payload: {e}")))?;

    match payload.kind.as_str() {
        "offer" => RTCSessionDescription::offer(payload.sdp)
            .map_err(|e| Error::Sdp(format!("Failed to parse offer SDP: {e}"))),
        "answer" => RTCSessionDescription::answer(payload.sdp)
            .map_err(|e| Error::Sdp(format!("Failed to parse answer SDP: {e}"))),
        other => Err(Error::Sdp(format!(
            "Unsupported description type: {other:?}"
        ))),
    }
}
