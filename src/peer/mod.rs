//! WebRTC peer handling
//!
//! Connection construction and negotiation live in [`connection`]; the
//! per-browser session lifecycle, track fan-in, and keyframe requesting
//! live in [`session`].

pub mod connection;
pub mod session;

pub use connection::TransportEvents;
pub use session::{PeerSession, SessionEvent, SessionState, TeardownReason};
