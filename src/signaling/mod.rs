//! Signalling surface
//!
//! [`sdp`] is the base64 wire codec for session descriptions; [`http`] is
//! the REST endpoint the browser client talks to.

pub mod http;
pub mod sdp;
