//! Error types for the gateway

/// Result type alias using the gateway Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in gateway operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Session identifier already bound to a live session
    #[error("Session already exists: {0}")]
    SessionExists(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    Sdp(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrack(String),

    /// Malformed media payload that cannot be reassembled
    #[error("Bitstream error: {0}")]
    Bitstream(String),

    /// Container muxer error
    #[error("Muxer error: {0}")]
    Muxer(String),

    /// Encoder process error
    #[error("Encoder process error: {0}")]
    Encoder(String),

    /// Registry dispatch loop gone or unreachable
    #[error("Registry unavailable: {0}")]
    Registry(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error must tear down the whole session.
    ///
    /// Bitstream and downstream I/O failures poison the container stream;
    /// the session cannot continue past them.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Bitstream(_) | Error::Muxer(_) | Error::Encoder(_) | Error::Io(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error should surface as a signalling request error
    /// rather than an internal failure
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Error::SessionExists(_) | Error::SessionNotFound(_) | Error::Sdp(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");

        let err = Error::SessionExists("abc".to_string());
        assert_eq!(err.to_string(), "Session already exists: abc");
    }

    #[test]
    fn test_error_is_session_fatal() {
        assert!(Error::Bitstream("truncated".to_string()).is_session_fatal());
        assert!(Error::Encoder("stdin closed".to_string()).is_session_fatal());
        assert!(!Error::SessionExists("abc".to_string()).is_session_fatal());
        assert!(!Error::Sdp("bad offer".to_string()).is_session_fatal());
    }

    #[test]
    fn test_error_is_config_error() {
        assert!(Error::InvalidConfig("test".to_string()).is_config_error());
        assert!(!Error::Muxer("test".to_string()).is_config_error());
    }

    #[test]
    fn test_error_is_request_error() {
        assert!(Error::SessionExists("abc".to_string()).is_request_error());
        assert!(Error::Sdp("bad offer".to_string()).is_request_error());
        assert!(!Error::Encoder("died".to_string()).is_request_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_session_fatal());
    }
}
