//! Session registry and serialized event dispatch
//!
//! All sessions live in one map owned by a single dispatch task. Create
//! requests and session events travel through the same ordered queue, so
//! negotiation for one request finishes before the next command is examined
//! and two events for the same session can never race. Collaborators read
//! the map through accessors backed by a read lock; only the dispatch task
//! ever writes it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::peer::{PeerSession, SessionEvent};
use crate::signaling::sdp;

const COMMAND_QUEUE_DEPTH: usize = 64;

/// One create request as accepted from the signalling surface.
#[derive(Debug)]
pub struct CreateSession {
    /// Caller-chosen identifier; unique among live sessions.
    pub session_id: String,
    /// Base64-wrapped JSON offer as pasted or POSTed by the browser.
    pub offer: String,
    /// RTMP URL including the stream key.
    pub destination: String,
}

pub(crate) enum Command {
    Create {
        request: CreateSession,
        reply: oneshot::Sender<Result<String>>,
    },
    SessionEvent(SessionEvent),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Session-side handle for pushing events into the dispatch queue.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Command>,
}

impl EventSender {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// Returns false when the registry is no longer running.
    pub(crate) async fn send(&self, event: SessionEvent) -> bool {
        self.tx.send(Command::SessionEvent(event)).await.is_ok()
    }
}

type SessionMap = Arc<RwLock<HashMap<String, Arc<PeerSession>>>>;

/// Owner of every live session.
pub struct SessionRegistry {
    commands: mpsc::Sender<Command>,
    sessions: SessionMap,
}

impl SessionRegistry {
    /// Start the registry and its dispatch task.
    pub fn start(config: GatewayConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));

        tokio::spawn(dispatch(
            rx,
            EventSender::new(tx.clone()),
            Arc::clone(&sessions),
            config,
        ));

        Arc::new(Self {
            commands: tx,
            sessions,
        })
    }

    /// Create a session and return the base64 answer.
    ///
    /// Serialized through the dispatch queue: negotiation for this request
    /// completes before any later command is taken up.
    pub async fn create_session(&self, request: CreateSession) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.commands
            .send(Command::Create {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Registry("Dispatch loop is not running".to_string()))?;

        reply_rx
            .await
            .map_err(|_| Error::Registry("Dispatch loop dropped the request".to_string()))?
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn has_session(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn session(&self, session_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Drain every live session and stop the dispatch task.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();

        if self
            .commands
            .send(Command::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

async fn dispatch(
    mut commands: mpsc::Receiver<Command>,
    events: EventSender,
    sessions: SessionMap,
    config: GatewayConfig,
) {
    debug!("Session dispatch loop started");

    while let Some(command) = commands.recv().await {
        match command {
            Command::Create { request, reply } => {
                let result = create_session(&sessions, &config, events.clone(), request).await;
                let _ = reply.send(result);
            }
            Command::SessionEvent(event) => {
                let removed = sessions.write().await.remove(&event.session_id);
                match removed {
                    Some(session) => {
                        info!(
                            session_id = %event.session_id,
                            reason = ?event.reason,
                            "Removing session"
                        );
                        session.finalize().await;
                    }
                    None => {
                        debug!(
                            session_id = %event.session_id,
                            "Event for unknown session ignored"
                        );
                    }
                }
            }
            Command::Shutdown { reply } => {
                let drained: Vec<_> = sessions.write().await.drain().collect();
                for (session_id, session) in drained {
                    debug!(%session_id, "Closing session at shutdown");
                    session.finalize().await;
                }
                let _ = reply.send(());
                break;
            }
        }
    }

    debug!("Session dispatch loop ended");
}

async fn create_session(
    sessions: &SessionMap,
    config: &GatewayConfig,
    events: EventSender,
    request: CreateSession,
) -> Result<String> {
    if sessions.read().await.contains_key(&request.session_id) {
        warn!(session_id = %request.session_id, "Rejecting duplicate session");
        return Err(Error::SessionExists(request.session_id));
    }

    let offer = sdp::decode(&request.offer)?;
    if offer.sdp_type != RTCSdpType::Offer {
        return Err(Error::Sdp(format!(
            "Expected an offer, got {}",
            offer.sdp_type
        )));
    }

    let (session, answer) = PeerSession::connect(
        request.session_id.clone(),
        offer,
        request.destination,
        config,
        events,
    )
    .await?;

    let encoded = sdp::encode(&answer)?;
    sessions.write().await.insert(request.session_id, session);

    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{TeardownReason, TransportEvents};
    use std::time::Duration;
    use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

    fn offline_config() -> GatewayConfig {
        GatewayConfig {
            stun_servers: vec![],
            ..Default::default()
        }
    }

    async fn wire_offer() -> String {
        let remote = crate::peer::connection::build_peer_connection(&offline_config())
            .await
            .unwrap();
        let offer = remote.create_offer(None).await.unwrap();
        sdp::encode(&offer).unwrap()
    }

    fn create_request(session_id: &str, offer: String) -> CreateSession {
        CreateSession {
            session_id: session_id.to_string(),
            offer,
            destination: "rtmp://127.0.0.1/live/test".to_string(),
        }
    }

    async fn wait_until_removed(registry: &SessionRegistry, session_id: &str) {
        for _ in 0..100 {
            if !registry.has_session(session_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {session_id} was not removed");
    }

    #[tokio::test]
    async fn creates_and_answers_a_session() {
        let registry = SessionRegistry::start(offline_config());

        let answer = registry
            .create_session(create_request("cam-1", wire_offer().await))
            .await
            .unwrap();

        assert!(!answer.is_empty());
        assert_eq!(registry.session_count().await, 1);
        assert!(registry.has_session("cam-1").await);

        // The answer round-trips through the wire codec.
        let decoded = sdp::decode(&answer).unwrap();
        assert_eq!(decoded.sdp_type, RTCSdpType::Answer);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_session_id_is_rejected() {
        let registry = SessionRegistry::start(offline_config());

        registry
            .create_session(create_request("cam-1", wire_offer().await))
            .await
            .unwrap();

        let duplicate = registry
            .create_session(create_request("cam-1", wire_offer().await))
            .await;

        match duplicate {
            Err(error) => {
                assert!(matches!(error, Error::SessionExists(_)));
                assert!(error.is_request_error());
            }
            Ok(_) => panic!("duplicate create must be rejected"),
        }

        // The first session is unaffected.
        assert_eq!(registry.session_count().await, 1);
        assert!(registry.has_session("cam-1").await);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_offer_is_a_request_error() {
        let registry = SessionRegistry::start(offline_config());

        let result = registry
            .create_session(create_request("cam-1", "not base64!".to_string()))
            .await;

        match result {
            Err(error) => assert!(error.is_request_error()),
            Ok(_) => panic!("malformed offer must be rejected"),
        }
        assert_eq!(registry.session_count().await, 0);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn terminal_failure_removes_the_session_once() {
        let registry = SessionRegistry::start(offline_config());

        registry
            .create_session(create_request("cam-1", wire_offer().await))
            .await
            .unwrap();

        let session = registry.session("cam-1").await.unwrap();
        session
            .on_connection_state_changed(RTCPeerConnectionState::Failed)
            .await;
        session
            .on_connection_state_changed(RTCPeerConnectionState::Failed)
            .await;

        wait_until_removed(&registry, "cam-1").await;
        assert_eq!(registry.session_count().await, 0);

        // The identifier is free again once the session is gone.
        registry
            .create_session(create_request("cam-1", wire_offer().await))
            .await
            .unwrap();
        assert_eq!(registry.session_count().await, 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn event_for_unknown_session_is_ignored() {
        let registry = SessionRegistry::start(offline_config());

        registry
            .create_session(create_request("cam-1", wire_offer().await))
            .await
            .unwrap();

        registry
            .commands
            .send(Command::SessionEvent(SessionEvent {
                session_id: "ghost".to_string(),
                reason: TeardownReason::ConnectionFailed,
            }))
            .await
            .unwrap();

        // Queue a second create to prove the loop survived the stray event.
        registry
            .create_session(create_request("cam-2", wire_offer().await))
            .await
            .unwrap();

        assert_eq!(registry.session_count().await, 2);
        assert!(registry.has_session("cam-1").await);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_sessions_and_stops_the_loop() {
        let registry = SessionRegistry::start(offline_config());

        registry
            .create_session(create_request("cam-1", wire_offer().await))
            .await
            .unwrap();

        registry.shutdown().await;
        assert_eq!(registry.session_count().await, 0);

        let after = registry
            .create_session(create_request("cam-2", wire_offer().await))
            .await;
        assert!(matches!(after, Err(Error::Registry(_))));
    }
}
