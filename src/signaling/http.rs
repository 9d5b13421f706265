//! HTTP signalling endpoint
//!
//! One POST creates a session: the browser submits its id, the base64 offer,
//! and the RTMP destination, and receives the base64 answer in the same
//! response. Everything that can go wrong after negotiation is visible only
//! through logs and the session's disappearance from the registry, so the
//! error surface here is small: 409 for a duplicate id, 400 for anything
//! unparseable, 500 for the rest.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Error, Result};
use crate::session::{CreateSession, SessionRegistry};

/// Body of `POST /api/peer`. Field names are the wire contract with the
/// browser client.
#[derive(Debug, Deserialize)]
pub struct CreatePeerRequest {
    pub id: String,
    pub session_description_offer: String,
    pub rtmp_url_with_stream_key: String,
}

/// Successful response: the answer travels back under the same field name
/// the offer arrived under.
#[derive(Debug, Serialize)]
pub struct CreatePeerResponse {
    pub session_description_offer: String,
}

/// Build the signalling router.
pub fn router(registry: Arc<SessionRegistry>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/peer", post(create_peer))
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Serve the router until the shutdown future resolves.
pub async fn serve<F>(
    registry: Arc<SessionRegistry>,
    listen_addr: &str,
    shutdown: F,
) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("Signalling endpoint listening on {}", listener.local_addr()?);

    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn create_peer(
    State(registry): State<Arc<SessionRegistry>>,
    Json(request): Json<CreatePeerRequest>,
) -> Response {
    info!(session_id = %request.id, "Create peer requested");

    let create = CreateSession {
        session_id: request.id,
        offer: request.session_description_offer,
        destination: request.rtmp_url_with_stream_key,
    };

    match registry.create_session(create).await {
        Ok(answer) => (
            StatusCode::OK,
            Json(CreatePeerResponse {
                session_description_offer: answer,
            }),
        )
            .into_response(),
        Err(error) => error_response(&error),
    }
}

async fn health(State(registry): State<Arc<SessionRegistry>>) -> Response {
    let body = json!({
        "status": "ok",
        "sessions": registry.session_count().await,
    });

    (StatusCode::OK, Json(body)).into_response()
}

fn error_response(error: &Error) -> Response {
    let status = match error {
        Error::SessionExists(_) => StatusCode::CONFLICT,
        Error::Sdp(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::signaling::sdp;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use serde_json::Value;
    use tower::ServiceExt;

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

    fn post_peer(body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/api/peer")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    async fn response_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_session_count() {
        let registry = SessionRegistry::start(offline_config());
        let app = router(Arc::clone(&registry));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn create_peer_returns_the_answer() {
        let registry = SessionRegistry::start(offline_config());
        let app = router(Arc::clone(&registry));

        let response = app
            .oneshot(post_peer(json!({
                "id": "cam-1",
                "session_description_offer": wire_offer().await,
                "rtmp_url_with_stream_key": "rtmp://127.0.0.1/live/key",
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        let answer = body["session_description_offer"].as_str().unwrap();
        assert!(sdp::decode(answer).is_ok());

        assert_eq!(registry.session_count().await, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_offer_maps_to_bad_request() {
        let registry = SessionRegistry::start(offline_config());
        let app = router(Arc::clone(&registry));

        let response = app
            .oneshot(post_peer(json!({
                "id": "cam-1",
                "session_description_offer": "garbage",
                "rtmp_url_with_stream_key": "rtmp://127.0.0.1/live/key",
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("SDP"));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_id_maps_to_conflict() {
        let registry = SessionRegistry::start(offline_config());
        let app = router(Arc::clone(&registry));

        let first = app
            .clone()
            .oneshot(post_peer(json!({
                "id": "cam-1",
                "session_description_offer": wire_offer().await,
                "rtmp_url_with_stream_key": "rtmp://127.0.0.1/live/key",
            })))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(post_peer(json!({
                "id": "cam-1",
                "session_description_offer": wire_offer().await,
                "rtmp_url_with_stream_key": "rtmp://127.0.0.1/live/key",
            })))
            .await
            .unwrap();

        assert_eq!(second.status(), StatusCode::CONFLICT);
        registry.shutdown().await;
    }
}
