//! HTTP and WebSocket routes.
//!
//! Provides:
//! - `/` - Service banner
//! - `/health` - Liveness with worker identity and store backend
//! - `/api/v1/push/sidecar/{app_id}/{deployment_id}` - Sidecar WebSocket
//! - `/api/v1/push/ide/{app_id}/{deployment_id}` - IDE WebSocket
//! - `/api/v1/push/ide/{app_id}/{deployment_id}/ready` - Sidecar readiness

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
};
use csp_common::ConnectionKey;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::manager::ConnectionManager;
use crate::transport::Connection;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub manager: Arc<ConnectionManager>,
    /// Daemon version.
    pub version: &'static str,
    pub started_at: Instant,
}

/// Identity supplied by the fronting layer; absent means standalone.
#[derive(Debug, Default, Deserialize)]
pub struct IdentityQuery {
    pub org_id: Option<String>,
    pub user_id: Option<String>,
}

impl IdentityQuery {
    fn into_key(self, app_id: String, deployment_id: String) -> ConnectionKey {
        ConnectionKey::with_identity(app_id, deployment_id, self.org_id, self.user_id)
    }
}

pub fn create_router(state: HttpState) -> Router {
    let push_routes = Router::new()
        .route("/sidecar/{app_id}/{deployment_id}", get(sidecar_ws_handler))
        .route("/ide/{app_id}/{deployment_id}", get(ide_ws_handler))
        .route("/ide/{app_id}/{deployment_id}/ready", get(ready_handler));

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .nest("/api/v1/push", push_routes)
        .with_state(Arc::new(state))
}

/// Serve `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: HttpState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state);
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn root_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(json!({
        "message": "Code sync proxy",
        "worker_id": state.manager.worker_id().as_str(),
    }))
}

async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "worker_id": state.manager.worker_id().as_str(),
        "version": state.version,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "store_backend": state.manager.store().backend_name(),
        "active_connections": state.manager.registry().len(),
    }))
}

async fn sidecar_ws_handler(
    ws: WebSocketUpgrade,
    Path((app_id, deployment_id)): Path<(String, String)>,
    Query(identity): Query<IdentityQuery>,
    State(state): State<Arc<HttpState>>,
) -> Response {
    let key = identity.into_key(app_id, deployment_id);
    let manager = Arc::clone(&state.manager);
    ws.on_upgrade(move |socket| async move {
        manager
            .attach_sidecar(key, Connection::from_websocket(socket))
            .await;
    })
}

async fn ide_ws_handler(
    ws: WebSocketUpgrade,
    Path((app_id, deployment_id)): Path<(String, String)>,
    Query(identity): Query<IdentityQuery>,
    State(state): State<Arc<HttpState>>,
) -> Response {
    let key = identity.into_key(app_id, deployment_id);
    let manager = Arc::clone(&state.manager);
    ws.on_upgrade(move |socket| async move {
        manager
            .attach_ide(key, Connection::from_websocket(socket))
            .await;
    })
}

/// Handler for the readiness probe. Never mutates state.
async fn ready_handler(
    Path((app_id, deployment_id)): Path<(String, String)>,
    Query(identity): Query<IdentityQuery>,
    State(state): State<Arc<HttpState>>,
) -> impl IntoResponse {
    let key = identity.into_key(app_id, deployment_id);
    let ready = state.manager.is_sidecar_ready(&key).await;
    Json(json!({ "ready": ready }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConnectionStore;
    use crate::test_support::{Harness, wait_until};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use csp_common::{ConnectionRole, Envelope, PushMessage, PushStatus, WorkerId};
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use tokio_tungstenite::tungstenite::Message;
    use tower::ServiceExt;

    fn make_test_state(harness: &Harness) -> HttpState {
        HttpState {
            manager: Arc::clone(&harness.manager),
            version: "0.3.0-test",
            started_at: Instant::now(),
        }
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn spawn_server(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let harness = Harness::new("w-health");
        let (status, json) = get_json(create_router(make_test_state(&harness)), "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["worker_id"], "w-health");
        assert_eq!(json["version"], "0.3.0-test");
        assert_eq!(json["store_backend"], "local");
        assert_eq!(json["active_connections"], 0);
    }

    #[tokio::test]
    async fn test_root_endpoint() {
        let harness = Harness::new("w1");
        let (status, json) = get_json(create_router(make_test_state(&harness)), "/").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["worker_id"], "w1");
    }

    #[tokio::test]
    async fn test_ready_reflects_store_without_mutating() {
        let harness = Harness::new("w1");
        harness
            .store
            .register(
                ConnectionRole::Sidecar,
                &ConnectionKey::new("app-1", "dep-1"),
                &WorkerId::new("w2"),
            )
            .await
            .unwrap();
        let router = create_router(make_test_state(&harness));

        let (_, ready) = get_json(router.clone(), "/api/v1/push/ide/app-1/dep-1/ready").await;
        assert_eq!(ready["ready"], true);

        let (_, not_ready) = get_json(router.clone(), "/api/v1/push/ide/app-1/dep-2/ready").await;
        assert_eq!(not_ready["ready"], false);

        // Identity is part of the key.
        let (_, other_user) = get_json(
            router,
            "/api/v1/push/ide/app-1/dep-1/ready?org_id=org&user_id=u1",
        )
        .await;
        assert_eq!(other_user["ready"], false);

        assert!(harness.manager.registry().is_empty());
        assert_eq!(
            harness
                .store
                .get_owner(ConnectionRole::Ide, &ConnectionKey::new("app-1", "dep-1"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_websocket_relay_end_to_end() {
        let harness = Harness::new("w1");
        let router = create_router(make_test_state(&harness));
        let addr = spawn_server(router.clone()).await;

        let (mut sidecar, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/push/sidecar/app-1/dep-1"))
                .await
                .unwrap();
        let key = ConnectionKey::new("app-1", "dep-1");
        wait_until(|| {
            harness
                .manager
                .registry()
                .lookup(ConnectionRole::Sidecar, &key)
                .is_some()
        })
        .await;

        let (_, ready) = get_json(router, "/api/v1/push/ide/app-1/dep-1/ready").await;
        assert_eq!(ready["ready"], true);

        let (mut ide, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/push/ide/app-1/dep-1"))
                .await
                .unwrap();
        wait_until(|| {
            harness
                .manager
                .registry()
                .lookup(ConnectionRole::Ide, &key)
                .is_some()
        })
        .await;

        let push = Envelope::PushRequest(PushMessage {
            push_id: "p1".to_string(),
            batch_file: b"data".to_vec(),
            code_diff: "diff".to_string(),
            change_description: "desc".to_string(),
            database_branch_updates: Vec::new(),
        });
        ide.send(Message::binary(push.encode_to_vec())).await.unwrap();

        let received = loop {
            match sidecar.next().await {
                Some(Ok(Message::Binary(data))) => break data,
                Some(Ok(_)) => continue,
                other => panic!("sidecar stream ended: {:?}", other),
            }
        };
        assert_eq!(Envelope::decode(&received).unwrap(), push);
        wait_until(|| harness.pushes.get("p1").map(|r| r.status) == Some(PushStatus::Pushed)).await;

        ide.close(None).await.unwrap();
        wait_until(|| {
            harness
                .manager
                .registry()
                .lookup(ConnectionRole::Ide, &key)
                .is_none()
        })
        .await;
    }

    #[tokio::test]
    async fn test_ide_without_sidecar_receives_policy_close() {
        let harness = Harness::new("w1");
        let addr = spawn_server(create_router(make_test_state(&harness))).await;

        let (mut ide, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/push/ide/app-1/dep-1"))
                .await
                .unwrap();

        let close = loop {
            match ide.next().await {
                Some(Ok(Message::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {:?}", other),
            }
        };
        let close = close.expect("close frame carries a code");
        assert_eq!(u16::from(close.code), 1008);
        assert_eq!(close.reason.as_str(), "Sidecar not connected");
        assert!(harness.manager.registry().is_empty());
    }
}
