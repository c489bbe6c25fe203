//! Edge API served by the super.
//!
//! ```text
//! GET /{prefix}/peerinfo?NodeID=..&PubKey=..&State=..
//! GET /{prefix}/nhtable?NodeID=..&PubKey=..&State=..
//! ```

use super::{ApiReject, BlobKind, ControlError, SuperState};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn respond(state: &SuperState, kind: BlobKind, params: &HashMap<String, String>) -> Response {
    match state.serve(kind, params) {
        Ok(blob) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            blob.as_ref().clone(),
        )
            .into_response(),
        Err(ApiReject::BadRequest(msg)) => {
            debug!(target: "meshguard::control", %kind, %msg, "Edge API bad request");
            (StatusCode::BAD_REQUEST, msg).into_response()
        }
        Err(ApiReject::NotFound(msg)) => {
            debug!(target: "meshguard::control", %kind, %msg, "Edge API refused");
            (StatusCode::NOT_FOUND, msg).into_response()
        }
    }
}

async fn peerinfo(
    State(state): State<Arc<SuperState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    respond(&state, BlobKind::PeerInfo, &params)
}

async fn nhtable(
    State(state): State<Arc<SuperState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    respond(&state, BlobKind::NhTable, &params)
}

/// Routes under the configured prefix.
pub fn edge_api_router(state: Arc<SuperState>) -> Router {
    let prefix = state.settings().api_prefix.trim_matches('/').to_string();
    let path = |name: &str| {
        if prefix.is_empty() {
            format!("/{}", name)
        } else {
            format!("/{}/{}", prefix, name)
        }
    };
    Router::new()
        .route(&path("peerinfo"), get(peerinfo))
        .route(&path("nhtable"), get(nhtable))
        .with_state(state)
}

/// A running edge API server.
pub struct EdgeApiServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl EdgeApiServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the server task.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

/// Bind `listen` and serve the edge API until shut down.
pub async fn serve_edge_api(
    state: Arc<SuperState>,
    listen: &str,
) -> Result<EdgeApiServer, ControlError> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;
    let (tx, rx) = oneshot::channel::<()>();
    let app = edge_api_router(state);
    let task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Edge API server failed");
        }
    });
    info!(%local_addr, "Edge API listening");
    Ok(EdgeApiServer {
        local_addr,
        shutdown: Some(tx),
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{BlobFetcher, FetchParams, HttpFetcher, SuperPeer, SuperSettings};
    use crate::identity::{PresharedKey, StaticIdentity};
    use crate::protocol::NodeId;
    use crate::routing::{Graph, GraphSettings};

    #[tokio::test]
    async fn test_fetch_over_http() {
        let state = Arc::new(SuperState::new(
            SuperSettings::default(),
            Graph::new(GraphSettings::default()),
        ));
        let identity = StaticIdentity::generate();
        state.add_peer(SuperPeer {
            node_id: NodeId(1),
            name: "edge1".into(),
            public_key: *identity.public_key(),
            psk: PresharedKey::default(),
            additional_cost: 0.0,
            skip_local_ip: false,
        });
        let server = serve_edge_api(state.clone(), "127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/api", server.local_addr());
        let fetcher = HttpFetcher::new(&base).unwrap();

        let (expected, hash) = state.nh_blob();
        let mut params = FetchParams {
            node_id: NodeId(1),
            public_key: *identity.public_key(),
            state: hash,
        };
        let blob = fetcher.fetch(BlobKind::NhTable, &params).await.unwrap();
        assert_eq!(blob, *expected);

        params.state = [7u8; 32];
        match fetcher.fetch(BlobKind::NhTable, &params).await {
            Err(ControlError::Status { status, .. }) => assert_eq!(status, 404),
            other => panic!("unexpected {:?}", other.map(|b| b.len())),
        }

        server.shutdown().await;
    }
}
