//! Blob download from the super's edge API.

use super::ControlError;
use crate::identity::PublicKey;
use crate::protocol::NodeId;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Per-request timeout for blob downloads.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Which blob to fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlobKind {
    PeerInfo,
    NhTable,
}

impl BlobKind {
    pub fn path(&self) -> &'static str {
        match self {
            BlobKind::PeerInfo => "peerinfo",
            BlobKind::NhTable => "nhtable",
        }
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

/// Who is asking and which version they were told about.
#[derive(Clone, Debug)]
pub struct FetchParams {
    pub node_id: NodeId,
    pub public_key: PublicKey,
    pub state: [u8; 32],
}

/// Source of control-plane blobs.
pub trait BlobFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        kind: BlobKind,
        params: &'a FetchParams,
    ) -> BoxFuture<'a, Result<Vec<u8>, ControlError>>;
}

/// Fetches over HTTP from `{base_url}/{peerinfo|nhtable}`.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: &str) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| ControlError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, kind: BlobKind, params: &FetchParams) -> Result<Vec<u8>, ControlError> {
        let url = format!("{}/{}", self.base_url, kind.path());
        debug!(target: "meshguard::control", %url, "Fetching blob");
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("NodeID", params.node_id.0.to_string()),
                ("PubKey", params.public_key.to_base64()),
                ("State", hex::encode(params.state)),
            ])
            .send()
            .await
            .map_err(|e| ControlError::Http(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ControlError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(ControlError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }
}

impl BlobFetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        kind: BlobKind,
        params: &'a FetchParams,
    ) -> BoxFuture<'a, Result<Vec<u8>, ControlError>> {
        Box::pin(self.get(kind, params))
    }
}

/// Serves whatever blobs were last stored. For embedding and tests.
#[derive(Default)]
pub struct StaticFetcher {
    blobs: Mutex<HashMap<BlobKind, Vec<u8>>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, kind: BlobKind, blob: Vec<u8>) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(kind, blob);
        }
    }
}

impl BlobFetcher for StaticFetcher {
    fn fetch<'a>(
        &'a self,
        kind: BlobKind,
        _params: &'a FetchParams,
    ) -> BoxFuture<'a, Result<Vec<u8>, ControlError>> {
        let blob = self
            .blobs
            .lock()
            .ok()
            .and_then(|b| b.get(&kind).cloned())
            .ok_or_else(|| ControlError::NotAvailable(kind.to_string()));
        Box::pin(async move { blob })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;

    fn params() -> FetchParams {
        FetchParams {
            node_id: NodeId(1),
            public_key: *StaticIdentity::generate().public_key(),
            state: [0u8; 32],
        }
    }

    #[tokio::test]
    async fn test_static_fetcher() {
        let fetcher = StaticFetcher::new();
        let p = params();
        assert!(matches!(
            fetcher.fetch(BlobKind::NhTable, &p).await,
            Err(ControlError::NotAvailable(_))
        ));
        fetcher.set(BlobKind::NhTable, b"{}".to_vec());
        assert_eq!(fetcher.fetch(BlobKind::NhTable, &p).await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_http_fetcher_unreachable() {
        // Nothing listens on port 9 of the loopback
        let fetcher = HttpFetcher::new("http://127.0.0.1:9/api/").unwrap();
        assert!(matches!(
            fetcher.fetch(BlobKind::PeerInfo, &params()).await,
            Err(ControlError::Http(_))
        ));
    }
}
