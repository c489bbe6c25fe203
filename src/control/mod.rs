//! Control Plane
//!
//! The pieces of the edge/super exchange that live outside the datagram
//! path:
//!
//! - the JSON blobs a super serves (peer list and next-hop table) and the
//!   hash that names each version
//! - [`BlobFetcher`], how an edge downloads a blob after a `ServerUpdate`
//! - [`SuperState`], the super's bookkeeping shared by its devices and
//!   its HTTP API
//! - [`serve_edge_api`], the axum server edges fetch from

mod fetch;
mod http;
mod super_state;

pub use fetch::{BlobFetcher, BlobKind, FetchParams, HttpFetcher, StaticFetcher, FETCH_TIMEOUT};
pub use http::{edge_api_router, serve_edge_api, EdgeApiServer};
pub use super_state::{
    ApiReject, EdgeStatus, PskDb, SuperPeer, SuperSettings, SuperState, ERR_NODE_ID_MISMATCH,
    ERR_REMOVED, ERR_VERSION,
};

use crate::protocol::NodeId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from control-plane operations.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("http request failed: {0}")]
    Http(String),

    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("blob hash mismatch: announced {announced}, got {actual}")]
    HashMismatch { announced: String, actual: String },

    #[error("blob decode failed: {0}")]
    Decode(String),

    #[error("blob not available: {0}")]
    NotAvailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Candidate URLs for one peer, each with a try priority.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnUrl {
    #[serde(default)]
    pub external_v4: BTreeMap<String, f64>,
    #[serde(default)]
    pub external_v6: BTreeMap<String, f64>,
    #[serde(default)]
    pub local_v4: BTreeMap<String, f64>,
    #[serde(default)]
    pub local_v6: BTreeMap<String, f64>,
}

impl ConnUrl {
    pub fn is_empty(&self) -> bool {
        self.external_v4.is_empty()
            && self.external_v6.is_empty()
            && self.local_v4.is_empty()
            && self.local_v6.is_empty()
    }

    /// All candidates, local ones only when `use_local`.
    pub fn candidates(&self, use_local: bool) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        if use_local {
            out.extend(self.local_v4.iter().map(|(k, v)| (k.clone(), *v)));
            out.extend(self.local_v6.iter().map(|(k, v)| (k.clone(), *v)));
        }
        out.extend(self.external_v4.iter().map(|(k, v)| (k.clone(), *v)));
        out.extend(self.external_v6.iter().map(|(k, v)| (k.clone(), *v)));
        out
    }
}

/// One entry of the peer-info blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiPeerInfo {
    #[serde(rename = "NodeID")]
    pub node_id: NodeId,
    /// Base64 preshared key, empty for none.
    #[serde(rename = "PSKey", default)]
    pub psk: String,
    #[serde(rename = "Connurl", default)]
    pub conn_url: ConnUrl,
}

/// Peer-info blob: base64 public key -> entry.
pub type ApiPeers = BTreeMap<String, ApiPeerInfo>;

/// Hash naming a blob version.
pub fn blob_hash(blob: &[u8]) -> [u8; 32] {
    Sha256::digest(blob).into()
}

/// Check a downloaded blob against the hash the super announced.
pub fn verify_blob(blob: &[u8], announced: &[u8; 32]) -> Result<(), ControlError> {
    let actual = blob_hash(blob);
    if &actual != announced {
        return Err(ControlError::HashMismatch {
            announced: hex::encode(announced),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}

pub fn decode_peers(blob: &[u8]) -> Result<ApiPeers, ControlError> {
    serde_json::from_slice(blob).map_err(|e| ControlError::Decode(e.to_string()))
}
