//! Super node configuration.

use super::{
    invalid, load_yaml, non_negative, positive, seconds, ConfigError, GraphRecalculateConfig,
    LogConfig,
};
use crate::control::{SuperPeer, SuperSettings};
use crate::device::{DeviceSettings, NodeRole};
use crate::identity::{PresharedKey, PrivateKey, PublicKey, StaticIdentity};
use crate::peer::PeerConfig;
use crate::protocol::NodeId;
use crate::routing::{GraphSettings, NextHopTable};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

/// One edge the super serves (`Peers[]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperPeerEntry {
    #[serde(rename = "NodeID")]
    pub node_id: NodeId,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "PubKey")]
    pub pub_key: String,
    #[serde(rename = "PSKey", default)]
    pub psk: String,
    /// Milliseconds added to every edge this node reports.
    #[serde(rename = "AdditionalCost", default)]
    pub additional_cost: f64,
    #[serde(rename = "SkipLocalIP", default)]
    pub skip_local_ip: bool,
}

impl SuperPeerEntry {
    pub fn super_peer(&self) -> Result<SuperPeer, ConfigError> {
        Ok(SuperPeer {
            node_id: self.node_id,
            name: self.name.clone(),
            public_key: PublicKey::from_base64(&self.pub_key)?,
            psk: PresharedKey::from_base64(&self.psk)?,
            additional_cost: self.additional_cost,
            skip_local_ip: self.skip_local_ip,
        })
    }
}

/// Root of a super configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperConfig {
    #[serde(rename = "NodeName", default)]
    pub node_name: String,
    /// Key of the IPv4 listener; empty disables it.
    #[serde(rename = "PrivKeyV4", default)]
    pub priv_key_v4: String,
    /// Key of the IPv6 listener; empty disables it.
    #[serde(rename = "PrivKeyV6", default)]
    pub priv_key_v6: String,
    #[serde(rename = "ListenPort")]
    pub listen_port: u16,
    /// Edge API listen address; a bare port binds all interfaces.
    #[serde(rename = "ListenPort_EdgeAPI")]
    pub edge_api_listen: String,
    #[serde(rename = "API_Prefix", default = "SuperConfig::default_api_prefix")]
    pub api_prefix: String,
    #[serde(rename = "RePushConfigInterval", default = "SuperConfig::default_repush")]
    pub repush_interval: f64,
    #[serde(rename = "PeerAliveTimeout", default = "SuperConfig::default_alive")]
    pub peer_alive_timeout: f64,
    #[serde(rename = "SendPingInterval", default = "SuperConfig::default_ping")]
    pub send_ping_interval: f64,
    #[serde(rename = "LogLevel", default)]
    pub log: LogConfig,
    #[serde(rename = "GraphRecalculateSetting", default)]
    pub graph: GraphRecalculateConfig,
    #[serde(rename = "NextHopTable", default)]
    pub next_hop_table: NextHopTable,
    #[serde(rename = "UsePSKForInterEdge", default = "SuperConfig::default_true")]
    pub use_psk_for_inter_edge: bool,
    #[serde(rename = "Peers", default)]
    pub peers: Vec<SuperPeerEntry>,
}

impl SuperConfig {
    fn default_api_prefix() -> String { "/api".to_string() }
    fn default_repush() -> f64 { 30.0 }
    fn default_alive() -> f64 { 70.0 }
    fn default_ping() -> f64 { 15.0 }
    fn default_true() -> bool { true }

    /// Load configuration from a single file and validate it.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.priv_key_v4.is_empty() && self.priv_key_v6.is_empty() {
            return Err(invalid("one of PrivKeyV4 or PrivKeyV6 is required"));
        }
        for key in [&self.priv_key_v4, &self.priv_key_v6] {
            if !key.is_empty() {
                PrivateKey::from_base64(key)?;
            }
        }
        if self.edge_api_listen.is_empty() {
            return Err(invalid("ListenPort_EdgeAPI is required"));
        }
        positive("RePushConfigInterval", self.repush_interval)?;
        positive("PeerAliveTimeout", self.peer_alive_timeout)?;
        positive("SendPingInterval", self.send_ping_interval)?;
        self.graph.validate()?;

        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        for peer in &self.peers {
            if peer.node_id.is_special() {
                return Err(invalid(format!("peer NodeID {} is reserved", peer.node_id)));
            }
            if !ids.insert(peer.node_id) {
                return Err(invalid(format!("duplicate peer NodeID {}", peer.node_id)));
            }
            let super_peer = peer.super_peer()?;
            if !keys.insert(super_peer.public_key) {
                return Err(invalid(format!("duplicate PubKey for NodeID {}", peer.node_id)));
            }
            non_negative("AdditionalCost", peer.additional_cost)?;
        }
        Ok(())
    }

    /// One identity per enabled address family, with its bind address.
    pub fn identities(&self) -> Result<Vec<(IpAddr, StaticIdentity)>, ConfigError> {
        let mut out = Vec::new();
        if !self.priv_key_v4.is_empty() {
            out.push((
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                StaticIdentity::new(PrivateKey::from_base64(&self.priv_key_v4)?),
            ));
        }
        if !self.priv_key_v6.is_empty() {
            out.push((
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                StaticIdentity::new(PrivateKey::from_base64(&self.priv_key_v6)?),
            ));
        }
        Ok(out)
    }

    /// `host:port` for the edge API listener.
    pub fn edge_api_addr(&self) -> String {
        if self.edge_api_listen.contains(':') {
            self.edge_api_listen.clone()
        } else {
            format!("0.0.0.0:{}", self.edge_api_listen)
        }
    }

    pub fn graph_settings(&self) -> GraphSettings {
        GraphSettings {
            super_mode: true,
            ..self.graph.graph_settings()
        }
    }

    pub fn super_settings(&self) -> SuperSettings {
        SuperSettings {
            api_prefix: self.api_prefix.clone(),
            use_psk_for_inter_edge: self.use_psk_for_inter_edge,
            peer_alive_timeout: seconds(self.peer_alive_timeout),
            repush_interval: seconds(self.repush_interval),
            ..SuperSettings::default()
        }
    }

    pub fn device_settings(&self, bind_ip: IpAddr) -> DeviceSettings {
        DeviceSettings {
            role: NodeRole::Super,
            node_name: self.node_name.clone(),
            listen_port: self.listen_port,
            bind_ip,
            send_ping_interval: seconds(self.send_ping_interval),
            peer_alive_timeout: seconds(self.peer_alive_timeout),
            repush_interval: seconds(self.repush_interval),
            timeout_check_interval: seconds(self.graph.timeout_check_interval),
            ..DeviceSettings::super_node()
        }
    }

    pub fn super_peers(&self) -> Result<Vec<SuperPeer>, ConfigError> {
        self.peers.iter().map(SuperPeerEntry::super_peer).collect()
    }

    /// Session peers for one super device.
    pub fn peer_configs(&self) -> Result<Vec<PeerConfig>, ConfigError> {
        let alive = seconds(self.peer_alive_timeout);
        self.peers
            .iter()
            .map(|p| {
                let sp = p.super_peer()?;
                let mut config = PeerConfig::new(sp.node_id, sp.public_key);
                config.preshared_key = sp.psk;
                config.alive_timeout = alive;
                Ok(config)
            })
            .collect()
    }
}
