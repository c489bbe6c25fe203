//! Edge node configuration.
//!
//! Everything an edge needs at startup: identity, interface, static peers,
//! the dynamic-routing knobs and the optional super node.

use super::{
    invalid, load_yaml, non_negative, positive, seconds, write_atomic, ConfigError,
    GraphRecalculateConfig, LogConfig,
};
use crate::device::{DeviceSettings, NodeRole};
use crate::identity::{PresharedKey, PrivateKey, PublicKey, StaticIdentity};
use crate::peer::PeerConfig;
use crate::protocol::NodeId;
use crate::routing::{GraphSettings, NextHopTable, NtpSettings};
use crate::tap::{MacAddr, Tap, TapError, DEFAULT_MTU};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Interface
// ============================================================================

/// Virtual interface (`Interface`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// `dummy` or `udpsock`.
    #[serde(rename = "IType", default = "InterfaceConfig::default_itype")]
    pub itype: String,
    #[serde(rename = "Name", default = "InterfaceConfig::default_name")]
    pub name: String,
    /// Up to four hex bytes; the node ID fills the last two.
    #[serde(rename = "MacAddrPrefix", default)]
    pub mac_addr_prefix: String,
    #[serde(rename = "MTU", default = "InterfaceConfig::default_mtu")]
    pub mtu: u16,
    #[serde(rename = "RecvAddr", default)]
    pub recv_addr: String,
    #[serde(rename = "SendAddr", default)]
    pub send_addr: String,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            itype: Self::default_itype(),
            name: Self::default_name(),
            mac_addr_prefix: String::new(),
            mtu: Self::default_mtu(),
            recv_addr: String::new(),
            send_addr: String::new(),
        }
    }
}

impl InterfaceConfig {
    fn default_itype() -> String { "dummy".to_string() }
    fn default_name() -> String { "mg0".to_string() }
    fn default_mtu() -> u16 { DEFAULT_MTU }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.itype.as_str() {
            "dummy" => {}
            "udpsock" => {
                if self.recv_addr.is_empty() && self.send_addr.is_empty() {
                    return Err(invalid("udpsock interface needs RecvAddr or SendAddr"));
                }
            }
            other => return Err(invalid(format!("unsupported interface type {:?}", other))),
        }
        if self.mtu < 576 {
            return Err(invalid(format!("MTU {} too small", self.mtu)));
        }
        Ok(())
    }

    /// The interface's own MAC address.
    pub fn mac_addr(&self, node_id: NodeId) -> Result<MacAddr, TapError> {
        MacAddr::for_node(&self.mac_addr_prefix, node_id.as_u16())
    }

    /// Open the configured interface.
    pub async fn open(&self) -> Result<Tap, TapError> {
        match self.itype.as_str() {
            "udpsock" => {
                let recv = (!self.recv_addr.is_empty()).then_some(self.recv_addr.as_str());
                let send = (!self.send_addr.is_empty()).then_some(self.send_addr.as_str());
                Tap::udp_sock(&self.name, self.mtu, recv, send).await
            }
            _ => Ok(Tap::dummy(&self.name, self.mtu)),
        }
    }
}

// ============================================================================
// Peers
// ============================================================================

/// One statically configured peer (`Peers[]`). Also the persisted form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    #[serde(rename = "NodeID")]
    pub node_id: NodeId,
    #[serde(rename = "PubKey")]
    pub pub_key: String,
    #[serde(rename = "PSKey", default)]
    pub psk: String,
    #[serde(rename = "EndPoint", default)]
    pub endpoint: String,
    #[serde(rename = "PersistentKeepalive", default, skip_serializing_if = "is_zero")]
    pub persistent_keepalive: u32,
    #[serde(rename = "Static", default)]
    pub static_conn: bool,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl PeerEntry {
    pub fn peer_config(&self, alive_timeout: Duration) -> Result<PeerConfig, ConfigError> {
        let mut config = PeerConfig::new(self.node_id, PublicKey::from_base64(&self.pub_key)?);
        config.preshared_key = PresharedKey::from_base64(&self.psk)?;
        config.static_conn = self.static_conn;
        config.conn_url = (!self.endpoint.is_empty()).then(|| self.endpoint.clone());
        config.persistent_keepalive = Duration::from_secs(self.persistent_keepalive as u64);
        config.alive_timeout = alive_timeout;
        Ok(config)
    }
}

// ============================================================================
// Dynamic routing
// ============================================================================

/// Super node connection (`DynamicRoute.SuperNode`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperNodeConfig {
    #[serde(rename = "UseSuperNode", default)]
    pub use_super_node: bool,
    #[serde(rename = "PSKey", default)]
    pub psk: String,
    #[serde(rename = "EndpointV4", default)]
    pub endpoint_v4: String,
    #[serde(rename = "PubKeyV4", default)]
    pub pub_key_v4: String,
    #[serde(rename = "EndpointV6", default)]
    pub endpoint_v6: String,
    #[serde(rename = "PubKeyV6", default)]
    pub pub_key_v6: String,
    #[serde(rename = "EndpointEdgeAPIUrl", default)]
    pub edge_api_url: String,
    #[serde(rename = "SkipLocalIP", default)]
    pub skip_local_ip: bool,
    /// Seconds a super-provided next-hop table stays authoritative.
    #[serde(
        rename = "SuperNodeInfoTimeout",
        default = "SuperNodeConfig::default_info_timeout"
    )]
    pub info_timeout: f64,
}

impl Default for SuperNodeConfig {
    fn default() -> Self {
        Self {
            use_super_node: false,
            psk: String::new(),
            endpoint_v4: String::new(),
            pub_key_v4: String::new(),
            endpoint_v6: String::new(),
            pub_key_v6: String::new(),
            edge_api_url: String::new(),
            skip_local_ip: false,
            info_timeout: Self::default_info_timeout(),
        }
    }
}

impl SuperNodeConfig {
    fn default_info_timeout() -> f64 { 50.0 }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.use_super_node {
            return Ok(());
        }
        let v4 = !self.endpoint_v4.is_empty();
        let v6 = !self.endpoint_v6.is_empty();
        if !v4 && !v6 {
            return Err(invalid("UseSuperNode needs EndpointV4 or EndpointV6"));
        }
        if v4 {
            PublicKey::from_base64(&self.pub_key_v4)?;
        }
        if v6 {
            PublicKey::from_base64(&self.pub_key_v6)?;
        }
        PresharedKey::from_base64(&self.psk)?;
        if self.edge_api_url.is_empty() {
            return Err(invalid("UseSuperNode needs EndpointEdgeAPIUrl"));
        }
        positive("SuperNodeInfoTimeout", self.info_timeout)
    }

    /// One peer per configured super address family.
    pub fn peer_configs(&self, alive_timeout: Duration) -> Result<Vec<PeerConfig>, ConfigError> {
        let mut out = Vec::new();
        if !self.use_super_node {
            return Ok(out);
        }
        let psk = PresharedKey::from_base64(&self.psk)?;
        for (endpoint, key) in [
            (&self.endpoint_v4, &self.pub_key_v4),
            (&self.endpoint_v6, &self.pub_key_v6),
        ] {
            if endpoint.is_empty() {
                continue;
            }
            let mut config =
                PeerConfig::new(NodeId::SUPER_NODE_MESSAGE, PublicKey::from_base64(key)?);
            config.is_super = true;
            config.preshared_key = psk.clone();
            config.static_conn = true;
            config.conn_url = Some(endpoint.clone());
            config.alive_timeout = alive_timeout;
            out.push(config);
        }
        Ok(out)
    }
}

/// Peer-to-peer discovery (`DynamicRoute.P2P`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    #[serde(rename = "UseP2P", default)]
    pub use_p2p: bool,
    #[serde(rename = "SendPeerInterval", default = "P2pConfig::default_send_peer_interval")]
    pub send_peer_interval: f64,
    #[serde(rename = "GraphRecalculateSetting", default)]
    pub graph: GraphRecalculateConfig,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            use_p2p: false,
            send_peer_interval: Self::default_send_peer_interval(),
            graph: GraphRecalculateConfig::default(),
        }
    }
}

impl P2pConfig {
    fn default_send_peer_interval() -> f64 { 20.0 }
}

/// Clock correction (`DynamicRoute.NTPConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtpConfig {
    #[serde(rename = "UseNTP", default)]
    pub use_ntp: bool,
    #[serde(rename = "MaxServerUse", default = "NtpConfig::default_max_server_use")]
    pub max_server_use: usize,
    #[serde(rename = "SyncTimeInterval", default = "NtpConfig::default_sync_interval")]
    pub sync_time_interval: f64,
    #[serde(rename = "NTPTimeout", default = "NtpConfig::default_timeout")]
    pub ntp_timeout: f64,
    #[serde(rename = "Servers", default)]
    pub servers: Vec<String>,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            use_ntp: false,
            max_server_use: Self::default_max_server_use(),
            sync_time_interval: Self::default_sync_interval(),
            ntp_timeout: Self::default_timeout(),
            servers: Vec::new(),
        }
    }
}

impl NtpConfig {
    fn default_max_server_use() -> usize { 8 }
    fn default_sync_interval() -> f64 { 3600.0 }
    fn default_timeout() -> f64 { 3.0 }

    pub fn settings(&self) -> NtpSettings {
        NtpSettings {
            use_ntp: self.use_ntp && !self.servers.is_empty(),
            max_server_use: self.max_server_use,
            sync_time_interval: seconds(self.sync_time_interval),
            ntp_timeout: seconds(self.ntp_timeout),
            servers: self.servers.clone(),
        }
    }
}

/// Latency probing and liveness (`DynamicRoute`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicRouteConfig {
    #[serde(rename = "SendPingInterval", default = "DynamicRouteConfig::default_ping")]
    pub send_ping_interval: f64,
    #[serde(rename = "PeerAliveTimeout", default = "DynamicRouteConfig::default_alive")]
    pub peer_alive_timeout: f64,
    #[serde(rename = "DupCheckTimeout", default = "DynamicRouteConfig::default_dup")]
    pub dup_check_timeout: f64,
    #[serde(rename = "ConnTimeOut", default = "DynamicRouteConfig::default_conn_timeout")]
    pub conn_timeout: f64,
    #[serde(rename = "ConnNextTry", default = "DynamicRouteConfig::default_conn_next_try")]
    pub conn_next_try: f64,
    /// Milliseconds added to every path through this node.
    #[serde(rename = "AdditionalCost", default)]
    pub additional_cost: f64,
    #[serde(rename = "SaveNewPeers", default)]
    pub save_new_peers: bool,
    #[serde(rename = "SuperNode", default)]
    pub super_node: SuperNodeConfig,
    #[serde(rename = "P2P", default)]
    pub p2p: P2pConfig,
    #[serde(rename = "NTPConfig", default)]
    pub ntp: NtpConfig,
}

impl Default for DynamicRouteConfig {
    fn default() -> Self {
        Self {
            send_ping_interval: Self::default_ping(),
            peer_alive_timeout: Self::default_alive(),
            dup_check_timeout: Self::default_dup(),
            conn_timeout: Self::default_conn_timeout(),
            conn_next_try: Self::default_conn_next_try(),
            additional_cost: 0.0,
            save_new_peers: false,
            super_node: SuperNodeConfig::default(),
            p2p: P2pConfig::default(),
            ntp: NtpConfig::default(),
        }
    }
}

impl DynamicRouteConfig {
    fn default_ping() -> f64 { 16.0 }
    fn default_alive() -> f64 { 70.0 }
    fn default_dup() -> f64 { 40.0 }
    fn default_conn_timeout() -> f64 { 20.0 }
    fn default_conn_next_try() -> f64 { 5.0 }

    fn validate(&self) -> Result<(), ConfigError> {
        positive("SendPingInterval", self.send_ping_interval)?;
        positive("PeerAliveTimeout", self.peer_alive_timeout)?;
        positive("DupCheckTimeout", self.dup_check_timeout)?;
        positive("ConnTimeOut", self.conn_timeout)?;
        positive("ConnNextTry", self.conn_next_try)?;
        non_negative("AdditionalCost", self.additional_cost)?;
        if self.p2p.use_p2p {
            positive("SendPeerInterval", self.p2p.send_peer_interval)?;
        }
        self.p2p.graph.validate()?;
        self.super_node.validate()?;
        if self.ntp.use_ntp {
            positive("SyncTimeInterval", self.ntp.sync_time_interval)?;
            positive("NTPTimeout", self.ntp.ntp_timeout)?;
        }
        Ok(())
    }
}

// ============================================================================
// Edge
// ============================================================================

/// Root of an edge configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(rename = "Interface", default)]
    pub interface: InterfaceConfig,
    #[serde(rename = "NodeID")]
    pub node_id: NodeId,
    #[serde(rename = "NodeName", default)]
    pub node_name: String,
    #[serde(rename = "DefaultTTL", default = "EdgeConfig::default_ttl")]
    pub default_ttl: u8,
    /// Seconds a learned MAC stays in the forwarding table.
    #[serde(rename = "L2FIBTimeout", default = "EdgeConfig::default_l2fib_timeout")]
    pub l2fib_timeout: f64,
    #[serde(rename = "PrivKey")]
    pub priv_key: String,
    /// 0 picks a free port.
    #[serde(rename = "ListenPort", default)]
    pub listen_port: u16,
    #[serde(rename = "LogLevel", default)]
    pub log: LogConfig,
    #[serde(rename = "DynamicRoute", default)]
    pub dynamic_route: DynamicRouteConfig,
    /// Initial next-hop table, used as-is in static mode.
    #[serde(rename = "NextHopTable", default)]
    pub next_hop_table: NextHopTable,
    /// Seconds between resetting connections to static peers; 0 disables.
    #[serde(rename = "ResetConnInterval", default)]
    pub reset_conn_interval: f64,
    #[serde(rename = "Peers", default)]
    pub peers: Vec<PeerEntry>,
}

impl EdgeConfig {
    fn default_ttl() -> u8 { 200 }
    fn default_l2fib_timeout() -> f64 { 3600.0 }

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
        if self.node_id.is_special() {
            return Err(invalid(format!("NodeID {} is reserved", self.node_id)));
        }
        PrivateKey::from_base64(&self.priv_key)?;
        if self.default_ttl == 0 {
            return Err(invalid("DefaultTTL must be positive"));
        }
        positive("L2FIBTimeout", self.l2fib_timeout)?;
        non_negative("ResetConnInterval", self.reset_conn_interval)?;
        self.interface.validate()?;
        self.interface.mac_addr(self.node_id).map_err(|e| invalid(e.to_string()))?;
        self.dynamic_route.validate()?;

        let mut ids = HashSet::new();
        for peer in &self.peers {
            if peer.node_id.is_special() {
                return Err(invalid(format!("peer NodeID {} is reserved", peer.node_id)));
            }
            if peer.node_id == self.node_id {
                return Err(invalid(format!("peer NodeID {} is our own", peer.node_id)));
            }
            if !ids.insert(peer.node_id) {
                return Err(invalid(format!("duplicate peer NodeID {}", peer.node_id)));
            }
            PublicKey::from_base64(&peer.pub_key)?;
            PresharedKey::from_base64(&peer.psk)?;
        }
        Ok(())
    }

    pub fn identity(&self) -> Result<StaticIdentity, ConfigError> {
        Ok(StaticIdentity::new(PrivateKey::from_base64(&self.priv_key)?))
    }

    pub fn graph_settings(&self) -> GraphSettings {
        GraphSettings {
            super_node_info_timeout: if self.dynamic_route.super_node.use_super_node {
                seconds(self.dynamic_route.super_node.info_timeout)
            } else {
                Duration::ZERO
            },
            ..self.dynamic_route.p2p.graph.graph_settings()
        }
    }

    pub fn device_settings(&self, config_path: Option<&Path>) -> DeviceSettings {
        let dr = &self.dynamic_route;
        DeviceSettings {
            role: NodeRole::Edge,
            node_id: self.node_id,
            node_name: self.node_name.clone(),
            listen_port: self.listen_port,
            default_ttl: self.default_ttl,
            l2fib_timeout: seconds(self.l2fib_timeout),
            dup_check_timeout: seconds(dr.dup_check_timeout),
            send_ping_interval: seconds(dr.send_ping_interval),
            peer_alive_timeout: seconds(dr.peer_alive_timeout),
            conn_timeout: seconds(dr.conn_timeout),
            conn_next_try: seconds(dr.conn_next_try),
            additional_cost: dr.additional_cost,
            damping_resistance: dr.p2p.graph.damping_resistance,
            save_new_peers: dr.save_new_peers,
            use_super_node: dr.super_node.use_super_node,
            skip_local_ip: dr.super_node.skip_local_ip,
            use_p2p: dr.p2p.use_p2p,
            send_peer_interval: seconds(dr.p2p.send_peer_interval),
            reset_conn_interval: seconds(self.reset_conn_interval),
            timeout_check_interval: seconds(dr.p2p.graph.timeout_check_interval),
            ntp: dr.ntp.settings(),
            config_path: config_path.map(Path::to_path_buf),
            ..DeviceSettings::edge(self.node_id)
        }
    }

    /// Static edge peers followed by the super peers.
    pub fn peer_configs(&self) -> Result<Vec<PeerConfig>, ConfigError> {
        let alive = seconds(self.dynamic_route.peer_alive_timeout);
        let mut out = self
            .peers
            .iter()
            .map(|p| p.peer_config(alive))
            .collect::<Result<Vec<_>, _>>()?;
        out.extend(self.dynamic_route.super_node.peer_configs(alive)?);
        Ok(out)
    }

    /// Rewrite the `Peers` list of the file at `path`, leaving every other
    /// key as it was.
    pub fn save_peers(path: &Path, peers: &[PeerEntry]) -> Result<(), ConfigError> {
        let mut doc: serde_yaml::Value = load_yaml(path)?;
        let parse_err = |source| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source,
        };
        let list = serde_yaml::to_value(peers).map_err(parse_err)?;
        match doc.as_mapping_mut() {
            Some(map) => {
                map.insert(serde_yaml::Value::String("Peers".into()), list);
            }
            None => return Err(invalid(format!("{} is not a mapping", path.display()))),
        }
        let text = serde_yaml::to_string(&doc).map_err(parse_err)?;
        write_atomic(path, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PRIV: &str = "6GyDagZKhbm5WNqMiRHhkf43RlbMJ34IieTlIuvfJ1M=";
    const PUB2: &str = "dHeWQtlTPQGy87WdbUARS4CtwVaR2y7IQ1qcX4GKSXk=";
    const PSK: &str = "juJMQaGAaeSy8aDsXSKNsPZv/nFiPj4h/1G70tGYygs=";

    fn sample_yaml() -> String {
        format!(
            r#"
Interface:
  IType: dummy
  Name: tap1
  MacAddrPrefix: "AA:BB:CC:DD"
  MTU: 1416
NodeID: 1
NodeName: Node01
PrivKey: "{PRIV}"
ListenPort: 3001
LogLevel:
  LogLevel: error
  LogControl: true
DynamicRoute:
  SendPingInterval: 8
  AdditionalCost: 10
  SaveNewPeers: true
  P2P:
    UseP2P: true
    GraphRecalculateSetting:
      JitterTolerance: 20
NextHopTable:
  1:
    2: 2
  2:
    1: 1
Peers:
  - NodeID: 2
    PubKey: "{PUB2}"
    PSKey: "{PSK}"
    EndPoint: "127.0.0.1:3002"
    Static: true
"#
        )
    }

    #[test]
    fn test_parse_and_defaults() {
        let config: EdgeConfig = serde_yaml::from_str(&sample_yaml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.node_id, NodeId(1));
        assert_eq!(config.default_ttl, 200);
        assert_eq!(config.interface.mtu, 1416);
        assert_eq!(config.dynamic_route.peer_alive_timeout, 70.0);
        assert_eq!(config.dynamic_route.send_ping_interval, 8.0);
        assert!(config.dynamic_route.p2p.use_p2p);
        assert_eq!(config.next_hop_table.next(NodeId(1), NodeId(2)), Some(NodeId(2)));
        assert_eq!(config.peers.len(), 1);
        assert!(config.peers[0].static_conn);
    }

    #[test]
    fn test_device_settings() {
        let config: EdgeConfig = serde_yaml::from_str(&sample_yaml()).unwrap();
        let settings = config.device_settings(None);
        assert_eq!(settings.role, NodeRole::Edge);
        assert_eq!(settings.node_id, NodeId(1));
        assert_eq!(settings.listen_port, 3001);
        assert_eq!(settings.send_ping_interval, Duration::from_secs(8));
        assert_eq!(settings.additional_cost, 10.0);
        assert!(settings.use_p2p && settings.save_new_peers);
        assert_eq!(config.graph_settings().jitter_tolerance, 20.0);
    }

    #[test]
    fn test_peer_configs() {
        let mut config: EdgeConfig = serde_yaml::from_str(&sample_yaml()).unwrap();
        config.dynamic_route.super_node = SuperNodeConfig {
            use_super_node: true,
            endpoint_v4: "127.0.0.1:3000".into(),
            pub_key_v4: PUB2.into(),
            edge_api_url: "http://127.0.0.1:3000/api".into(),
            ..SuperNodeConfig::default()
        };
        config.validate().unwrap();
        let peers = config.peer_configs().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].node_id, NodeId(2));
        assert!(!peers[0].preshared_key.is_zero());
        assert!(peers[1].is_super);
        assert_eq!(peers[1].node_id, NodeId::SUPER_NODE_MESSAGE);
        assert_eq!(peers[1].conn_url.as_deref(), Some("127.0.0.1:3000"));
    }

    #[test]
    fn test_validate_rejects() {
        let base: EdgeConfig = serde_yaml::from_str(&sample_yaml()).unwrap();

        let mut c = base.clone();
        c.node_id = NodeId::BROADCAST;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = base.clone();
        c.priv_key = "short".into();
        assert!(matches!(c.validate(), Err(ConfigError::Identity(_))));

        let mut c = base.clone();
        c.peers[0].node_id = NodeId(1);
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.dynamic_route.send_ping_interval = 0.0;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.dynamic_route.super_node.use_super_node = true;
        assert!(c.validate().is_err());

        let mut c = base;
        c.interface.itype = "vpp".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_load_file_and_save_peers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("edge.yaml");
        std::fs::write(&path, sample_yaml()).unwrap();

        let config = EdgeConfig::load_file(&path).unwrap();
        let mut peers = config.peers.clone();
        peers[0].endpoint = "192.0.2.7:4000".into();
        peers[0].static_conn = false;
        EdgeConfig::save_peers(&path, &peers).unwrap();

        let reloaded = EdgeConfig::load_file(&path).unwrap();
        assert_eq!(reloaded.peers, peers);
        assert_eq!(reloaded.node_name, "Node01");
        assert_eq!(reloaded.interface.mtu, 1416);
    }

    #[tokio::test]
    async fn test_open_dummy_interface() {
        let config: EdgeConfig = serde_yaml::from_str(&sample_yaml()).unwrap();
        let tap = config.interface.open().await.unwrap();
        assert_eq!(tap.name(), "tap1");
        assert_eq!(tap.mtu(), 1416);
        assert_eq!(
            config.interface.mac_addr(config.node_id).unwrap(),
            MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0, 1])
        );
    }
}
