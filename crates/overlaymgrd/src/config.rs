//! Bootstrap configuration for the overlay manager binary.
//!
//! A small serde schema describing the initial topology; the external
//! topology query sink normally supplies this population.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use fabric_common::{FabricResult, InterfaceAddress, MacAddr, Vni};

use crate::topology::{Topology, VirtualInterface};

/// One virtual interface in the bootstrap config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VifConfig {
    /// Interface name.
    pub name: String,
    /// Endpoint MAC address.
    pub mac: MacAddr,
    /// Assigned VNI; defaults to none.
    #[serde(default)]
    pub vni: Option<u32>,
    /// Endpoint address pair.
    #[serde(default)]
    pub addr: Option<InterfaceAddress>,
}

/// One bridge in the bootstrap config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bridge name.
    pub name: String,
    /// Virtual interfaces to attach, in order.
    #[serde(default)]
    pub vifs: Vec<VifConfig>,
    /// Uplink names to attach, in order.
    #[serde(default)]
    pub uplinks: Vec<String>,
}

/// The bootstrap topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Local tunnel endpoint.
    pub tep: InterfaceAddress,
    /// Remote tunnel endpoints.
    #[serde(default)]
    pub remote_teps: Vec<Ipv4Addr>,
    /// Bridges to create.
    pub bridges: Vec<BridgeConfig>,
}

impl TopologyConfig {
    /// Builds the in-memory topology, allocating port ids in config order.
    pub fn build(&self) -> FabricResult<Topology> {
        let mut topo = Topology::new(self.tep, self.remote_teps.clone());
        for bridge_cfg in &self.bridges {
            let bridge = topo.add_bridge(bridge_cfg.name.as_str());
            for (index, vif_cfg) in bridge_cfg.vifs.iter().enumerate() {
                let port_no = bridge.acquire_vif_port()?;
                let mut vif = VirtualInterface::new(
                    vif_cfg.name.as_str(),
                    index as u32,
                    vif_cfg.mac,
                    port_no,
                );
                vif.addr = vif_cfg.addr;
                vif.vni = vif_cfg.vni.map(Vni).unwrap_or(Vni::NONE);
                bridge.add_vif(vif);
            }
            for uplink in &bridge_cfg.uplinks {
                bridge.add_uplink(uplink.as_str())?;
            }
        }
        Ok(topo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_build_from_json() {
        let cfg: TopologyConfig = serde_json::from_str(
            r#"{
                "tep": {
                    "ipv4": "10.111.0.1", "ipv4_prefix": 16,
                    "ipv6": "2001:1000:1000:1000::a6f:1", "ipv6_prefix": 112
                },
                "remote_teps": ["10.111.0.2"],
                "bridges": [{
                    "name": "br0",
                    "vifs": [
                        {"name": "vhost0", "mac": "00:00:00:01:01:01", "vni": 200},
                        {"name": "vhost1", "mac": "00:00:00:01:01:02"}
                    ],
                    "uplinks": ["dpdk1"]
                }]
            }"#,
        )
        .unwrap();

        let topo = cfg.build().unwrap();
        let bridge = topo.bridge("br0").unwrap();
        // Local port plus the two configured interfaces.
        assert_eq!(bridge.vifs().len(), 3);
        assert_eq!(bridge.vif("vhost0").unwrap().port_no, 10);
        assert_eq!(bridge.vif("vhost0").unwrap().vni, Vni(200));
        assert_eq!(bridge.vif("vhost1").unwrap().vni, Vni::NONE);
        assert_eq!(bridge.uplinks()[0].port_no, 1);
        assert_eq!(topo.remote_teps, vec![Ipv4Addr::new(10, 111, 0, 2)]);
    }
}
