//! Topology and resource model: bridges, ports, VNI membership and port-id
//! allocation.
//!
//! The model is populated from the external topology query sink and then
//! owned exclusively in memory; compilers read it, the manager mutates it.
//! There is no process-wide registry — callers pass a [`Topology`] handle
//! into every compiler entry point.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::Range;
use std::str::FromStr;

use fabric_common::{FabricError, FabricResult, InterfaceAddress, MacAddr, Vni};

use crate::tables::{
    PORT_LOCAL, PORT_TUNNEL_BASE, PORT_TUNNEL_END, PORT_UPLINK_BASE, PORT_VIF_BASE,
};

/// Overlay deployment mode of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// Single flat network, no encapsulation.
    Native,
    /// VNI carried in the tunnel id of an encapsulation header.
    Tunnel,
    /// VNI carried in an 802.1Q tag.
    Vlan,
    /// VNI pair carried in double 802.1Q tags (outer 0x88a8, inner 0x8100).
    Qinq,
}

impl DeployMode {
    /// The configuration keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMode::Native => "native",
            DeployMode::Tunnel => "tunnel",
            DeployMode::Vlan => "vlan",
            DeployMode::Qinq => "qinq",
        }
    }
}

impl fmt::Display for DeployMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployMode {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(DeployMode::Native),
            "tunnel" => Ok(DeployMode::Tunnel),
            "vlan" => Ok(DeployMode::Vlan),
            "qinq" => Ok(DeployMode::Qinq),
            other => Err(FabricError::UnsupportedMode {
                mode: other.to_string(),
            }),
        }
    }
}

/// A bounded pool of port ids reserved for one port category.
///
/// `acquire` hands out the lowest free id; an id is never held twice, and
/// `release` only accepts ids currently held.
#[derive(Debug, Clone)]
pub struct PortIdPool {
    name: String,
    free: BTreeSet<u16>,
    held: BTreeSet<u16>,
}

impl PortIdPool {
    /// Creates a pool over a half-open id range.
    pub fn new(name: impl Into<String>, range: Range<u16>) -> Self {
        Self {
            name: name.into(),
            free: range.collect(),
            held: BTreeSet::new(),
        }
    }

    /// Takes the lowest free id out of the pool.
    pub fn acquire(&mut self) -> FabricResult<u16> {
        let id = self
            .free
            .pop_first()
            .ok_or_else(|| FabricError::pool_exhausted(&self.name))?;
        self.held.insert(id);
        Ok(id)
    }

    /// Returns a previously acquired id to the pool.
    pub fn release(&mut self, id: u16) -> FabricResult<()> {
        if !self.held.remove(&id) {
            return Err(FabricError::invalid_config(
                format!("pool '{}'", self.name),
                format!("release of id {id} that is not held"),
            ));
        }
        self.free.insert(id);
        Ok(())
    }

    /// Number of ids currently free.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// A virtual interface attached to a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualInterface {
    /// Interface name.
    pub name: String,
    /// Index of the interface on its endpoint.
    pub index: u32,
    /// Endpoint MAC address.
    pub mac: MacAddr,
    /// Assigned switch port number.
    pub port_no: u16,
    /// Endpoint address pair, if the interface has one.
    pub addr: Option<InterfaceAddress>,
    /// Assigned VNI; `Vni::NONE` until overlay configuration.
    pub vni: Vni,
    /// Number of queue pairs.
    pub queue_pairs: u16,
    /// Offload enabled.
    pub offload: bool,
}

impl VirtualInterface {
    /// Creates an interface with default VNI, one queue pair and offload on.
    pub fn new(name: impl Into<String>, index: u32, mac: MacAddr, port_no: u16) -> Self {
        Self {
            name: name.into(),
            index,
            mac,
            port_no,
            addr: None,
            vni: Vni::NONE,
            queue_pairs: 1,
            offload: true,
        }
    }

    /// Sets the endpoint address pair (builder pattern).
    pub fn with_addr(mut self, addr: InterfaceAddress) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Sets the queue-pair count (builder pattern).
    pub fn with_queue_pairs(mut self, queue_pairs: u16) -> Self {
        self.queue_pairs = queue_pairs;
        self
    }
}

/// A physical uplink port of a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uplink {
    /// Uplink interface name.
    pub name: String,
    /// Assigned switch port number.
    pub port_no: u16,
    /// Queue-pair count requested from the datapath.
    pub queue_pairs: u16,
}

impl Uplink {
    /// Creates an uplink with one queue pair.
    pub fn new(name: impl Into<String>, port_no: u16) -> Self {
        Self {
            name: name.into(),
            port_no,
            queue_pairs: 1,
        }
    }
}

/// Remote address mode of a tunnel port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteIp {
    /// Fixed remote endpoint.
    Fixed(Ipv4Addr),
    /// Remote endpoint resolved per packet by a flow action.
    PerFlow,
}

/// VNI mode of a tunnel port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelVni {
    /// Fixed VNI; the port belongs to exactly one overlay.
    Fixed(Vni),
    /// VNI resolved per packet; the port multiplexes overlays.
    PerFlow,
}

impl TunnelVni {
    /// Returns true if this tunnel port carries traffic of `vni`.
    pub fn carries(&self, vni: Vni) -> bool {
        match self {
            TunnelVni::Fixed(v) => *v == vni,
            TunnelVni::PerFlow => true,
        }
    }
}

/// A tunnel port of a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelPort {
    /// Tunnel port name.
    pub name: String,
    /// Encapsulation type (e.g. "geneve", "vxlan").
    pub encap: String,
    /// Assigned switch port number.
    pub port_no: u16,
    /// Remote endpoint mode.
    pub remote_ip: RemoteIp,
    /// VNI mode.
    pub vni: TunnelVni,
}

/// A bridge and everything attached to it.
#[derive(Debug, Clone)]
pub struct Bridge {
    /// Bridge name.
    pub name: String,
    vifs: Vec<VirtualInterface>,
    vni_index: BTreeMap<Vni, Vec<u16>>,
    uplinks: Vec<Uplink>,
    tunnel_ports: Vec<TunnelPort>,
    /// Tunnel metadata TLV map installed on this bridge.
    pub tunnel_metadata: bool,
    uplink_ids: PortIdPool,
    vif_ids: PortIdPool,
    tunnel_ids: PortIdPool,
}

impl Bridge {
    /// Creates a bridge carrying its local port (port number 0, no VNI).
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut bridge = Self {
            vifs: Vec::new(),
            vni_index: BTreeMap::new(),
            uplinks: Vec::new(),
            tunnel_ports: Vec::new(),
            tunnel_metadata: false,
            uplink_ids: PortIdPool::new(
                format!("{name} uplink"),
                PORT_UPLINK_BASE..PORT_VIF_BASE,
            ),
            vif_ids: PortIdPool::new(format!("{name} vif"), PORT_VIF_BASE..PORT_TUNNEL_BASE),
            tunnel_ids: PortIdPool::new(
                format!("{name} tunnel"),
                PORT_TUNNEL_BASE..PORT_TUNNEL_END,
            ),
            name,
        };
        let local = VirtualInterface::new(bridge.name.clone(), 0, MacAddr::ZERO, PORT_LOCAL);
        bridge.add_vif(local);
        bridge
    }

    /// Appends an interface to the port list and indexes it under its VNI.
    pub fn add_vif(&mut self, vif: VirtualInterface) {
        self.vni_index
            .entry(vif.vni)
            .or_default()
            .push(vif.port_no);
        self.vifs.push(vif);
    }

    /// Removes an interface by name, releasing its port id, and rebuilds
    /// the VNI index.
    pub fn remove_vif(&mut self, name: &str) -> FabricResult<VirtualInterface> {
        let pos = self
            .vifs
            .iter()
            .position(|v| v.name == name)
            .ok_or_else(|| {
                FabricError::invalid_config(
                    format!("bridge '{}'", self.name),
                    format!("no interface named '{name}'"),
                )
            })?;
        let vif = self.vifs.remove(pos);
        if vif.port_no != PORT_LOCAL {
            self.vif_ids.release(vif.port_no)?;
        }
        self.rebuild_vni_index();
        Ok(vif)
    }

    /// Clears and repopulates every VNI bucket from the current interface
    /// list. Must be invoked after any bulk VNI reassignment; buckets are
    /// never patched incrementally.
    pub fn rebuild_vni_index(&mut self) {
        self.vni_index.clear();
        for vif in &self.vifs {
            self.vni_index
                .entry(vif.vni)
                .or_default()
                .push(vif.port_no);
        }
    }

    /// Assigns a VNI to an interface and rebuilds the index.
    pub fn set_vif_vni(&mut self, name: &str, vni: Vni) -> FabricResult<()> {
        let bridge_name = self.name.clone();
        let vif = self
            .vifs
            .iter_mut()
            .find(|v| v.name == name)
            .ok_or_else(|| {
                FabricError::invalid_config(
                    format!("bridge '{bridge_name}'"),
                    format!("no interface named '{name}'"),
                )
            })?;
        vif.vni = vni;
        self.rebuild_vni_index();
        Ok(())
    }

    /// Interfaces in attachment order.
    pub fn vifs(&self) -> &[VirtualInterface] {
        &self.vifs
    }

    /// Looks up an interface by name.
    pub fn vif(&self, name: &str) -> Option<&VirtualInterface> {
        self.vifs.iter().find(|v| v.name == name)
    }

    /// The VNI index: for each VNI, local port numbers in stored order.
    pub fn vni_index(&self) -> &BTreeMap<Vni, Vec<u16>> {
        &self.vni_index
    }

    /// Uplinks in attachment order.
    pub fn uplinks(&self) -> &[Uplink] {
        &self.uplinks
    }

    /// Tunnel ports in creation order.
    pub fn tunnel_ports(&self) -> &[TunnelPort] {
        &self.tunnel_ports
    }

    /// Attaches an uplink, assigning it a port id from the uplink pool.
    pub fn add_uplink(&mut self, name: impl Into<String>) -> FabricResult<&Uplink> {
        let port_no = self.uplink_ids.acquire()?;
        self.uplinks.push(Uplink::new(name, port_no));
        Ok(self.uplinks.last().expect("just pushed"))
    }

    /// Detaches an uplink, returning its port id to the pool.
    pub fn remove_uplink(&mut self, name: &str) -> FabricResult<Uplink> {
        let pos = self
            .uplinks
            .iter()
            .position(|u| u.name == name)
            .ok_or_else(|| {
                FabricError::invalid_config(
                    format!("bridge '{}'", self.name),
                    format!("no uplink named '{name}'"),
                )
            })?;
        let uplink = self.uplinks.remove(pos);
        self.uplink_ids.release(uplink.port_no)?;
        Ok(uplink)
    }

    /// Creates a tunnel port named after the encapsulation and its port id.
    pub fn add_tunnel_port(
        &mut self,
        encap: &str,
        remote_ip: RemoteIp,
        vni: TunnelVni,
    ) -> FabricResult<&TunnelPort> {
        let port_no = self.tunnel_ids.acquire()?;
        self.tunnel_ports.push(TunnelPort {
            name: format!("{encap}{port_no}"),
            encap: encap.to_string(),
            port_no,
            remote_ip,
            vni,
        });
        Ok(self.tunnel_ports.last().expect("just pushed"))
    }

    /// Deletes every tunnel port, returning ids to the pool.
    pub fn clear_tunnel_ports(&mut self) -> FabricResult<Vec<TunnelPort>> {
        let ports = std::mem::take(&mut self.tunnel_ports);
        for port in &ports {
            self.tunnel_ids.release(port.port_no)?;
        }
        Ok(ports)
    }

    /// Acquires a port id for a new interface.
    pub fn acquire_vif_port(&mut self) -> FabricResult<u16> {
        self.vif_ids.acquire()
    }
}

/// The explicit topology handle passed into every compiler entry point.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Local tunnel endpoint address of this switch.
    pub tep: InterfaceAddress,
    /// Tunnel endpoints of the remote switches in the fabric.
    pub remote_teps: Vec<Ipv4Addr>,
    bridges: Vec<Bridge>,
}

impl Topology {
    /// Creates a topology with no bridges.
    pub fn new(tep: InterfaceAddress, remote_teps: Vec<Ipv4Addr>) -> Self {
        Self {
            tep,
            remote_teps,
            bridges: Vec::new(),
        }
    }

    /// Adds a bridge and returns it.
    pub fn add_bridge(&mut self, name: impl Into<String>) -> &mut Bridge {
        self.bridges.push(Bridge::new(name));
        self.bridges.last_mut().expect("just pushed")
    }

    /// Looks up a bridge by name.
    pub fn bridge(&self, name: &str) -> FabricResult<&Bridge> {
        self.bridges
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| FabricError::bridge_not_found(name))
    }

    /// Looks up a bridge by name for mutation.
    pub fn bridge_mut(&mut self, name: &str) -> FabricResult<&mut Bridge> {
        self.bridges
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| FabricError::bridge_not_found(name))
    }

    /// Removes a bridge.
    pub fn remove_bridge(&mut self, name: &str) -> FabricResult<Bridge> {
        let pos = self
            .bridges
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| FabricError::bridge_not_found(name))?;
        Ok(self.bridges.remove(pos))
    }

    /// All bridges.
    pub fn bridges(&self) -> &[Bridge] {
        &self.bridges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_tep() -> InterfaceAddress {
        InterfaceAddress::new(
            Ipv4Addr::new(10, 111, 0, 1),
            16,
            "2001:1000:1000:1000::a6f:1".parse().unwrap(),
            112,
        )
    }

    #[test]
    fn test_pool_acquires_lowest_free() {
        let mut pool = PortIdPool::new("test", 10..13);
        assert_eq!(pool.acquire().unwrap(), 10);
        assert_eq!(pool.acquire().unwrap(), 11);
        pool.release(10).unwrap();
        assert_eq!(pool.acquire().unwrap(), 10);
        assert_eq!(pool.acquire().unwrap(), 12);
        assert_eq!(pool.available(), 0);
        assert!(matches!(
            pool.acquire(),
            Err(FabricError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn test_pool_never_duplicates_without_release() {
        let mut pool = PortIdPool::new("test", 0..32);
        let mut seen = BTreeSet::new();
        for _ in 0..32 {
            assert!(seen.insert(pool.acquire().unwrap()));
        }
    }

    #[test]
    fn test_pool_rejects_foreign_release() {
        let mut pool = PortIdPool::new("test", 10..20);
        assert!(pool.release(10).is_err());
        let id = pool.acquire().unwrap();
        pool.release(id).unwrap();
        // Double release.
        assert!(pool.release(id).is_err());
    }

    #[test]
    fn test_bridge_has_local_port() {
        let bridge = Bridge::new("br0");
        assert_eq!(bridge.vifs().len(), 1);
        assert_eq!(bridge.vifs()[0].port_no, PORT_LOCAL);
        assert_eq!(bridge.vifs()[0].vni, Vni::NONE);
        assert_eq!(bridge.vni_index()[&Vni::NONE], vec![PORT_LOCAL]);
    }

    #[test]
    fn test_vni_rebuild_after_reassignment() {
        let mut bridge = Bridge::new("br0");
        for i in 0..3u32 {
            let port = bridge.acquire_vif_port().unwrap();
            let mac = MacAddr::new([0, 0, 0, 0, 1, i as u8]);
            bridge.add_vif(VirtualInterface::new(format!("vhost{i}"), i, mac, port));
        }
        bridge.set_vif_vni("vhost0", Vni(200)).unwrap();
        bridge.set_vif_vni("vhost1", Vni(200)).unwrap();
        bridge.set_vif_vni("vhost2", Vni(201)).unwrap();

        assert_eq!(bridge.vni_index()[&Vni(200)], vec![10, 11]);
        assert_eq!(bridge.vni_index()[&Vni(201)], vec![12]);
        // Only the local port stays on the default VNI.
        assert_eq!(bridge.vni_index()[&Vni::NONE], vec![PORT_LOCAL]);

        // Reassignment leaves no stale bucket behind.
        bridge.set_vif_vni("vhost2", Vni(200)).unwrap();
        assert!(!bridge.vni_index().contains_key(&Vni(201)));
        assert_eq!(bridge.vni_index()[&Vni(200)], vec![10, 11, 12]);
    }

    #[test]
    fn test_remove_vif_releases_port() {
        let mut bridge = Bridge::new("br0");
        let port = bridge.acquire_vif_port().unwrap();
        bridge.add_vif(VirtualInterface::new(
            "vhost0",
            0,
            MacAddr::new([0, 0, 0, 0, 1, 1]),
            port,
        ));
        bridge.remove_vif("vhost0").unwrap();
        assert_eq!(bridge.acquire_vif_port().unwrap(), port);
        assert!(bridge.vif("vhost0").is_none());
    }

    #[test]
    fn test_tunnel_port_lifecycle() {
        let mut bridge = Bridge::new("br0");
        let port = bridge
            .add_tunnel_port("geneve", RemoteIp::PerFlow, TunnelVni::PerFlow)
            .unwrap();
        assert_eq!(port.name, "geneve100");
        assert_eq!(port.port_no, 100);

        bridge
            .add_tunnel_port(
                "vxlan",
                RemoteIp::Fixed(Ipv4Addr::new(10, 111, 0, 2)),
                TunnelVni::Fixed(Vni(200)),
            )
            .unwrap();
        let cleared = bridge.clear_tunnel_ports().unwrap();
        assert_eq!(cleared.len(), 2);
        // Ids came back: the next tunnel port starts over at the base.
        let port = bridge
            .add_tunnel_port("geneve", RemoteIp::PerFlow, TunnelVni::PerFlow)
            .unwrap();
        assert_eq!(port.port_no, 100);
    }

    #[test]
    fn test_tunnel_vni_carries() {
        assert!(TunnelVni::PerFlow.carries(Vni(7)));
        assert!(TunnelVni::Fixed(Vni(7)).carries(Vni(7)));
        assert!(!TunnelVni::Fixed(Vni(7)).carries(Vni(8)));
    }

    #[test]
    fn test_deploy_mode_parse() {
        assert_eq!("tunnel".parse::<DeployMode>().unwrap(), DeployMode::Tunnel);
        assert_eq!("qinq".parse::<DeployMode>().unwrap(), DeployMode::Qinq);
        assert!(matches!(
            "gre".parse::<DeployMode>(),
            Err(FabricError::UnsupportedMode { .. })
        ));
    }

    #[test]
    fn test_uplink_lifecycle() {
        let mut bridge = Bridge::new("br0");
        let port = bridge.add_uplink("dpdk1").unwrap().port_no;
        assert_eq!(port, PORT_UPLINK_BASE);
        bridge.remove_uplink("dpdk1").unwrap();
        assert!(bridge.uplinks().is_empty());
        assert_eq!(bridge.add_uplink("dpdk2").unwrap().port_no, port);
        assert!(bridge.remove_uplink("dpdk1").is_err());
    }

    #[test]
    fn test_topology_bridge_lookup() {
        let mut topo = Topology::new(test_tep(), vec![Ipv4Addr::new(10, 111, 0, 2)]);
        topo.add_bridge("br0");
        assert_eq!(topo.bridges().len(), 1);
        assert!(topo.bridge("br0").is_ok());
        assert!(matches!(
            topo.bridge("br1"),
            Err(FabricError::BridgeNotFound { .. })
        ));
        topo.remove_bridge("br0").unwrap();
        assert!(topo.bridge("br0").is_err());
        assert!(topo.bridges().is_empty());
    }
}
