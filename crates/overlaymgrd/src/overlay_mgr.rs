//! OverlayMgr - overlay deployment manager.
//!
//! Owns the topology model and a provisioning sink; compiles the model into
//! flow batches and pushes them across the boundary. Every batch is
//! validated against the table-transfer invariant before it is serialized.

use tracing::{debug, info};

use fabric_common::{FabricError, FabricResult, InterfaceAddress, MacAddr, ProvisioningSink, Vni};

use crate::acl::{self, AclProtocol};
use crate::backend::{self, SwitchBackend};
use crate::nat::{self, NatEndpoint, NatRouter, NatSpec};
use crate::pipeline;
use crate::rule::FlowRule;
use crate::tables::{TABLE_ACL, TABLE_INPUT, TABLE_NAT, TABLE_OUTPUT};
use crate::topology::{DeployMode, RemoteIp, Topology, TunnelVni, VirtualInterface};

/// Serializes a batch after validating every rule.
fn serialize(flows: &[FlowRule]) -> FabricResult<Vec<String>> {
    for flow in flows {
        flow.validate()?;
    }
    Ok(flows.iter().map(FlowRule::wire).collect())
}

/// Manages overlay deployments on the bridges of one switch.
pub struct OverlayMgr {
    topo: Topology,
    backend: Box<dyn SwitchBackend>,
    sink: Box<dyn ProvisioningSink>,
}

impl OverlayMgr {
    /// Creates a manager over a topology; the backend strategy and sink are
    /// fixed here for the manager's lifetime.
    pub fn new(
        topo: Topology,
        backend: Box<dyn SwitchBackend>,
        sink: Box<dyn ProvisioningSink>,
    ) -> Self {
        Self {
            topo,
            backend,
            sink,
        }
    }

    /// The managed topology.
    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    /// The managed topology, for mutation.
    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topo
    }

    /// Attaches a virtual interface to a bridge, assigning it a port number
    /// from the bridge's VIF pool. Returns the assigned port number.
    pub fn attach_vif(
        &mut self,
        bridge_name: &str,
        name: &str,
        index: u32,
        mac: MacAddr,
        addr: Option<InterfaceAddress>,
    ) -> FabricResult<u16> {
        let bridge = self.topo.bridge_mut(bridge_name)?;
        let port_no = bridge.acquire_vif_port()?;
        let mut vif = VirtualInterface::new(name, index, mac, port_no);
        vif.addr = addr;
        bridge.add_vif(vif);
        info!(bridge = %bridge_name, vif = %name, port = port_no, "Attached interface");
        Ok(port_no)
    }

    /// Detaches a virtual interface, returning its port number to the pool.
    pub fn detach_vif(&mut self, bridge_name: &str, name: &str) -> FabricResult<()> {
        let bridge = self.topo.bridge_mut(bridge_name)?;
        bridge.remove_vif(name)?;
        info!(bridge = %bridge_name, vif = %name, "Detached interface");
        Ok(())
    }

    /// Assigns a VNI to one interface; the bridge's VNI index is rebuilt.
    pub fn set_vif_vni(&mut self, bridge_name: &str, name: &str, vni: Vni) -> FabricResult<()> {
        self.topo.bridge_mut(bridge_name)?.set_vif_vni(name, vni)
    }

    /// Assigns `base + i` to the i-th non-local interface of a bridge, then
    /// rebuilds the VNI index.
    pub fn assign_vnis_by_index(&mut self, bridge_name: &str, base: u32) -> FabricResult<()> {
        let bridge = self.topo.bridge_mut(bridge_name)?;
        let names: Vec<String> = bridge
            .vifs()
            .iter()
            .filter(|v| v.port_no != crate::tables::PORT_LOCAL)
            .map(|v| v.name.clone())
            .collect();
        for (i, name) in names.iter().enumerate() {
            bridge.set_vif_vni(name, Vni(base + i as u32))?;
        }
        Ok(())
    }

    /// Clears every interface back to the default VNI.
    pub fn reset_vnis(&mut self, bridge_name: &str) -> FabricResult<()> {
        let bridge = self.topo.bridge_mut(bridge_name)?;
        let names: Vec<String> = bridge.vifs().iter().map(|v| v.name.clone()).collect();
        for name in names {
            bridge.set_vif_vni(&name, Vni::NONE)?;
        }
        Ok(())
    }

    /// Creates tunnel ports for a bridge according to the remote-address and
    /// VNI modes. Fixed remotes get one port per remote endpoint; a fixed
    /// VNI multiplies that by the bridge's VNIs; per-flow on both sides
    /// collapses to a single multiplexed port.
    pub fn create_tunnel_ports(
        &mut self,
        bridge_name: &str,
        encap: &str,
        rip_per_flow: bool,
        vni_per_flow: bool,
    ) -> FabricResult<usize> {
        let remotes = self.topo.remote_teps.clone();
        let bridge = self.topo.bridge_mut(bridge_name)?;
        let vnis: Vec<Vni> = bridge.vni_index().keys().copied().collect();

        let mut created = 0;
        if !rip_per_flow {
            for remote in &remotes {
                if !vni_per_flow {
                    for vni in &vnis {
                        bridge.add_tunnel_port(
                            encap,
                            RemoteIp::Fixed(*remote),
                            TunnelVni::Fixed(*vni),
                        )?;
                        created += 1;
                    }
                } else {
                    bridge.add_tunnel_port(encap, RemoteIp::Fixed(*remote), TunnelVni::PerFlow)?;
                    created += 1;
                }
            }
        } else if !vni_per_flow {
            for vni in &vnis {
                bridge.add_tunnel_port(encap, RemoteIp::PerFlow, TunnelVni::Fixed(*vni))?;
                created += 1;
            }
        } else {
            bridge.add_tunnel_port(encap, RemoteIp::PerFlow, TunnelVni::PerFlow)?;
            created += 1;
        }
        info!(bridge = %bridge_name, encap = %encap, created, "Created tunnel ports");
        Ok(created)
    }

    /// Builds the backend command sequence recreating a bridge's current
    /// port population on the datapath, for the external runner.
    pub fn provisioning_commands(
        &self,
        bridge_name: &str,
        mode: DeployMode,
    ) -> FabricResult<Vec<String>> {
        let bridge = self.topo.bridge(bridge_name)?;
        let mut cmds = vec![self.backend.create_bridge_cmd(bridge)];
        for vif in bridge.vifs() {
            if vif.port_no == crate::tables::PORT_LOCAL {
                continue;
            }
            cmds.push(self.backend.create_vif_port_cmd(bridge, vif));
        }
        for uplink in bridge.uplinks() {
            cmds.push(self.backend.create_uplink_port_cmd(bridge, uplink));
        }
        for tunnel in bridge.tunnel_ports() {
            cmds.push(backend::create_tunnel_port_cmd(&bridge.name, tunnel));
        }
        if mode == DeployMode::Qinq {
            // The switch parses a single tag by default.
            cmds.push(backend::set_vlan_limit_cmd(2));
        }
        if bridge.tunnel_metadata {
            cmds.push(backend::add_tlv_map_cmd(&bridge.name));
        }
        debug!(backend = self.backend.name(), count = cmds.len(), "Built backend commands");
        Ok(cmds)
    }

    /// Builds the backend command sequence undoing a deployment's datapath
    /// configuration: the TLV map first (flows referencing it must already
    /// be gone), then the tunnel ports, then mode-specific restores.
    pub fn teardown_commands(
        &self,
        bridge_name: &str,
        mode: DeployMode,
    ) -> FabricResult<Vec<String>> {
        let bridge = self.topo.bridge(bridge_name)?;
        let mut cmds = Vec::new();
        if bridge.tunnel_metadata {
            cmds.push(backend::del_tlv_map_cmd(&bridge.name));
        }
        for tunnel in bridge.tunnel_ports() {
            cmds.push(backend::delete_port_cmd(&bridge.name, &tunnel.name));
        }
        if mode == DeployMode::Qinq {
            for uplink in bridge.uplinks() {
                cmds.push(backend::set_uplink_mtu_cmd(uplink, 1500));
            }
        }
        Ok(cmds)
    }

    /// Deploys a mode on a bridge: the default pipeline first, then the
    /// mode's INPUT/OUTPUT tables on top of it.
    pub async fn deploy(
        &mut self,
        bridge_name: &str,
        mode: DeployMode,
        tunnel_metadata: bool,
    ) -> FabricResult<()> {
        if tunnel_metadata && mode != DeployMode::Tunnel {
            return Err(FabricError::invalid_config(
                "tunnel metadata",
                format!("not applicable to {mode} mode"),
            ));
        }
        self.topo.bridge_mut(bridge_name)?.tunnel_metadata = tunnel_metadata;

        let bridge = self.topo.bridge(bridge_name)?;
        let default_wire = serialize(&pipeline::default_pipeline_flows(&self.topo, bridge)?)?;

        let overlay_wire = if mode == DeployMode::Native {
            Vec::new()
        } else {
            let mut flows = pipeline::generate_input_flows(bridge, mode);
            flows.extend(pipeline::generate_output_flows(
                &self.topo,
                bridge,
                mode,
                tunnel_metadata,
            )?);
            serialize(&flows)?
        };

        self.sink.clear_flows(bridge_name, &[]).await?;
        self.sink.apply_flows(bridge_name, &default_wire).await?;
        if !overlay_wire.is_empty() {
            // The overlay re-implements INPUT/OUTPUT; drop the native ones.
            self.sink
                .clear_flows(bridge_name, &[TABLE_INPUT, TABLE_OUTPUT])
                .await?;
            self.sink.apply_flows(bridge_name, &overlay_wire).await?;
        }
        info!(bridge = %bridge_name, mode = %mode, tunnel_metadata, "Deployed overlay pipeline");
        Ok(())
    }

    /// Tears a bridge's deployment down: clears all flows and drops its
    /// tunnel ports.
    pub async fn undeploy(&mut self, bridge_name: &str) -> FabricResult<()> {
        self.sink.clear_flows(bridge_name, &[]).await?;
        let bridge = self.topo.bridge_mut(bridge_name)?;
        bridge.tunnel_metadata = false;
        let dropped = bridge.clear_tunnel_ports()?;
        info!(bridge = %bridge_name, tunnels = dropped.len(), "Undeployed overlay");
        Ok(())
    }

    /// Rewrites the ACL table to admit one protocol per VNI zone.
    pub async fn apply_acl_allow(
        &mut self,
        bridge_name: &str,
        proto: AclProtocol,
    ) -> FabricResult<()> {
        let bridge = self.topo.bridge(bridge_name)?;
        let wire = serialize(&acl::generate_acl_allow_flows(bridge, proto))?;
        self.sink.clear_flows(bridge_name, &[TABLE_ACL]).await?;
        self.sink.apply_flows(bridge_name, &wire).await?;
        info!(bridge = %bridge_name, proto = %proto, "Applied ACL protocol filter");
        Ok(())
    }

    /// Adds the originate-only guard for one endpoint on top of the current
    /// ACL table.
    pub async fn apply_originate_only(
        &mut self,
        bridge_name: &str,
        proto: AclProtocol,
        dst_mac: MacAddr,
    ) -> FabricResult<()> {
        let wire = serialize(&acl::generate_originate_only_flows(proto, dst_mac))?;
        self.sink.apply_flows(bridge_name, &wire).await?;
        info!(bridge = %bridge_name, proto = %proto, mac = %dst_mac, "Applied originate-only guard");
        Ok(())
    }

    /// Deploys the NAT chain for a client interface: the default pipeline,
    /// then the NAT table range rewritten with the translation.
    pub async fn apply_nat(
        &mut self,
        bridge_name: &str,
        client_vif: &str,
        servers: &[NatEndpoint],
        router: &NatRouter,
        spec: &NatSpec,
    ) -> FabricResult<()> {
        self.deploy(bridge_name, DeployMode::Native, false).await?;

        let bridge = self.topo.bridge(bridge_name)?;
        let vif = bridge.vif(client_vif).ok_or_else(|| {
            FabricError::invalid_config(
                format!("bridge '{bridge_name}'"),
                format!("no interface named '{client_vif}'"),
            )
        })?;
        let addr = vif.addr.ok_or_else(|| {
            FabricError::invalid_config(
                format!("interface '{client_vif}'"),
                "NAT client interface has no address",
            )
        })?;
        let client = NatEndpoint {
            mac: vif.mac,
            ipv4: addr.ipv4,
            ipv6: addr.ipv6,
        };
        let wire = serialize(&nat::generate_nat_flows(
            vif.port_no,
            &client,
            servers,
            router,
            spec,
        )?)?;

        self.sink.clear_flows(bridge_name, &[TABLE_NAT]).await?;
        self.sink.apply_flows(bridge_name, &wire).await?;
        info!(
            bridge = %bridge_name,
            client = %client_vif,
            snat = spec.is_snat(),
            "Applied NAT chain"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DpdkBackend;
    use fabric_common::{RecordingSink, SinkOp};
    use std::net::Ipv4Addr;

    fn test_topology() -> Topology {
        let mut topo = Topology::new(
            InterfaceAddress::new(
                Ipv4Addr::new(10, 111, 0, 1),
                16,
                "2001:1000:1000:1000::a6f:1".parse().unwrap(),
                112,
            ),
            vec![Ipv4Addr::new(10, 111, 0, 2)],
        );
        topo.add_bridge("br0");
        topo
    }

    fn test_mgr() -> (OverlayMgr, RecordingSink) {
        let sink = RecordingSink::new();
        let mgr = OverlayMgr::new(
            test_topology(),
            Box::new(DpdkBackend),
            Box::new(sink.clone()),
        );
        (mgr, sink)
    }

    #[test]
    fn test_attach_vif_assigns_pool_ports() {
        let (mut mgr, _sink) = test_mgr();
        let p0 = mgr
            .attach_vif("br0", "vhost0", 0, MacAddr::new([0, 0, 0, 0, 0, 1]), None)
            .unwrap();
        let p1 = mgr
            .attach_vif("br0", "vhost1", 1, MacAddr::new([0, 0, 0, 0, 0, 2]), None)
            .unwrap();
        assert_eq!((p0, p1), (10, 11));

        mgr.detach_vif("br0", "vhost0").unwrap();
        let p2 = mgr
            .attach_vif("br0", "vhost2", 2, MacAddr::new([0, 0, 0, 0, 0, 3]), None)
            .unwrap();
        assert_eq!(p2, 10);
    }

    #[test]
    fn test_assign_vnis_by_index_skips_local_port() {
        let (mut mgr, _sink) = test_mgr();
        for i in 0..2u32 {
            mgr.attach_vif(
                "br0",
                &format!("vhost{i}"),
                i,
                MacAddr::new([0, 0, 0, 0, 0, i as u8]),
                None,
            )
            .unwrap();
        }
        mgr.assign_vnis_by_index("br0", 200).unwrap();
        let bridge = mgr.topology().bridge("br0").unwrap();
        assert_eq!(bridge.vif("vhost0").unwrap().vni, Vni(200));
        assert_eq!(bridge.vif("vhost1").unwrap().vni, Vni(201));
        assert_eq!(bridge.vifs()[0].vni, Vni::NONE);
    }

    #[test]
    fn test_tunnel_port_matrix() {
        let (mut mgr, _sink) = test_mgr();
        mgr.attach_vif("br0", "vhost0", 0, MacAddr::new([0, 0, 0, 0, 0, 1]), None)
            .unwrap();
        mgr.set_vif_vni("br0", "vhost0", Vni(200)).unwrap();

        // Per-flow everything: one multiplexed port.
        assert_eq!(
            mgr.create_tunnel_ports("br0", "geneve", true, true).unwrap(),
            1
        );
        mgr.topology_mut()
            .bridge_mut("br0")
            .unwrap()
            .clear_tunnel_ports()
            .unwrap();

        // Fixed remote, fixed VNI: one port per remote per VNI bucket
        // (default bucket + VNI 200, one remote).
        assert_eq!(
            mgr.create_tunnel_ports("br0", "geneve", false, false).unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_deploy_clears_then_applies() {
        let (mut mgr, sink) = test_mgr();
        mgr.attach_vif("br0", "vhost0", 0, MacAddr::new([0, 0, 0, 0, 0, 1]), None)
            .unwrap();
        mgr.attach_vif("br0", "vhost1", 1, MacAddr::new([0, 0, 0, 0, 0, 2]), None)
            .unwrap();
        mgr.assign_vnis_by_index("br0", 200).unwrap();
        mgr.create_tunnel_ports("br0", "geneve", true, true).unwrap();

        mgr.deploy("br0", DeployMode::Tunnel, false).await.unwrap();

        let ops = sink.ops();
        assert!(matches!(&ops[0], SinkOp::Clear { tables, .. } if tables.is_empty()));
        assert!(matches!(&ops[1], SinkOp::Apply { .. }));
        assert!(
            matches!(&ops[2], SinkOp::Clear { tables, .. } if tables == &vec![TABLE_INPUT, TABLE_OUTPUT])
        );
        assert!(matches!(&ops[3], SinkOp::Apply { .. }));
    }

    #[tokio::test]
    async fn test_deploy_rejects_metadata_outside_tunnel_mode() {
        let (mut mgr, _sink) = test_mgr();
        let err = mgr.deploy("br0", DeployMode::Vlan, true).await.unwrap_err();
        assert!(matches!(err, FabricError::InvalidConfig { .. }));
    }

    #[test]
    fn test_provisioning_commands_cover_ports() {
        let (mut mgr, _sink) = test_mgr();
        mgr.attach_vif("br0", "vhost0", 0, MacAddr::new([0, 0, 0, 0, 0, 1]), None)
            .unwrap();
        mgr.topology_mut()
            .bridge_mut("br0")
            .unwrap()
            .add_uplink("dpdk1")
            .unwrap();
        mgr.create_tunnel_ports("br0", "geneve", true, true).unwrap();

        let cmds = mgr.provisioning_commands("br0", DeployMode::Qinq).unwrap();
        assert!(cmds[0].contains("add-br br0"));
        assert!(cmds.iter().any(|c| c.contains("vhost0")));
        assert!(cmds.iter().any(|c| c.contains("type=dpdk ")));
        assert!(cmds.iter().any(|c| c.contains("type=geneve")));
        assert!(cmds.iter().any(|c| c.contains("vlan-limit=2")));
    }

    #[tokio::test]
    async fn test_teardown_commands_follow_deployment() {
        let (mut mgr, _sink) = test_mgr();
        mgr.attach_vif("br0", "vhost0", 0, MacAddr::new([0, 0, 0, 0, 0, 1]), None)
            .unwrap();
        mgr.create_tunnel_ports("br0", "geneve", true, true).unwrap();
        mgr.deploy("br0", DeployMode::Tunnel, true).await.unwrap();

        let cmds = mgr.teardown_commands("br0", DeployMode::Tunnel).unwrap();
        // TLV map removal precedes the tunnel port deletion.
        assert!(cmds[0].contains("del-tlv-map br0"));
        assert!(cmds[1].contains("del-port br0 geneve100"));
    }
}
