//! Switch backend command builders.
//!
//! Bridge and port creation differ by the underlying datapath. The
//! differences live behind the [`SwitchBackend`] capability trait; the
//! concrete strategy is selected once at construction time. Builders only
//! produce the CLI command text — executing it against a switch belongs to
//! the external provisioning side.

use crate::topology::{Bridge, RemoteIp, TunnelPort, TunnelVni, Uplink, VirtualInterface};

/// Datapath-specific bridge/port creation capabilities.
pub trait SwitchBackend: Send + Sync {
    /// Backend name, for logging.
    fn name(&self) -> &'static str;

    /// Command creating a bridge on this datapath.
    fn create_bridge_cmd(&self, bridge: &Bridge) -> String;

    /// Command attaching a virtual interface port.
    fn create_vif_port_cmd(&self, bridge: &Bridge, vif: &VirtualInterface) -> String;

    /// Command attaching an uplink port.
    fn create_uplink_port_cmd(&self, bridge: &Bridge, uplink: &Uplink) -> String;

    /// Command bonding several uplinks into one logical port.
    fn create_uplink_bond_cmd(&self, bridge: &Bridge, bond_name: &str, members: &[Uplink])
        -> String;

    /// Command detaching an uplink.
    fn delete_uplink_cmd(&self, bridge: &Bridge, uplink: &Uplink) -> String {
        delete_port_cmd(&bridge.name, &uplink.name)
    }

    /// Command bringing a bond member up or down.
    fn set_bond_member_up_cmd(&self, bridge: &Bridge, member: &str, up: bool) -> String {
        let state = if up { "up" } else { "down" };
        format!("ovs-ofctl mod-port {} {} {}", bridge.name, member, state)
    }
}

/// Userspace (DPDK) datapath backend.
#[derive(Debug, Default)]
pub struct DpdkBackend;

/// Kernel datapath backend.
#[derive(Debug, Default)]
pub struct KernelBackend;

impl SwitchBackend for DpdkBackend {
    fn name(&self) -> &'static str {
        "dpdk"
    }

    fn create_bridge_cmd(&self, bridge: &Bridge) -> String {
        format!(
            "ovs-vsctl add-br {0} -- set bridge {0} datapath_type=netdev",
            bridge.name
        )
    }

    fn create_vif_port_cmd(&self, bridge: &Bridge, vif: &VirtualInterface) -> String {
        format!(
            "ovs-vsctl add-port {0} {1} -- set Interface {1} \
             type=dpdkvhostuserclient options:vhost-server-path=/var/run/{1} \
             ofport_request={2}",
            bridge.name, vif.name, vif.port_no
        )
    }

    fn create_uplink_port_cmd(&self, bridge: &Bridge, uplink: &Uplink) -> String {
        format!(
            "ovs-vsctl add-port {0} {1} -- set Interface {1} type=dpdk \
             options:n_rxq={2} options:n_txq={2} ofport_request={3}",
            bridge.name, uplink.name, uplink.queue_pairs, uplink.port_no
        )
    }

    fn create_uplink_bond_cmd(
        &self,
        bridge: &Bridge,
        bond_name: &str,
        members: &[Uplink],
    ) -> String {
        let names: Vec<&str> = members.iter().map(|u| u.name.as_str()).collect();
        let mut cmd = format!(
            "ovs-vsctl add-bond {} {} {} bond_mode=balance-tcp lacp=active \
             other_config:lacp-time=fast",
            bridge.name,
            bond_name,
            names.join(" ")
        );
        for member in members {
            cmd.push_str(&format!(
                " -- set Interface {} type=dpdk options:n_rxq=1 options:n_txq=1 \
                 ofport_request={}",
                member.name, member.port_no
            ));
        }
        cmd
    }
}

impl SwitchBackend for KernelBackend {
    fn name(&self) -> &'static str {
        "kernel"
    }

    fn create_bridge_cmd(&self, bridge: &Bridge) -> String {
        format!(
            "ovs-vsctl add-br {0} -- set bridge {0} datapath_type=system",
            bridge.name
        )
    }

    fn create_vif_port_cmd(&self, bridge: &Bridge, vif: &VirtualInterface) -> String {
        format!(
            "ovs-vsctl add-port {0} {1} -- set Interface {1} ofport_request={2}",
            bridge.name, vif.name, vif.port_no
        )
    }

    fn create_uplink_port_cmd(&self, bridge: &Bridge, uplink: &Uplink) -> String {
        format!(
            "ovs-vsctl add-port {0} {1} -- set Interface {1} ofport_request={2}",
            bridge.name, uplink.name, uplink.port_no
        )
    }

    fn create_uplink_bond_cmd(
        &self,
        bridge: &Bridge,
        bond_name: &str,
        _members: &[Uplink],
    ) -> String {
        format!(
            "ovs-vsctl add-port {0} {1} -- set Interface {1} ofport_request={2}",
            bridge.name, bond_name, crate::tables::PORT_UPLINK_BASE
        )
    }
}

/// Command creating a tunnel port; datapath independent.
pub fn create_tunnel_port_cmd(bridge_name: &str, port: &TunnelPort) -> String {
    let remote = match port.remote_ip {
        RemoteIp::Fixed(ip) => ip.to_string(),
        RemoteIp::PerFlow => "flow".to_string(),
    };
    let key = match port.vni {
        TunnelVni::Fixed(vni) => vni.to_string(),
        TunnelVni::PerFlow => "flow".to_string(),
    };
    format!(
        "ovs-vsctl add-port {0} {1} -- set Interface {1} type={2} \
         options:remote_ip={3} options:key={4} ofport_request={5}",
        bridge_name, port.name, port.encap, remote, key, port.port_no
    )
}

/// Command deleting any port; datapath independent.
pub fn delete_port_cmd(bridge_name: &str, port_name: &str) -> String {
    format!("ovs-vsctl del-port {bridge_name} {port_name}")
}

/// Command bounding how many 802.1Q tags the switch parses; QinQ needs 2.
pub fn set_vlan_limit_cmd(limit: u8) -> String {
    format!("ovs-vsctl set Open_vSwitch . other_config:vlan-limit={limit}")
}

/// Command requesting an uplink MTU, for encapsulation headroom.
pub fn set_uplink_mtu_cmd(uplink: &Uplink, mtu: u16) -> String {
    format!("ovs-vsctl set Interface {} mtu_request={mtu}", uplink.name)
}

/// Command installing the tunnel-metadata TLV map on a bridge.
pub fn add_tlv_map_cmd(bridge_name: &str) -> String {
    format!(
        "ovs-ofctl add-tlv-map {bridge_name} \
         \"{{class=0xffff,type=0,len=4}}->tun_metadata0,\
         {{class=0xffff,type=1,len=8}}->tun_metadata1\""
    )
}

/// Command removing a bridge's TLV map. Must run after flow deletion:
/// active flows may still reference the mapped fields.
pub fn del_tlv_map_cmd(bridge_name: &str) -> String {
    format!("ovs-ofctl del-tlv-map {bridge_name}")
}
