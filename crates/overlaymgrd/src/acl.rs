//! Connection-tracking based ACL compiler.
//!
//! For every (VNI, port) pair and every allowed protocol the ACL table gates
//! traffic through a per-VNI tracking zone: untracked packets are sent
//! through the tracker, new connections are committed to the VNI's zone, and
//! established (or established-reply) connections pass straight to CORE.
//! ARP and IPv6 neighbor discovery bypass the filter entirely.

use std::fmt;
use std::str::FromStr;

use fabric_common::{FabricError, MacAddr, Vni};

use crate::rule::{
    Action, CtArgs, CtFlag, CtState, CtZoneSpec, Field, FieldRef, FlowRule, Match, Proto,
};
use crate::tables::{PRIO_ACL_BYPASS, PRIO_ACL_DROP, PRIO_ACL_TRACK, TABLE_ACL, TABLE_CORE};
use crate::topology::Bridge;

/// ICMPv6 neighbor solicitation type.
const ND_SOLICIT: u8 = 135;
/// ICMPv6 neighbor advertisement type.
const ND_ADVERT: u8 = 136;

/// A protocol admitted by the ACL filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl AclProtocol {
    /// Expands to the tracked protocol keywords, always covering both IP
    /// families. Allowing udp implicitly also allows tcp: the UDP
    /// throughput tool needs a TCP control channel first.
    pub fn tracked(&self) -> Vec<Proto> {
        match self {
            AclProtocol::Udp => vec![Proto::Tcp, Proto::Tcp6, Proto::Udp, Proto::Udp6],
            AclProtocol::Tcp => vec![Proto::Tcp, Proto::Tcp6],
            AclProtocol::Icmp => vec![Proto::Icmp, Proto::Icmp6],
        }
    }

    /// The configuration keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            AclProtocol::Tcp => "tcp",
            AclProtocol::Udp => "udp",
            AclProtocol::Icmp => "icmp",
        }
    }
}

impl fmt::Display for AclProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AclProtocol {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(AclProtocol::Tcp),
            "udp" => Ok(AclProtocol::Udp),
            "icmp" => Ok(AclProtocol::Icmp),
            other => Err(FabricError::invalid_config(
                "acl protocol",
                format!("unrecognized protocol '{other}'"),
            )),
        }
    }
}

/// Tracking rules for one protocol on one (VNI, port) pair.
///
/// Untracked packets must enter the tracker with the zone taken from
/// reg0[0..15], never a literal: a trunk port multiplexes many VNIs, and a
/// literal zone would misattribute traffic from all but the last configured
/// VNI. IPv6 later fragments do not carry a parseable L4 protocol, so a
/// catch-all forces them through the tracker (which also reassembles).
fn track_proto_flows(vni: Vni, port_no: u16, proto: AclProtocol) -> Vec<FlowRule> {
    let zone_from_pkt = CtZoneSpec::Field(FieldRef::bits(Field::Reg0, 0, 15));
    let mut flows = Vec::new();

    flows.push(
        FlowRule::new(TABLE_ACL, PRIO_ACL_TRACK)
            .match_on(Match::InPort(port_no))
            .match_on(Match::Proto(Proto::Ipv6))
            .match_on(Match::IpFragLater)
            .match_on(Match::CtState(CtState::untracked()))
            .action(Action::ConnTrack(CtArgs {
                zone: Some(zone_from_pkt.clone()),
                table: Some(TABLE_ACL),
                ..Default::default()
            })),
    );

    for p in proto.tracked() {
        flows.push(
            FlowRule::new(TABLE_ACL, PRIO_ACL_TRACK)
                .match_on(Match::InPort(port_no))
                .match_on(Match::Proto(p))
                .match_on(Match::CtState(CtState::untracked()))
                .action(Action::ConnTrack(CtArgs {
                    zone: Some(zone_from_pkt.clone()),
                    table: Some(TABLE_ACL),
                    ..Default::default()
                })),
        );
        flows.push(
            FlowRule::new(TABLE_ACL, PRIO_ACL_TRACK)
                .match_on(Match::InPort(port_no))
                .match_on(Match::Proto(p))
                .match_on(Match::CtZone(vni.value()))
                .match_on(Match::CtState(CtState::tracked(&[CtFlag::New])))
                .action(Action::ConnTrack(CtArgs {
                    commit: true,
                    zone: Some(CtZoneSpec::Literal(vni.value())),
                    ..Default::default()
                }))
                .action(Action::GotoTable(TABLE_CORE)),
        );
        flows.push(
            FlowRule::new(TABLE_ACL, PRIO_ACL_TRACK)
                .match_on(Match::InPort(port_no))
                .match_on(Match::Proto(p))
                .match_on(Match::CtZone(vni.value()))
                .match_on(Match::CtState(CtState::tracked(&[CtFlag::Est])))
                .action(Action::GotoTable(TABLE_CORE)),
        );
        flows.push(
            FlowRule::new(TABLE_ACL, PRIO_ACL_TRACK)
                .match_on(Match::InPort(port_no))
                .match_on(Match::Proto(p))
                .match_on(Match::CtZone(vni.value()))
                .match_on(Match::CtState(CtState::tracked(&[CtFlag::Est, CtFlag::Rpl])))
                .action(Action::GotoTable(TABLE_CORE)),
        );
    }
    flows
}

/// Compiles the ACL table to admit one protocol per VNI zone.
///
/// Rules cover every local interface within its VNI bucket, then every
/// (VNI x tunnel port) and (VNI x uplink) pair — trunk ports need the rules
/// of every VNI they can carry.
pub fn generate_acl_allow_flows(bridge: &Bridge, proto: AclProtocol) -> Vec<FlowRule> {
    let mut flows = Vec::new();

    flows.push(FlowRule::new(TABLE_ACL, PRIO_ACL_DROP).action(Action::Drop));

    // Address resolution is always admitted, ahead of everything else.
    flows.push(
        FlowRule::new(TABLE_ACL, PRIO_ACL_BYPASS)
            .match_on(Match::Proto(Proto::Arp))
            .action(Action::GotoTable(TABLE_CORE)),
    );
    for nd_type in [ND_SOLICIT, ND_ADVERT] {
        flows.push(
            FlowRule::new(TABLE_ACL, PRIO_ACL_BYPASS)
                .match_on(Match::Proto(Proto::Icmp6))
                .match_on(Match::IcmpType(nd_type))
                .action(Action::GotoTable(TABLE_CORE)),
        );
    }

    for (vni, ports) in bridge.vni_index() {
        for &port_no in ports {
            flows.extend(track_proto_flows(*vni, port_no, proto));
        }
    }
    for vni in bridge.vni_index().keys() {
        for tunnel in bridge.tunnel_ports() {
            flows.extend(track_proto_flows(*vni, tunnel.port_no, proto));
        }
        for uplink in bridge.uplinks() {
            flows.extend(track_proto_flows(*vni, uplink.port_no, proto));
        }
    }

    flows
}

/// Compiles the "allow once originated" guard: traffic addressed to the
/// guarded endpoint is only accepted as a reply to a connection the endpoint
/// itself originated. New or invalid tracked connections towards its MAC are
/// dropped ahead of the protocol filter.
pub fn generate_originate_only_flows(proto: AclProtocol, dst_mac: MacAddr) -> Vec<FlowRule> {
    let mut flows = Vec::new();
    for p in proto.tracked() {
        for state in [
            CtState::tracked(&[CtFlag::New]),
            CtState::tracked(&[CtFlag::Inv]),
        ] {
            flows.push(
                FlowRule::new(TABLE_ACL, PRIO_ACL_BYPASS)
                    .match_on(Match::CtState(state))
                    .match_on(Match::DlDst(dst_mac))
                    .match_on(Match::Proto(p))
                    .action(Action::Drop),
            );
        }
    }
    flows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::VirtualInterface;
    use pretty_assertions::assert_eq;

    fn bridge_with_one_vif(vni: u32) -> Bridge {
        let mut bridge = Bridge::new("br0");
        let port = bridge.acquire_vif_port().unwrap();
        let mut vif =
            VirtualInterface::new("vhost0", 0, MacAddr::new([0, 0, 0, 1, 1, 1]), port);
        vif.vni = Vni(vni);
        bridge.add_vif(vif);
        bridge
    }

    #[test]
    fn test_udp_expands_to_tcp_and_udp() {
        assert_eq!(
            AclProtocol::Udp.tracked(),
            vec![Proto::Tcp, Proto::Tcp6, Proto::Udp, Proto::Udp6]
        );
        assert_eq!(AclProtocol::Tcp.tracked(), vec![Proto::Tcp, Proto::Tcp6]);
        assert_eq!(AclProtocol::Icmp.tracked(), vec![Proto::Icmp, Proto::Icmp6]);
    }

    #[test]
    fn test_unknown_protocol_is_config_error() {
        assert!(matches!(
            "sctp".parse::<AclProtocol>(),
            Err(FabricError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_untracked_rules_use_zone_from_packet() {
        let bridge = bridge_with_one_vif(200);
        let flows = generate_acl_allow_flows(&bridge, AclProtocol::Tcp);
        // Every untracked rule reads the zone from reg0, never a literal.
        let untracked: Vec<&FlowRule> = flows
            .iter()
            .filter(|r| {
                r.matches
                    .contains(&Match::CtState(CtState::untracked()))
            })
            .collect();
        assert!(!untracked.is_empty());
        for rule in untracked {
            let wire = rule.wire();
            assert!(
                wire.contains("zone=reg0[0..15]"),
                "literal zone in: {wire}"
            );
        }
    }

    #[test]
    fn test_new_connection_commits_to_literal_zone() {
        let bridge = bridge_with_one_vif(200);
        let flows = generate_acl_allow_flows(&bridge, AclProtocol::Tcp);
        let wire = flows
            .iter()
            .map(FlowRule::wire)
            .find(|w| w.contains("ct_state=+trk+new") && w.contains("in_port=10,tcp"))
            .unwrap();
        assert_eq!(
            wire,
            "table=30,priority=100,in_port=10,tcp,ct_zone=200,ct_state=+trk+new,\
             action=ct(commit,zone=200),goto_table:40"
        );
    }

    #[test]
    fn test_arp_and_nd_bypass_ahead_of_filter() {
        let bridge = bridge_with_one_vif(200);
        let flows = generate_acl_allow_flows(&bridge, AclProtocol::Icmp);
        let wires: Vec<String> = flows.iter().map(FlowRule::wire).collect();
        assert!(wires.contains(&"table=30,priority=2000,arp,action=goto_table:40".to_string()));
        assert!(wires.contains(
            &"table=30,priority=2000,icmp6,icmp_type=135,action=goto_table:40".to_string()
        ));
        assert!(wires.contains(
            &"table=30,priority=2000,icmp6,icmp_type=136,action=goto_table:40".to_string()
        ));
        assert!(wires.contains(&"table=30,priority=1,action=drop".to_string()));
    }

    #[test]
    fn test_trunk_ports_get_rules_for_every_vni() {
        let mut bridge = bridge_with_one_vif(200);
        bridge.add_uplink("dpdk1").unwrap();
        let flows = generate_acl_allow_flows(&bridge, AclProtocol::Icmp);
        // The uplink (port 1) must carry commit rules for both the default
        // VNI bucket and VNI 200.
        let uplink_commits: Vec<String> = flows
            .iter()
            .map(FlowRule::wire)
            .filter(|w| w.contains("in_port=1,icmp,") && w.contains("+trk+new"))
            .collect();
        assert!(uplink_commits.iter().any(|w| w.contains("ct_zone=0")));
        assert!(uplink_commits.iter().any(|w| w.contains("ct_zone=200")));
    }

    #[test]
    fn test_originate_only_drops_new_and_invalid() {
        let mac: MacAddr = "00:00:00:01:01:01".parse().unwrap();
        let flows = generate_originate_only_flows(AclProtocol::Tcp, mac);
        let wires: Vec<String> = flows.iter().map(FlowRule::wire).collect();
        assert_eq!(wires.len(), 4);
        assert!(wires.contains(
            &"table=30,priority=2000,ct_state=+trk+new,dl_dst=00:00:00:01:01:01,tcp,\
              action=drop"
                .to_string()
        ));
        assert!(wires.contains(
            &"table=30,priority=2000,ct_state=+trk+inv,dl_dst=00:00:00:01:01:01,tcp6,\
              action=drop"
                .to_string()
        ));
    }
}
