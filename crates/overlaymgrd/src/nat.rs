//! NAT/ALG compiler: the four-sub-table chain rooted at the NAT table.
//!
//! Sub-table 0 commits all IP traffic to connection tracking with NAT
//! enabled, sub-table 1 admits new connections applying the address/port
//! rewrite (with FTP/TFTP ALG exceptions so related data channels are
//! pre-authorized), sub-table 2 hands over to L2 matching, and sub-table 3
//! rewrites MAC addresses per destination network on behalf of the NAT
//! router, which answers no ARP/ND itself.

use std::net::{Ipv4Addr, Ipv6Addr};

use fabric_common::{FabricResult, MacAddr};

use crate::rule::{
    Action, CtAlg, CtArgs, CtFlag, CtNat, CtState, Field, FieldRef, FlowRule, Match, Proto,
    SetValue,
};
use crate::tables::{PRIO_NAT_DROP, PRIO_NAT_MATCH, TABLE_L2_MATCH, TABLE_NAT, TableId};

/// NAT sub-table: new-connection admission and translation.
const TABLE_NAT_ALLOW: TableId = TABLE_NAT + 1;
/// NAT sub-table: hand-off towards L2 matching.
const TABLE_NAT_FORWARD: TableId = TABLE_NAT + 2;
/// NAT sub-table: per-destination MAC rewrite.
const TABLE_NAT_MAC: TableId = TABLE_NAT + 3;

/// FTP control channel port, tracked with the ftp ALG.
const FTP_CTRL_PORT: u16 = 21;
/// TFTP port, tracked with the tftp ALG.
const TFTP_PORT: u16 = 69;

/// Which address family a NAT action string is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// A NAT translation specification.
///
/// The presence of a virtual IP makes the spec DNAT (traffic to the virtual
/// address is redirected); its absence makes it SNAT. A port count of zero
/// means plain address translation without port rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatSpec {
    /// First IPv4 address of the translation range.
    pub ipv4_start: Ipv4Addr,
    /// First IPv6 address of the translation range.
    pub ipv6_start: Ipv6Addr,
    /// Number of addresses in the range.
    pub addr_count: u32,
    /// First port of the translation range.
    pub port_start: u16,
    /// Number of ports in the range; 0 disables port translation.
    pub port_count: u16,
    /// Free-form translation flags appended to the action.
    pub flags: Option<String>,
    /// DNAT virtual IPv4 address.
    pub vip_v4: Option<Ipv4Addr>,
    /// DNAT virtual IPv6 address.
    pub vip_v6: Option<Ipv6Addr>,
}

impl NatSpec {
    /// Creates an SNAT spec over an address range.
    pub fn snat(
        ipv4_start: Ipv4Addr,
        ipv6_start: Ipv6Addr,
        addr_count: u32,
        port_start: u16,
        port_count: u16,
    ) -> Self {
        Self {
            ipv4_start,
            ipv6_start,
            addr_count,
            port_start,
            port_count,
            flags: None,
            vip_v4: None,
            vip_v6: None,
        }
    }

    /// Creates a DNAT spec redirecting a virtual address to a real range.
    pub fn dnat(
        ipv4_start: Ipv4Addr,
        ipv6_start: Ipv6Addr,
        addr_count: u32,
        vip_v4: Ipv4Addr,
        vip_v6: Ipv6Addr,
    ) -> Self {
        Self {
            ipv4_start,
            ipv6_start,
            addr_count,
            port_start: 0,
            port_count: 0,
            flags: None,
            vip_v4: Some(vip_v4),
            vip_v6: Some(vip_v6),
        }
    }

    /// Returns true for source translation.
    pub fn is_snat(&self) -> bool {
        self.vip_v4.is_none()
    }

    /// Returns true for destination translation.
    pub fn is_dnat(&self) -> bool {
        !self.is_snat()
    }

    /// Generates the NAT action string for one address family:
    /// `<src|dst>=<addr>[-<last>][:<port>[-<last>]][,<flags>]`.
    ///
    /// The range suffix is omitted for a single address, the port clause for
    /// a zero port count, and IPv6 addresses are bracket-wrapped only when a
    /// port clause is present.
    pub fn nat_action(&self, version: IpVersion) -> String {
        let mut action = String::from(if self.is_snat() { "src=" } else { "dst=" });

        match version {
            IpVersion::V4 => {
                action.push_str(&self.ipv4_start.to_string());
                if self.addr_count > 1 {
                    let last = v4_offset(self.ipv4_start, self.addr_count - 1);
                    action.push_str(&format!("-{last}"));
                }
            }
            IpVersion::V6 => {
                let bracket = self.port_count > 0;
                if bracket {
                    action.push('[');
                }
                action.push_str(&self.ipv6_start.to_string());
                if self.addr_count > 1 {
                    let last = v6_offset(self.ipv6_start, u128::from(self.addr_count - 1));
                    action.push_str(&format!("-{last}"));
                }
                if bracket {
                    action.push(']');
                }
            }
        }

        if self.port_count > 0 {
            action.push_str(&format!(":{}", self.port_start));
            if self.port_count > 1 {
                action.push_str(&format!("-{}", self.port_start + self.port_count - 1));
            }
        }

        if let Some(flags) = &self.flags {
            action.push_str(&format!(",{flags}"));
        }

        action
    }
}

/// The NAT router's interface MACs. Its client-side interface faces the
/// client network, the server-side interface the server network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatRouter {
    /// MAC of the client-facing router interface.
    pub client_mac: MacAddr,
    /// MAC of the server-facing router interface.
    pub server_mac: MacAddr,
}

/// One translated endpoint: its MAC and network addresses. Matching is on
/// the network address — port numbers are meaningless across hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatEndpoint {
    /// Endpoint MAC address.
    pub mac: MacAddr,
    /// Endpoint IPv4 address.
    pub ipv4: Ipv4Addr,
    /// Endpoint IPv6 address.
    pub ipv6: Ipv6Addr,
}

fn v4_offset(start: Ipv4Addr, offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(start) + offset)
}

fn v6_offset(start: Ipv6Addr, offset: u128) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(start) + offset)
}

/// MAC rewrite rule pair (v4 + v6) for one destination endpoint.
fn mac_rewrite_rules(endpoint: &NatEndpoint, router_src: MacAddr) -> [FlowRule; 2] {
    [
        FlowRule::new(TABLE_NAT_MAC, PRIO_NAT_MATCH)
            .match_on(Match::Proto(Proto::Ip))
            .match_on(Match::NwDst(endpoint.ipv4))
            .action(Action::SetField {
                value: SetValue::Mac(endpoint.mac),
                dst: FieldRef::whole(Field::EthDst),
            })
            .action(Action::SetField {
                value: SetValue::Mac(router_src),
                dst: FieldRef::whole(Field::EthSrc),
            }),
        FlowRule::new(TABLE_NAT_MAC, PRIO_NAT_MATCH)
            .match_on(Match::Proto(Proto::Ipv6))
            .match_on(Match::Ipv6Dst(endpoint.ipv6))
            .action(Action::SetField {
                value: SetValue::Mac(endpoint.mac),
                dst: FieldRef::whole(Field::EthDst),
            })
            .action(Action::SetField {
                value: SetValue::Mac(router_src),
                dst: FieldRef::whole(Field::EthSrc),
            }),
    ]
}

/// Compiles the NAT chain for one client port.
///
/// `client_port` is the switch port of the translated (client) interface;
/// `client` and `servers` provide the endpoint addresses for the MAC rewrite
/// sub-table.
pub fn generate_nat_flows(
    client_port: u16,
    client: &NatEndpoint,
    servers: &[NatEndpoint],
    router: &NatRouter,
    spec: &NatSpec,
) -> FabricResult<Vec<FlowRule>> {
    let mut flows = Vec::new();

    // Sub-table 0: everything IP goes through the tracker with NAT enabled;
    // anything else is dropped.
    for family in [Proto::Ip, Proto::Ipv6] {
        flows.push(
            FlowRule::new(TABLE_NAT, PRIO_NAT_MATCH)
                .match_on(Match::Proto(family))
                .action(Action::ConnTrack(CtArgs {
                    nat: Some(CtNat::Enable),
                    table: Some(TABLE_NAT_ALLOW),
                    ..Default::default()
                })),
        );
    }
    flows.push(FlowRule::new(TABLE_NAT, PRIO_NAT_DROP).action(Action::Drop));

    // Sub-table 1: admit new connections from the client port with the
    // translation applied. ALG-tracked protocols come first so their data
    // channels are pre-authorized as related connections.
    let v4_action = spec.nat_action(IpVersion::V4);
    let v6_action = spec.nat_action(IpVersion::V6);

    let base = |family: Proto| -> FlowRule {
        let rule = FlowRule::new(TABLE_NAT_ALLOW, PRIO_NAT_MATCH)
            .match_on(Match::InPort(client_port))
            .match_on(Match::CtState(CtState::set(&[CtFlag::New])))
            .match_on(Match::Proto(family));
        // DNAT only admits traffic addressed to the virtual IP.
        match (family, spec.vip_v4, spec.vip_v6) {
            (Proto::Ip, Some(vip), _) => rule.match_on(Match::NwDst(vip)),
            (Proto::Ipv6, _, Some(vip)) => rule.match_on(Match::Ipv6Dst(vip)),
            _ => rule,
        }
    };
    let commit = |nat: &str, alg: Option<CtAlg>| {
        Action::ConnTrack(CtArgs {
            commit: true,
            alg,
            nat: Some(CtNat::Rewrite(nat.to_string())),
            table: Some(TABLE_NAT_FORWARD),
            ..Default::default()
        })
    };

    // ALG exceptions: FTP control and TFTP.
    flows.push(
        base(Proto::Ip)
            .match_on(Match::Proto(Proto::Tcp))
            .match_on(Match::TpDst(FTP_CTRL_PORT))
            .action(commit(&v4_action, Some(CtAlg::Ftp))),
    );
    flows.push(
        base(Proto::Ip)
            .match_on(Match::Proto(Proto::Udp))
            .match_on(Match::TpDst(TFTP_PORT))
            .action(commit(&v4_action, Some(CtAlg::Tftp))),
    );
    flows.push(
        base(Proto::Ipv6)
            .match_on(Match::Proto(Proto::Tcp6))
            .match_on(Match::TpDst(FTP_CTRL_PORT))
            .action(commit(&v6_action, Some(CtAlg::Ftp))),
    );
    flows.push(
        base(Proto::Ipv6)
            .match_on(Match::Proto(Proto::Udp6))
            .match_on(Match::TpDst(TFTP_PORT))
            .action(commit(&v6_action, Some(CtAlg::Tftp))),
    );

    // Generic transport and ICMP commits.
    for proto in [Proto::Tcp, Proto::Udp, Proto::Icmp] {
        flows.push(base(Proto::Ip).match_on(Match::Proto(proto)).action(commit(&v4_action, None)));
    }
    for proto in [Proto::Tcp6, Proto::Udp6, Proto::Icmp6] {
        flows.push(base(Proto::Ipv6).match_on(Match::Proto(proto)).action(commit(&v6_action, None)));
    }

    // Related data channels inherit the control channel's translation.
    for proto in [Proto::Tcp, Proto::Tcp6, Proto::Udp, Proto::Udp6] {
        flows.push(
            FlowRule::new(TABLE_NAT_ALLOW, PRIO_NAT_MATCH)
                .match_on(Match::CtState(CtState::set(&[CtFlag::New, CtFlag::Rel])))
                .match_on(Match::Proto(proto))
                .action(Action::ConnTrack(CtArgs {
                    commit: true,
                    nat: Some(CtNat::Enable),
                    table: Some(TABLE_NAT_FORWARD),
                    ..Default::default()
                })),
        );
    }

    // Established and already-related connections skip re-committing.
    for state in [CtState::set(&[CtFlag::Est]), CtState::set(&[CtFlag::Rel])] {
        flows.push(
            FlowRule::new(TABLE_NAT_ALLOW, PRIO_NAT_MATCH)
                .match_on(Match::CtState(state))
                .action(Action::Resubmit(TABLE_NAT_FORWARD)),
        );
    }

    // Sub-table 2: MAC rewrite, then L2 matching.
    flows.push(
        FlowRule::new(TABLE_NAT_FORWARD, PRIO_NAT_MATCH)
            .action(Action::Resubmit(TABLE_NAT_MAC))
            .action(Action::GotoTable(TABLE_L2_MATCH)),
    );

    // Sub-table 3: the router's MAC rewrite per destination network address.
    flows.extend(mac_rewrite_rules(client, router.client_mac));
    for server in servers {
        flows.extend(mac_rewrite_rules(server, router.server_mac));
    }

    Ok(flows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snat_spec(addr_count: u32, port_count: u16) -> NatSpec {
        NatSpec {
            ipv4_start: Ipv4Addr::new(192, 200, 0, 100),
            ipv6_start: "2001:1000:1000:1000::c0c8:64".parse().unwrap(),
            addr_count,
            port_start: 10001,
            port_count,
            flags: None,
            vip_v4: None,
            vip_v6: None,
        }
    }

    #[test]
    fn test_nat_action_address_range_without_ports() {
        let spec = snat_spec(3, 0);
        assert_eq!(spec.nat_action(IpVersion::V4), "src=192.200.0.100-192.200.0.102");
    }

    #[test]
    fn test_nat_action_single_address_single_port() {
        let spec = snat_spec(1, 1);
        // A single port keeps the clause but omits the dash.
        assert_eq!(spec.nat_action(IpVersion::V4), "src=192.200.0.100:10001");
    }

    #[test]
    fn test_nat_action_port_range() {
        let spec = snat_spec(2, 100);
        assert_eq!(
            spec.nat_action(IpVersion::V4),
            "src=192.200.0.100-192.200.0.101:10001-10100"
        );
    }

    #[test]
    fn test_nat_action_ipv6_brackets_only_with_ports() {
        let without_ports = snat_spec(1, 0);
        assert_eq!(
            without_ports.nat_action(IpVersion::V6),
            "src=2001:1000:1000:1000::c0c8:64"
        );

        let with_ports = snat_spec(2, 1);
        assert_eq!(
            with_ports.nat_action(IpVersion::V6),
            "src=[2001:1000:1000:1000::c0c8:64-2001:1000:1000:1000::c0c8:65]:10001"
        );
    }

    #[test]
    fn test_nat_action_dnat_with_flags() {
        let mut spec = NatSpec::dnat(
            Ipv4Addr::new(192, 200, 0, 100),
            "2001:1000:1000:1000::c0c8:64".parse().unwrap(),
            1,
            Ipv4Addr::new(172, 10, 0, 1),
            "2001:1000:1000:1000::ac0a:1".parse().unwrap(),
        );
        spec.flags = Some("persistent".to_string());
        assert!(spec.is_dnat());
        assert_eq!(
            spec.nat_action(IpVersion::V4),
            "dst=192.200.0.100,persistent"
        );
    }

    fn endpoints() -> (NatEndpoint, NatEndpoint, NatRouter) {
        let client = NatEndpoint {
            mac: "00:00:00:01:01:01".parse().unwrap(),
            ipv4: Ipv4Addr::new(172, 10, 0, 100),
            ipv6: "2001:1000:1000:1000::ac0a:64".parse().unwrap(),
        };
        let server = NatEndpoint {
            mac: "00:00:00:02:01:01".parse().unwrap(),
            ipv4: Ipv4Addr::new(192, 200, 0, 100),
            ipv6: "2001:1000:1000:1000::c0c8:64".parse().unwrap(),
        };
        let router = NatRouter {
            client_mac: "80:88:88:88:88:88".parse().unwrap(),
            server_mac: "60:66:66:66:66:66".parse().unwrap(),
        };
        (client, server, router)
    }

    #[test]
    fn test_nat_chain_root_commits_ip_and_drops_rest() {
        let (client, server, router) = endpoints();
        let spec = snat_spec(1, 0);
        let flows = generate_nat_flows(10, &client, &[server], &router, &spec).unwrap();
        let wires: Vec<String> = flows.iter().map(FlowRule::wire).collect();

        assert_eq!(wires[0], "table=60,priority=10,ip,action=ct(nat,table=61)");
        assert_eq!(wires[1], "table=60,priority=10,ipv6,action=ct(nat,table=61)");
        assert_eq!(wires[2], "table=60,priority=0,action=drop");
    }

    #[test]
    fn test_nat_alg_rules_precede_generic_commits() {
        let (client, server, router) = endpoints();
        let spec = snat_spec(1, 0);
        let flows = generate_nat_flows(10, &client, &[server], &router, &spec).unwrap();
        let wires: Vec<String> = flows.iter().map(FlowRule::wire).collect();

        let ftp = wires.iter().position(|w| w.contains("alg=ftp")).unwrap();
        let tftp = wires.iter().position(|w| w.contains("alg=tftp")).unwrap();
        let generic = wires
            .iter()
            .position(|w| w.contains("ip,tcp,action=ct(commit,nat("))
            .unwrap();
        assert!(ftp < generic);
        assert!(tftp < generic);

        assert!(wires.contains(
            &"table=61,priority=10,in_port=10,ct_state=+new,ip,tcp,tp_dst=21,\
              action=ct(alg=ftp,commit,nat(src=192.200.0.100),table=62)"
                .to_string()
        ));
        assert!(wires.contains(
            &"table=61,priority=10,in_port=10,ct_state=+new,ip,udp,tp_dst=69,\
              action=ct(alg=tftp,commit,nat(src=192.200.0.100),table=62)"
                .to_string()
        ));
    }

    #[test]
    fn test_nat_related_and_established_paths() {
        let (client, server, router) = endpoints();
        let spec = snat_spec(1, 0);
        let flows = generate_nat_flows(10, &client, &[server], &router, &spec).unwrap();
        let wires: Vec<String> = flows.iter().map(FlowRule::wire).collect();

        assert!(wires.contains(
            &"table=61,priority=10,ct_state=+new+rel,tcp,action=ct(commit,nat,table=62)"
                .to_string()
        ));
        assert!(wires
            .contains(&"table=61,priority=10,ct_state=+est,action=resubmit(,62)".to_string()));
        assert!(wires
            .contains(&"table=61,priority=10,ct_state=+rel,action=resubmit(,62)".to_string()));
        assert!(wires.contains(
            &"table=62,priority=10,action=resubmit(,63),goto_table:70".to_string()
        ));
    }

    #[test]
    fn test_nat_mac_rewrite_per_destination() {
        let (client, server, router) = endpoints();
        let spec = snat_spec(1, 0);
        let flows = generate_nat_flows(10, &client, &[server], &router, &spec).unwrap();
        let wires: Vec<String> = flows.iter().map(FlowRule::wire).collect();

        // Client-directed traffic: source is the router's client-side MAC.
        assert!(wires.contains(
            &"table=63,priority=10,ip,nw_dst=172.10.0.100,\
              action=set_field:00:00:00:01:01:01->eth_dst,\
              set_field:80:88:88:88:88:88->eth_src"
                .to_string()
        ));
        // Server-directed traffic: source is the router's server-side MAC.
        assert!(wires.contains(
            &"table=63,priority=10,ipv6,ipv6_dst=2001:1000:1000:1000::c0c8:64,\
              action=set_field:00:00:00:02:01:01->eth_dst,\
              set_field:60:66:66:66:66:66->eth_src"
                .to_string()
        ));
    }

    #[test]
    fn test_dnat_matches_virtual_ip() {
        let (client, server, router) = endpoints();
        let spec = NatSpec::dnat(
            server.ipv4,
            server.ipv6,
            1,
            Ipv4Addr::new(172, 10, 0, 1),
            "2001:1000:1000:1000::ac0a:1".parse().unwrap(),
        );
        let flows = generate_nat_flows(10, &client, &[server], &router, &spec).unwrap();
        let wires: Vec<String> = flows.iter().map(FlowRule::wire).collect();

        assert!(wires.contains(
            &"table=61,priority=10,in_port=10,ct_state=+new,ip,nw_dst=172.10.0.1,tcp,\
              action=ct(commit,nat(dst=192.200.0.100),table=62)"
                .to_string()
        ));
    }
}
