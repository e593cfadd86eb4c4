//! INPUT/OUTPUT stage compilers and the default pipeline wiring.
//!
//! The INPUT stage resolves a packet's logical VNI into reg0 before the ACL
//! stage. The OUTPUT stage floods when no unicast FIB hit was recorded
//! (reg1=0) and delivers by reg1 otherwise. The default pipeline realizes a
//! learning bridge entirely as flow data: CORE installs learned
//! (VNI, source MAC) -> ingress port entries into FIB, and L2_MATCH replays
//! FIB to resolve reg1 before OUTPUT.

use fabric_common::{FabricError, FabricResult};

use crate::rule::{Action, Field, FieldRef, FlowRule, LearnField, LearnSpec, Match, SetValue};
use crate::tables::{
    PRIO_ACL_DROP, PRIO_DEFAULT, PRIO_FLOOD, PRIO_UNICAST_EXTERNAL, PRIO_UNICAST_TNL_MD,
    PRIO_UNICAST_VIF, TABLE_ACL, TABLE_ADMISS, TABLE_CORE, TABLE_FIB, TABLE_INPUT,
    TABLE_L2_MATCH, TABLE_NAT, TABLE_OUTPUT, TUN_METADATA1_PROBE,
};
use crate::topology::{Bridge, DeployMode, RemoteIp, Topology, TunnelPort, TunnelVni};

/// Egress action sequence for one tunnel port, ending with the output.
///
/// A per-flow remote address means the port is multiplexed towards every
/// remote endpoint; a per-flow VNI means the wire tunnel id is taken from
/// reg0. With tunnel metadata on, slot 0 carries the dynamic VNI and slot 1
/// the fixed probe value.
fn tunnel_egress_actions(topo: &Topology, port: &TunnelPort, metadata: bool) -> Vec<Action> {
    let mut actions = Vec::new();
    if port.remote_ip == RemoteIp::PerFlow {
        for remote in &topo.remote_teps {
            actions.push(Action::SetField {
                value: SetValue::Ipv4(*remote),
                dst: FieldRef::whole(Field::TunDst),
            });
        }
    }
    if port.vni == TunnelVni::PerFlow {
        actions.push(Action::Move {
            src: FieldRef::whole(Field::Reg0),
            dst: FieldRef::bits(Field::TunId, 0, 31),
        });
    }
    if metadata {
        actions.push(Action::Move {
            src: FieldRef::whole(Field::Reg0),
            dst: FieldRef::bits(Field::TunMetadata0, 0, 31),
        });
        actions.push(Action::SetField {
            value: SetValue::Hex(TUN_METADATA1_PROBE),
            dst: FieldRef::whole(Field::TunMetadata1),
        });
    }
    actions.push(Action::Output(port.port_no));
    actions
}

/// Tag push sequence towards an uplink. QinQ pushes the inner 0x8100 tag
/// first, then the outer 0x88a8 tag; inner comes from reg0[0..11], outer
/// from reg0[16..27].
fn uplink_encap_actions(mode: DeployMode) -> Vec<Action> {
    let mut actions = vec![
        Action::PushVlan(0x8100),
        Action::Move {
            src: FieldRef::bits(Field::Reg0, 0, 11),
            dst: FieldRef::bits(Field::VlanTci, 0, 11),
        },
        Action::Load {
            value: 1,
            dst: FieldRef::bit(Field::VlanTci, 12),
        },
    ];
    if mode == DeployMode::Qinq {
        actions.extend([
            Action::PushVlan(0x88a8),
            Action::Move {
                src: FieldRef::bits(Field::Reg0, 16, 27),
                dst: FieldRef::bits(Field::VlanTci, 0, 11),
            },
            Action::Load {
                value: 1,
                dst: FieldRef::bit(Field::VlanTci, 12),
            },
        ]);
    }
    actions
}

/// Compiles the INPUT table: populate reg0 with the packet's logical VNI,
/// then continue to ACL.
///
/// Native mode needs no per-port differentiation (there is exactly one
/// network): a single unconditional rule. The other modes load each local
/// interface's VNI as a literal — the VNI is a control-plane fact on those
/// ports — while trunk-facing ports resolve it from the wire (tunnel id or
/// 802.1Q tags).
pub fn generate_input_flows(bridge: &Bridge, mode: DeployMode) -> Vec<FlowRule> {
    let mut flows = Vec::new();

    if mode == DeployMode::Native {
        flows.push(
            FlowRule::new(TABLE_INPUT, PRIO_DEFAULT).action(Action::GotoTable(TABLE_ACL)),
        );
        return flows;
    }

    for vif in bridge.vifs() {
        let rule = FlowRule::new(TABLE_INPUT, PRIO_DEFAULT).match_on(Match::InPort(vif.port_no));
        let rule = if mode == DeployMode::Qinq {
            // Inner tag in reg0[0..11], outer tag (VNI + 100) in reg0[16..27].
            rule.action(Action::Load {
                value: u64::from(vif.vni.value()),
                dst: FieldRef::bits(Field::Reg0, 0, 11),
            })
            .action(Action::Load {
                value: u64::from(vif.vni.value() + 100),
                dst: FieldRef::bits(Field::Reg0, 16, 27),
            })
        } else {
            rule.action(Action::Load {
                value: u64::from(vif.vni.value()),
                dst: FieldRef::bits(Field::Reg0, 0, 31),
            })
        };
        flows.push(rule.action(Action::GotoTable(TABLE_ACL)));
    }

    match mode {
        DeployMode::Tunnel => {
            for port in bridge.tunnel_ports() {
                // The wire VNI is only readable with a move; a tunnel port
                // may multiplex several VNIs.
                flows.push(
                    FlowRule::new(TABLE_INPUT, PRIO_DEFAULT)
                        .match_on(Match::InPort(port.port_no))
                        .action(Action::Move {
                            src: FieldRef::bits(Field::TunId, 0, 31),
                            dst: FieldRef::bits(Field::Reg0, 0, 31),
                        })
                        .action(Action::GotoTable(TABLE_ACL)),
                );
            }
        }
        DeployMode::Vlan => {
            for uplink in bridge.uplinks() {
                flows.push(
                    FlowRule::new(TABLE_INPUT, PRIO_DEFAULT)
                        .match_on(Match::InPort(uplink.port_no))
                        .action(Action::Move {
                            src: FieldRef::bits(Field::VlanTci, 0, 11),
                            dst: FieldRef::bits(Field::Reg0, 0, 11),
                        })
                        .action(Action::PopVlan)
                        .action(Action::GotoTable(TABLE_ACL)),
                );
            }
        }
        DeployMode::Qinq => {
            for uplink in bridge.uplinks() {
                // Two sequential pops, outer tag resolved first into
                // reg0[16..27], then the inner tag into reg0[0..11].
                flows.push(
                    FlowRule::new(TABLE_INPUT, PRIO_DEFAULT)
                        .match_on(Match::InPort(uplink.port_no))
                        .action(Action::Move {
                            src: FieldRef::bits(Field::VlanTci, 0, 11),
                            dst: FieldRef::bits(Field::Reg0, 16, 27),
                        })
                        .action(Action::PopVlan)
                        .action(Action::Move {
                            src: FieldRef::bits(Field::VlanTci, 0, 11),
                            dst: FieldRef::bits(Field::Reg0, 0, 11),
                        })
                        .action(Action::PopVlan)
                        .action(Action::GotoTable(TABLE_ACL)),
                );
            }
        }
        DeployMode::Native => unreachable!("handled above"),
    }

    flows
}

/// Compiles the OUTPUT table for a deployment mode.
///
/// Flooding rules (priority 100) fire on the reg1=0 "no unicast hit"
/// sentinel, once per VNI per ingress port; unicast rules deliver by reg1 at
/// priorities 20 (external ports, with encapsulation), 15 (tunnel metadata
/// validation, which must run before generic delivery) and 10 (per-VIF
/// catch-all).
pub fn generate_output_flows(
    topo: &Topology,
    bridge: &Bridge,
    mode: DeployMode,
    tunnel_metadata: bool,
) -> FabricResult<Vec<FlowRule>> {
    let mut flows = Vec::new();

    for (vni, local_ports) in bridge.vni_index() {
        if local_ports.is_empty() {
            return Err(FabricError::invalid_config(
                format!("vni {vni}"),
                "no local interface on this VNI",
            ));
        }

        // Flooding out of each local port: all other local ports in stored
        // order first, then the external ports relevant to this VNI.
        for &ingress in local_ports {
            let mut actions: Vec<Action> = local_ports
                .iter()
                .filter(|&&p| p != ingress)
                .map(|&p| Action::Output(p))
                .collect();

            match mode {
                DeployMode::Tunnel => {
                    for port in bridge.tunnel_ports() {
                        if !port.vni.carries(*vni) {
                            continue;
                        }
                        actions.extend(tunnel_egress_actions(topo, port, tunnel_metadata));
                    }
                }
                DeployMode::Vlan | DeployMode::Qinq => {
                    // One push sequence serves every uplink.
                    actions.extend(uplink_encap_actions(mode));
                    actions.extend(bridge.uplinks().iter().map(|u| Action::Output(u.port_no)));
                }
                DeployMode::Native => {
                    actions.extend(bridge.uplinks().iter().map(|u| Action::Output(u.port_no)));
                }
            }

            if actions.is_empty() {
                // Sole port on its VNI with no external path: nothing to
                // flood to.
                actions.push(Action::Drop);
            }
            flows.push(
                FlowRule::new(TABLE_OUTPUT, PRIO_FLOOD)
                    .match_on(Match::InPort(ingress))
                    .match_on(Match::Reg {
                        field: FieldRef::whole(Field::Reg1),
                        value: 0,
                    })
                    .actions(actions),
            );
        }

        // Flooding in from external ports: deliver to every local port,
        // never back out an external port.
        let local_actions: Vec<Action> =
            local_ports.iter().map(|&p| Action::Output(p)).collect();

        match mode {
            DeployMode::Tunnel => {
                for port in bridge.tunnel_ports() {
                    let mut rule = FlowRule::new(TABLE_OUTPUT, PRIO_FLOOD)
                        .match_on(Match::InPort(port.port_no))
                        .match_on(Match::Reg {
                            field: FieldRef::whole(Field::Reg0),
                            value: u64::from(vni.value()),
                        })
                        .match_on(Match::Reg {
                            field: FieldRef::whole(Field::Reg1),
                            value: 0,
                        });
                    if tunnel_metadata {
                        rule = rule
                            .match_on(Match::TunMetadata0(u64::from(vni.value())))
                            .match_on(Match::TunMetadata1(TUN_METADATA1_PROBE));
                    }
                    flows.push(rule.actions(local_actions.iter().cloned()));
                }
            }
            DeployMode::Vlan | DeployMode::Qinq => {
                for uplink in bridge.uplinks() {
                    // Only the low 12 bits carry the (inner) tag.
                    flows.push(
                        FlowRule::new(TABLE_OUTPUT, PRIO_FLOOD)
                            .match_on(Match::InPort(uplink.port_no))
                            .match_on(Match::Reg {
                                field: FieldRef::bits(Field::Reg0, 0, 11),
                                value: u64::from(vni.value()),
                            })
                            .match_on(Match::Reg {
                                field: FieldRef::whole(Field::Reg1),
                                value: 0,
                            })
                            .actions(local_actions.iter().cloned()),
                    );
                }
            }
            DeployMode::Native => {
                for uplink in bridge.uplinks() {
                    flows.push(
                        FlowRule::new(TABLE_OUTPUT, PRIO_FLOOD)
                            .match_on(Match::InPort(uplink.port_no))
                            .match_on(Match::Reg {
                                field: FieldRef::whole(Field::Reg1),
                                value: 0,
                            })
                            .actions(local_actions.iter().cloned()),
                    );
                }
            }
        }
    }

    // Unicast towards external ports: reg1 already names the egress port,
    // the rule only adds the mode's encapsulation.
    match mode {
        DeployMode::Tunnel => {
            for port in bridge.tunnel_ports() {
                flows.push(
                    FlowRule::new(TABLE_OUTPUT, PRIO_UNICAST_EXTERNAL)
                        .match_on(Match::Reg {
                            field: FieldRef::whole(Field::Reg1),
                            value: u64::from(port.port_no),
                        })
                        .actions(tunnel_egress_actions(topo, port, tunnel_metadata)),
                );
            }
        }
        DeployMode::Vlan | DeployMode::Qinq => {
            for uplink in bridge.uplinks() {
                flows.push(
                    FlowRule::new(TABLE_OUTPUT, PRIO_UNICAST_EXTERNAL)
                        .match_on(Match::Reg {
                            field: FieldRef::whole(Field::Reg1),
                            value: u64::from(uplink.port_no),
                        })
                        .actions(uplink_encap_actions(mode))
                        .action(Action::Output(uplink.port_no)),
                );
            }
        }
        DeployMode::Native => {
            for uplink in bridge.uplinks() {
                flows.push(
                    FlowRule::new(TABLE_OUTPUT, PRIO_UNICAST_EXTERNAL)
                        .match_on(Match::Reg {
                            field: FieldRef::whole(Field::Reg1),
                            value: u64::from(uplink.port_no),
                        })
                        .action(Action::Output(uplink.port_no)),
                );
            }
        }
    }

    if tunnel_metadata {
        // Metadata correctness is checked per VNI before generic delivery;
        // there is no way to compare tun_metadata0 against reg0 directly.
        for port in bridge.tunnel_ports() {
            for vni in bridge.vni_index().keys() {
                flows.push(
                    FlowRule::new(TABLE_OUTPUT, PRIO_UNICAST_TNL_MD)
                        .match_on(Match::InPort(port.port_no))
                        .match_on(Match::TunMetadata0(u64::from(vni.value())))
                        .match_on(Match::TunMetadata1(TUN_METADATA1_PROBE))
                        .action(Action::OutputReg(FieldRef::whole(Field::Reg1))),
                );
            }
        }
    }

    // The lowest-priority, most general path: reg1 points straight at a
    // local interface.
    for vif in bridge.vifs() {
        flows.push(
            FlowRule::new(TABLE_OUTPUT, PRIO_UNICAST_VIF)
                .match_on(Match::Reg {
                    field: FieldRef::whole(Field::Reg1),
                    value: u64::from(vif.port_no),
                })
                .action(Action::Output(vif.port_no)),
        );
    }

    Ok(flows)
}

/// Compiles the default pipeline: ADMISS handing to INPUT, a native INPUT,
/// an ACL that admits everything, the CORE self-learning rule, a
/// pass-through NAT stage, the L2_MATCH FIB replay, and a native OUTPUT.
///
/// Overlay and NAT deployments rewrite the INPUT/OUTPUT and NAT tables on
/// top of this wiring; the ACL compiler rewrites the ACL table.
pub fn default_pipeline_flows(topo: &Topology, bridge: &Bridge) -> FabricResult<Vec<FlowRule>> {
    let mut flows = Vec::new();

    flows.push(
        FlowRule::new(TABLE_ADMISS, PRIO_DEFAULT).action(Action::GotoTable(TABLE_INPUT)),
    );

    flows.extend(generate_input_flows(bridge, DeployMode::Native));

    flows.push(FlowRule::new(TABLE_ACL, PRIO_ACL_DROP).action(Action::Drop));
    flows.push(FlowRule::new(TABLE_ACL, PRIO_DEFAULT).action(Action::GotoTable(TABLE_CORE)));

    // The learning-bridge core: record (VNI, source MAC) -> ingress port
    // into FIB on every packet, then continue towards delivery.
    flows.push(
        FlowRule::new(TABLE_CORE, PRIO_DEFAULT)
            .action(Action::Learn(LearnSpec {
                table: TABLE_FIB,
                fields: vec![
                    LearnField::MatchField(FieldRef::bits(Field::Reg0, 0, 31)),
                    LearnField::MatchFrom {
                        dst: FieldRef::whole(Field::EthDst),
                        src: FieldRef::whole(Field::EthSrc),
                    },
                    LearnField::LoadFrom {
                        src: FieldRef::whole(Field::InPort),
                        dst: FieldRef::bits(Field::Reg1, 0, 15),
                    },
                ],
            }))
            .action(Action::GotoTable(TABLE_NAT)),
    );

    flows.push(
        FlowRule::new(TABLE_NAT, PRIO_DEFAULT).action(Action::GotoTable(TABLE_L2_MATCH)),
    );

    // Resolve the destination MAC to reg1 via the learned FIB entries, then
    // deliver; both transfers go backwards/forwards by resubmission.
    flows.push(
        FlowRule::new(TABLE_L2_MATCH, PRIO_DEFAULT)
            .action(Action::Resubmit(TABLE_FIB))
            .action(Action::Resubmit(TABLE_OUTPUT)),
    );

    flows.extend(generate_output_flows(topo, bridge, DeployMode::Native, false)?);

    Ok(flows)
}
