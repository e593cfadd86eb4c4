//! Pipeline table numbering, port number ranges and rule priorities.
//!
//! Every compiler stage consumes this one fixed numbering scheme; the
//! tables are assumed to be exclusively owned by the fabric.

/// Pipeline table id type.
pub type TableId = u8;

/// Admission table, the pipeline entry point.
pub const TABLE_ADMISS: TableId = 0;

/// INPUT table: resolves the packet's logical VNI into reg0.
pub const TABLE_INPUT: TableId = 20;

/// ACL table: connection-tracking based admission per VNI zone.
pub const TABLE_ACL: TableId = 30;

/// CORE table: source-MAC self-learning into the FIB table.
pub const TABLE_CORE: TableId = 40;

/// FIB table: learned (VNI, destination MAC) -> egress port entries.
pub const TABLE_FIB: TableId = 50;

/// NAT table: root of the four-sub-table NAT chain (NAT..NAT+3).
pub const TABLE_NAT: TableId = 60;

/// L2 match table: FIB lookup then hand-off to OUTPUT.
pub const TABLE_L2_MATCH: TableId = 70;

/// OUTPUT table: flooding and unicast delivery.
pub const TABLE_OUTPUT: TableId = 80;

/// Port number of the bridge-local port.
pub const PORT_LOCAL: u16 = 0;

/// First port number handed to uplinks; the uplink pool is
/// [`PORT_UPLINK_BASE`, `PORT_VIF_BASE`).
pub const PORT_UPLINK_BASE: u16 = 1;

/// First port number handed to virtual interfaces; the VIF pool is
/// [`PORT_VIF_BASE`, `PORT_TUNNEL_BASE`).
pub const PORT_VIF_BASE: u16 = 10;

/// First port number handed to tunnel ports; the tunnel pool is
/// [`PORT_TUNNEL_BASE`, `PORT_TUNNEL_END`).
pub const PORT_TUNNEL_BASE: u16 = 100;

/// One past the last tunnel port number.
pub const PORT_TUNNEL_END: u16 = 200;

/// Priority of flooding rules in the OUTPUT table.
pub const PRIO_FLOOD: u16 = 100;

/// Priority of unicast rules towards external (tunnel/uplink) ports.
pub const PRIO_UNICAST_EXTERNAL: u16 = 20;

/// Priority of tunnel-metadata validation rules; must outrank the per-VIF
/// catch-all so the metadata check runs before generic delivery.
pub const PRIO_UNICAST_TNL_MD: u16 = 15;

/// Priority of the per-VIF unicast catch-all, the most general path.
pub const PRIO_UNICAST_VIF: u16 = 10;

/// Priority of ACL rules that bypass the protocol filter (ARP, IPv6 ND)
/// and of the originate-only drop guards.
pub const PRIO_ACL_BYPASS: u16 = 2000;

/// Priority of per-protocol connection tracking rules in the ACL table.
pub const PRIO_ACL_TRACK: u16 = 100;

/// Priority of the ACL default drop.
pub const PRIO_ACL_DROP: u16 = 1;

/// Priority of NAT chain match rules.
pub const PRIO_NAT_MATCH: u16 = 10;

/// Priority of the NAT chain default drop.
pub const PRIO_NAT_DROP: u16 = 0;

/// Priority of unconditional pipeline wiring rules.
pub const PRIO_DEFAULT: u16 = 100;

/// Fixed probe value written into tun_metadata1 on tunnel egress and
/// checked on ingress when tunnel metadata is enabled. tun_metadata0
/// carries the dynamic VNI.
pub const TUN_METADATA1_PROBE: u64 = 0x1234567890abcdef;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_strictly_ordered() {
        let order = [
            TABLE_ADMISS,
            TABLE_INPUT,
            TABLE_ACL,
            TABLE_CORE,
            TABLE_FIB,
            TABLE_NAT,
            TABLE_L2_MATCH,
            TABLE_OUTPUT,
        ];
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        // The NAT sub-tables must fit before L2_MATCH.
        assert!(TABLE_NAT + 3 < TABLE_L2_MATCH);
    }

    #[test]
    fn test_port_pools_disjoint() {
        assert!(PORT_LOCAL < PORT_UPLINK_BASE);
        assert!(PORT_UPLINK_BASE < PORT_VIF_BASE);
        assert!(PORT_VIF_BASE < PORT_TUNNEL_BASE);
        assert!(PORT_TUNNEL_BASE < PORT_TUNNEL_END);
    }

    #[test]
    fn test_unicast_priority_ladder() {
        assert!(PRIO_FLOOD > PRIO_UNICAST_EXTERNAL);
        assert!(PRIO_UNICAST_EXTERNAL > PRIO_UNICAST_TNL_MD);
        assert!(PRIO_UNICAST_TNL_MD > PRIO_UNICAST_VIF);
    }
}
