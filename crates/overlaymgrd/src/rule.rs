//! Flow rule model and wire serialization.
//!
//! A rule is a table id, a priority, a conjunction of match fields and an
//! ordered action list. Actions are typed variants; the textual wire
//! grammar (`table=..,priority=..,<match>..,action=..`) is produced only at
//! the provisioning boundary via `Display`, so no compiler stage ever
//! concatenates rule fragments by hand.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use fabric_common::{FabricError, FabricResult, MacAddr};

use crate::tables::TableId;

/// A packet header field or per-packet register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// reg0, the VNI/tag carrier.
    Reg0,
    /// reg1, the resolved egress port (0 = no unicast hit).
    Reg1,
    /// The wire tunnel id (VNI carried in-band).
    TunId,
    /// The 802.1Q tag control information.
    VlanTci,
    /// Tunnel metadata slot 0 (dynamic value).
    TunMetadata0,
    /// Tunnel metadata slot 1 (fixed probe value).
    TunMetadata1,
    /// Tunnel destination address.
    TunDst,
    /// Ethernet source address.
    EthSrc,
    /// Ethernet destination address.
    EthDst,
    /// Ingress port.
    InPort,
}

impl Field {
    /// Field name in the match/action wire grammar.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Field::Reg0 => "reg0",
            Field::Reg1 => "reg1",
            Field::TunId => "tun_id",
            Field::VlanTci => "vlan_tci",
            Field::TunMetadata0 => "tun_metadata0",
            Field::TunMetadata1 => "tun_metadata1",
            Field::TunDst => "tun_dst",
            Field::EthSrc => "eth_src",
            Field::EthDst => "eth_dst",
            Field::InPort => "in_port",
        }
    }

    /// Field name inside learn templates, which use the NXM register
    /// naming scheme.
    pub fn nxm_name(&self) -> &'static str {
        match self {
            Field::Reg0 => "NXM_NX_REG0",
            Field::Reg1 => "NXM_NX_REG1",
            Field::TunId => "NXM_NX_TUN_ID",
            Field::EthSrc => "NXM_OF_ETH_SRC",
            Field::EthDst => "NXM_OF_ETH_DST",
            Field::InPort => "NXM_OF_IN_PORT",
            // The remaining fields never appear in learn templates.
            Field::VlanTci => "NXM_OF_VLAN_TCI",
            Field::TunMetadata0 => "TUN_METADATA0",
            Field::TunMetadata1 => "TUN_METADATA1",
            Field::TunDst => "NXM_NX_TUN_IPV4_DST",
        }
    }
}

/// A field reference, optionally restricted to a bit range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef {
    /// The referenced field.
    pub field: Field,
    /// Inclusive bit range, low..high. `None` references the whole field.
    pub bits: Option<(u8, u8)>,
}

impl FieldRef {
    /// References a whole field.
    pub const fn whole(field: Field) -> Self {
        Self { field, bits: None }
    }

    /// References an inclusive bit range of a field.
    pub const fn bits(field: Field, low: u8, high: u8) -> Self {
        Self {
            field,
            bits: Some((low, high)),
        }
    }

    /// References a single bit of a field.
    pub const fn bit(field: Field, bit: u8) -> Self {
        Self {
            field,
            bits: Some((bit, bit)),
        }
    }

    fn fmt_bits(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bits {
            Some((low, high)) if low == high => write!(f, "[{low}]"),
            Some((low, high)) => write!(f, "[{low}..{high}]"),
            None => Ok(()),
        }
    }

    /// Renders the reference in NXM form for learn templates, where a
    /// whole-field reference is written with empty brackets.
    pub fn nxm(&self) -> String {
        match self.bits {
            Some((low, high)) if low == high => format!("{}[{low}]", self.field.nxm_name()),
            Some((low, high)) => format!("{}[{low}..{high}]", self.field.nxm_name()),
            None => format!("{}[]", self.field.nxm_name()),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.field.wire_name())?;
        self.fmt_bits(f)
    }
}

/// Protocol keyword in a match conjunction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Ip,
    Ipv6,
    Arp,
    Icmp,
    Icmp6,
    Tcp,
    Tcp6,
    Udp,
    Udp6,
}

impl Proto {
    /// The wire keyword.
    pub fn keyword(&self) -> &'static str {
        match self {
            Proto::Ip => "ip",
            Proto::Ipv6 => "ipv6",
            Proto::Arp => "arp",
            Proto::Icmp => "icmp",
            Proto::Icmp6 => "icmp6",
            Proto::Tcp => "tcp",
            Proto::Tcp6 => "tcp6",
            Proto::Udp => "udp",
            Proto::Udp6 => "udp6",
        }
    }
}

/// Connection tracking state flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtFlag {
    Trk,
    New,
    Est,
    Rel,
    Rpl,
    Inv,
}

impl CtFlag {
    fn keyword(&self) -> &'static str {
        match self {
            CtFlag::Trk => "trk",
            CtFlag::New => "new",
            CtFlag::Est => "est",
            CtFlag::Rel => "rel",
            CtFlag::Rpl => "rpl",
            CtFlag::Inv => "inv",
        }
    }
}

/// A conjunction of signed connection-tracking state bits,
/// e.g. `+trk+new` or `-trk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtState(Vec<(bool, CtFlag)>);

impl CtState {
    /// Matches untracked packets (`-trk`).
    pub fn untracked() -> Self {
        CtState(vec![(false, CtFlag::Trk)])
    }

    /// Matches tracked packets with the given additional set bits
    /// (`+trk+flag..`).
    pub fn tracked(flags: &[CtFlag]) -> Self {
        let mut bits = vec![(true, CtFlag::Trk)];
        bits.extend(flags.iter().map(|f| (true, *f)));
        CtState(bits)
    }

    /// Matches the given set bits without a tracking bit (`+flag..`).
    pub fn set(flags: &[CtFlag]) -> Self {
        CtState(flags.iter().map(|f| (true, *f)).collect())
    }
}

impl fmt::Display for CtState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (set, flag) in &self.0 {
            write!(f, "{}{}", if *set { '+' } else { '-' }, flag.keyword())?;
        }
        Ok(())
    }
}

/// One member of a rule's match conjunction.
#[derive(Debug, Clone, PartialEq)]
pub enum Match {
    /// Ingress port equality.
    InPort(u16),
    /// Register equality, optionally over a sub-range.
    Reg {
        /// The register (with optional bit range).
        field: FieldRef,
        /// Expected value.
        value: u64,
    },
    /// Protocol keyword.
    Proto(Proto),
    /// Connection tracking state bits.
    CtState(CtState),
    /// Connection tracking zone.
    CtZone(u32),
    /// ICMPv6 type (neighbor discovery filtering).
    IcmpType(u8),
    /// Later fragment of a fragmented packet.
    IpFragLater,
    /// Ethernet destination address.
    DlDst(MacAddr),
    /// IPv4 destination address.
    NwDst(Ipv4Addr),
    /// IPv6 destination address.
    Ipv6Dst(Ipv6Addr),
    /// L4 destination port.
    TpDst(u16),
    /// Tunnel metadata slot 0 value.
    TunMetadata0(u64),
    /// Tunnel metadata slot 1 value (rendered in hex).
    TunMetadata1(u64),
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Match::InPort(p) => write!(f, "in_port={p}"),
            Match::Reg { field, value } => write!(f, "{field}={value}"),
            Match::Proto(p) => write!(f, "{}", p.keyword()),
            Match::CtState(s) => write!(f, "ct_state={s}"),
            Match::CtZone(z) => write!(f, "ct_zone={z}"),
            Match::IcmpType(t) => write!(f, "icmp_type={t}"),
            Match::IpFragLater => write!(f, "ip_frag=later"),
            Match::DlDst(mac) => write!(f, "dl_dst={mac}"),
            Match::NwDst(ip) => write!(f, "nw_dst={ip}"),
            Match::Ipv6Dst(ip) => write!(f, "ipv6_dst={ip}"),
            Match::TpDst(p) => write!(f, "tp_dst={p}"),
            Match::TunMetadata0(v) => write!(f, "tun_metadata0={v}"),
            Match::TunMetadata1(v) => write!(f, "tun_metadata1=0x{v:x}"),
        }
    }
}

/// Value written by a set_field action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetValue {
    /// An IPv4 address (tunnel destination).
    Ipv4(Ipv4Addr),
    /// A MAC address (NAT MAC rewrite).
    Mac(MacAddr),
    /// A literal rendered in hex (tunnel metadata probe).
    Hex(u64),
}

impl fmt::Display for SetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetValue::Ipv4(ip) => write!(f, "{ip}"),
            SetValue::Mac(mac) => write!(f, "{mac}"),
            SetValue::Hex(v) => write!(f, "0x{v:x}"),
        }
    }
}

/// Connection tracking zone argument: either a literal zone id or a zone
/// taken from a field of the packet under processing.
#[derive(Debug, Clone, PartialEq)]
pub enum CtZoneSpec {
    /// Literal zone id.
    Literal(u32),
    /// Zone read from a packet register sub-range.
    Field(FieldRef),
}

impl fmt::Display for CtZoneSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtZoneSpec::Literal(z) => write!(f, "{z}"),
            CtZoneSpec::Field(r) => write!(f, "{r}"),
        }
    }
}

/// Application-level gateway selector for connection tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtAlg {
    Ftp,
    Tftp,
}

impl CtAlg {
    fn keyword(&self) -> &'static str {
        match self {
            CtAlg::Ftp => "ftp",
            CtAlg::Tftp => "tftp",
        }
    }
}

/// NAT argument of a ct action.
#[derive(Debug, Clone, PartialEq)]
pub enum CtNat {
    /// Bare `nat`: apply existing or inherited translation.
    Enable,
    /// `nat(<spec>)`: install the given address/port rewrite.
    Rewrite(String),
}

/// Arguments of a ct action. Sub-options serialize in one canonical order
/// (alg, commit, zone, nat, table); the grammar is order-insensitive.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CtArgs {
    /// Commit the connection to the tracker.
    pub commit: bool,
    /// Tracking zone.
    pub zone: Option<CtZoneSpec>,
    /// Application-level gateway.
    pub alg: Option<CtAlg>,
    /// NAT behavior.
    pub nat: Option<CtNat>,
    /// Table the packet continues in after tracking.
    pub table: Option<TableId>,
}

impl fmt::Display for CtArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if first {
                first = false;
                Ok(())
            } else {
                write!(f, ",")
            }
        };
        if let Some(alg) = self.alg {
            sep(f)?;
            write!(f, "alg={}", alg.keyword())?;
        }
        if self.commit {
            sep(f)?;
            write!(f, "commit")?;
        }
        if let Some(zone) = &self.zone {
            sep(f)?;
            write!(f, "zone={zone}")?;
        }
        match &self.nat {
            Some(CtNat::Enable) => {
                sep(f)?;
                write!(f, "nat")?;
            }
            Some(CtNat::Rewrite(spec)) => {
                sep(f)?;
                write!(f, "nat({spec})")?;
            }
            None => {}
        }
        if let Some(table) = self.table {
            sep(f)?;
            write!(f, "table={table}")?;
        }
        Ok(())
    }
}

/// One member of a learn action's field-copy template.
#[derive(Debug, Clone, PartialEq)]
pub enum LearnField {
    /// Learned rule matches the same field value as the current packet.
    MatchField(FieldRef),
    /// Learned rule matches `dst` against the current packet's `src`.
    MatchFrom {
        /// Match field of the learned rule.
        dst: FieldRef,
        /// Source field of the current packet.
        src: FieldRef,
    },
    /// Learned rule loads the current packet's `src` into `dst`.
    LoadFrom {
        /// Source field of the current packet.
        src: FieldRef,
        /// Destination register of the learned rule.
        dst: FieldRef,
    },
}

impl fmt::Display for LearnField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LearnField::MatchField(r) => write!(f, "{}", r.nxm()),
            LearnField::MatchFrom { dst, src } => write!(f, "{}={}", dst.nxm(), src.nxm()),
            LearnField::LoadFrom { src, dst } => write!(f, "load:{}->{}", src.nxm(), dst.nxm()),
        }
    }
}

/// A learn action: installs a rule derived from the current packet into a
/// target table.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnSpec {
    /// Table receiving the learned rule.
    pub table: TableId,
    /// Field-copy template, in order.
    pub fields: Vec<LearnField>,
}

impl fmt::Display for LearnSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table={}", self.table)?;
        for field in &self.fields {
            write!(f, ",{field}")?;
        }
        Ok(())
    }
}

/// One action of a rule's ordered action list.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Writes a literal value into a field.
    SetField {
        /// The value written.
        value: SetValue,
        /// Destination field.
        dst: FieldRef,
    },
    /// Copies a field (or sub-range) into another.
    Move {
        /// Source field.
        src: FieldRef,
        /// Destination field.
        dst: FieldRef,
    },
    /// Loads a literal into a register (sub-range).
    Load {
        /// The literal value.
        value: u64,
        /// Destination register.
        dst: FieldRef,
    },
    /// Pushes an 802.1Q tag with the given TPID.
    PushVlan(u16),
    /// Pops the outermost 802.1Q tag.
    PopVlan,
    /// Transfers processing to a strictly later table.
    GotoTable(TableId),
    /// Re-enters the pipeline at the given table; the only transfer allowed
    /// to target an earlier or same-numbered table.
    Resubmit(TableId),
    /// Delivers the packet out of a port.
    Output(u16),
    /// Delivers the packet out of the port named by a register.
    OutputReg(FieldRef),
    /// Sends the packet through connection tracking.
    ConnTrack(CtArgs),
    /// Installs a derived rule into another table.
    Learn(LearnSpec),
    /// Drops the packet.
    Drop,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::SetField { value, dst } => write!(f, "set_field:{value}->{dst}"),
            Action::Move { src, dst } => write!(f, "move:{src}->{dst}"),
            Action::Load { value, dst } => write!(f, "load:{value}->{dst}"),
            Action::PushVlan(tpid) => write!(f, "push_vlan:0x{tpid:04x}"),
            Action::PopVlan => write!(f, "pop_vlan"),
            Action::GotoTable(t) => write!(f, "goto_table:{t}"),
            Action::Resubmit(t) => write!(f, "resubmit(,{t})"),
            Action::Output(p) => write!(f, "output:{p}"),
            Action::OutputReg(r) => write!(f, "output:{r}"),
            Action::ConnTrack(args) => write!(f, "ct({args})"),
            Action::Learn(spec) => write!(f, "learn({spec})"),
            Action::Drop => write!(f, "drop"),
        }
    }
}

/// A single flow rule.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRule {
    /// Pipeline table the rule lives in.
    pub table: TableId,
    /// Priority; higher wins. Ties do not occur by construction.
    pub priority: u16,
    /// Match conjunction, serialized in insertion order.
    pub matches: Vec<Match>,
    /// Ordered action list.
    pub actions: Vec<Action>,
}

impl FlowRule {
    /// Creates an empty rule for a table at a priority.
    pub fn new(table: TableId, priority: u16) -> Self {
        Self {
            table,
            priority,
            matches: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Appends a match member (builder pattern).
    pub fn match_on(mut self, m: Match) -> Self {
        self.matches.push(m);
        self
    }

    /// Appends one action (builder pattern).
    pub fn action(mut self, a: Action) -> Self {
        self.actions.push(a);
        self
    }

    /// Appends a sequence of actions (builder pattern).
    pub fn actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.actions.extend(actions);
        self
    }

    /// Checks the table-transfer invariant: goto_table must target a
    /// strictly later table; resubmit is exempt.
    pub fn validate(&self) -> FabricResult<()> {
        if self.actions.is_empty() {
            return Err(FabricError::invalid_config(
                format!("table {} rule", self.table),
                "empty action list",
            ));
        }
        for action in &self.actions {
            if let Action::GotoTable(target) = action {
                if *target <= self.table {
                    return Err(FabricError::invalid_config(
                        format!("table {} rule", self.table),
                        format!("goto_table:{target} does not move forward"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Serializes the rule to its wire string.
    pub fn wire(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FlowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table={},priority={}", self.table, self.priority)?;
        for m in &self.matches {
            write!(f, ",{m}")?;
        }
        write!(f, ",action=")?;
        for (i, a) in self.actions.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{a}")?;
        }
        Ok(())
    }
}
