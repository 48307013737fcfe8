// ============================================================================
// CORE TYPE SYSTEM
// ============================================================================
// The network vocabulary every other module speaks: nodes, ports, links,
// flow matches, probe bit patterns and the correlation keys built from them.
// All of these are immutable values and cheap to clone.
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// ----------------------------------------------------------------------------
// Timestamps
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Get the current timestamp with nanosecond precision
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    /// Calculate duration between two timestamps (zero if `earlier` is later)
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as i64))
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

// ----------------------------------------------------------------------------
// Nodes, Ports & Links
// ----------------------------------------------------------------------------

/// Datapath identifier of a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse::<u64>(),
        };
        parsed
            .map(NodeId)
            .map_err(|e| ValidationError::parse("node id", s, e.to_string()))
    }
}

/// OpenFlow port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub u32);

impl Display for PortId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PortId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(PortId)
            .map_err(|e| ValidationError::parse("port", s, e.to_string()))
    }
}

/// A switch port, written `node[port]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodePort {
    pub node: NodeId,
    pub port: PortId,
}

impl NodePort {
    pub const fn new(node: u64, port: u32) -> Self {
        Self {
            node: NodeId(node),
            port: PortId(port),
        }
    }
}

impl Display for NodePort {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.node, self.port)
    }
}

impl FromStr for NodePort {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (node, rest) = s
            .split_once('[')
            .ok_or_else(|| ValidationError::parse("node-port", s, "expected node[port]"))?;
        let port = rest
            .strip_suffix(']')
            .ok_or_else(|| ValidationError::parse("node-port", s, "missing closing ']'"))?;
        Ok(Self {
            node: node.parse()?,
            port: port.parse()?,
        })
    }
}

/// Which end of a link an endpoint sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointSide {
    Source,
    Destination,
}

impl Display for EndpointSide {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EndpointSide::Source => write!(f, "source"),
            EndpointSide::Destination => write!(f, "destination"),
        }
    }
}

/// A unidirectional link between two switch ports, written `1[2]>3[4]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatapathLink {
    pub src: NodePort,
    pub dest: NodePort,
}

impl DatapathLink {
    pub const fn new(src: NodePort, dest: NodePort) -> Self {
        Self { src, dest }
    }

    pub fn src_node(&self) -> NodeId {
        self.src.node
    }

    pub fn dest_node(&self) -> NodeId {
        self.dest.node
    }

    pub fn has_node(&self, node: NodeId) -> bool {
        self.src.node == node || self.dest.node == node
    }

    pub fn endpoint(&self, side: EndpointSide) -> NodePort {
        match side {
            EndpointSide::Source => self.src,
            EndpointSide::Destination => self.dest,
        }
    }

    pub fn reversed(&self) -> Self {
        Self {
            src: self.dest,
            dest: self.src,
        }
    }
}

impl Display for DatapathLink {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}>{}", self.src, self.dest)
    }
}

impl FromStr for DatapathLink {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (src, dest) = s
            .split_once('>')
            .ok_or_else(|| ValidationError::parse("link", s.trim(), "expected src>dest"))?;
        let link = Self {
            src: src.parse()?,
            dest: dest.parse()?,
        };
        if link.src.node == link.dest.node {
            return Err(ValidationError::parse(
                "link",
                s.trim(),
                "source and destination must be different nodes",
            ));
        }
        Ok(link)
    }
}

// ----------------------------------------------------------------------------
// Flow Matches
// ----------------------------------------------------------------------------

/// Header fields a flow may constrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    InPort,
    EthType,
    EthSrc,
    EthDst,
    VlanVid,
    IpProto,
    Ipv4Src,
    Ipv4Dst,
    TcpSrc,
    TcpDst,
    UdpSrc,
    UdpDst,
    Metadata,
    NxReg0,
}

impl MatchField {
    pub const ALL: [MatchField; 14] = [
        MatchField::InPort,
        MatchField::EthType,
        MatchField::EthSrc,
        MatchField::EthDst,
        MatchField::VlanVid,
        MatchField::IpProto,
        MatchField::Ipv4Src,
        MatchField::Ipv4Dst,
        MatchField::TcpSrc,
        MatchField::TcpDst,
        MatchField::UdpSrc,
        MatchField::UdpDst,
        MatchField::Metadata,
        MatchField::NxReg0,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchField::InPort => "in_port",
            MatchField::EthType => "eth_type",
            MatchField::EthSrc => "eth_src",
            MatchField::EthDst => "eth_dst",
            MatchField::VlanVid => "vlan_vid",
            MatchField::IpProto => "ip_proto",
            MatchField::Ipv4Src => "ipv4_src",
            MatchField::Ipv4Dst => "ipv4_dst",
            MatchField::TcpSrc => "tcp_src",
            MatchField::TcpDst => "tcp_dst",
            MatchField::UdpSrc => "udp_src",
            MatchField::UdpDst => "udp_dst",
            MatchField::Metadata => "metadata",
            MatchField::NxReg0 => "nx_reg0",
        }
    }
}

impl Display for MatchField {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchField {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        MatchField::ALL
            .iter()
            .copied()
            .find(|field| field.as_str() == name)
            .ok_or_else(|| ValidationError::parse("match field", s.trim(), "unknown field"))
    }
}

/// An Ethernet address, written `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl Display for MacAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl FromStr for MacAddr {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut octets = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| ValidationError::parse("mac address", s, "expected six octets"))?;
            if part.len() != 2 {
                return Err(ValidationError::parse("mac address", s, "octets are two hex digits"));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|e| ValidationError::parse("mac address", s, e.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ValidationError::parse("mac address", s, "expected six octets"));
        }
        Ok(Self(octets))
    }
}

/// A typed match value. Which variant a field takes is fixed by
/// [`MatchField::parse_value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchValue {
    Number(u64),
    Ipv4(Ipv4Addr),
    Mac(MacAddr),
}

impl MatchValue {
    pub fn as_number(&self) -> Option<u64> {
        match self {
            MatchValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// Decimal, or hexadecimal with a `0x` prefix.
fn parse_number(input: &str) -> Result<u64, std::num::ParseIntError> {
    match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => input.parse::<u64>(),
    }
}

impl MatchField {
    /// Largest value a numeric field can hold.
    fn max_value(&self) -> Option<u64> {
        match self {
            MatchField::InPort | MatchField::NxReg0 => Some(u64::from(u32::MAX)),
            MatchField::EthType
            | MatchField::TcpSrc
            | MatchField::TcpDst
            | MatchField::UdpSrc
            | MatchField::UdpDst => Some(u64::from(u16::MAX)),
            // 12-bit VID plus the OFPVID_PRESENT bit
            MatchField::VlanVid => Some(0x1fff),
            MatchField::IpProto => Some(u64::from(u8::MAX)),
            MatchField::Metadata => Some(u64::MAX),
            MatchField::EthSrc | MatchField::EthDst | MatchField::Ipv4Src | MatchField::Ipv4Dst => None,
        }
    }

    /// Parse a value for this field, rejecting anything of the wrong shape
    /// or outside the field's width.
    pub fn parse_value(&self, input: &str) -> Result<MatchValue, ValidationError> {
        let input = input.trim();
        let reject = |reason: String| ValidationError::parse("match value", format!("{}={}", self, input), reason);
        match self {
            MatchField::EthSrc | MatchField::EthDst => input
                .parse::<MacAddr>()
                .map(MatchValue::Mac)
                .map_err(|e| reject(e.to_string())),
            MatchField::Ipv4Src | MatchField::Ipv4Dst => input
                .parse::<Ipv4Addr>()
                .map(MatchValue::Ipv4)
                .map_err(|e| reject(e.to_string())),
            _ => {
                let n = parse_number(input).map_err(|e| reject(e.to_string()))?;
                self.check_number(n).map_err(reject)
            }
        }
    }

    fn check_number(&self, n: u64) -> Result<MatchValue, String> {
        match self.max_value() {
            Some(max) if n <= max => Ok(MatchValue::Number(n)),
            Some(max) => Err(format!("{} exceeds the maximum {:#x}", n, max)),
            None => Err(format!("{} does not take a number", self)),
        }
    }

    fn render(&self, value: &MatchValue, f: &mut Formatter<'_>) -> fmt::Result {
        match (self, value) {
            (MatchField::EthType, MatchValue::Number(n)) => write!(f, "{:#06x}", n),
            (MatchField::Metadata | MatchField::NxReg0, MatchValue::Number(n)) => write!(f, "{:#x}", n),
            (_, MatchValue::Number(n)) => write!(f, "{}", n),
            (_, MatchValue::Ipv4(addr)) => write!(f, "{}", addr),
            (_, MatchValue::Mac(mac)) => write!(f, "{}", mac),
        }
    }
}

/// A packet-matching pattern: a set of exact field constraints.
/// The empty flow matches every packet and is written `any`.
///
/// Values are typed, so `eth_type=0x800` and `eth_type=2048` are the same
/// flow and render the same way.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Flow {
    fields: BTreeMap<MatchField, MatchValue>,
}

impl Flow {
    pub fn any() -> Self {
        Self::default()
    }

    /// The flow of every frame with the given EtherType.
    pub fn eth_type(eth_type: u16) -> Self {
        let mut flow = Self::any();
        flow.fields
            .insert(MatchField::EthType, MatchValue::Number(u64::from(eth_type)));
        flow
    }

    /// Builder-style constraint, parsed and checked against the field.
    pub fn with(mut self, field: MatchField, value: &str) -> Result<Self, ValidationError> {
        let value = field.parse_value(value)?;
        self.fields.insert(field, value);
        Ok(self)
    }

    pub fn get(&self, field: MatchField) -> Option<&MatchValue> {
        self.fields.get(&field)
    }

    pub fn constrains(&self, field: MatchField) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn is_any(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (MatchField, &MatchValue)> {
        self.fields.iter().map(|(k, v)| (*k, v))
    }

    /// True if every packet matched by `other` is also matched by `self`,
    /// i.e. each constraint of `self` appears identically in `other`.
    pub fn contains(&self, other: &Flow) -> bool {
        self.fields
            .iter()
            .all(|(field, value)| other.fields.get(field) == Some(value))
    }
}

impl Display for Flow {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() {
            return f.write_str("any");
        }
        let mut first = true;
        for (field, value) in &self.fields {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}=", field)?;
            field.render(value, f)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Flow {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "any" || s == "*" {
            return Ok(Flow::any());
        }

        let mut flow = Flow::any();
        for entry in s.split(',') {
            let (field, value) = entry
                .split_once('=')
                .ok_or_else(|| ValidationError::parse("flow", s, format!("'{}' is not field=value", entry.trim())))?;
            let field: MatchField = field.parse()?;
            let value = value.trim();
            if value.is_empty() {
                return Err(ValidationError::parse("flow", s, format!("empty value for {}", field)));
            }
            if flow.constrains(field) {
                return Err(ValidationError::parse("flow", s, format!("{} given twice", field)));
            }
            flow = flow.with(field, value)?;
        }
        Ok(flow)
    }
}

impl TryFrom<String> for Flow {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Flow> for String {
    fn from(flow: Flow) -> Self {
        flow.to_string()
    }
}

/// A link restricted to the packets of one flow, written `1[2]>3[4]@flow`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowedLink {
    pub link: DatapathLink,
    pub flow: Flow,
}

impl FlowedLink {
    pub fn new(link: DatapathLink, flow: Flow) -> Self {
        Self { link, flow }
    }

    pub fn unflowed(&self) -> &DatapathLink {
        &self.link
    }
}

impl Display for FlowedLink {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.link, self.flow)
    }
}

impl FromStr for FlowedLink {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((link, flow)) => Ok(Self::new(link.parse()?, flow.parse()?)),
            None => Ok(Self::new(s.parse()?, Flow::any())),
        }
    }
}

/// A bit pattern identifying secure probe packets, written `value/mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BitMatch {
    pub value: u64,
    pub mask: u64,
}

impl BitMatch {
    /// Bits of `value` outside `mask` are cleared.
    pub const fn new(value: u64, mask: u64) -> Self {
        Self {
            value: value & mask,
            mask,
        }
    }

    pub fn matches(&self, bits: u64) -> bool {
        bits & self.mask == self.value
    }

    /// A random full-width pattern, used to tag the probes of one round.
    pub fn random() -> Self {
        Self::new(fastrand::u64(..), u64::MAX)
    }
}

impl Display for BitMatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}", self.value, self.mask)
    }
}

impl FromStr for BitMatch {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse_u64 = |part: &str| {
            let part = part.trim();
            match part.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => part.parse::<u64>(),
            }
            .map_err(|e| ValidationError::parse("bit match", s, e.to_string()))
        };
        let (value, mask) = match s.split_once('/') {
            Some((value, mask)) => (parse_u64(value)?, parse_u64(mask)?),
            None => (parse_u64(s)?, u64::MAX),
        };
        if value & !mask != 0 {
            return Err(ValidationError::parse("bit match", s, "value has bits outside the mask"));
        }
        Ok(Self::new(value, mask))
    }
}

// ----------------------------------------------------------------------------
// Measurement Requests & Correlation Keys
// ----------------------------------------------------------------------------

/// Identifier announced by a collector agent when it connects.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectorId(pub String);

impl CollectorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Display for CollectorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Passive sampling or active probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Sampling,
    Probing,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Sampling => "sampling",
            RequestKind::Probing => "probing",
        }
    }
}

impl Display for RequestKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a measurement request is about.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementTarget {
    /// A link together with the flow whose packets are sampled.
    Flowed(FlowedLink),
    /// A link probed with packets carrying a bit pattern.
    Probe { link: DatapathLink, bit_match: BitMatch },
}

impl MeasurementTarget {
    pub fn link(&self) -> &DatapathLink {
        match self {
            MeasurementTarget::Flowed(flowed) => &flowed.link,
            MeasurementTarget::Probe { link, .. } => link,
        }
    }

    pub fn has_node(&self, node: NodeId) -> bool {
        self.link().has_node(node)
    }

    /// The endpoint a collector reports from for the given side.
    pub fn endpoint(&self, side: EndpointSide) -> MeasurementEndpoint {
        match self {
            MeasurementTarget::Flowed(flowed) => MeasurementEndpoint::Flowed {
                port: flowed.link.endpoint(side),
                side,
                flow: flowed.flow.clone(),
            },
            MeasurementTarget::Probe { link, bit_match } => MeasurementEndpoint::Probe {
                port: link.endpoint(side),
                side,
                bit_match: *bit_match,
            },
        }
    }
}

impl Display for MeasurementTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementTarget::Flowed(flowed) => write!(f, "flowed-link {}", flowed),
            MeasurementTarget::Probe { link, bit_match } => {
                write!(f, "link {} (bit match {})", link, bit_match)
            }
        }
    }
}

/// Uniqueness key among outstanding requests.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub target: MeasurementTarget,
    pub kind: RequestKind,
}

impl CorrelationKey {
    pub fn new(target: MeasurementTarget, kind: RequestKind) -> Self {
        Self { target, kind }
    }

    pub fn sampling(flowed: FlowedLink) -> Self {
        Self::new(MeasurementTarget::Flowed(flowed), RequestKind::Sampling)
    }

    pub fn probing(bit_match: BitMatch, link: DatapathLink) -> Self {
        Self::new(MeasurementTarget::Probe { link, bit_match }, RequestKind::Probing)
    }
}

impl Display for CorrelationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.target, self.kind)
    }
}

/// One side of a measurement, as identified by the collector replying for it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementEndpoint {
    Flowed {
        port: NodePort,
        side: EndpointSide,
        flow: Flow,
    },
    Probe {
        port: NodePort,
        side: EndpointSide,
        bit_match: BitMatch,
    },
}

impl MeasurementEndpoint {
    pub fn side(&self) -> EndpointSide {
        match self {
            MeasurementEndpoint::Flowed { side, .. } | MeasurementEndpoint::Probe { side, .. } => *side,
        }
    }

    pub fn port(&self) -> NodePort {
        match self {
            MeasurementEndpoint::Flowed { port, .. } | MeasurementEndpoint::Probe { port, .. } => *port,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            MeasurementEndpoint::Flowed { .. } => RequestKind::Sampling,
            MeasurementEndpoint::Probe { .. } => RequestKind::Probing,
        }
    }
}

impl Display for MeasurementEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementEndpoint::Flowed { port, side, flow } => write!(f, "{} ({}) @{}", port, side, flow),
            MeasurementEndpoint::Probe { port, side, bit_match } => {
                write!(f, "{} ({}) ~{}", port, side, bit_match)
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("1[2]>3[4]", NodePort::new(1, 2), NodePort::new(3, 4))]
    #[case(" 0x1a[7] > 0x1b[8] ", NodePort::new(26, 7), NodePort::new(27, 8))]
    fn test_link_parsing(#[case] input: &str, #[case] src: NodePort, #[case] dest: NodePort) {
        let link: DatapathLink = input.parse().unwrap();
        assert_eq!(link, DatapathLink::new(src, dest));
    }

    #[rstest]
    #[case("1[2]")]
    #[case("1[2]>1[3]")]
    #[case("1(2)>3[4]")]
    #[case("a[2]>3[4]")]
    fn test_link_parsing_rejects(#[case] input: &str) {
        assert!(input.parse::<DatapathLink>().is_err());
    }

    #[test]
    fn test_flow_round_trips_through_text() {
        let flow: Flow = "ipv4_dst=10.0.0.2, eth_type=0x0800".parse().unwrap();
        assert_eq!(flow.to_string(), "eth_type=0x0800,ipv4_dst=10.0.0.2");
        assert_eq!(
            flow.get(MatchField::Ipv4Dst),
            Some(&MatchValue::Ipv4(Ipv4Addr::new(10, 0, 0, 2)))
        );
        assert_eq!("any".parse::<Flow>().unwrap(), Flow::any());
    }

    #[rstest]
    #[case("eth_type")]
    #[case("eth_type=")]
    #[case("bogus=1")]
    #[case("eth_type=1,eth_type=2")]
    #[case("eth_type=banana")]
    #[case("eth_type=0x10000")]
    #[case("ipv4_dst=not-an-ip")]
    #[case("ipv4_src=10.0.0.256")]
    #[case("eth_src=aa:bb:cc:dd:ee")]
    #[case("eth_dst=aa:bb:cc:dd:ee:zz")]
    #[case("ip_proto=256")]
    #[case("tcp_dst=-1")]
    #[case("vlan_vid=0x2000")]
    #[case("in_port=4294967296")]
    fn test_flow_parsing_rejects(#[case] input: &str) {
        assert!(input.parse::<Flow>().is_err());
    }

    #[rstest]
    #[case("eth_type=0x0800", "eth_type=0x800")]
    #[case("eth_type=0x0800", "eth_type=2048")]
    #[case("eth_type=0x88b5", "eth_type=34997")]
    #[case("eth_src=AA:BB:CC:DD:EE:FF", "eth_src=aa-bb-cc-dd-ee-ff")]
    #[case("tcp_dst=80", "tcp_dst=0x50")]
    #[case("metadata=0x10", "metadata=16")]
    fn test_equivalent_spellings_are_one_flow(#[case] a: &str, #[case] b: &str) {
        let a: Flow = a.parse().unwrap();
        let b: Flow = b.parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_flow_renders_canonical_values() {
        let flow: Flow = "eth_src=AA-BB-CC-DD-EE-01, eth_type=2048, ip_proto=0x6, metadata=255"
            .parse()
            .unwrap();
        assert_eq!(
            flow.to_string(),
            "eth_type=0x0800,eth_src=aa:bb:cc:dd:ee:01,ip_proto=6,metadata=0xff"
        );
        assert_eq!(flow.get(MatchField::IpProto).and_then(MatchValue::as_number), Some(6));
        assert_eq!(Flow::eth_type(0x88b5).to_string(), "eth_type=0x88b5");
    }

    #[test]
    fn test_flow_serializes_as_text() {
        let flow: Flow = "ipv4_dst=10.0.0.2,eth_type=0x800".parse().unwrap();
        let json = serde_json::to_string(&flow).unwrap();
        assert_eq!(json, r#""eth_type=0x0800,ipv4_dst=10.0.0.2""#);
        assert_eq!(serde_json::from_str::<Flow>(&json).unwrap(), flow);
        assert!(serde_json::from_str::<Flow>(r#""eth_type=banana""#).is_err());
    }

    #[test]
    fn test_flow_containment() {
        let base = Flow::eth_type(0x88b5);
        let narrower = base.clone().with(MatchField::Ipv4Dst, "10.0.0.1").unwrap();
        let other = Flow::eth_type(0x0800);

        assert!(base.contains(&narrower));
        assert!(!narrower.contains(&base));
        assert!(!base.contains(&other));
        assert!(Flow::any().contains(&other));
    }

    #[test]
    fn test_flowed_link_parsing() {
        let flowed: FlowedLink = "1[1]>2[1]@eth_type=0x0800".parse().unwrap();
        assert_eq!(flowed.link, DatapathLink::new(NodePort::new(1, 1), NodePort::new(2, 1)));
        assert_eq!(flowed.to_string(), "1[1]>2[1]@eth_type=0x0800");

        let unflowed: FlowedLink = "1[1]>2[1]".parse().unwrap();
        assert!(unflowed.flow.is_any());
    }

    #[test]
    fn test_bit_match_parsing() {
        let bm: BitMatch = "0xff/0xffff".parse().unwrap();
        assert_eq!(bm, BitMatch::new(0xff, 0xffff));
        assert!(bm.matches(0x12ff));
        assert!(!bm.matches(0x12fe));
        assert!("0xff/0x0f".parse::<BitMatch>().is_err());
    }

    #[test]
    fn test_target_endpoints() {
        let flowed: FlowedLink = "1[1]>2[3]@ip_proto=6".parse().unwrap();
        let target = MeasurementTarget::Flowed(flowed.clone());
        let dest = target.endpoint(EndpointSide::Destination);
        assert_eq!(dest.port(), NodePort::new(2, 3));
        assert_eq!(dest.side(), EndpointSide::Destination);
        assert_eq!(dest.kind(), RequestKind::Sampling);
        assert!(target.has_node(NodeId(1)));
        assert!(!target.has_node(NodeId(3)));
    }

    #[test]
    fn test_timestamp_operations() {
        let ts1 = Timestamp::from_millis(1_000);
        let ts2 = ts1.add_duration(Duration::from_millis(250));
        assert_eq!(ts2.duration_since(ts1), Duration::from_millis(250));
        assert_eq!(ts1.duration_since(ts2), Duration::ZERO);
        assert_eq!(ts2.as_millis(), 1_250);
    }
}
