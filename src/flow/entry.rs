//! Live flow state
//!
//! A [`FlowEntry`] is owned by the flow cache from the first packet of a
//! conversation until eviction. Plugins receive `&mut FlowEntry` but can only
//! touch the extension bag and `expiration_id`; every built-in field is
//! private and read through accessors.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::classify::{Classifier, ClassifierState, FlowMetadata};
use crate::core::{
    Direction, FlowKey, IpProtocol, KeySide, Observation, RunningStats, TcpFlags,
};

use super::record::{DirectionSummary, FlowRecord};

/// Value stored in a flow's extension bag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::UInt(v) => Some(*v),
            FieldValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInt(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<Vec<FieldValue>> for FieldValue {
    fn from(v: Vec<FieldValue>) -> Self {
        FieldValue::List(v)
    }
}

/// Plugin-declared fields, keyed by name
pub type Extensions = BTreeMap<String, FieldValue>;

/// Per-flag TCP counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFlagCounters {
    pub syn: u64,
    pub cwr: u64,
    pub ece: u64,
    pub urg: u64,
    pub ack: u64,
    pub psh: u64,
    pub rst: u64,
    pub fin: u64,
}

impl TcpFlagCounters {
    pub fn record(&mut self, flags: &TcpFlags) {
        self.syn += flags.syn as u64;
        self.cwr += flags.cwr as u64;
        self.ece += flags.ece as u64;
        self.urg += flags.urg as u64;
        self.ack += flags.ack as u64;
        self.psh += flags.psh as u64;
        self.rst += flags.rst as u64;
        self.fin += flags.fin as u64;
    }
}

/// Counters and statistics for one direction (or both)
#[derive(Debug, Clone, Default)]
pub struct DirectionAccumulator {
    first_seen_ms: u64,
    last_seen_ms: u64,
    packets: u64,
    raw_bytes: u64,
    ip_bytes: u64,
    raw_ps: RunningStats,
    ip_ps: RunningStats,
    piat_ms: RunningStats,
    flags: TcpFlagCounters,
}

impl DirectionAccumulator {
    fn observe(&mut self, obs: &Observation, statistics: bool) {
        let ts = obs.timestamp_ms;
        if self.packets == 0 {
            self.first_seen_ms = ts;
        } else if statistics {
            // No prior timestamp for the first packet, so no IAT sample
            self.piat_ms.push(ts.saturating_sub(self.last_seen_ms) as f64);
        }
        self.last_seen_ms = ts;

        self.packets += 1;
        self.raw_bytes += u64::from(obs.raw_size);
        self.ip_bytes += u64::from(obs.ip_size);

        if statistics {
            self.raw_ps.push(f64::from(obs.raw_size));
            self.ip_ps.push(f64::from(obs.ip_size));
            self.flags.record(&obs.tcp_flags);
        }
    }

    pub fn first_seen_ms(&self) -> u64 {
        self.first_seen_ms
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms
    }

    pub fn duration_ms(&self) -> u64 {
        self.last_seen_ms.saturating_sub(self.first_seen_ms)
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn raw_bytes(&self) -> u64 {
        self.raw_bytes
    }

    pub fn ip_bytes(&self) -> u64 {
        self.ip_bytes
    }

    /// Raw packet size statistics (empty unless statistics are enabled)
    pub fn raw_ps(&self) -> &RunningStats {
        &self.raw_ps
    }

    pub fn ip_ps(&self) -> &RunningStats {
        &self.ip_ps
    }

    /// Packet inter-arrival time statistics in milliseconds
    pub fn piat_ms(&self) -> &RunningStats {
        &self.piat_ms
    }

    pub fn flags(&self) -> &TcpFlagCounters {
        &self.flags
    }

    pub(crate) fn summary(&self, statistics: bool) -> DirectionSummary {
        DirectionSummary {
            first_seen_ms: self.first_seen_ms,
            last_seen_ms: self.last_seen_ms,
            duration_ms: self.duration_ms(),
            packets: self.packets,
            raw_bytes: self.raw_bytes,
            ip_bytes: self.ip_bytes,
            raw_ps: statistics.then(|| self.raw_ps.summary()),
            ip_ps: statistics.then(|| self.ip_ps.summary()),
            piat_ms: statistics.then(|| self.piat_ms.summary()),
            tcp_flags: statistics.then_some(self.flags),
        }
    }
}

/// A live, mutable flow
pub struct FlowEntry {
    sequence_id: u64,
    key: FlowKey,
    src_side: KeySide,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
    protocol: IpProtocol,
    vlan_id: u16,
    tunnel: bool,
    statistics: bool,

    bidirectional: DirectionAccumulator,
    src2dst: DirectionAccumulator,
    dst2src: DirectionAccumulator,

    classifier: Option<Box<dyn ClassifierState>>,
    metadata: FlowMetadata,

    expiration_id: i32,
    extensions: Extensions,

    fin_src2dst: bool,
    fin_dst2src: bool,
    rst_seen: bool,
}

impl fmt::Debug for FlowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowEntry")
            .field("sequence_id", &self.sequence_id)
            .field("key", &self.key)
            .field("packets", &self.bidirectional.packets)
            .field("expiration_id", &self.expiration_id)
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}

impl FlowEntry {
    /// Create an entry from the first observation of a conversation
    ///
    /// The observation is not counted; the cache does that through `update`.
    pub(crate) fn new(
        sequence_id: u64,
        key: FlowKey,
        src_side: KeySide,
        first: &Observation,
        statistics: bool,
        classifier: &dyn Classifier,
    ) -> Self {
        Self {
            sequence_id,
            key,
            src_side,
            src_ip: first.src_ip,
            dst_ip: first.dst_ip,
            src_port: first.src_port,
            dst_port: first.dst_port,
            protocol: first.protocol,
            vlan_id: first.vlan_id,
            tunnel: first.tunnel,
            statistics,
            bidirectional: DirectionAccumulator::default(),
            src2dst: DirectionAccumulator::default(),
            dst2src: DirectionAccumulator::default(),
            classifier: Some(classifier.open(first)),
            metadata: FlowMetadata::default(),
            expiration_id: 0,
            extensions: Extensions::new(),
            fin_src2dst: false,
            fin_dst2src: false,
            rst_seen: false,
        }
    }

    /// Direction of an observation sent from `side`
    pub(crate) fn direction_of(&self, side: KeySide) -> Direction {
        side.direction(self.src_side)
    }

    /// Fold one observation into the counters
    pub(crate) fn update(&mut self, obs: &Observation) {
        let statistics = self.statistics;
        self.bidirectional.observe(obs, statistics);

        match obs.direction {
            Direction::Src2Dst => {
                self.src2dst.observe(obs, statistics);
                self.fin_src2dst |= obs.tcp_flags.fin;
            }
            Direction::Dst2Src => {
                self.dst2src.observe(obs, statistics);
                self.fin_dst2src |= obs.tcp_flags.fin;
            }
        }
        self.rst_seen |= obs.tcp_flags.rst;
    }

    /// Hand the observation to the in-progress classifier
    pub(crate) fn classify(&mut self, obs: &Observation) {
        if let Some(state) = self.classifier.as_mut() {
            state.update(obs, &mut self.metadata);
        }
    }

    /// Convert into an immutable record, finalizing the classifier
    pub(crate) fn into_record(mut self, id: u64) -> FlowRecord {
        let classification = self
            .classifier
            .take()
            .map(|state| state.finish())
            .unwrap_or_default();
        let statistics = self.statistics;

        FlowRecord {
            id,
            sequence_id: self.sequence_id,
            expiration_id: self.expiration_id,
            src_ip: self.src_ip,
            src_ip_is_private: crate::core::is_private_ip(&self.src_ip),
            dst_ip: self.dst_ip,
            dst_ip_is_private: crate::core::is_private_ip(&self.dst_ip),
            version: match self.src_ip {
                IpAddr::V4(_) => 4,
                IpAddr::V6(_) => 6,
            },
            src_port: self.src_port,
            dst_port: self.dst_port,
            protocol: u8::from(self.protocol),
            vlan_id: self.vlan_id,
            tunnel: self.tunnel,
            bidirectional: self.bidirectional.summary(statistics),
            src2dst: self.src2dst.summary(statistics),
            dst2src: self.dst2src.summary(statistics),
            classification,
            metadata: std::mem::take(&mut self.metadata),
            extensions: std::mem::take(&mut self.extensions),
        }
    }

    /// TCP connection has been torn down (RST seen, or FIN from both sides)
    pub fn tcp_closed(&self) -> bool {
        self.protocol == IpProtocol::Tcp && (self.rst_seen || (self.fin_src2dst && self.fin_dst2src))
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn src_ip(&self) -> IpAddr {
        self.src_ip
    }

    pub fn dst_ip(&self) -> IpAddr {
        self.dst_ip
    }

    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    pub fn protocol(&self) -> IpProtocol {
        self.protocol
    }

    pub fn vlan_id(&self) -> u16 {
        self.vlan_id
    }

    pub fn bidirectional(&self) -> &DirectionAccumulator {
        &self.bidirectional
    }

    pub fn src2dst(&self) -> &DirectionAccumulator {
        &self.src2dst
    }

    pub fn dst2src(&self) -> &DirectionAccumulator {
        &self.dst2src
    }

    /// Shortcut for `bidirectional().packets()`
    pub fn packets(&self) -> u64 {
        self.bidirectional.packets
    }

    pub fn first_seen_ms(&self) -> u64 {
        self.bidirectional.first_seen_ms
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.bidirectional.last_seen_ms
    }

    pub fn metadata(&self) -> &FlowMetadata {
        &self.metadata
    }

    pub fn expiration_id(&self) -> i32 {
        self.expiration_id
    }

    /// Set the expiration code; a negative value forces eviction at the next
    /// evaluation
    pub fn set_expiration_id(&mut self, id: i32) {
        self.expiration_id = id;
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.extensions.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.extensions.insert(name.into(), value.into());
    }
}
