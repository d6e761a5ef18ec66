//! Immutable flow records
//!
//! What the consumer sees: a snapshot of a flow taken at eviction time.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::classify::{Classification, FlowMetadata};
use crate::core::StatsSummary;

use super::entry::{Extensions, FieldValue, TcpFlagCounters};
use super::policy::ExpirationReason;

/// Per-direction counters and, when enabled, statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionSummary {
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub duration_ms: u64,
    pub packets: u64,
    pub raw_bytes: u64,
    pub ip_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_ps: Option<StatsSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_ps: Option<StatsSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub piat_ms: Option<StatsSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_flags: Option<TcpFlagCounters>,
}

/// An expired flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Emission index, starting at 0
    pub id: u64,
    /// Creation order of the underlying flow
    pub sequence_id: u64,
    /// Why the flow expired (see [`ExpirationReason`])
    pub expiration_id: i32,
    pub src_ip: IpAddr,
    pub src_ip_is_private: bool,
    pub dst_ip: IpAddr,
    pub dst_ip_is_private: bool,
    pub version: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub vlan_id: u16,
    pub tunnel: bool,
    pub bidirectional: DirectionSummary,
    pub src2dst: DirectionSummary,
    pub dst2src: DirectionSummary,
    #[serde(flatten)]
    pub classification: Classification,
    #[serde(flatten)]
    pub metadata: FlowMetadata,
    #[serde(default)]
    pub extensions: Extensions,
}

impl FlowRecord {
    /// Serialize as a single JSON object
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn extension(&self, name: &str) -> Option<&FieldValue> {
        self.extensions.get(name)
    }

    pub fn expiration_reason(&self) -> ExpirationReason {
        ExpirationReason::from_code(self.expiration_id)
    }
}
