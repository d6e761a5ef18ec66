//! Core shared types for flow metering
//!
//! - `Observation`: one decoded packet
//! - `FlowKey`: direction-normalized flow identity
//! - `RunningStats`: streaming min/mean/stdev/max
//! - `parser`: frame decoding into observations

pub mod flow;
pub mod packet;
pub mod parser;
pub mod stats;

pub use flow::{FlowKey, KeySide};
pub use packet::{is_private_ip, Direction, IpProtocol, Observation, TcpFlags};
pub use parser::{decode_ethernet, decode_ip};
pub use stats::{RunningStats, StatsSummary};
