//! Flow metering engine
//!
//! Turns an ordered observation stream into bidirectional flow records.
//!
//! # Features
//!
//! - Direction-normalized flow tracking (first packet fixes src/dst)
//! - Per-direction counters, size / inter-arrival statistics, TCP flag counts
//! - Idle, active, TCP-teardown and plugin-forced expiration
//! - Deterministic eviction order
//!
//! # Example
//!
//! ```
//! use flowmeter::classify::NoClassifier;
//! use flowmeter::flow::FlowMeter;
//! use flowmeter::plugin::PluginRegistry;
//! use flowmeter::MeterConfig;
//!
//! let mut meter = FlowMeter::new(
//!     MeterConfig::default(),
//!     PluginRegistry::new(),
//!     Box::new(NoClassifier),
//! )
//! .unwrap();
//!
//! let mut records = Vec::new();
//! // meter.process(observation, &mut records)?;
//! meter.finish(&mut records).unwrap();
//! assert!(records.is_empty());
//! ```

pub mod cache;
pub mod entry;
pub mod meter;
pub mod policy;
pub mod record;

pub use cache::FlowCache;
pub use entry::{DirectionAccumulator, Extensions, FieldValue, FlowEntry, TcpFlagCounters};
pub use meter::{FlowMeter, MeterStats};
pub use policy::{ExpirationPolicy, ExpirationReason};
pub use record::{DirectionSummary, FlowRecord};
