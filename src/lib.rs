//! flowmeter: bidirectional network flow metering
//!
//! Consumes an ordered stream of captured packets and produces one record
//! per conversation, with per-direction counters, optional streaming
//! statistics, application classification and plugin-defined fields.
//!
//! # Example
//!
//! ```no_run
//! use flowmeter::engine::{FlowStreamer, PcapFileSource};
//! use flowmeter::classify::BasicClassifier;
//! use flowmeter::plugin::PacketLimit;
//! use flowmeter::MeterConfig;
//!
//! # fn main() -> flowmeter::Result<()> {
//! let config = MeterConfig { statistics: true, ..Default::default() };
//! let stream = FlowStreamer::builder()
//!     .with_config(config)
//!     .with_classifier(BasicClassifier::new())
//!     .with_plugin(PacketLimit::new(100))
//!     .build(PcapFileSource::open("capture.pcap")?)?;
//!
//! for record in stream {
//!     let record = record?;
//!     println!("{} {} packets", record.classification.application_name, record.bidirectional.packets);
//! }
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod flow;
pub mod plugin;

pub use config::MeterConfig;
pub use engine::{FlowStream, FlowStreamer, FlowStreamerBuilder};
pub use error::{MeterError, PluginError, Result};
pub use flow::{FieldValue, FlowEntry, FlowMeter, FlowRecord, MeterStats};
pub use plugin::{FlowPlugin, Hooks, PluginRegistry};
