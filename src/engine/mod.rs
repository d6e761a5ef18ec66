//! Streaming engine
//!
//! Runs the metering loop on its own thread and hands records to the
//! consumer through a bounded channel.
//!
//! # Architecture
//! ```text
//! ┌──────────────┐     ┌─────────────────────┐     ┌──────────────┐
//! │ PacketSource │────▶│  flowmeter-meter    │────▶│  FlowStream  │
//! │ (pcap/iter)  │     │  FlowMeter + cache  │     │  (Iterator)  │
//! └──────────────┘     └─────────────────────┘     └──────────────┘
//!                           bounded channel, blocking send
//! ```
//!
//! A slow consumer blocks the meter thread instead of growing memory.
//! Expiration runs on the packet clock, so blocking never changes results.

pub mod capture;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::classify::{Classifier, NoClassifier};
use crate::config::MeterConfig;
use crate::error::{MeterError, Result};
use crate::flow::{FlowMeter, FlowRecord, MeterStats};
use crate::plugin::{FlowPlugin, PluginRegistry};

pub use capture::{CaptureStats, IterSource, PacketSource, PcapFileSource};

/// Entry point for building a [`FlowStream`]
pub struct FlowStreamer;

impl FlowStreamer {
    pub fn builder() -> FlowStreamerBuilder {
        FlowStreamerBuilder::new()
    }
}

/// Builder for a metering session
pub struct FlowStreamerBuilder {
    config: MeterConfig,
    plugins: PluginRegistry,
    classifier: Box<dyn Classifier>,
}

impl Default for FlowStreamerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowStreamerBuilder {
    pub fn new() -> Self {
        Self {
            config: MeterConfig::default(),
            plugins: PluginRegistry::new(),
            classifier: Box::new(NoClassifier),
        }
    }

    pub fn with_config(mut self, config: MeterConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a plugin; plugins run in the order they are added
    pub fn with_plugin(mut self, plugin: impl FlowPlugin + 'static) -> Self {
        self.plugins.register(Box::new(plugin));
        self
    }

    pub fn with_boxed_plugin(mut self, plugin: Box<dyn FlowPlugin>) -> Self {
        self.plugins.register(plugin);
        self
    }

    pub fn with_classifier(mut self, classifier: impl Classifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    /// Validate the configuration and start metering `source`
    pub fn build(self, source: impl PacketSource + 'static) -> Result<FlowStream> {
        let capacity = self.config.channel_capacity;
        let meter = FlowMeter::new(self.config, self.plugins, self.classifier)?;

        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(RwLock::new(MeterStats::default()));

        let thread_stop = stop.clone();
        let thread_stats = stats.clone();
        let handle = std::thread::Builder::new()
            .name("flowmeter-meter".into())
            .spawn(move || run_meter(meter, source, tx, thread_stop, thread_stats))?;

        Ok(FlowStream {
            rx,
            stop,
            stats,
            handle: Some(handle),
            finished: false,
        })
    }
}

/// Pull-based stream of flow records
///
/// Yields records in eviction order. A plugin failure is yielded as a
/// single `Err` after every record evicted before it, then the stream ends.
pub struct FlowStream {
    rx: Receiver<Result<FlowRecord>>,
    stop: Arc<AtomicBool>,
    stats: Arc<RwLock<MeterStats>>,
    handle: Option<JoinHandle<()>>,
    finished: bool,
}

impl FlowStream {
    /// Ask the meter to stop reading packets
    ///
    /// Live flows are still flushed; keep iterating to receive them.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Snapshot of the meter's counters
    pub fn stats(&self) -> MeterStats {
        *self.stats.read()
    }
}

impl Iterator for FlowStream {
    type Item = Result<FlowRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.rx.recv() {
            Ok(item) => Some(item),
            Err(_) => {
                self.finished = true;
                let panicked = self
                    .handle
                    .take()
                    .map(|handle| handle.join().is_err())
                    .unwrap_or(false);
                if panicked {
                    error!("Metering thread panicked");
                    Some(Err(MeterError::ProducerPanicked))
                } else {
                    None
                }
            }
        }
    }
}

impl Drop for FlowStream {
    fn drop(&mut self) {
        // The receiver drops right after this, which unblocks a pending send
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn run_meter(
    mut meter: FlowMeter,
    mut source: impl PacketSource,
    tx: Sender<Result<FlowRecord>>,
    stop: Arc<AtomicBool>,
    stats: Arc<RwLock<MeterStats>>,
) {
    info!("Metering started");
    let mut out = Vec::new();

    loop {
        if stop.load(Ordering::Relaxed) {
            info!("Stop requested, flushing live flows");
            break;
        }
        let Some(obs) = source.next_observation() else {
            break;
        };

        let result = meter.process(obs, &mut out);
        *stats.write() = meter.stats();
        if !deliver(&tx, &mut out) {
            return;
        }
        if let Err(e) = result {
            error!("Metering aborted: {}", e);
            let _ = tx.send(Err(e));
            return;
        }
    }

    let result = meter.finish(&mut out);
    *stats.write() = meter.stats();
    if !deliver(&tx, &mut out) {
        return;
    }
    if let Err(e) = result {
        error!("Flush aborted: {}", e);
        let _ = tx.send(Err(e));
        return;
    }
    info!("Metering stopped");
}

/// Push records to the consumer; false once it has gone away
fn deliver(tx: &Sender<Result<FlowRecord>>, out: &mut Vec<FlowRecord>) -> bool {
    for record in out.drain(..) {
        if tx.send(Ok(record)).is_err() {
            debug!("Consumer disconnected, stopping meter");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IpProtocol, Observation};
    use std::net::{IpAddr, Ipv4Addr};

    fn make_observation(ts: u64, client: u8) -> Observation {
        Observation::new(
            ts,
            IpAddr::V4(Ipv4Addr::new(10, 1, 0, client)),
            IpAddr::V4(Ipv4Addr::new(10, 2, 0, 1)),
            IpProtocol::Udp,
        )
        .with_ports(5000, 53)
        .with_sizes(60, 46)
    }

    #[test]
    fn test_stream_yields_all_flows() {
        let packets: Vec<_> = (0..20).map(|i| make_observation(i, (i % 4) as u8)).collect();
        let stream = FlowStreamer::builder()
            .build(IterSource::new(packets))
            .unwrap();

        let records: Vec<FlowRecord> = stream.collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records.iter().map(|r| r.bidirectional.packets).sum::<u64>(), 20);
    }

    #[test]
    fn test_invalid_config_fails_build() {
        let config = MeterConfig { channel_capacity: 0, ..Default::default() };
        let result = FlowStreamer::builder()
            .with_config(config)
            .build(IterSource::new(Vec::<Observation>::new()));
        assert!(matches!(result, Err(MeterError::Config(_))));
    }

    #[test]
    fn test_backpressure_preserves_records() {
        let config = MeterConfig {
            idle_timeout: 0,
            active_timeout: 0,
            channel_capacity: 1,
            ..Default::default()
        };
        let packets: Vec<_> = (0..200).map(|i| make_observation(i, 1)).collect();
        let stream = FlowStreamer::builder()
            .with_config(config)
            .build(IterSource::new(packets))
            .unwrap();

        let ids: Vec<u64> = stream.map(|r| r.unwrap().id).collect();
        assert_eq!(ids, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_stats_after_drain() {
        let packets: Vec<_> = (0..3).map(|i| make_observation(i, 1)).collect();
        let mut stream = FlowStreamer::builder()
            .build(IterSource::new(packets))
            .unwrap();
        while let Some(record) = stream.next() {
            record.unwrap();
        }
        let stats = stream.stats();
        assert_eq!(stats.packets_processed, 3);
        assert_eq!(stats.flows_expired, 1);
        assert_eq!(stats.active_flows, 0);
    }
}
