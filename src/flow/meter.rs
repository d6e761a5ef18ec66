//! Metering loop
//!
//! [`FlowMeter`] drives observations through the cache one at a time, in
//! arrival order. Every record it evicts is appended to the caller's buffer
//! in eviction order. Time is the packet clock: the largest timestamp seen
//! so far.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classify::Classifier;
use crate::config::MeterConfig;
use crate::core::{Direction, FlowKey, Observation};
use crate::error::Result;
use crate::plugin::PluginRegistry;

use super::cache::FlowCache;
use super::policy::{ExpirationPolicy, ExpirationReason};
use super::record::FlowRecord;

/// Metering counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterStats {
    pub packets_processed: u64,
    pub bytes_processed: u64,
    pub flows_created: u64,
    pub flows_expired: u64,
    pub active_flows: u64,
    pub idle_expired: u64,
    pub active_expired: u64,
    pub teardown_expired: u64,
    pub end_of_stream_expired: u64,
    pub custom_expired: u64,
}

impl MeterStats {
    fn count_expired(&mut self, record: &FlowRecord) {
        self.flows_expired += 1;
        match record.expiration_reason() {
            ExpirationReason::Idle => self.idle_expired += 1,
            ExpirationReason::Active => self.active_expired += 1,
            ExpirationReason::TcpTeardown => self.teardown_expired += 1,
            ExpirationReason::EndOfStream => self.end_of_stream_expired += 1,
            ExpirationReason::Custom(_) => self.custom_expired += 1,
        }
    }
}

/// Single-threaded flow metering state machine
pub struct FlowMeter {
    config: MeterConfig,
    policy: ExpirationPolicy,
    cache: FlowCache,
    plugins: PluginRegistry,
    classifier: Box<dyn Classifier>,
    clock_ms: Option<u64>,
    next_sweep_ms: u64,
    stats: MeterStats,
}

impl FlowMeter {
    /// Create a meter; the configuration is validated first
    pub fn new(
        config: MeterConfig,
        plugins: PluginRegistry,
        classifier: Box<dyn Classifier>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            policy: ExpirationPolicy::from_config(&config),
            cache: FlowCache::new(config.statistics),
            plugins,
            classifier,
            clock_ms: None,
            next_sweep_ms: 0,
            stats: MeterStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    pub fn policy(&self) -> &ExpirationPolicy {
        &self.policy
    }

    pub fn cache(&self) -> &FlowCache {
        &self.cache
    }

    pub fn stats(&self) -> MeterStats {
        self.stats
    }

    /// Meter one observation
    ///
    /// Records evicted along the way are appended to `out`, including those
    /// evicted before a plugin error is returned.
    pub fn process(&mut self, obs: Observation, out: &mut Vec<FlowRecord>) -> Result<()> {
        let before = out.len();
        let result = self.process_observation(obs, out);
        self.account(&out[before..]);
        result
    }

    /// End of stream: expire what has timed out, then flush everything else
    pub fn finish(&mut self, out: &mut Vec<FlowRecord>) -> Result<()> {
        let before = out.len();
        let result = self.flush(out);
        self.account(&out[before..]);
        if result.is_ok() {
            info!(
                "Metering finished: {} packets, {} flows, {} records",
                self.stats.packets_processed,
                self.stats.flows_created,
                self.stats.flows_expired
            );
        }
        result
    }

    fn process_observation(&mut self, mut obs: Observation, out: &mut Vec<FlowRecord>) -> Result<()> {
        let now = self.clock_ms.map_or(obs.timestamp_ms, |clock| clock.max(obs.timestamp_ms));
        if self.clock_ms.is_none() {
            self.next_sweep_ms = now.saturating_add(self.config.sweep_interval_ms);
        }
        self.clock_ms = Some(now);
        self.stats.packets_processed += 1;
        self.stats.bytes_processed += u64::from(obs.raw_size);

        let (key, side) = FlowKey::from_observation(&obs);

        // A live entry that has already expired at this instant must not
        // absorb the packet; it goes out first and the packet opens a new flow
        let stale = self
            .cache
            .get(&key)
            .and_then(|entry| self.policy.evaluate(entry, now));
        if let Some(reason) = stale {
            self.sweep(now, out)?;
            self.cache.evict(&key, reason, &mut self.plugins, out)?;
        }

        obs.direction = match self.cache.get(&key) {
            Some(entry) => entry.direction_of(side),
            None => Direction::Src2Dst,
        };

        let entry = if self.cache.contains(&key) {
            let Some(entry) = self.cache.touch(&key, &obs) else {
                return Ok(());
            };
            entry.classify(&obs);
            self.plugins.run_update(&obs, entry)?;
            entry
        } else {
            let (entry, _) = self
                .cache
                .lookup_or_create(key, side, &obs, self.classifier.as_ref());
            self.stats.flows_created += 1;
            entry.classify(&obs);
            self.plugins.run_init(&obs, entry)?;
            entry
        };

        let immediate = self.plugins.has_volatile()
            || entry.expiration_id() < 0
            || self.policy.tcp_teardown;
        let fired = if immediate {
            self.policy.evaluate(entry, now)
        } else {
            None
        };
        if let Some(reason) = fired {
            self.sweep(now, out)?;
            self.cache.evict(&key, reason, &mut self.plugins, out)?;
        }

        if now >= self.next_sweep_ms {
            self.sweep(now, out)?;
            self.next_sweep_ms = now.saturating_add(self.config.sweep_interval_ms);
        }
        Ok(())
    }

    fn sweep(&mut self, now: u64, out: &mut Vec<FlowRecord>) -> Result<usize> {
        let evicted = self.cache.sweep(now, &self.policy, &mut self.plugins, out)?;
        if evicted > 0 {
            debug!(now, evicted, active = self.cache.len(), "sweep");
        }
        Ok(evicted)
    }

    fn flush(&mut self, out: &mut Vec<FlowRecord>) -> Result<()> {
        if let Some(now) = self.clock_ms {
            self.sweep(now, out)?;
        }
        let flushed = self.cache.flush_all(&mut self.plugins, out)?;
        info!("Flushed {} flows at end of stream", flushed);
        Ok(())
    }

    fn account(&mut self, emitted: &[FlowRecord]) {
        for record in emitted {
            self.stats.count_expired(record);
        }
        self.stats.active_flows = self.cache.len() as u64;
    }
}
