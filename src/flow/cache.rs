//! Flow cache with expiration indexes
//!
//! Live entries are stored by key. Two ordered indexes sit next to the map:
//! - idle index: `(last_seen_ms, sequence_id)`
//! - active index: `(first_seen_ms, sequence_id)`
//!
//! A sweep walks each index from the oldest end and stops at the first entry
//! that cannot have expired yet, so it never visits unrelated flows.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::classify::Classifier;
use crate::core::{FlowKey, KeySide, Observation};
use crate::error::Result;
use crate::plugin::PluginRegistry;

use super::entry::FlowEntry;
use super::policy::{ExpirationPolicy, ExpirationReason};
use super::record::FlowRecord;

/// Keyed store of live flows
#[derive(Debug)]
pub struct FlowCache {
    entries: HashMap<FlowKey, FlowEntry>,
    idle_index: BTreeMap<(u64, u64), FlowKey>,
    active_index: BTreeMap<(u64, u64), FlowKey>,
    statistics: bool,
    next_sequence: u64,
    next_record_id: u64,
}

impl FlowCache {
    pub fn new(statistics: bool) -> Self {
        Self {
            entries: HashMap::new(),
            idle_index: BTreeMap::new(),
            active_index: BTreeMap::new(),
            statistics,
            next_sequence: 0,
            next_record_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &FlowKey) -> Option<&FlowEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &FlowKey) -> Option<&mut FlowEntry> {
        self.entries.get_mut(key)
    }

    /// Number of records emitted so far
    pub fn records_emitted(&self) -> u64 {
        self.next_record_id
    }

    /// Find the entry for `key`, creating it from `obs` if absent
    ///
    /// A new entry gets the next sequence id and has `obs` counted as its
    /// first packet. An existing entry is returned untouched; use
    /// [`touch`](Self::touch) to count the observation.
    pub fn lookup_or_create(
        &mut self,
        key: FlowKey,
        side: KeySide,
        obs: &Observation,
        classifier: &dyn Classifier,
    ) -> (&mut FlowEntry, bool) {
        match self.entries.entry(key) {
            Entry::Occupied(occupied) => (occupied.into_mut(), false),
            Entry::Vacant(vacant) => {
                let seq = self.next_sequence;
                self.next_sequence += 1;

                let mut entry = FlowEntry::new(seq, key, side, obs, self.statistics, classifier);
                entry.update(obs);
                self.idle_index.insert((entry.last_seen_ms(), seq), key);
                self.active_index.insert((entry.first_seen_ms(), seq), key);
                trace!(seq, ?key, "flow created");
                (vacant.insert(entry), true)
            }
        }
    }

    /// Count `obs` against an existing entry and re-position it in the idle index
    pub fn touch(&mut self, key: &FlowKey, obs: &Observation) -> Option<&mut FlowEntry> {
        let entry = self.entries.get_mut(key)?;
        let seq = entry.sequence_id();
        self.idle_index.remove(&(entry.last_seen_ms(), seq));
        entry.update(obs);
        self.idle_index.insert((entry.last_seen_ms(), seq), *key);
        Some(entry)
    }

    /// Remove a live entry, run `on_expire` hooks and append its record to `out`
    ///
    /// A plugin-forced (negative) `expiration_id` is kept; otherwise the
    /// reason's code is recorded. If a hook fails the entry stays in the
    /// cache with both indexes intact.
    pub fn evict(
        &mut self,
        key: &FlowKey,
        reason: ExpirationReason,
        plugins: &mut PluginRegistry,
        out: &mut Vec<FlowRecord>,
    ) -> Result<bool> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(false);
        };
        if entry.expiration_id() >= 0 {
            entry.set_expiration_id(reason.code());
        }
        plugins.run_expire(entry)?;

        let Some(entry) = self.entries.remove(key) else {
            return Ok(false);
        };
        let seq = entry.sequence_id();
        self.idle_index.remove(&(entry.last_seen_ms(), seq));
        self.active_index.remove(&(entry.first_seen_ms(), seq));

        let id = self.next_record_id;
        self.next_record_id += 1;
        trace!(id, seq, %reason, packets = entry.packets(), "flow evicted");
        out.push(entry.into_record(id));
        Ok(true)
    }

    /// Evict every entry whose timeout has passed at packet time `now`
    ///
    /// Records are appended in ascending `(last_seen, sequence_id)` order.
    /// Returns the number of evicted flows.
    pub fn sweep(
        &mut self,
        now: u64,
        policy: &ExpirationPolicy,
        plugins: &mut PluginRegistry,
        out: &mut Vec<FlowRecord>,
    ) -> Result<usize> {
        let mut candidates: BTreeMap<(u64, u64), FlowKey> = BTreeMap::new();

        if let Some(horizon) = policy.idle_horizon(now) {
            for (&(last_seen, seq), key) in self.idle_index.range(..=(horizon, u64::MAX)) {
                candidates.insert((last_seen, seq), *key);
            }
        }
        if let Some(horizon) = policy.active_horizon(now) {
            for (&(_, seq), key) in self.active_index.range(..=(horizon, u64::MAX)) {
                if let Some(entry) = self.entries.get(key) {
                    candidates.insert((entry.last_seen_ms(), seq), *key);
                }
            }
        }

        let mut evicted = 0;
        for key in candidates.into_values() {
            let Some(reason) = self.entries.get(&key).and_then(|e| policy.evaluate(e, now)) else {
                continue;
            };
            if self.evict(&key, reason, plugins, out)? {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    /// Evict everything, in creation order, as end of stream
    pub fn flush_all(
        &mut self,
        plugins: &mut PluginRegistry,
        out: &mut Vec<FlowRecord>,
    ) -> Result<usize> {
        let mut keys: Vec<(u64, FlowKey)> = self
            .entries
            .iter()
            .map(|(key, entry)| (entry.sequence_id(), *key))
            .collect();
        keys.sort_unstable_by_key(|(seq, _)| *seq);

        let mut evicted = 0;
        for (_, key) in keys {
            if self.evict(&key, ExpirationReason::EndOfStream, plugins, out)? {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    #[cfg(test)]
    fn indexes_consistent(&self) -> bool {
        self.idle_index.len() == self.entries.len()
            && self.active_index.len() == self.entries.len()
            && self.entries.iter().all(|(key, e)| {
                self.idle_index.get(&(e.last_seen_ms(), e.sequence_id())) == Some(key)
                    && self.active_index.get(&(e.first_seen_ms(), e.sequence_id())) == Some(key)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::NoClassifier;
    use crate::core::IpProtocol;
    use crate::error::{MeterError, PluginError};
    use crate::plugin::{FlowPlugin, Hooks};
    use std::net::{IpAddr, Ipv4Addr};

    fn make_observation(ts: u64, client: u8) -> Observation {
        Observation::new(
            ts,
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, client)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpProtocol::Udp,
        )
        .with_ports(40000, 53)
        .with_sizes(80, 66)
    }

    fn ingest(cache: &mut FlowCache, obs: &Observation) -> FlowKey {
        let (key, side) = FlowKey::from_observation(obs);
        let (_, created) = cache.lookup_or_create(key, side, obs, &NoClassifier);
        if !created {
            cache.touch(&key, obs).unwrap();
        }
        key
    }

    fn policy(idle_ms: u64, active_ms: u64) -> ExpirationPolicy {
        ExpirationPolicy { idle_ms, active_ms, tcp_teardown: false }
    }

    #[test]
    fn test_create_then_touch() {
        let mut cache = FlowCache::new(false);
        let key = ingest(&mut cache, &make_observation(100, 1));
        ingest(&mut cache, &make_observation(250, 1));

        let entry = cache.get(&key).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(entry.packets(), 2);
        assert_eq!(entry.first_seen_ms(), 100);
        assert_eq!(entry.last_seen_ms(), 250);
        assert!(cache.indexes_consistent());
    }

    #[test]
    fn test_sequence_ids_increase() {
        let mut cache = FlowCache::new(false);
        let a = ingest(&mut cache, &make_observation(0, 1));
        let b = ingest(&mut cache, &make_observation(0, 2));
        assert_eq!(cache.get(&a).unwrap().sequence_id(), 0);
        assert_eq!(cache.get(&b).unwrap().sequence_id(), 1);
    }

    #[test]
    fn test_sweep_in_activity_order() {
        let mut cache = FlowCache::new(false);
        let mut plugins = PluginRegistry::new();
        // Flow 1 created first but active last
        ingest(&mut cache, &make_observation(0, 1));
        ingest(&mut cache, &make_observation(10, 2));
        ingest(&mut cache, &make_observation(20, 3));
        ingest(&mut cache, &make_observation(30, 1));

        let mut out = Vec::new();
        let n = cache.sweep(1_000, &policy(500, 10_000), &mut plugins, &mut out).unwrap();
        assert_eq!(n, 3);
        let seqs: Vec<u64> = out.iter().map(|r| r.sequence_id).collect();
        assert_eq!(seqs, vec![1, 2, 0]);
        assert!(out.iter().all(|r| r.expiration_id == 0));
        assert_eq!(out.iter().map(|r| r.id).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(cache.is_empty());
        assert!(cache.indexes_consistent());
    }

    #[test]
    fn test_sweep_stops_at_unexpired() {
        let mut cache = FlowCache::new(false);
        let mut plugins = PluginRegistry::new();
        ingest(&mut cache, &make_observation(0, 1));
        let live = ingest(&mut cache, &make_observation(900, 2));

        let mut out = Vec::new();
        cache.sweep(1_000, &policy(500, 10_000), &mut plugins, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert!(cache.contains(&live));
        assert!(cache.indexes_consistent());
    }

    #[test]
    fn test_active_timeout_in_sweep() {
        let mut cache = FlowCache::new(false);
        let mut plugins = PluginRegistry::new();
        for ts in (0..=1_000).step_by(100) {
            ingest(&mut cache, &make_observation(ts, 1));
        }

        let mut out = Vec::new();
        cache.sweep(1_000, &policy(500, 1_000), &mut plugins, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].expiration_id, 1);
        assert_eq!(out[0].bidirectional.packets, 11);
    }

    #[test]
    fn test_flush_in_creation_order() {
        let mut cache = FlowCache::new(false);
        let mut plugins = PluginRegistry::new();
        ingest(&mut cache, &make_observation(0, 3));
        ingest(&mut cache, &make_observation(5, 1));
        ingest(&mut cache, &make_observation(9, 2));
        ingest(&mut cache, &make_observation(20, 3));

        let mut out = Vec::new();
        assert_eq!(cache.flush_all(&mut plugins, &mut out).unwrap(), 3);
        let seqs: Vec<u64> = out.iter().map(|r| r.sequence_id).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(out.iter().all(|r| r.expiration_id == 3));
    }

    struct FailOnExpire;

    impl FlowPlugin for FailOnExpire {
        fn name(&self) -> &str {
            "fail_on_expire"
        }

        fn hooks(&self) -> Hooks {
            Hooks::NONE.with_expire()
        }

        fn on_expire(&mut self, _flow: &mut FlowEntry) -> std::result::Result<(), PluginError> {
            Err(PluginError::failed("nope"))
        }
    }

    #[test]
    fn test_failed_expire_keeps_indexes() {
        let mut cache = FlowCache::new(false);
        let mut plugins = PluginRegistry::new();
        plugins.register(Box::new(FailOnExpire));
        let key = ingest(&mut cache, &make_observation(0, 1));

        let mut out = Vec::new();
        let err = cache
            .evict(&key, ExpirationReason::Idle, &mut plugins, &mut out)
            .unwrap_err();
        assert!(matches!(err, MeterError::Plugin { .. }));
        assert!(out.is_empty());
        assert!(cache.contains(&key));
        assert!(cache.indexes_consistent());
    }
}
