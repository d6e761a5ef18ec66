//! Built-in plugins

use super::{FlowPlugin, Hooks};
use crate::core::Observation;
use crate::error::PluginError;
use crate::flow::{FieldValue, FlowEntry};

/// Extension field written by [`PacketMatrix`]
pub const PACKET_MATRIX_FIELD: &str = "bidirectional_packets_matrix";

/// Extracts one extra matrix column from a packet
pub type ColumnExtractor = Box<dyn Fn(&Observation) -> FieldValue + Send>;

/// Records the first packets of every flow as rows of features
///
/// Row layout: `[ip_size, payload_size, tcp_flags, protocol, direction,
/// ms_since_flow_start, custom...]`. The first four columns are on by
/// default and can be switched off individually.
pub struct PacketMatrix {
    packet_limit: usize,
    ip_size: bool,
    payload_size: bool,
    tcp_flags: bool,
    protocol: bool,
    custom: Vec<(String, ColumnExtractor)>,
}

impl PacketMatrix {
    /// Matrix over the first `packet_limit` packets with every built-in column
    pub fn new(packet_limit: usize) -> Self {
        Self {
            packet_limit,
            ip_size: true,
            payload_size: true,
            tcp_flags: true,
            protocol: true,
            custom: Vec::new(),
        }
    }

    pub fn with_ip_size(mut self, enabled: bool) -> Self {
        self.ip_size = enabled;
        self
    }

    pub fn with_payload_size(mut self, enabled: bool) -> Self {
        self.payload_size = enabled;
        self
    }

    pub fn with_tcp_flags(mut self, enabled: bool) -> Self {
        self.tcp_flags = enabled;
        self
    }

    pub fn with_protocol(mut self, enabled: bool) -> Self {
        self.protocol = enabled;
        self
    }

    /// Append a custom column
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        extract: impl Fn(&Observation) -> FieldValue + Send + 'static,
    ) -> Self {
        self.custom.push((name.into(), Box::new(extract)));
        self
    }

    /// Column names in row order
    pub fn columns(&self) -> Vec<String> {
        let mut cols = Vec::new();
        if self.ip_size {
            cols.push("ip_size".to_string());
        }
        if self.payload_size {
            cols.push("payload_size".to_string());
        }
        if self.tcp_flags {
            cols.push("tcp_flags".to_string());
        }
        if self.protocol {
            cols.push("protocol".to_string());
        }
        cols.push("direction".to_string());
        cols.push("ms_since_start".to_string());
        cols.extend(self.custom.iter().map(|(name, _)| name.clone()));
        cols
    }

    fn row(&self, obs: &Observation, flow_start_ms: u64) -> FieldValue {
        let mut row = Vec::with_capacity(6 + self.custom.len());
        if self.ip_size {
            row.push(FieldValue::UInt(u64::from(obs.ip_size)));
        }
        if self.payload_size {
            row.push(FieldValue::UInt(u64::from(obs.payload_size)));
        }
        if self.tcp_flags {
            row.push(FieldValue::UInt(u64::from(obs.tcp_flags.to_u8())));
        }
        if self.protocol {
            row.push(FieldValue::UInt(u64::from(u8::from(obs.protocol))));
        }
        row.push(FieldValue::UInt(u64::from(obs.direction.as_u8())));
        row.push(FieldValue::UInt(obs.timestamp_ms.saturating_sub(flow_start_ms)));
        row.extend(self.custom.iter().map(|(_, extract)| extract(obs)));
        FieldValue::List(row)
    }

    fn record(&self, obs: &Observation, flow: &mut FlowEntry) {
        let start = flow.first_seen_ms();
        let row = self.row(obs, start);
        if let Some(FieldValue::List(rows)) = flow.extensions_mut().get_mut(PACKET_MATRIX_FIELD) {
            if rows.len() < self.packet_limit {
                rows.push(row);
            }
            return;
        }
        if self.packet_limit > 0 {
            flow.set(PACKET_MATRIX_FIELD, vec![row]);
        }
    }
}

impl FlowPlugin for PacketMatrix {
    fn name(&self) -> &str {
        "packet_matrix"
    }

    fn hooks(&self) -> Hooks {
        Hooks::NONE.with_init().with_update()
    }

    fn on_init(&mut self, obs: &Observation, flow: &mut FlowEntry) -> Result<(), PluginError> {
        self.record(obs, flow);
        Ok(())
    }

    fn on_update(&mut self, obs: &Observation, flow: &mut FlowEntry) -> Result<(), PluginError> {
        if flow.packets() as usize <= self.packet_limit {
            self.record(obs, flow);
        }
        Ok(())
    }
}

/// Forces expiration once a flow reaches a bidirectional packet count
pub struct PacketLimit {
    limit: u64,
    expiration_id: i32,
}

impl PacketLimit {
    pub fn new(limit: u64) -> Self {
        Self { limit, expiration_id: -1 }
    }

    /// Use a different negative expiration code
    pub fn with_expiration_id(mut self, code: i32) -> Self {
        self.expiration_id = if code < 0 { code } else { -1 };
        self
    }

    fn check(&self, flow: &mut FlowEntry) {
        if flow.packets() >= self.limit && flow.expiration_id() >= 0 {
            flow.set_expiration_id(self.expiration_id);
        }
    }
}

impl FlowPlugin for PacketLimit {
    fn name(&self) -> &str {
        "packet_limit"
    }

    fn hooks(&self) -> Hooks {
        Hooks::NONE.with_init().with_update()
    }

    fn volatile(&self) -> bool {
        true
    }

    fn on_init(&mut self, _obs: &Observation, flow: &mut FlowEntry) -> Result<(), PluginError> {
        self.check(flow);
        Ok(())
    }

    fn on_update(&mut self, _obs: &Observation, flow: &mut FlowEntry) -> Result<(), PluginError> {
        self.check(flow);
        Ok(())
    }
}
