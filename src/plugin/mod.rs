//! Flow plugins
//!
//! Plugins observe flows through three hooks:
//! - `on_init` once, when the flow is created, before any `on_update`
//! - `on_update` for every later packet of the flow
//! - `on_expire` once, right before the flow becomes a record
//!
//! Hooks run in registration order and may only write the flow's extension
//! bag and `expiration_id`. Errors are not swallowed: they abort metering and
//! reach the consumer as [`MeterError::Plugin`](crate::MeterError::Plugin).

pub mod builtin;
pub mod registry;

use crate::core::Observation;
use crate::error::PluginError;
use crate::flow::FlowEntry;

pub use builtin::{PacketLimit, PacketMatrix};
pub use registry::PluginRegistry;

/// Which hooks a plugin implements
///
/// The registry skips plugins whose flag is off, so a plugin that only
/// cares about expiration costs nothing per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hooks {
    pub init: bool,
    pub update: bool,
    pub expire: bool,
}

impl Hooks {
    pub const ALL: Hooks = Hooks { init: true, update: true, expire: true };
    pub const NONE: Hooks = Hooks { init: false, update: false, expire: false };

    pub fn with_init(mut self) -> Self {
        self.init = true;
        self
    }

    pub fn with_update(mut self) -> Self {
        self.update = true;
        self
    }

    pub fn with_expire(mut self) -> Self {
        self.expire = true;
        self
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Hooks::ALL
    }
}

/// Extension point invoked by the meter at flow lifecycle events
pub trait FlowPlugin: Send {
    /// Name used in logs and error reports
    fn name(&self) -> &str;

    /// Hooks this plugin implements
    fn hooks(&self) -> Hooks {
        Hooks::ALL
    }

    /// Volatile plugins have their flow's expiration re-evaluated right after
    /// `on_update`, instead of waiting for the next sweep
    fn volatile(&self) -> bool {
        false
    }

    fn on_init(&mut self, _obs: &Observation, _flow: &mut FlowEntry) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_update(&mut self, _obs: &Observation, _flow: &mut FlowEntry) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_expire(&mut self, _flow: &mut FlowEntry) -> Result<(), PluginError> {
        Ok(())
    }
}
