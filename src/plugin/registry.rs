//! Ordered plugin registry

use tracing::info;

use super::FlowPlugin;
use crate::core::Observation;
use crate::error::{MeterError, Result};
use crate::flow::FlowEntry;

/// Plugins in registration order, with per-hook dispatch lists
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn FlowPlugin>>,
    init: Vec<usize>,
    update: Vec<usize>,
    expire: Vec<usize>,
    volatile: bool,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin; it runs after every plugin registered before it
    pub fn register(&mut self, plugin: Box<dyn FlowPlugin>) {
        let idx = self.plugins.len();
        let hooks = plugin.hooks();
        info!(
            "Registering flow plugin: {} (init={}, update={}, expire={}, volatile={})",
            plugin.name(),
            hooks.init,
            hooks.update,
            hooks.expire,
            plugin.volatile()
        );

        if hooks.init {
            self.init.push(idx);
        }
        if hooks.update {
            self.update.push(idx);
        }
        if hooks.expire {
            self.expire.push(idx);
        }
        self.volatile |= plugin.volatile();
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// At least one registered plugin is volatile
    pub fn has_volatile(&self) -> bool {
        self.volatile
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn run_init(&mut self, obs: &Observation, flow: &mut FlowEntry) -> Result<()> {
        for &idx in &self.init {
            let plugin = &mut self.plugins[idx];
            plugin.on_init(obs, flow).map_err(|source| MeterError::Plugin {
                plugin: plugin.name().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn run_update(&mut self, obs: &Observation, flow: &mut FlowEntry) -> Result<()> {
        for &idx in &self.update {
            let plugin = &mut self.plugins[idx];
            plugin.on_update(obs, flow).map_err(|source| MeterError::Plugin {
                plugin: plugin.name().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn run_expire(&mut self, flow: &mut FlowEntry) -> Result<()> {
        for &idx in &self.expire {
            let plugin = &mut self.plugins[idx];
            plugin.on_expire(flow).map_err(|source| MeterError::Plugin {
                plugin: plugin.name().to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .field("volatile", &self.volatile)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::NoClassifier;
    use crate::core::{FlowKey, IpProtocol};
    use crate::error::PluginError;
    use crate::flow::FieldValue;
    use crate::plugin::Hooks;
    use std::net::{IpAddr, Ipv4Addr};

    /// Appends its tag to the `trace` extension on every hook
    struct Tagger {
        tag: &'static str,
        hooks: Hooks,
    }

    impl Tagger {
        fn push(&self, flow: &mut FlowEntry, hook: &str) {
            let entry = format!("{}:{}", self.tag, hook);
            if let Some(FieldValue::List(items)) = flow.extensions_mut().get_mut("trace") {
                items.push(entry.into());
                return;
            }
            flow.set("trace", vec![FieldValue::from(entry)]);
        }
    }

    impl FlowPlugin for Tagger {
        fn name(&self) -> &str {
            self.tag
        }

        fn hooks(&self) -> Hooks {
            self.hooks
        }

        fn on_init(&mut self, _obs: &Observation, flow: &mut FlowEntry) -> std::result::Result<(), PluginError> {
            self.push(flow, "init");
            Ok(())
        }

        fn on_update(&mut self, _obs: &Observation, flow: &mut FlowEntry) -> std::result::Result<(), PluginError> {
            self.push(flow, "update");
            Ok(())
        }

        fn on_expire(&mut self, flow: &mut FlowEntry) -> std::result::Result<(), PluginError> {
            self.push(flow, "expire");
            Ok(())
        }
    }

    struct Failing;

    impl FlowPlugin for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_update(&mut self, _obs: &Observation, _flow: &mut FlowEntry) -> std::result::Result<(), PluginError> {
            Err(PluginError::failed("boom"))
        }
    }

    fn make_flow() -> (Observation, FlowEntry) {
        let obs = Observation::new(
            0,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            IpProtocol::Udp,
        );
        let (key, side) = FlowKey::from_observation(&obs);
        let entry = FlowEntry::new(0, key, side, &obs, false, &NoClassifier);
        (obs, entry)
    }

    fn trace(flow: &FlowEntry) -> Vec<String> {
        flow.get("trace")
            .and_then(FieldValue::as_list)
            .unwrap_or_default()
            .iter()
            .map(|v| match v {
                FieldValue::Text(s) => s.clone(),
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_registration_order_and_hook_flags() {
        let mut registry = PluginRegistry::new();
        registry.register(Box::new(Tagger { tag: "a", hooks: Hooks::ALL }));
        registry.register(Box::new(Tagger { tag: "b", hooks: Hooks::NONE.with_expire() }));
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(!registry.has_volatile());

        let (obs, mut flow) = make_flow();
        registry.run_init(&obs, &mut flow).unwrap();
        registry.run_update(&obs, &mut flow).unwrap();
        registry.run_expire(&mut flow).unwrap();

        assert_eq!(trace(&flow), vec!["a:init", "a:update", "a:expire", "b:expire"]);
    }

    #[test]
    fn test_error_names_plugin() {
        let mut registry = PluginRegistry::new();
        registry.register(Box::new(Failing));

        let (obs, mut flow) = make_flow();
        registry.run_init(&obs, &mut flow).unwrap();
        let err = registry.run_update(&obs, &mut flow).unwrap_err();
        match err {
            MeterError::Plugin { plugin, .. } => assert_eq!(plugin, "failing"),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
