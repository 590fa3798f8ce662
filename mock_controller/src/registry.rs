use controller_protocol::{PluginState, PluginStatus, StatusSnapshot};
use std::collections::BTreeMap;

/// In-memory stand-in for the tool adapters a real controller would host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, PluginState>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin(mut self, id: impl Into<String>, state: PluginState) -> Self {
        self.plugins.insert(id.into(), state);
        self
    }

    /// Parses `id=state,id=state`. A bare `id` starts out stopped.
    pub fn parse(list: &str) -> Result<Self, String> {
        let mut registry = Self::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (id, state) = match entry.split_once('=') {
                Some((id, state)) => (id.trim(), state.parse().unwrap_or_default()),
                None => (entry, PluginState::Stopped),
            };
            if id.is_empty() {
                return Err(format!("missing plugin id in {entry:?}"));
            }
            registry.plugins.insert(id.to_string(), state);
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<PluginState> {
        self.plugins.get(id).copied()
    }

    /// Returns the previous state, or `None` for an unknown plugin.
    pub fn set(&mut self, id: &str, state: PluginState) -> Option<PluginState> {
        let slot = self.plugins.get_mut(id)?;
        Some(std::mem::replace(slot, state))
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot::new(
            self.plugins
                .iter()
                .map(|(id, status)| PluginStatus {
                    id: id.clone(),
                    status: *status,
                })
                .collect(),
        )
    }
}
