//! Read-mostly broker state and its atomic replacement on reload.

use std::sync::{Arc, RwLock};

use reqwest::Client;

use crate::config::{BrokerConfig, ProxySettings};
use crate::error::Result;
use crate::normalize::ParamNormalizer;
use crate::registry::AdapterRegistry;

/// Everything a request needs from configuration, frozen at load time.
#[derive(Debug)]
pub struct BrokerSnapshot {
    pub settings: ProxySettings,
    pub registry: AdapterRegistry,
    pub normalizer: ParamNormalizer,
}

impl BrokerSnapshot {
    pub fn new(
        settings: ProxySettings,
        registry: AdapterRegistry,
        normalizer: ParamNormalizer,
    ) -> Self {
        Self {
            settings,
            registry,
            normalizer,
        }
    }

    /// Build adapters and rules from a loaded config.
    pub fn from_config(config: &BrokerConfig, client: &Client) -> Result<Self> {
        let registry =
            AdapterRegistry::from_bindings(&config.models, client, config.proxy.timeout())?;
        let normalizer = ParamNormalizer::new(
            config
                .vendors
                .iter()
                .map(|(vendor, rule)| (vendor.clone(), rule.clone())),
        );
        Ok(Self::new(config.proxy.clone(), registry, normalizer))
    }
}

/// Shared pointer to the current snapshot.
///
/// The lock only guards the pointer: readers clone the `Arc` and release it
/// immediately, so in-flight requests keep the snapshot they started with.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    current: Arc<RwLock<Arc<BrokerSnapshot>>>,
}

impl SnapshotHandle {
    pub fn new(snapshot: BrokerSnapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    pub fn load(&self) -> Arc<BrokerSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the snapshot wholesale.
    pub fn install(&self, snapshot: BrokerSnapshot) {
        let snapshot = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
        tracing::info!("configuration snapshot installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(alias: &str) -> BrokerConfig {
        BrokerConfig::parse(
            &format!(
                "[proxy]\ndefault_model = \"{alias}\"\n\n[models.{alias}]\nprovider = \"openai\"\nmodel_name = \"gpt-4\"\napi_key = \"k\"\n\n[vendors.OpenAI]\nremove_params = [\"seed\"]\n"
            ),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_from_config() {
        let snapshot = BrokerSnapshot::from_config(&config("a"), &Client::new()).unwrap();
        assert_eq!(snapshot.registry.list_aliases(), vec!["a"]);
        assert!(snapshot.normalizer.rule_for("openai").is_some());
        assert_eq!(snapshot.settings.default_model, "a");
    }

    #[test]
    fn test_install_swaps_without_disturbing_holders() {
        let client = Client::new();
        let handle = SnapshotHandle::new(BrokerSnapshot::from_config(&config("a"), &client).unwrap());

        let held = handle.load();
        handle.install(BrokerSnapshot::from_config(&config("b"), &client).unwrap());

        assert_eq!(held.registry.list_aliases(), vec!["a"]);
        assert_eq!(handle.load().registry.list_aliases(), vec!["b"]);
    }
}
