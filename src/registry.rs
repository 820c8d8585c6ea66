//! Model alias resolution.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use reqwest::Client;

use crate::adapters::{build_adapter, VendorAdapter};
use crate::config::ModelBinding;
use crate::error::{BrokerError, Result};

/// Owns one adapter per configured alias, built up front.
pub struct AdapterRegistry {
    adapters: IndexMap<String, Box<dyn VendorAdapter>>,
}

impl AdapterRegistry {
    /// Build every adapter. Fails on the first unknown provider.
    pub fn from_bindings(
        bindings: &IndexMap<String, ModelBinding>,
        client: &Client,
        timeout: Duration,
    ) -> Result<Self> {
        let mut adapters = IndexMap::with_capacity(bindings.len());
        for (alias, binding) in bindings {
            let adapter = build_adapter(Arc::new(binding.clone()), client, timeout).map_err(
                |e| match e {
                    BrokerError::Config { message } => {
                        BrokerError::config(format!("model '{alias}': {message}"))
                    }
                    other => other,
                },
            )?;
            tracing::debug!(
                alias = %alias,
                dialect = %adapter.dialect(),
                model = %binding.model_name,
                "registered model"
            );
            adapters.insert(alias.clone(), adapter);
        }
        Ok(Self { adapters })
    }

    /// Registry over pre-built adapters.
    pub fn from_adapters(
        adapters: impl IntoIterator<Item = (String, Box<dyn VendorAdapter>)>,
    ) -> Self {
        Self {
            adapters: adapters.into_iter().collect(),
        }
    }

    pub fn resolve(&self, alias: &str) -> Result<&dyn VendorAdapter> {
        self.adapters
            .get(alias)
            .map(|adapter| adapter.as_ref())
            .ok_or_else(|| BrokerError::unknown_model(alias))
    }

    /// Aliases in declaration order.
    pub fn list_aliases(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn binding(&self, alias: &str) -> Option<&ModelBinding> {
        self.adapters.get(alias).map(|adapter| adapter.binding())
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("aliases", &self.list_aliases())
            .finish()
    }
}
