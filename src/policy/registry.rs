//! Name and alias table for policies

use super::PolicyId;
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Maps configuration names to [`PolicyId`]s
///
/// Lookups are case-insensitive. Hosts may register extra aliases before
/// loading a configuration.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    names: BTreeMap<String, PolicyId>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl PolicyRegistry {
    /// Registry without any entries
    pub fn empty() -> Self {
        Self {
            names: BTreeMap::new(),
        }
    }

    /// Canonical names of every built-in policy plus the stock aliases
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for id in PolicyId::ALL {
            registry.names.insert(id.name().to_string(), id);
        }
        for alias in ["vanilla", "none"] {
            registry.names.insert(alias.to_string(), PolicyId::Identity);
        }
        registry
    }

    /// Register `alias` for `id`; re-pointing an existing name is an error
    pub fn register_alias(&mut self, alias: &str, id: PolicyId) -> Result<()> {
        let key = alias.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(Error::ConfigError("empty policy alias".to_string()));
        }
        match self.names.get(&key) {
            Some(existing) if *existing != id => Err(Error::ConfigError(format!(
                "alias '{alias}' already maps to {existing}"
            ))),
            _ => {
                self.names.insert(key, id);
                Ok(())
            }
        }
    }

    /// Resolve a configured name
    pub fn resolve(&self, name: &str) -> Result<PolicyId> {
        self.names
            .get(&name.trim().to_ascii_lowercase())
            .copied()
            .ok_or_else(|| Error::ConfigError(format!("unknown mix policy '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    /// Every registered name in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(String::as_str)
    }
}
