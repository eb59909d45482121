use indexmap::IndexMap;
use roomcast_core::error::{Error, Result};
use std::sync::Arc;
use tracing::debug;

use super::MixingConfiguration;

/// Raised when the current configuration changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub current: Option<String>,
    pub previous: Option<String>,
}

/// Configurations keyed by id in registration order, with exactly one current
/// configuration whenever any of them is applicable
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    configs: IndexMap<String, Arc<MixingConfiguration>>,
    ids: Vec<String>,
    current: Option<String>,
}

impl ConfigRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    #[must_use]
    pub fn current(&self) -> Option<(&str, &Arc<MixingConfiguration>)> {
        let id = self.current.as_deref()?;
        self.configs.get(id).map(|config| (id, config))
    }

    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Register or replace a configuration; a replaced one keeps its
    /// registration slot
    pub fn add(&mut self, id: impl Into<String>, config: MixingConfiguration) -> Option<ConfigChange> {
        self.configs.insert(id.into(), Arc::new(config));
        self.recompute()
    }

    pub fn remove(&mut self, id: &str) -> Result<Option<ConfigChange>> {
        if self.configs.shift_remove(id).is_none() {
            return Err(Error::NotFound(format!("mixing configuration {id:?}")));
        }
        Ok(self.recompute())
    }

    /// Make `id` current regardless of applicability, until the next change
    /// to the source ids or the registry
    pub fn force(&mut self, id: &str) -> Result<Option<ConfigChange>> {
        if !self.configs.contains_key(id) {
            return Err(Error::NotFound(format!("mixing configuration {id:?}")));
        }
        Ok(self.switch_to(Some(id.to_string())))
    }

    pub fn update_ids(&mut self, ids: Vec<String>) -> Option<ConfigChange> {
        self.ids = ids;
        self.recompute()
    }

    /// The configuration that should be current for `ids`
    ///
    /// The highest priority among the applicable configurations wins. On a
    /// tie the current configuration is kept if it is among the best,
    /// otherwise the first registered one is taken.
    #[must_use]
    pub fn select(&self, ids: &[String]) -> Option<String> {
        let mut best: Option<(&String, f64)> = None;
        for (id, config) in &self.configs {
            if !config.is_applicable(ids) {
                continue;
            }
            let priority = config.priority_for(ids);
            if best.map_or(true, |(_, top)| priority > top) {
                best = Some((id, priority));
            }
        }
        let (best_id, top) = best?;

        let keep_current = self
            .current
            .as_deref()
            .and_then(|id| self.configs.get(id))
            .is_some_and(|config| config.is_applicable(ids) && config.priority_for(ids) >= top);
        if keep_current {
            return self.current.clone();
        }
        Some(best_id.clone())
    }

    fn recompute(&mut self) -> Option<ConfigChange> {
        let selected = self.select(&self.ids);
        self.switch_to(selected)
    }

    fn switch_to(&mut self, next: Option<String>) -> Option<ConfigChange> {
        if next == self.current {
            return None;
        }
        let previous = std::mem::replace(&mut self.current, next);
        debug!(current = ?self.current, previous = ?previous, "Mixing configuration changed");
        Some(ConfigChange {
            current: self.current.clone(),
            previous,
        })
    }
}
