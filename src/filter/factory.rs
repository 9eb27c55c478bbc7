//! Explicit filter registry.
//!
//! Concrete filter constructors are registered at engine setup, not via
//! static initializers, so the set of available filters is visible at one
//! call site and registration order is well defined.

use super::{Filter, FilterType};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Constructor for a concrete filter, given its instance name.
pub type FilterGenerator = Box<dyn Fn(&str) -> Arc<Filter> + Send + Sync>;

/// Registry mapping [`FilterType`] to a constructor.
#[derive(Default)]
pub struct FilterFactory {
    generators: RwLock<HashMap<FilterType, FilterGenerator>>,
}

impl FilterFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `filter_type`.
    ///
    /// Last registration wins: re-registering a type replaces the previous
    /// constructor, and the return value says whether one was replaced.
    pub fn register(&self, filter_type: FilterType, generator: FilterGenerator) -> bool {
        let replaced = self
            .generators
            .write()
            .unwrap()
            .insert(filter_type, generator)
            .is_some();
        if replaced {
            tracing::debug!(?filter_type, "filter generator replaced");
        }
        replaced
    }

    /// Remove the constructor for `filter_type`, if any.
    pub fn unregister(&self, filter_type: FilterType) -> bool {
        self.generators.write().unwrap().remove(&filter_type).is_some()
    }

    /// True if a constructor is registered for `filter_type`.
    pub fn is_registered(&self, filter_type: FilterType) -> bool {
        self.generators.read().unwrap().contains_key(&filter_type)
    }

    /// Instantiate a filter of `filter_type` named `name`.
    pub fn create_filter(&self, name: &str, filter_type: FilterType) -> Result<Arc<Filter>> {
        let generators = self.generators.read().unwrap();
        let generator = generators
            .get(&filter_type)
            .ok_or_else(|| Error::NotRegistered(format!("{filter_type:?}")))?;
        Ok(generator(name))
    }
}

impl std::fmt::Debug for FilterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.generators.read().unwrap().len();
        f.debug_struct("FilterFactory")
            .field("registered", &count)
            .finish()
    }
}
