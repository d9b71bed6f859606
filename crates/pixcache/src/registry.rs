//! Loader capacity registry
//!
//! Owns the loader instance for a process and its memory budget. The cache
//! capacity is a fraction of that budget; asking for a larger fraction
//! replaces the loader with a wider one, asking for a smaller or equal
//! fraction returns the existing instance untouched.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::loader::ImageLoader;

/// Smallest allowed fraction of the memory budget
pub const MIN_MEMORY_FACTOR: f64 = 0.125;
/// Largest allowed fraction of the memory budget
pub const MAX_MEMORY_FACTOR: f64 = 0.5;

#[derive(Default)]
struct RegistryState {
    /// Factor the current loader was built with; 0.0 before the first build
    factor: f64,
    loader: Option<Arc<ImageLoader>>,
}

/// Hands out [`ImageLoader`] instances with widening-only capacity
///
/// Pass the registry around explicitly; there is no global instance.
pub struct LoaderRegistry {
    /// Total memory budget in bytes the factor applies to
    budget: usize,
    state: Mutex<RegistryState>,
}

impl LoaderRegistry {
    /// Registry over an explicit memory budget in bytes
    pub fn new(memory_budget: usize) -> Self {
        Self {
            budget: memory_budget,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Loader at the minimum memory factor
    pub fn get(&self) -> Arc<ImageLoader> {
        self.widen(MIN_MEMORY_FACTOR)
    }

    /// Loader with a cache of at least `factor` times the budget
    ///
    /// The factor is clamped to `[0.125, 0.5]`. A clamped factor above the
    /// current one rebuilds the loader at the wider capacity; anything
    /// else returns the instance already in place.
    pub fn widen(&self, factor: f64) -> Arc<ImageLoader> {
        let factor = factor.clamp(MIN_MEMORY_FACTOR, MAX_MEMORY_FACTOR);

        let mut state = self.state.lock().unwrap();
        match &state.loader {
            Some(loader) if factor <= state.factor => Arc::clone(loader),
            _ => {
                let capacity = (self.budget as f64 * factor) as usize;
                debug!(factor, capacity, "building image loader");
                let loader = Arc::new(ImageLoader::new(capacity));
                state.factor = factor;
                state.loader = Some(Arc::clone(&loader));
                loader
            }
        }
    }

    /// The loader currently in place, if one was ever requested
    pub fn current(&self) -> Option<Arc<ImageLoader>> {
        self.state.lock().unwrap().loader.clone()
    }

    /// Memory budget the factors apply to
    pub fn budget(&self) -> usize {
        self.budget
    }
}

impl std::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("LoaderRegistry")
            .field("budget", &self.budget)
            .field("factor", &state.factor)
            .field("built", &state.loader.is_some())
            .finish()
    }
}
