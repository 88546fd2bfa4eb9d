//! Memoization keyed on the inventory revision.

use anyhow::Result;

/// Holds one value derived from a [`crate::DeviceGraph`], valid for as
/// long as the graph revision it was computed from stays current.
#[derive(Debug, Default)]
pub struct RevisionCache<T> {
    entry: Option<(u64, T)>,
}

impl<T: Clone> RevisionCache<T> {
    /// An empty cache.
    pub fn new() -> Self {
        Self { entry: None }
    }

    /// Return the cached value for `revision`, computing it with `f` if
    /// the cache is empty or was filled for another revision.
    pub fn get_or_try_insert_with(
        &mut self,
        revision: u64,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        if let Some((cached, v)) = &self.entry {
            if *cached == revision {
                return Ok(v.clone());
            }
            tracing::debug!("Inventory revision changed {cached} -> {revision}; recomputing");
        }
        let v = f()?;
        self.entry = Some((revision, v.clone()));
        Ok(v)
    }

    /// Drop the cached value.
    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    /// The revision the cached value belongs to.
    pub fn revision(&self) -> Option<u64> {
        self.entry.as_ref().map(|e| e.0)
    }
}
