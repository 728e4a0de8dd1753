use std::sync::Arc;

use dashmap::DashMap;

/// Name → handler map. Lookups hand out a clone of the `Arc` so a handler
/// can run without holding any map lock.
pub struct HandlerRegistry<H: ?Sized> {
    handlers: DashMap<String, Arc<H>>,
}

impl<H: ?Sized> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ?Sized> HandlerRegistry<H> {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Returns the handler previously registered under `name`.
    pub fn register(&self, name: &str, handler: Arc<H>) -> Option<Arc<H>> {
        self.handlers.insert(name.to_string(), handler)
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<H>> {
        self.handlers.remove(name).map(|(_, h)| h)
    }

    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        self.handlers.get(name).map(|h| h.value().clone())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
