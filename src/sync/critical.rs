use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Mutual exclusion for `critical` sections.  The unnamed section is one lock; every name gets a
/// lock of its own, created the first time the name is used.
#[derive(Default)]
pub struct CriticalSections {
    anonymous: Mutex<()>,
    named: spin::RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl CriticalSections {
    pub fn new() -> Self {
        Self::default()
    }

    fn named_lock(&self, name: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.named.read().get(name) {
            return lock.clone();
        }
        self.named
            .write()
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    /// Run `f` while holding the lock of section `name`, or of the unnamed section.
    ///
    /// Sections are not reentrant.  Entering a section the thread already holds deadlocks.
    pub fn run<R>(&self, name: Option<&str>, f: impl FnOnce() -> R) -> R {
        match name {
            None => {
                // A panic inside a section aborts the run, so a poisoned lock has nothing to
                // protect.
                let _guard = self.anonymous.lock().unwrap_or_else(|e| e.into_inner());
                f()
            }
            Some(name) => {
                let lock = self.named_lock(name);
                let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                f()
            }
        }
    }

    /// Number of distinct names used so far.
    pub fn named_sections(&self) -> usize {
        self.named.read().len()
    }
}
