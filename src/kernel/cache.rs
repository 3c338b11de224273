//! Per-device compiled kernel cache.
//!
//! Kernels are keyed by their canonical `name(config)` string and never
//! evicted. The map lock is only held long enough to find or create a key's
//! slot; compilation happens under the slot's own lock, so each key compiles
//! at most once while lookups of other keys proceed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, trace};

use crate::error::Result;

type Slot<K> = Arc<Mutex<Option<Arc<K>>>>;

pub struct KernelCache<K> {
    slots: Mutex<HashMap<String, Slot<K>>>,
}

impl<K> Default for KernelCache<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> KernelCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the kernel cached under `key`, compiling it with `compile` on
    /// a miss. A failed compilation leaves nothing behind for the key.
    pub fn get_or_compile(&self, key: &str, compile: impl FnOnce() -> Result<K>) -> Result<Arc<K>> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.to_owned()).or_default())
        };
        let mut entry = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(kernel) = entry.as_ref() {
            trace!("kernel cache hit: {key}");
            return Ok(Arc::clone(kernel));
        }
        debug!("compiling kernel {key}");
        let kernel = Arc::new(compile()?);
        *entry = Some(Arc::clone(&kernel));
        Ok(kernel)
    }

    /// Number of successfully compiled kernels.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .values()
            .filter(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn compiles_once_per_key() {
        let cache = KernelCache::new();
        let compiled = AtomicUsize::new(0);
        let compile = || {
            compiled.fetch_add(1, Ordering::SeqCst);
            Ok(42_u32)
        };
        let a = cache.get_or_compile("k(dtype=float32)", compile).unwrap();
        let b = cache.get_or_compile("k(dtype=float32)", compile).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(compiled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_compile_is_not_cached() {
        let cache: KernelCache<u32> = KernelCache::new();
        let err = cache.get_or_compile("bad", || Err(Error::UnknownKernel("bad".into())));
        assert!(err.is_err());
        assert!(cache.is_empty());
        let ok = cache.get_or_compile("bad", || Ok(1)).unwrap();
        assert_eq!(*ok, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_lookups_share_one_instance() {
        let cache = Arc::new(KernelCache::new());
        let compiled = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let compiled = Arc::clone(&compiled);
                std::thread::spawn(move || {
                    cache
                        .get_or_compile("shared", || {
                            compiled.fetch_add(1, Ordering::SeqCst);
                            Ok(String::from("kernel"))
                        })
                        .unwrap()
                })
            })
            .collect();
        let kernels: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(kernels.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(compiled.load(Ordering::SeqCst), 1);
    }
}
