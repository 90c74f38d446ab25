//! Export key to interceptor mapping.
//!
//! Reads vastly outnumber writes: every typed call looks its export up, while
//! registrations happen a handful of times during startup. The map lives
//! behind a [`parking_lot::RwLock`]; entries are reference counted and cloned
//! out, so interceptors never run with the lock held.
//!
//! Raw interceptors of forward exports are also published into the export's
//! [`Slot`]: registration, unregistration and binding all take the write lock,
//! so the slot target always reflects the registry state.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::abi::{ExportFn, RawFn};
use crate::error::RegistrationError;
use crate::surface::{ExportKey, Slot};

/// What runs in place of the genuine export.
#[derive(Clone)]
pub enum Interceptor {
    /// A function with the exact signature of the export.
    Raw(RawFn),
    /// A [`Handler`](crate::dispatch::Handler) for the export's signature.
    Typed(Arc<dyn Any + Send + Sync>),
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interceptor::Raw(raw) => f.debug_tuple("Raw").field(raw).finish(),
            Interceptor::Typed(_) => f.write_str("Typed"),
        }
    }
}

/// A registered interceptor.
#[derive(Debug)]
pub struct CallbackEntry {
    slot: &'static Slot,
    interceptor: Interceptor,
}

impl CallbackEntry {
    /// Intercepted export.
    pub fn key(&self) -> ExportKey {
        self.slot.key()
    }

    /// The interceptor.
    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }
}

/// Yields the address of the genuine export once the library is resolved.
#[derive(Debug, Clone, Copy)]
pub struct OriginalAccessor {
    slot: &'static Slot,
}

impl OriginalAccessor {
    pub(crate) fn new(slot: &'static Slot) -> Self {
        Self { slot }
    }

    /// Export this accessor refers to.
    pub fn key(&self) -> ExportKey {
        self.slot.key()
    }

    /// Whether the genuine export has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.slot.is_bound()
    }

    /// Address of the genuine export.
    pub fn get(&self) -> Result<RawFn, RegistrationError> {
        self.slot
            .original()
            .ok_or_else(|| RegistrationError::NotYetResolved(self.key().to_string()))
    }

    /// The genuine export as a typed function pointer.
    ///
    /// # Safety
    ///
    /// `F` must be the exact signature of the export.
    pub unsafe fn get_as<F: ExportFn>(&self) -> Result<F, RegistrationError> {
        self.get().map(|raw| unsafe { F::from_raw(raw) })
    }
}

/// Registered interceptors, at most one per export.
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<ExportKey, Arc<CallbackEntry>>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `interceptor` for the export backed by `slot`.
    pub fn insert(
        &self,
        slot: &'static Slot,
        interceptor: Interceptor,
    ) -> Result<OriginalAccessor, RegistrationError> {
        let key = slot.key();
        let mut entries = self.entries.write();

        if entries.contains_key(&key) {
            return Err(RegistrationError::DuplicateName(key.to_string()));
        }

        if let (Interceptor::Raw(raw), true) = (&interceptor, slot.is_bound()) {
            slot.retarget(*raw);
        }

        debug!("registered {interceptor:?} for {key}");
        entries.insert(key, Arc::new(CallbackEntry { slot, interceptor }));

        Ok(OriginalAccessor::new(slot))
    }

    /// Remove the interceptor of `key`, restoring direct forwarding.
    pub fn remove(&self, key: &ExportKey) -> Option<Arc<CallbackEntry>> {
        let entry = self.entries.write().remove(key)?;
        if let Some(original) = entry.slot.original() {
            entry.slot.retarget(original);
        }
        debug!("unregistered {key}");
        Some(entry)
    }

    /// Interceptor registered for `key`.
    pub fn get(&self, key: &ExportKey) -> Option<Arc<CallbackEntry>> {
        self.entries.read().get(key).cloned()
    }

    /// Whether an interceptor is registered for `key`.
    pub fn contains(&self, key: &ExportKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Number of registered interceptors.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no interceptors are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Bind slots to their genuine exports. The trampoline target is the raw
    /// interceptor of the export if there is one, the genuine export
    /// otherwise.
    pub(crate) fn bind(&self, bindings: &[(&'static Slot, RawFn)]) {
        let entries = self.entries.write();
        for &(slot, original) in bindings {
            let target = match entries.get(&slot.key()).map(|entry| &entry.interceptor) {
                Some(Interceptor::Raw(raw)) => *raw,
                _ => original,
            };
            slot.bind(original, target);
        }
    }

    /// Remove every interceptor, restoring direct forwarding for bound slots.
    pub(crate) fn clear(&self) {
        let mut entries = self.entries.write();
        for entry in entries.values() {
            if let Some(original) = entry.slot.original() {
                entry.slot.retarget(original);
            }
        }
        entries.clear();
    }
}
