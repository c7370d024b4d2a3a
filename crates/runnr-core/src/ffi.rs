//! The process-wide FFI identifier registry.
//!
//! Guest imports cannot carry a pointer back to the host, so every guest
//! call into the host passes an `ident`: a random `i32` registered for the
//! duration of one `run_e` call. Host functions resolve it here to the
//! [`InstanceSlot`] of the instance serving the job. Unknown identifiers are
//! rejected and logged as a security event.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{trace, warn};

use runnr_common::RunErr;
use runnr_host::Capabilities;

static REGISTRY: Lazy<DashMap<i32, Arc<InstanceSlot>>> = Lazy::new(DashMap::new);

/// Per-instance state shared between the environment and host functions.
///
/// Everything here is set while a job holds the instance and cleared when
/// it is returned to the pool.
#[derive(Default)]
pub struct InstanceSlot {
    capabilities: Mutex<Option<Capabilities>>,
    ffi_result: Mutex<Option<Vec<u8>>>,
    outcome: Mutex<Option<Result<Vec<u8>, RunErr>>>,
}

impl InstanceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bind(&self, capabilities: Capabilities) {
        *self.capabilities.lock() = Some(capabilities);
        *self.ffi_result.lock() = None;
        *self.outcome.lock() = None;
    }

    pub(crate) fn clear(&self) {
        *self.capabilities.lock() = None;
        *self.ffi_result.lock() = None;
        *self.outcome.lock() = None;
    }

    /// The capabilities of the job holding the instance.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities.lock().clone()
    }

    /// Park bytes for the guest to collect with `get_ffi_result`.
    pub fn set_ffi_result(&self, bytes: Vec<u8>) {
        if self.ffi_result.lock().replace(bytes).is_some() {
            warn!("guest did not collect previous FFI result, dropping it");
        }
    }

    /// Take the parked bytes, leaving the slot empty.
    pub fn take_ffi_result(&self) -> Option<Vec<u8>> {
        self.ffi_result.lock().take()
    }

    /// Publish the job's output. Returns false if an outcome was already published.
    pub fn publish_result(&self, bytes: Vec<u8>) -> bool {
        self.publish(Ok(bytes))
    }

    /// Publish the job's error. Returns false if an outcome was already published.
    pub fn publish_error(&self, err: RunErr) -> bool {
        self.publish(Err(err))
    }

    fn publish(&self, outcome: Result<Vec<u8>, RunErr>) -> bool {
        let mut slot = self.outcome.lock();
        if slot.is_some() {
            warn!("guest published more than one outcome, keeping the first");
            return false;
        }
        *slot = Some(outcome);
        true
    }

    pub(crate) fn take_outcome(&self) -> Option<Result<Vec<u8>, RunErr>> {
        self.outcome.lock().take()
    }
}

impl std::fmt::Debug for InstanceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceSlot")
            .field("bound", &self.capabilities.lock().is_some())
            .field("ffi_result", &self.ffi_result.lock().as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

/// A live registration. The identifier is unregistered on drop.
#[derive(Debug)]
pub struct Registration {
    ident: i32,
}

impl Registration {
    pub fn ident(&self) -> i32 {
        self.ident
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        REGISTRY.remove(&self.ident);
        trace!(ident = self.ident, "ffi identifier released");
    }
}

/// Register `slot` under a fresh random identifier in `[0, 2^31)`.
pub fn register(slot: Arc<InstanceSlot>) -> Registration {
    let mut rng = rand::thread_rng();
    loop {
        let ident = rng.gen_range(0..i32::MAX);
        if let Entry::Vacant(entry) = REGISTRY.entry(ident) {
            entry.insert(slot);
            trace!(ident, "ffi identifier registered");
            return Registration { ident };
        }
    }
}

/// The slot registered under `ident`.
pub fn lookup(ident: i32) -> Option<Arc<InstanceSlot>> {
    REGISTRY.get(&ident).map(|entry| entry.value().clone())
}

/// Resolve `ident` for a host call made by the instance owning `caller_slot`.
///
/// An identifier that is unknown, or registered to a different instance,
/// is a security event: it is logged and `None` is returned.
pub fn resolve(ident: i32, caller_slot: &Arc<InstanceSlot>) -> Option<Arc<InstanceSlot>> {
    match lookup(ident) {
        Some(slot) if Arc::ptr_eq(&slot, caller_slot) => Some(slot),
        _ => {
            warn!(ident, "invalid identifier used, potential malicious activity");
            None
        }
    }
}

pub fn is_registered(ident: i32) -> bool {
    REGISTRY.contains_key(&ident)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_release() {
        let slot = Arc::new(InstanceSlot::new());
        let registration = register(slot.clone());
        let ident = registration.ident();

        assert!(ident >= 0);
        assert!(is_registered(ident));
        assert!(Arc::ptr_eq(&lookup(ident).unwrap(), &slot));

        drop(registration);
        assert!(!is_registered(ident));
        assert!(lookup(ident).is_none());
    }

    #[test]
    fn test_resolve_rejects_other_instance() {
        let mine = Arc::new(InstanceSlot::new());
        let theirs = Arc::new(InstanceSlot::new());
        let registration = register(theirs);

        assert!(resolve(registration.ident(), &mine).is_none());
        assert!(resolve(-7, &mine).is_none());

        let own = register(mine.clone());
        assert!(resolve(own.ident(), &mine).is_some());
    }

    #[test]
    fn test_identifiers_are_unique() {
        let slot = Arc::new(InstanceSlot::new());
        let registrations: Vec<_> = (0..256).map(|_| register(slot.clone())).collect();

        let mut idents: Vec<i32> = registrations.iter().map(Registration::ident).collect();
        idents.sort_unstable();
        idents.dedup();
        assert_eq!(idents.len(), 256);
    }

    #[test]
    fn test_first_outcome_wins() {
        let slot = InstanceSlot::new();
        assert!(slot.publish_error(RunErr::new(400, "bad")));
        assert!(!slot.publish_result(b"late".to_vec()));

        assert_eq!(slot.take_outcome(), Some(Err(RunErr::new(400, "bad"))));
        assert_eq!(slot.take_outcome(), None);
    }

    #[test]
    fn test_ffi_result_is_single_use() {
        let slot = InstanceSlot::new();
        slot.set_ffi_result(b"one".to_vec());
        slot.set_ffi_result(b"two".to_vec());

        assert_eq!(slot.take_ffi_result().unwrap(), b"two");
        assert!(slot.take_ffi_result().is_none());
    }

    #[test]
    fn test_clear_resets_everything() {
        let slot = InstanceSlot::new();
        slot.bind(Capabilities::default_enabled());
        slot.set_ffi_result(vec![1]);
        slot.publish_result(vec![2]);

        slot.clear();
        assert!(slot.capabilities().is_none());
        assert!(slot.take_ffi_result().is_none());
        assert!(slot.take_outcome().is_none());
    }
}
