//! In-memory item set with per-item atomic claims
//!
//! The map lock only guards membership and is never held while a claim is
//! outstanding; two different items can be claimed and settled in parallel.

use super::{PaymentId, PendingPayment, QueueError, Resolution};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

const OPEN: u8 = 0;
const CLAIMED: u8 = 1;
const RESOLVED: u8 = 2;

struct Slot {
    item: PendingPayment,
    checked: AtomicBool,
    status: AtomicU8,
    resolution: Mutex<Option<Resolution>>,
}

impl Slot {
    fn new(item: PendingPayment) -> Self {
        Self {
            checked: AtomicBool::new(item.checked),
            item,
            status: AtomicU8::new(OPEN),
            resolution: Mutex::new(None),
        }
    }

    fn snapshot(&self) -> PendingPayment {
        let mut item = self.item.clone();
        item.checked = self.checked.load(Ordering::Acquire);
        item
    }

    fn is_unresolved(&self) -> bool {
        self.status.load(Ordering::Acquire) != RESOLVED
    }
}

/// Pending payments, ordered by id (ids are handed out in submission order)
#[derive(Default)]
pub struct ApprovalQueue {
    slots: RwLock<BTreeMap<PaymentId, Arc<Slot>>>,
}

impl ApprovalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the queue from stored unresolved items
    pub fn restore(items: impl IntoIterator<Item = PendingPayment>) -> Self {
        let queue = Self::new();
        for item in items {
            queue.enqueue(item);
        }
        queue
    }

    /// Add a stored item. Re-adding a known id keeps the existing entry.
    pub fn enqueue(&self, item: PendingPayment) -> PaymentId {
        let id = item.id;
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert_with(|| Arc::new(Slot::new(item)));
        id
    }

    fn slot(&self, id: PaymentId) -> Result<Arc<Slot>, QueueError> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(QueueError::NotFound(id))
    }

    pub fn get(&self, id: PaymentId) -> Option<PendingPayment> {
        self.slot(id).ok().map(|slot| slot.snapshot())
    }

    /// Unresolved items in insertion order. Items claimed by an in-flight
    /// resolution are still listed until the resolution commits.
    pub fn list_unresolved(&self) -> Vec<PendingPayment> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.is_unresolved())
            .map(|slot| slot.snapshot())
            .collect()
    }

    pub fn is_unresolved(&self, id: PaymentId) -> bool {
        self.slot(id).is_ok_and(|slot| slot.is_unresolved())
    }

    pub fn resolution(&self, id: PaymentId) -> Option<Resolution> {
        let slot = self.slot(id).ok()?;
        let resolution = slot
            .resolution
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        resolution
    }

    /// Flag an item as shown to a reviewer. Returns true only on the first call
    /// for an unresolved item.
    pub fn mark_checked(&self, id: PaymentId) -> bool {
        match self.slot(id) {
            Ok(slot) if slot.is_unresolved() => !slot.checked.swap(true, Ordering::AcqRel),
            _ => false,
        }
    }

    /// Take exclusive right to resolve an item.
    ///
    /// Exactly one caller wins per item; everyone else gets `AlreadyResolved`
    /// until the winner drops its claim without committing.
    pub fn claim(&self, id: PaymentId) -> Result<Claim, QueueError> {
        let slot = self.slot(id)?;
        slot.status
            .compare_exchange(OPEN, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| QueueError::AlreadyResolved(id))?;
        Ok(Claim {
            slot,
            settled: false,
        })
    }

    /// Claim and commit in one step, for resolutions without side effects
    #[cfg(test)]
    pub fn resolve(&self, id: PaymentId, resolution: Resolution) -> Result<(), QueueError> {
        self.claim(id)?.commit(resolution);
        Ok(())
    }
}

/// Exclusive right to resolve one item. Dropping it without `commit` reopens the item.
pub struct Claim {
    slot: Arc<Slot>,
    settled: bool,
}

impl Claim {
    pub fn item(&self) -> &PendingPayment {
        &self.slot.item
    }

    pub fn commit(mut self, resolution: Resolution) {
        *self
            .slot
            .resolution
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(resolution);
        self.slot.status.store(RESOLVED, Ordering::Release);
        self.settled = true;
    }

    /// Close an item that turned out to be settled outside this queue
    pub fn retire(mut self) {
        self.slot.status.store(RESOLVED, Ordering::Release);
        self.settled = true;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.settled {
            self.slot.status.store(OPEN, Ordering::Release);
        }
    }
}
