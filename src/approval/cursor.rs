//! Per-reviewer browsing snapshot

use super::PaymentId;

/// Snapshot of unresolved ids taken when a reviewer starts browsing, plus a position.
///
/// Not authoritative: items resolved by someone else are skipped lazily when the
/// cursor reaches them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewerCursor {
    ids: Vec<PaymentId>,
    index: usize,
}

impl ReviewerCursor {
    pub fn new(ids: Vec<PaymentId>) -> Self {
        Self { ids, index: 0 }
    }

    /// Move forward to the first still-open id at or after the current position
    pub fn settle(&mut self, is_open: impl Fn(PaymentId) -> bool) -> Option<PaymentId> {
        while let Some(&id) = self.ids.get(self.index) {
            if is_open(id) {
                return Some(id);
            }
            self.index += 1;
        }
        None
    }

    /// Step past the current item, then settle
    pub fn advance(&mut self, is_open: impl Fn(PaymentId) -> bool) -> Option<PaymentId> {
        if self.index < self.ids.len() {
            self.index += 1;
        }
        self.settle(is_open)
    }

    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        self.ids.len().saturating_sub(self.index)
    }
}
