//! Reviewer-facing operations over the approval queue

use super::{
    ApprovalQueue, Decision, NewPayment, PaymentId, PendingPayment, QueueError, Resolution,
    ReviewerCursor,
};
use crate::identity::Identity;
use crate::runtime::{BackendError, PaymentStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// What a reviewer sees after browsing or paging
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorStep {
    Item(PendingPayment),
    /// Past the last item; a normal end of browsing, not an error
    Exhausted,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("failed to settle payment {id}: {source}")]
    Settle {
        id: PaymentId,
        #[source]
        source: BackendError,
    },
}

/// Queue plus per-reviewer cursors plus the store that archives decisions
pub struct ReviewDesk {
    queue: Arc<ApprovalQueue>,
    payments: Arc<dyn PaymentStore>,
    cursors: Mutex<HashMap<Identity, ReviewerCursor>>,
}

impl ReviewDesk {
    pub fn new(queue: Arc<ApprovalQueue>, payments: Arc<dyn PaymentStore>) -> Self {
        Self {
            queue,
            payments,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &Arc<ApprovalQueue> {
        &self.queue
    }

    /// Store a new submission and make it visible to reviewers
    pub async fn submit(&self, payment: NewPayment) -> Result<PaymentId, BackendError> {
        let stored = self.payments.insert(payment).await?;
        let id = self.queue.enqueue(stored);
        tracing::info!(payment_id = %id, "Payment queued for review");
        Ok(id)
    }

    /// Start (or restart) browsing from a fresh snapshot of unresolved items
    pub async fn browse(&self, reviewer: Identity) -> CursorStep {
        let ids = self.queue.list_unresolved().iter().map(|p| p.id).collect();
        let mut cursor = ReviewerCursor::new(ids);
        let current = cursor.settle(|id| self.queue.is_unresolved(id));
        self.cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reviewer, cursor);
        self.show(current).await
    }

    /// Page forward, skipping anything resolved since the snapshot was taken
    pub async fn next(&self, reviewer: Identity) -> CursorStep {
        let current = {
            let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
            cursors
                .get_mut(&reviewer)
                .and_then(|cursor| cursor.advance(|id| self.queue.is_unresolved(id)))
        };
        self.show(current).await
    }

    /// Drop the reviewer's cursor. Items are left untouched.
    pub fn stop(&self, reviewer: Identity) -> bool {
        self.cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&reviewer)
            .is_some()
    }

    async fn show(&self, current: Option<PaymentId>) -> CursorStep {
        let Some(id) = current else {
            return CursorStep::Exhausted;
        };
        if self.queue.mark_checked(id) {
            if let Err(e) = self.payments.mark_checked(id).await {
                tracing::warn!(payment_id = %id, error = %e, "Failed to persist checked flag");
            } else {
                tracing::info!(payment_id = %id, "Payment viewed");
            }
        }
        self.queue
            .get(id)
            .map_or(CursorStep::Exhausted, CursorStep::Item)
    }

    /// Resolve an item exactly once.
    ///
    /// The claim is taken before the store is touched, so a concurrent reviewer
    /// fails fast with `AlreadyResolved` instead of waiting on the store. If the
    /// store fails, the claim is released and the item can be resolved again.
    pub async fn resolve(
        &self,
        id: PaymentId,
        decision: Decision,
        resolver: Identity,
        resolver_name: String,
    ) -> Result<(PendingPayment, Resolution), ResolveError> {
        let claim = self.queue.claim(id)?;
        let resolution = Resolution {
            decision,
            resolver,
            resolver_name,
            resolved_at: Utc::now(),
        };

        match self.payments.settle(claim.item(), &resolution).await {
            Ok(()) => {
                let item = claim.item().clone();
                claim.commit(resolution.clone());
                tracing::info!(
                    payment_id = %id,
                    decision = decision.as_str(),
                    resolver = %resolver,
                    student = %item.student,
                    lessons = item.lessons,
                    "Payment resolved"
                );
                Ok((item, resolution))
            }
            Err(BackendError::Conflict(reason)) => {
                tracing::warn!(payment_id = %id, %reason, "Payment already settled in store");
                claim.retire();
                Err(QueueError::AlreadyResolved(id).into())
            }
            Err(source) => {
                tracing::error!(payment_id = %id, error = %source, "Failed to settle payment");
                drop(claim);
                Err(ResolveError::Settle { id, source })
            }
        }
    }
}
