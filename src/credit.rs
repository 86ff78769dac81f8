//! Converts "message delivered" / "message settled" events on one receiver
//! link into decisions to add flow credit back, bounding the number of
//! unsettled messages the application can be holding at once.

use std::collections::HashSet;
use std::sync::Arc;

use fe2o3_amqp::link::{Delivery, Receiver};
use fe2o3_amqp_types::definitions::{self, ReceiverSettleMode, SequenceNo};
use fe2o3_amqp_types::messaging::{message::Body, Modified};
use fe2o3_amqp_types::primitives::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::ReceiveMode;
use crate::error::{LinkError, ServiceBusError};
use crate::lock_token::LockToken;

/// A receiver link shared between the owning streaming/batch receiver and
/// its [`CreditManager`]: `recv`/`set_credit` need exclusive access, while
/// `accept`/`reject`/`modify` only need a shared reference, so a single
/// async mutex covers every caller uniformly.
pub type SharedReceiver = Arc<AsyncMutex<Receiver>>;

/// The receiver-settle-mode + credit policy a [`CreditManager`] derives for
/// its receive mode. Exposed so link builders can apply it at attach time.
#[derive(Debug, Clone, Copy)]
pub struct LinkPolicy {
    /// The `rcv-settle-mode` to attach the link with.
    pub settle_mode: ReceiverSettleMode,
    /// The initial credit quantum to grant once the link is attached.
    pub initial_credit: u32,
}

/// Per-receiver-link credit bookkeeping.
///
/// In peek-lock mode the broker must not redeliver a message until its lock
/// expires, so we cap the number of outstanding (unsettled) deliveries at
/// `initial_credit` and replenish one credit for every message that finally
/// gets settled, whether immediately or after a delayed settle.
pub struct CreditManager {
    mode: ReceiveMode,
    initial_credit: u32,
    threshold: u32,
    receiver: parking_lot::Mutex<Option<SharedReceiver>>,
    pending: parking_lot::Mutex<HashSet<[u8; 16]>>,
    additional_credits: std::sync::atomic::AtomicU32,
}

impl CreditManager {
    /// Builds a credit manager for the given receive mode and concurrency budget.
    pub fn new(mode: ReceiveMode, initial_credit: u32, threshold: u32) -> Self {
        CreditManager {
            mode,
            initial_credit,
            threshold,
            receiver: parking_lot::Mutex::new(None),
            pending: parking_lot::Mutex::new(HashSet::new()),
            additional_credits: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// The link policy this credit manager requires; apply before attaching.
    pub fn link_policy(&self) -> LinkPolicy {
        match self.mode {
            ReceiveMode::PeekLock => LinkPolicy {
                settle_mode: ReceiverSettleMode::Second,
                initial_credit: self.initial_credit,
            },
            ReceiveMode::ReceiveAndDelete => LinkPolicy {
                settle_mode: ReceiverSettleMode::First,
                initial_credit: self.initial_credit,
            },
        }
    }

    /// Binds this credit manager to the receiver link it was built for, and
    /// grants the initial credit quantum.
    pub async fn set_receiver(&self, receiver: SharedReceiver) -> Result<(), ServiceBusError> {
        let initial = self.initial_credit as SequenceNo;
        if initial > 0 {
            let mut guard = receiver.lock().await;
            guard.set_credit(initial).await.map_err(|_| {
                ServiceBusError::from(LinkError::Detach(Some(
                    "failed to grant initial credit".into(),
                )))
            })?;
        }
        *self.receiver.lock() = Some(receiver);
        Ok(())
    }

    /// Schedules a message for delayed settlement: the credit is accounted
    /// for now even though the disposition itself will happen later.
    pub async fn schedule_message_settle(&self, token: LockToken) {
        let inserted = self.pending.lock().insert(token.0);
        if inserted {
            self.additional_credits
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let _ = self.refresh_credits().await;
        }
    }

    /// Called once a message actually settles (immediately, or as the
    /// delayed-settle timer fires). If the token was already accounted for
    /// via [`Self::schedule_message_settle`] this is a no-op for credit
    /// purposes; otherwise it accounts for the credit itself.
    pub async fn settle_message(&self, token: LockToken) {
        let was_pending = self.pending.lock().remove(&token.0);
        if !was_pending {
            self.additional_credits
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let _ = self.refresh_credits().await;
        }
    }

    /// Flushes accumulated credit back to the link once enough deliveries
    /// have settled since the last refresh to cross `threshold`; otherwise
    /// this is a no-op, so that the link's outstanding credit never rises
    /// above `initial_credit` between refreshes. Silently does nothing if
    /// the link has detached (sending flow on a detached link is an AMQP
    /// protocol error, not an application-visible failure); fails loudly
    /// only if no link was ever bound at all.
    ///
    /// `set_credit` sets the link's outstanding credit to an *absolute*
    /// value, not an additive one (see the teacher's own `CreditMode::Auto`
    /// handling in `link/receiver.rs`, which resets a `processed` counter on
    /// every `set_credit` call and only re-sends flow once `processed`
    /// crosses half of `max_credit`). So once accumulated settles cross the
    /// threshold, this refills to the full `initial_credit` quantum rather
    /// than to the count of newly-settled messages; sending the latter would
    /// shrink the outstanding window on every refresh instead of topping it
    /// back up.
    pub async fn refresh_credits(&self) -> Result<(), ServiceBusError> {
        let receiver = self.receiver.lock().clone();
        let Some(receiver) = receiver else {
            return Err(LinkError::NotFound.into());
        };

        let settled_since_refresh = self
            .additional_credits
            .load(std::sync::atomic::Ordering::SeqCst);
        if settled_since_refresh < self.threshold {
            return Ok(());
        }

        let mut guard = receiver.lock().await;
        match guard.set_credit(self.initial_credit as SequenceNo).await {
            Ok(()) => {
                self.additional_credits
                    .store(0, std::sync::atomic::Ordering::SeqCst);
                #[cfg(feature = "tracing")]
                tracing::trace!(
                    credits = self.initial_credit,
                    settled_since_refresh,
                    "replenished receiver credit"
                );
                #[cfg(feature = "log")]
                log::trace!(
                    "replenished receiver credit: credits={} settled_since_refresh={settled_since_refresh}",
                    self.initial_credit
                );
                Ok(())
            }
            Err(_) => {
                // Link state != attached: flow on a detached link is a
                // protocol error, not an application error. Swallow it.
                Ok(())
            }
        }
    }

    /// The configured refresh threshold, exposed for tests and for the
    /// streaming receiver's own bookkeeping.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Number of deliveries currently scheduled for delayed settlement.
    /// Exposed so a [`crate::receiver::streaming::MessageListener`] can
    /// report `pendingSettleCount`.
    pub fn pending_count(&self) -> u32 {
        self.pending.lock().len() as u32
    }

    fn bound_receiver(&self) -> Result<SharedReceiver, ServiceBusError> {
        self.receiver
            .lock()
            .clone()
            .ok_or_else(|| LinkError::NotFound.into())
    }

    /// Accepts a delivery on the bound receiver link (`complete`).
    pub async fn accept(&self, delivery: &Delivery<Body<Value>>) -> Result<(), ServiceBusError> {
        let receiver = self.bound_receiver()?;
        let guard = receiver.lock().await;
        guard
            .accept(delivery)
            .await
            .map_err(|_| LinkError::Detach(Some("accept failed".into())).into())
    }

    /// Releases a delivery back to the broker for immediate redelivery (`abandon`).
    pub async fn release(&self, delivery: &Delivery<Body<Value>>) -> Result<(), ServiceBusError> {
        let receiver = self.bound_receiver()?;
        let guard = receiver.lock().await;
        guard
            .modify(
                delivery,
                Modified {
                    delivery_failed: Some(true),
                    undeliverable_here: None,
                    message_annotations: None,
                },
            )
            .await
            .map_err(|_| LinkError::Detach(Some("release failed".into())).into())
    }

    /// Rejects a delivery into the entity's dead-letter sub-queue (`dead_letter`).
    pub async fn dead_letter(
        &self,
        delivery: &Delivery<Body<Value>>,
        description: Option<String>,
    ) -> Result<(), ServiceBusError> {
        let receiver = self.bound_receiver()?;
        let guard = receiver.lock().await;
        let error = definitions::Error::new(
            definitions::ErrorCondition::Custom("com.microsoft:dead-letter-requested".into()),
            description,
            None,
        );
        guard
            .reject(delivery, Some(error))
            .await
            .map_err(|_| LinkError::Detach(Some("reject failed".into())).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_policy_peek_lock_uses_settle_on_disposition() {
        let mgr = CreditManager::new(ReceiveMode::PeekLock, 4, 2);
        let policy = mgr.link_policy();
        assert!(matches!(policy.settle_mode, ReceiverSettleMode::Second));
        assert_eq!(policy.initial_credit, 4);
    }

    #[test]
    fn link_policy_receive_and_delete_is_pass_through() {
        let mgr = CreditManager::new(ReceiveMode::ReceiveAndDelete, 10, 5);
        let policy = mgr.link_policy();
        assert!(matches!(policy.settle_mode, ReceiverSettleMode::First));
    }

    #[tokio::test]
    async fn refresh_without_bound_receiver_fails_with_not_found() {
        let mgr = CreditManager::new(ReceiveMode::PeekLock, 1, 1);
        let err = mgr.refresh_credits().await.unwrap_err();
        assert_eq!(err.name(), "Link.NotFound");
    }

    #[test]
    fn scheduling_same_token_twice_only_counts_once() {
        // Exercised indirectly through the HashSet discipline: `insert`
        // returns `false` on the second call for the same token, so credit
        // is only counted once regardless of how many times a caller (in
        // error) tries to schedule the same message.
        let mut set: HashSet<[u8; 16]> = HashSet::new();
        assert!(set.insert([1u8; 16]));
        assert!(!set.insert([1u8; 16]));
    }
}
