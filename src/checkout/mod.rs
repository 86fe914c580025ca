// Checkout core: pricing, vouchers, orders and payment reconciliation

pub mod cart;
pub mod countdown;
pub mod gateway;
pub mod merchant;
pub mod order;
pub mod order_store;
pub mod pricing;
pub mod reconciler;
pub mod service;
pub mod voucher;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

pub use self::cart::{Cart, CartItem, CustomerSession, Identity};
pub use self::countdown::ExpiryCountdown;
pub use self::gateway::{CheckoutGateway, GatewayError};
pub use self::order::{Order, OrderId, PaymentMethod, PaymentStatus};
pub use self::order_store::OrderStore;
pub use self::reconciler::{CheckOutcome, PaymentReconciler, ResumeOutcome};
pub use self::service::{CheckoutError, CheckoutService, PlacedOrder};

/// Set of keys with an operation in progress.
#[derive(Debug)]
pub(crate) struct KeySet<K> {
    inner: Arc<Mutex<HashSet<K>>>,
}

impl<K> Clone for KeySet<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash + Clone> KeySet<K> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Claim `key`; `None` while another holder has it. The claim is
    /// released when the guard drops.
    pub(crate) fn try_claim(&self, key: &K) -> Option<KeyGuard<K>> {
        let mut keys = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(KeyGuard {
            set: Arc::clone(&self.inner),
            key: key.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &K) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

pub(crate) struct KeyGuard<K: Eq + Hash> {
    set: Arc<Mutex<HashSet<K>>>,
    key: K,
}

impl<K: Eq + Hash> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_set_releases_on_drop() {
        let set: KeySet<String> = KeySet::new();
        let key = "order-1".to_string();

        let guard = set.try_claim(&key).unwrap();
        assert!(set.try_claim(&key).is_none());
        assert!(set.contains(&key));

        drop(guard);
        assert!(!set.contains(&key));
        assert!(set.try_claim(&key).is_some());
    }
}
