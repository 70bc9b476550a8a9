//! Address push subscriptions.
//!
//! Subscriptions are fire-and-forget on the wire: `address.subscribe` and
//! `address.renew` get no structured response, and activity arrives later as
//! `address.update` pushes. The registry keeps one callback per address, a
//! sweep that renews live entries, and the replay used after a failover.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Address;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::correlator::Correlator;
use crate::error::ClientError;
use crate::protocol::{subscription_payload, RENEW_ADDRESS, SUBSCRIBE_ADDRESS};
use crate::types::AddressUpdate;

/// Invoked for every `address.update` push matching a subscribed address.
pub type UpdateCallback = Arc<dyn Fn(AddressUpdate) + Send + Sync>;

struct Subscription {
    address: Address,
    callback: UpdateCallback,
    expires_at: Instant,
}

pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, Subscription>>,
    ttl: Duration,
}

impl SubscriptionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Send `address.subscribe` and store `callback`, replacing any previous
    /// callback for the address.
    ///
    /// Only an address the protocol cannot express is an error. A failed send
    /// is logged and the entry is kept, so the next sweep or failover replay
    /// retries it.
    pub async fn subscribe(
        &self,
        correlator: &Correlator,
        address: &Address,
        callback: UpdateCallback,
    ) -> Result<(), ClientError> {
        let payload = subscription_payload(address)?;
        // Register first so an update racing the request is not dropped.
        if self.store(address, callback).await {
            debug!(%address, "replaced existing subscription");
        }
        send_fire_and_forget(correlator, SUBSCRIBE_ADDRESS, address, &payload).await;
        Ok(())
    }

    /// Send `address.renew` and store `callback` with a fresh lifetime.
    pub async fn renew(
        &self,
        correlator: &Correlator,
        address: &Address,
        callback: UpdateCallback,
    ) -> Result<(), ClientError> {
        let payload = subscription_payload(address)?;
        self.store(address, callback).await;
        send_fire_and_forget(correlator, RENEW_ADDRESS, address, &payload).await;
        Ok(())
    }

    /// Insert or replace the entry for `address` with a full lifetime.
    /// Returns whether an entry was replaced.
    async fn store(&self, address: &Address, callback: UpdateCallback) -> bool {
        let subscription = Subscription {
            address: address.clone(),
            callback,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries
            .lock()
            .await
            .insert(address.to_string(), subscription)
            .is_some()
    }

    /// Drop the subscription for `address`. Unknown addresses are ignored.
    pub async fn unsubscribe(&self, address: &Address) -> bool {
        self.entries
            .lock()
            .await
            .remove(&address.to_string())
            .is_some()
    }

    /// One renewal sweep: every entry that has not expired is renewed and
    /// gets a fresh lifetime. Expired entries are left untouched.
    pub async fn renew_live(&self, correlator: &Correlator) -> usize {
        let (due, total) = {
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            let due: Vec<_> = entries
                .values_mut()
                .filter(|subscription| subscription.expires_at > now)
                .filter_map(|subscription| {
                    let payload = subscription_payload(&subscription.address).ok()?;
                    subscription.expires_at = now + self.ttl;
                    Some((subscription.address.clone(), payload))
                })
                .collect();
            (due, entries.len())
        };
        send_all(correlator, RENEW_ADDRESS, &due).await;
        trace!(renewed = due.len(), total, "subscription renewal sweep");
        due.len()
    }

    /// Re-subscribe every tracked address, typically against a server that
    /// just became active.
    pub async fn resubscribe_all(&self, correlator: &Correlator) -> usize {
        let all = {
            let entries = self.entries.lock().await;
            entries
                .values()
                .filter_map(|subscription| {
                    let payload = subscription_payload(&subscription.address).ok()?;
                    Some((subscription.address.clone(), payload))
                })
                .collect::<Vec<_>>()
        };
        send_all(correlator, SUBSCRIBE_ADDRESS, &all).await;
        all.len()
    }

    /// Hand `update` to the callback registered for its address. Updates for
    /// addresses without a subscription are dropped.
    pub async fn dispatch(&self, update: AddressUpdate) -> bool {
        let callback = {
            let entries = self.entries.lock().await;
            entries
                .get(&update.address.to_string())
                .map(|subscription| subscription.callback.clone())
        };
        match callback {
            Some(callback) => {
                callback(update);
                true
            }
            None => {
                debug!(address = %update.address, "update for unsubscribed address; dropping");
                false
            }
        }
    }

    /// Run [`renew_live`](Self::renew_live) every `period`, starting one
    /// period from now. Never returns.
    pub async fn run_renewal(&self, correlator: &Correlator, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.renew_live(correlator).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    #[cfg(test)]
    pub async fn expires_at(&self, address: &Address) -> Option<Instant> {
        self.entries
            .lock()
            .await
            .get(&address.to_string())
            .map(|subscription| subscription.expires_at)
    }
}

/// Must be called without the registry lock held; dispatch takes it while
/// draining inbound frames.
async fn send_all(correlator: &Correlator, command: &'static str, batch: &[(Address, Vec<u8>)]) {
    for (address, payload) in batch {
        send_fire_and_forget(correlator, command, address, payload).await;
    }
}

async fn send_fire_and_forget(
    correlator: &Correlator,
    command: &'static str,
    address: &Address,
    payload: &[u8],
) {
    if let Err(err) = correlator.send_oneway(command, payload).await {
        warn!(command, %address, error = %err, "subscription send failed");
    }
}
