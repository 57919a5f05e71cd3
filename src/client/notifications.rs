//! Notification multiplexer
//!
//! Fans transport notifications out to per-feature listeners. One
//! transport registration is opened per characteristic and shared by every
//! listener on it; the last cancellation closes it. Each listener runs on
//! its own task behind an unbounded queue, so a slow or panicking listener
//! never holds up the others.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use uuid::Uuid;

use super::dispatcher::CommandDispatcher;
use super::{IO_TARGET, NOTIFICATION_TARGET};
use crate::ble::transport::{NotifyCallback, TransportSubscription};
use crate::error::F1Error;
use crate::protocol::codec::{self, FromFeatureValue};
use crate::protocol::registry::{Feature, Operation};

struct Listener {
    queue: mpsc::UnboundedSender<Vec<u8>>,
    active: Arc<AtomicBool>,
}

/// Listeners sharing one characteristic.
struct Channel {
    transport: TransportSubscription,
    listeners: HashMap<u64, Listener>,
}

struct MuxInner {
    dispatcher: Arc<CommandDispatcher>,
    channels: Mutex<HashMap<Uuid, Channel>>,
    /// Serializes subscribe and cancel so reference counts and transport
    /// registrations never disagree.
    changes: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl MuxInner {
    fn channels(&self) -> MutexGuard<'_, HashMap<Uuid, Channel>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fan_out(&self, characteristic: Uuid, bytes: &[u8]) {
        let channels = self.channels();
        let Some(channel) = channels.get(&characteristic) else {
            return;
        };
        log::debug!(
            target: IO_TARGET,
            "notify {} <- {} ({} listeners)",
            characteristic,
            hex::encode(bytes),
            channel.listeners.len()
        );
        for listener in channel.listeners.values() {
            if listener.active.load(Ordering::SeqCst) {
                let _ = listener.queue.send(bytes.to_vec());
            }
        }
    }
}

/// A caller's handle on one listener. Dropping it does not cancel.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    feature: Feature,
    active: Arc<AtomicBool>,
    owner: Weak<MuxInner>,
}

impl std::fmt::Debug for MuxInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationMultiplexer")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn feature(&self) -> Feature {
        self.feature
    }

    /// Whether the listener can still be invoked.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop the listener. Idempotent.
    pub async fn cancel(&self) -> Result<(), F1Error> {
        match self.owner.upgrade() {
            Some(inner) => NotificationMultiplexer { inner }.cancel(self).await,
            None => {
                self.active.store(false, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

/// Per-link notification fan-out.
#[derive(Clone)]
pub struct NotificationMultiplexer {
    inner: Arc<MuxInner>,
}

impl NotificationMultiplexer {
    pub fn new(dispatcher: Arc<CommandDispatcher>) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                dispatcher,
                channels: Mutex::new(HashMap::new()),
                changes: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Number of open transport registrations.
    pub fn transport_subscriptions(&self) -> usize {
        self.inner.channels().len()
    }

    /// Number of active listeners across all characteristics.
    pub fn listener_count(&self) -> usize {
        self.inner
            .channels()
            .values()
            .map(|c| c.listeners.len())
            .sum()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Register `listener` for decoded values of `feature`. With
    /// `distinct_until_changed`, a payload equal to the previous one this
    /// listener saw is skipped.
    pub async fn subscribe<T, F>(
        &self,
        feature: Feature,
        distinct_until_changed: bool,
        listener: F,
    ) -> Result<Subscription, F1Error>
    where
        T: FromFeatureValue,
        F: FnMut(T) + Send + 'static,
    {
        feature.descriptor().require(Operation::Notify)?;
        let dispatcher = &self.inner.dispatcher;
        let characteristic = dispatcher.addresses().uuid_for(feature);

        let _change = self.inner.changes.lock().await;
        if self.is_closed() || !dispatcher.is_alive() {
            return Err(F1Error::LinkLost);
        }

        let needs_transport = !self.inner.channels().contains_key(&characteristic);
        if needs_transport {
            let weak = Arc::downgrade(&self.inner);
            let on_value: NotifyCallback = Arc::new(move |bytes: &[u8]| {
                if let Some(inner) = weak.upgrade() {
                    inner.fan_out(characteristic, bytes);
                }
            });
            let transport = dispatcher.open_notifications(feature, on_value).await?;
            let installed = {
                // close() raises the flag before draining under this lock.
                let mut channels = self.inner.channels();
                if self.is_closed() {
                    false
                } else {
                    channels.insert(
                        characteristic,
                        Channel {
                            transport,
                            listeners: HashMap::new(),
                        },
                    );
                    true
                }
            };
            if !installed {
                log::debug!(
                    target: NOTIFICATION_TARGET,
                    "link lost while enabling notifications on {}",
                    feature
                );
                if let Err(e) = self.release(transport).await {
                    log::warn!(target: NOTIFICATION_TARGET, "could not release {}: {}", feature, e);
                }
                return Err(F1Error::LinkLost);
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));
        let (queue, deliveries) = mpsc::unbounded_channel();
        spawn_listener(
            id,
            feature,
            distinct_until_changed,
            Arc::clone(&active),
            deliveries,
            dispatcher.link_state(),
            listener,
        );

        let mut channels = self.inner.channels();
        let channel = if self.is_closed() {
            None
        } else {
            channels.get_mut(&characteristic)
        };
        let count = match channel {
            Some(channel) => {
                channel.listeners.insert(
                    id,
                    Listener {
                        queue,
                        active: Arc::clone(&active),
                    },
                );
                channel.listeners.len()
            }
            None => {
                active.store(false, Ordering::SeqCst);
                return Err(F1Error::LinkLost);
            }
        };
        drop(channels);
        log::info!(
            target: NOTIFICATION_TARGET,
            "listener {} subscribed to {} ({} on characteristic)",
            id,
            feature,
            count
        );

        Ok(Subscription {
            id,
            feature,
            active,
            owner: Arc::downgrade(&self.inner),
        })
    }

    /// Remove one listener, closing the transport registration when it was
    /// the last one. Idempotent.
    pub async fn cancel(&self, subscription: &Subscription) -> Result<(), F1Error> {
        if !subscription.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let _change = self.inner.changes.lock().await;

        let released = {
            let mut channels = self.inner.channels();
            let characteristic = channels
                .iter()
                .find(|(_, c)| c.listeners.contains_key(&subscription.id))
                .map(|(uuid, _)| *uuid);
            match characteristic {
                Some(uuid) => {
                    let remaining = channels.get_mut(&uuid).map(|channel| {
                        channel.listeners.remove(&subscription.id);
                        channel.listeners.len()
                    });
                    log::info!(
                        target: NOTIFICATION_TARGET,
                        "listener {} on {} cancelled",
                        subscription.id,
                        subscription.feature
                    );
                    if remaining == Some(0) {
                        channels.remove(&uuid).map(|c| c.transport)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        match released {
            Some(transport) => self.release(transport).await,
            None => Ok(()),
        }
    }

    /// Cancel every listener and close every transport registration.
    pub async fn cancel_all(&self) -> Result<(), F1Error> {
        let _change = self.inner.changes.lock().await;
        let drained: Vec<Channel> = self.inner.channels().drain().map(|(_, c)| c).collect();
        if !drained.is_empty() {
            log::info!(
                target: NOTIFICATION_TARGET,
                "cancelling all notifications ({} characteristics)",
                drained.len()
            );
        }
        let mut outcome = Ok(());
        for channel in drained {
            for listener in channel.listeners.values() {
                listener.active.store(false, Ordering::SeqCst);
            }
            if let Err(e) = self.release(channel.transport).await {
                outcome = Err(e);
            }
        }
        outcome
    }

    /// The link is gone: stop every listener without touching the transport.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<Channel> = self.inner.channels().drain().map(|(_, c)| c).collect();
        for channel in &drained {
            for listener in channel.listeners.values() {
                listener.active.store(false, Ordering::SeqCst);
            }
        }
        log::info!(
            target: NOTIFICATION_TARGET,
            "notifications closed, {} characteristics dropped",
            drained.len()
        );
    }

    async fn release(&self, transport: TransportSubscription) -> Result<(), F1Error> {
        match self.inner.dispatcher.close_notifications(transport).await {
            Err(F1Error::LinkLost) => {
                log::debug!(
                    target: NOTIFICATION_TARGET,
                    "link already lost; notifications on {} are gone",
                    transport.characteristic
                );
                Ok(())
            }
            other => other,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn spawn_listener<T, F>(
    id: u64,
    feature: Feature,
    distinct_until_changed: bool,
    active: Arc<AtomicBool>,
    mut deliveries: mpsc::UnboundedReceiver<Vec<u8>>,
    link_state: tokio::sync::watch::Receiver<bool>,
    mut listener: F,
) where
    T: FromFeatureValue,
    F: FnMut(T) + Send + 'static,
{
    tokio::spawn(async move {
        let mut previous: Option<Vec<u8>> = None;
        while let Some(bytes) = deliveries.recv().await {
            if !active.load(Ordering::SeqCst) || !*link_state.borrow() {
                break;
            }
            if distinct_until_changed && previous.as_deref() == Some(bytes.as_slice()) {
                continue;
            }
            previous = Some(bytes.clone());

            let value = match codec::decode(feature, &bytes)
                .and_then(|value| T::from_feature_value(feature, value))
            {
                Ok(value) => value,
                Err(e) => {
                    log::warn!(
                        target: NOTIFICATION_TARGET,
                        "dropping {} notification {}: {}",
                        feature,
                        hex::encode(&bytes),
                        e
                    );
                    continue;
                }
            };
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(value))) {
                log::error!(
                    target: NOTIFICATION_TARGET,
                    "listener {} for {} panicked: {}",
                    id,
                    feature,
                    panic_message(panic.as_ref())
                );
            }
        }
        log::trace!(target: NOTIFICATION_TARGET, "listener {} for {} finished", id, feature);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::ble::simulated::{SimCentral, SimulatedF1};
    use crate::ble::transport::GattCentral;
    use crate::client::dispatcher::DispatchSettings;
    use crate::protocol::registry::AddressMap;
    use crate::protocol::ButtonState;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
    const BUTTONS: u16 = 0x0aa4;

    async fn multiplexer() -> (SimulatedF1, NotificationMultiplexer) {
        let device = SimulatedF1::new(ADDRESS);
        let central = SimCentral::with_devices(vec![device.clone()]);
        let link = central.connect(ADDRESS, Duration::from_secs(1)).await.unwrap();
        let addresses = AddressMap::resolve(&link.characteristics());
        let dispatcher = Arc::new(CommandDispatcher::new(
            link,
            addresses,
            DispatchSettings::default(),
        ));
        (device, NotificationMultiplexer::new(dispatcher))
    }

    fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl FnMut(T) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |value: T| sink.lock().unwrap().push(value))
    }

    /// Let listener tasks drain their queues.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_listeners_share_one_transport_subscription() {
        let (device, mux) = multiplexer().await;
        let (first_seen, first) = recorder::<ButtonState>();
        let (second_seen, second) = recorder::<ButtonState>();

        let a = mux.subscribe(Feature::Buttons, false, first).await.unwrap();
        let b = mux.subscribe(Feature::Buttons, false, second).await.unwrap();
        assert_eq!(device.subscribe_count(), 1);
        assert_eq!(mux.listener_count(), 2);

        device.notify(BUTTONS, &[0x01]);
        settle().await;
        assert_eq!(*first_seen.lock().unwrap(), vec![ButtonState::Plus]);
        assert_eq!(*second_seen.lock().unwrap(), vec![ButtonState::Plus]);

        a.cancel().await.unwrap();
        assert_eq!(device.unsubscribe_count(), 0);
        device.notify(BUTTONS, &[0x02]);
        settle().await;
        assert_eq!(first_seen.lock().unwrap().len(), 1);
        assert_eq!(
            *second_seen.lock().unwrap(),
            vec![ButtonState::Plus, ButtonState::Minus]
        );

        b.cancel().await.unwrap();
        assert_eq!(device.unsubscribe_count(), 1);
        assert_eq!(device.active_subscriptions(), 0);
        assert_eq!(mux.transport_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (device, mux) = multiplexer().await;
        let (_, listener) = recorder::<ButtonState>();
        let sub = mux.subscribe(Feature::Buttons, false, listener).await.unwrap();

        sub.cancel().await.unwrap();
        sub.cancel().await.unwrap();
        mux.cancel(&sub).await.unwrap();
        assert!(!sub.is_active());
        assert_eq!(device.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_delivery_preserves_order() {
        let (device, mux) = multiplexer().await;
        let (seen, listener) = recorder::<u16>();
        let _sub = mux.subscribe(Feature::Depth, false, listener).await.unwrap();

        for depth in 0..=8u8 {
            device.notify(0x0a0b, &[0x00, depth]);
        }
        settle().await;
        assert_eq!(*seen.lock().unwrap(), (0..=8).collect::<Vec<u16>>());
    }

    #[tokio::test]
    async fn test_distinct_until_changed() {
        let (device, mux) = multiplexer().await;
        let (seen, listener) = recorder::<ButtonState>();
        let _sub = mux.subscribe(Feature::Buttons, true, listener).await.unwrap();

        for byte in [0x03, 0x03, 0x00, 0x00, 0x03] {
            device.notify(BUTTONS, &[byte]);
        }
        settle().await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ButtonState::NonePressed, ButtonState::Central, ButtonState::NonePressed]
        );
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let (device, mux) = multiplexer().await;
        let (seen, listener) = recorder::<ButtonState>();
        let _bad = mux
            .subscribe(Feature::Buttons, false, |_: ButtonState| panic!("listener bug"))
            .await
            .unwrap();
        let _good = mux.subscribe(Feature::Buttons, false, listener).await.unwrap();

        device.notify(BUTTONS, &[0x00]);
        device.notify(BUTTONS, &[0x01]);
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![ButtonState::Central, ButtonState::Plus]);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let (device, mux) = multiplexer().await;
        let (seen, listener) = recorder::<ButtonState>();
        let _sub = mux.subscribe(Feature::Buttons, false, listener).await.unwrap();

        device.notify(BUTTONS, &[0x09]);
        device.notify(BUTTONS, &[0x02]);
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![ButtonState::Minus]);
    }

    #[tokio::test]
    async fn test_close_stops_deliveries() {
        let (device, mux) = multiplexer().await;
        let (seen, listener) = recorder::<ButtonState>();
        let sub = mux.subscribe(Feature::Buttons, false, listener).await.unwrap();

        mux.close();
        device.notify(BUTTONS, &[0x01]);
        settle().await;
        assert!(seen.lock().unwrap().is_empty());
        assert!(!sub.is_active());

        let (_, again) = recorder::<ButtonState>();
        let err = mux.subscribe(Feature::Buttons, false, again).await.unwrap_err();
        assert_eq!(err, F1Error::LinkLost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_fails_when_closed_mid_registration() {
        let (device, mux) = multiplexer().await;
        device.set_latency(Duration::from_millis(50));
        let pending = {
            let mux = mux.clone();
            tokio::spawn(async move {
                let (_, listener) = recorder::<ButtonState>();
                mux.subscribe(Feature::Buttons, false, listener).await
            })
        };
        settle().await;
        mux.close();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err, F1Error::LinkLost);
        assert_eq!(mux.transport_subscriptions(), 0);
        assert_eq!(mux.listener_count(), 0);
        // The registration made meanwhile was handed back.
        assert_eq!(device.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_read_only_feature_rejects_notify() {
        let (_device, mux) = multiplexer().await;
        let (_, listener) = recorder::<u8>();
        let err = mux
            .subscribe(Feature::BatteryLevel, false, listener)
            .await
            .unwrap_err();
        assert!(matches!(err, F1Error::AccessDenied { operation: Operation::Notify, .. }));
    }
}
