//! Publish/subscribe layer over attribute changes.
//!
//! Listeners are scoped to one entity or to the live member set of a group.
//! Each subscription owns an ordered delivery queue drained by its own worker,
//! so a listener sees events for a given source and sensor in set order.
//! Listener invocation never happens on the setter's call stack: workers
//! share a small permit pool, separate from the task workers, and any error
//! or panic raised by a listener is logged and swallowed.

mod membership;

pub use membership::Membership;

use crate::entity::EntityId;
use crate::sensor::SensorEvent;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, error, warn};
use uuid::Uuid;


/// Which sources a subscription listens to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "entity", rename_all = "snake_case")]
pub enum Scope {
    /// A single entity
    Entity(EntityId),
    /// Current and future members of a group entity
    Members(EntityId),
}

impl Scope {
    fn anchor(&self) -> &str {
        match self {
            Scope::Entity(id) | Scope::Members(id) => id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Listener callback. Errors are logged, never returned to the publisher.
pub type Listener = Arc<dyn Fn(&SensorEvent) -> anyhow::Result<()> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    owner: Option<String>,
    scope: Scope,
    sensor: String,
    tx: mpsc::UnboundedSender<SensorEvent>,
    active: Arc<AtomicBool>,
}

/// Delivery counters
#[derive(Default)]
struct BusMetrics {
    published: AtomicU64,
    delivered: AtomicU64,
    listener_errors: AtomicU64,
}

#[derive(Clone, Debug, Serialize)]
pub struct BusMetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub listener_errors: u64,
    pub subscriptions: usize,
}

#[derive(Default)]
struct Registry {
    subscriptions: DashMap<SubscriptionId, Arc<Subscription>>,

    /// Sensor name -> subscriptions interested in it
    by_sensor: DashMap<String, Vec<Arc<Subscription>>>,
}

impl Registry {
    fn insert(&self, sub: &Arc<Subscription>) {
        self.subscriptions.insert(sub.id, Arc::clone(sub));
        self.by_sensor
            .entry(sub.sensor.clone())
            .or_default()
            .push(Arc::clone(sub));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let Some((_, sub)) = self.subscriptions.remove(&id) else {
            return false;
        };
        sub.active.store(false, Ordering::Release);

        if let Some(mut subs) = self.by_sensor.get_mut(&sub.sensor) {
            subs.retain(|s| s.id != id);
        }
        self.by_sensor.remove_if(&sub.sensor, |_, subs| subs.is_empty());

        debug!(subscription = %id, "Subscription removed");
        true
    }
}

/// Events for one stream subscription. Dropping it unsubscribes.
pub struct SubscriptionStream {
    inner: UnboundedReceiverStream<SensorEvent>,
    registry: Arc<Registry>,
    id: SubscriptionId,
}

impl SubscriptionStream {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Stream for SubscriptionStream {
    type Item = SensorEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<SensorEvent>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

pub struct EventBus {
    registry: Arc<Registry>,

    membership: Arc<Membership>,

    /// Listener pool, sized independently from the task worker pool
    listener_permits: Arc<Semaphore>,

    metrics: Arc<BusMetrics>,
}

impl EventBus {
    pub fn new(listener_concurrency: usize) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            membership: Arc::new(Membership::new()),
            listener_permits: Arc::new(Semaphore::new(listener_concurrency.max(1))),
            metrics: Arc::new(BusMetrics::default()),
        }
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Register `listener` for `sensor` on `scope`.
    ///
    /// Must be called from within a Tokio runtime: the subscription's
    /// delivery worker is spawned immediately.
    pub fn subscribe<F>(
        &self,
        owner: Option<&str>,
        scope: Scope,
        sensor: &str,
        listener: F,
    ) -> SubscriptionId
    where
        F: Fn(&SensorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.register(owner, scope.clone(), sensor, tx);
        self.spawn_delivery(sub.id, scope, rx, Arc::new(listener), Arc::clone(&sub.active));
        sub.id
    }

    /// Subscribe as a stream of events instead of a callback.
    ///
    /// Group scopes are resolved at publish time only. The subscription
    /// lives until the stream is dropped or the scope is removed.
    pub fn stream(&self, scope: Scope, sensor: &str) -> (SubscriptionId, SubscriptionStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.register(None, scope, sensor, tx);
        let stream = SubscriptionStream {
            inner: UnboundedReceiverStream::new(rx),
            registry: Arc::clone(&self.registry),
            id: sub.id,
        };
        (sub.id, stream)
    }

    fn register(
        &self,
        owner: Option<&str>,
        scope: Scope,
        sensor: &str,
        tx: mpsc::UnboundedSender<SensorEvent>,
    ) -> Arc<Subscription> {
        let sub = Arc::new(Subscription {
            id: SubscriptionId::new(),
            owner: owner.map(str::to_string),
            scope,
            sensor: sensor.to_string(),
            tx,
            active: Arc::new(AtomicBool::new(true)),
        });

        self.registry.insert(&sub);

        debug!(
            subscription = %sub.id,
            scope = ?sub.scope,
            sensor = %sensor,
            "Subscription registered"
        );
        sub
    }

    fn spawn_delivery(
        &self,
        id: SubscriptionId,
        scope: Scope,
        mut rx: mpsc::UnboundedReceiver<SensorEvent>,
        listener: Listener,
        active: Arc<AtomicBool>,
    ) {
        let membership = Arc::clone(&self.membership);
        let permits = Arc::clone(&self.listener_permits);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !active.load(Ordering::Acquire) {
                    break;
                }

                let Ok(_permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };

                // Live view: a member removed after publish is not delivered
                if let Scope::Members(group) = &scope {
                    if !membership.is_member(group, &event.source) {
                        continue;
                    }
                }

                match std::panic::catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                    Ok(Ok(())) => {
                        metrics.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        metrics.listener_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscription = %id,
                            source = %event.source,
                            sensor = %event.sensor,
                            error = %format!("{:#}", e),
                            "Listener failed, event swallowed"
                        );
                    }
                    Err(_) => {
                        metrics.listener_errors.fetch_add(1, Ordering::Relaxed);
                        error!(
                            subscription = %id,
                            source = %event.source,
                            sensor = %event.sensor,
                            "Listener panicked, event swallowed"
                        );
                    }
                }
            }
            debug!(subscription = %id, "Delivery worker stopped");
        });
    }

    /// Route an event to every matching subscription. Returns the number of
    /// queues it was handed to.
    pub fn publish(&self, event: &SensorEvent) -> usize {
        self.metrics.published.fetch_add(1, Ordering::Relaxed);

        let Some(subs) = self.registry.by_sensor.get(&event.sensor) else {
            return 0;
        };

        let mut groups: Option<BTreeSet<EntityId>> = None;
        let mut routed = 0;

        for sub in subs.iter() {
            let matches = match &sub.scope {
                Scope::Entity(id) => id == &event.source,
                Scope::Members(group) => groups
                    .get_or_insert_with(|| self.membership.groups_of(&event.source))
                    .contains(group),
            };
            if matches && sub.active.load(Ordering::Acquire) && sub.tx.send(event.clone()).is_ok() {
                routed += 1;
            }
        }

        routed
    }

    /// Remove a subscription. Events already queued for it are dropped.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.remove(id)
    }

    /// Remove every subscription registered by `owner`
    pub fn unsubscribe_owner(&self, owner: &str) -> usize {
        self.remove_where(|sub| sub.owner.as_deref() == Some(owner))
    }

    /// Remove every subscription scoped to `entity` (as source or as group)
    pub fn remove_scope(&self, entity: &str) -> usize {
        self.remove_where(|sub| sub.scope.anchor() == entity)
    }

    fn remove_where(&self, predicate: impl Fn(&Subscription) -> bool) -> usize {
        let ids: Vec<SubscriptionId> = self
            .registry
            .subscriptions
            .iter()
            .filter(|e| predicate(e.value().as_ref()))
            .map(|e| *e.key())
            .collect();

        ids.into_iter().filter(|id| self.unsubscribe(*id)).count()
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.subscriptions.len()
    }

    pub fn metrics(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            published: self.metrics.published.load(Ordering::Relaxed),
            delivered: self.metrics.delivered.load(Ordering::Relaxed),
            listener_errors: self.metrics.listener_errors.load(Ordering::Relaxed),
            subscriptions: self.registry.subscriptions.len(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4)
    }
}
