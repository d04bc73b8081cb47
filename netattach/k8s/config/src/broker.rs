use crate::{sync::SyncBarrier, ResourceEvent, ResourceId, Synced, Watched};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::prelude::*;
use kube::{api::DynamicObject, runtime::watcher};
use netattach_core::{Error, ErrorSink};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Fans out changes to a single kind of resource to a list of handlers.
pub struct Broker<T: Watched> {
    handlers: Vec<Arc<T::Handler>>,

    /// The last known state of each resource, as received from the watch.
    cache: HashMap<ResourceId, DynamicObject>,

    /// Resources seen since the watch last (re)started its listing.
    relisted: Option<HashSet<ResourceId>>,

    synced: SyncBarrier,
    errors: Arc<dyn ErrorSink>,
}

// === impl Broker ===

impl<T: Watched> Broker<T> {
    pub fn new(errors: Arc<dyn ErrorSink>) -> Self {
        Self {
            handlers: Vec::new(),
            cache: HashMap::new(),
            relisted: None,
            synced: SyncBarrier::new(),
            errors,
        }
    }

    /// Adds a handler to be notified of every subsequent event.
    ///
    /// Handlers are notified in registration order. A handler registered more than once is
    /// notified once per registration.
    pub fn register_handler(&mut self, handler: Arc<T::Handler>) {
        self.handlers.push(handler);
    }

    /// Returns a handle that observes when the initial listing has been delivered.
    pub fn synced(&self) -> Synced {
        self.synced.subscribe()
    }

    /// Processes watch events until the stream ends or shutdown is signaled.
    ///
    /// If shutdown is signaled before the initial listing completes, handlers are never notified
    /// that the broker synced.
    pub async fn run<S>(mut self, events: S, shutdown: drain::Watch)
    where
        S: Stream<Item = watcher::Result<watcher::Event<DynamicObject>>>,
    {
        info!(handlers = self.handlers.len(), "Starting config controller");
        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);
        tokio::pin!(events);

        loop {
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    if self.synced.is_synced() {
                        debug!("Shutdown");
                    } else {
                        debug!("Shutdown before the initial listing completed");
                    }
                    return;
                }
                event = events.next() => event,
            };

            match event {
                Some(Ok(event)) => self.process(event),
                Some(Err(error)) => info!(%error, "Watch failed"),
                None => {
                    debug!("Watch ended");
                    return;
                }
            }
        }
    }

    fn process(&mut self, event: watcher::Event<DynamicObject>) {
        match event {
            watcher::Event::Init => {
                trace!("Listing");
                self.relisted = Some(HashSet::new());
            }
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => self.apply(obj),
            watcher::Event::Delete(obj) => self.delete(obj),
            watcher::Event::InitDone => self.listed(),
        }
    }

    fn apply(&mut self, obj: DynamicObject) {
        let id = ResourceId::of(&obj);
        if let Some(relisted) = self.relisted.as_mut() {
            relisted.insert(id.clone());
        }

        let new = self.decode(&id, &obj);
        let prior = self.cache.insert(id.clone(), obj);
        let Some(new) = new else {
            return;
        };

        // A prior state that did not decode was already reported and never delivered.
        let event = match prior.map(|prior| Self::try_decode(&prior)) {
            Some(Ok(old)) => ResourceEvent::Updated { old, new },
            None | Some(Err(_)) => ResourceEvent::Added(new),
        };
        self.dispatch(&id, event);
    }

    fn delete(&mut self, obj: DynamicObject) {
        let id = ResourceId::of(&obj);
        self.cache.remove(&id);
        if let Some(relisted) = self.relisted.as_mut() {
            relisted.remove(&id);
        }

        if let Some(res) = self.decode(&id, &obj) {
            self.dispatch(&id, ResourceEvent::Deleted(res));
        }
    }

    /// Completes a listing: resources that were known before the listing but are not part of it
    /// were deleted while the watch was down.
    fn listed(&mut self) {
        let relisted = self.relisted.take().unwrap_or_default();
        let mut removed = self
            .cache
            .keys()
            .filter(|id| !relisted.contains(*id))
            .cloned()
            .collect::<Vec<_>>();
        removed.sort();

        for id in removed {
            if let Some(obj) = self.cache.remove(&id) {
                debug!(namespace = %id.namespace, name = %id.name, "Missing from relist");
                if let Some(res) = self.decode(&id, &obj) {
                    self.dispatch(&id, ResourceEvent::Deleted(res));
                }
            }
        }

        if self.synced.release() {
            info!(resources = self.cache.len(), "Synced");
            for handler in &self.handlers {
                T::synced(handler);
            }
        }
    }

    fn try_decode(obj: &DynamicObject) -> serde_json::Result<T> {
        serde_json::to_value(obj).and_then(serde_json::from_value)
    }

    fn decode(&self, id: &ResourceId, obj: &DynamicObject) -> Option<T> {
        match Self::try_decode(obj) {
            Ok(res) => Some(res),
            Err(source) => {
                self.errors.report(Error::TypeMismatch {
                    kind: T::kind(&()).into_owned(),
                    namespace: id.namespace.clone(),
                    name: id.name.clone(),
                    source,
                });
                None
            }
        }
    }

    fn dispatch(&self, id: &ResourceId, event: ResourceEvent<T>) {
        trace!(namespace = %id.namespace, name = %id.name, event = event.name(), "Dispatching");
        for handler in &self.handlers {
            T::dispatch(handler, &event);
        }
    }
}
