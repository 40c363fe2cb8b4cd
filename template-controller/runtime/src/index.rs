use crate::{
    k8s::{self, ResourceExt},
    metrics::IndexMetrics,
};
use ahash::AHashMap as HashMap;
use kubert::lease::Claim;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    time,
};

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

/// Tracks TemplateInstances that have not yet reached a terminal condition
/// and hands each one to the controller at most once.
pub struct Index {
    name: String,
    claims: watch::Receiver<Arc<Claim>>,
    dispatch: mpsc::Sender<k8s::TemplateInstance>,

    /// Instances waiting for this replica to hold the lease or for room in
    /// the dispatch queue.
    pending: HashMap<ResourceId, k8s::TemplateInstance>,

    /// The UID of each instance already handed to the controller.
    dispatched: HashMap<ResourceId, String>,

    metrics: IndexMetrics,
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: String, name: String) -> Self {
        Self { namespace, name }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl Index ===

impl Index {
    pub fn shared(
        name: impl ToString,
        claims: watch::Receiver<Arc<Claim>>,
        dispatch: mpsc::Sender<k8s::TemplateInstance>,
        metrics: IndexMetrics,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            name: name.to_string(),
            claims,
            dispatch,
            pending: HashMap::new(),
            dispatched: HashMap::new(),
            metrics,
        }))
    }

    /// Periodically retries dispatching pending instances so that work held
    /// back while another replica led, or while the queue was full, is
    /// eventually picked up.
    pub async fn run(index: SharedIndex, period: time::Duration) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            index.write().dispatch_pending();
        }
    }

    fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.name)
    }

    pub(crate) fn dispatch_pending(&mut self) {
        if self.pending.is_empty() || !self.is_leader() {
            return;
        }

        let ids = self.pending.keys().cloned().collect::<Vec<_>>();
        for id in ids {
            let Some(instance) = self.pending.remove(&id) else {
                continue;
            };
            let uid = instance.uid().unwrap_or_default();
            match self.dispatch.try_send(instance) {
                Ok(()) => {
                    tracing::debug!(%id, "Dispatched");
                    self.metrics.dispatched.inc();
                    self.dispatched.insert(id, uid);
                }
                Err(TrySendError::Full(instance)) => {
                    tracing::debug!(%id, "Dispatch queue full");
                    self.metrics.queue_full.inc();
                    self.pending.insert(id, instance);
                    return;
                }
                Err(TrySendError::Closed(instance)) => {
                    tracing::error!(%id, "Controller is no longer running");
                    self.pending.insert(id, instance);
                    return;
                }
            }
        }
    }

    /// Hands back an instance whose reconciliation stopped before any object
    /// was attempted. It is dispatched again on the next tick unless it was
    /// deleted or replaced in the meantime.
    pub fn release(&mut self, instance: k8s::TemplateInstance) {
        let Some(namespace) = instance.namespace() else {
            return;
        };
        let id = ResourceId::new(namespace, instance.name_unchecked());
        let uid = instance.uid();
        if uid.is_none() || self.dispatched.get(&id) != uid.as_ref() {
            return;
        }

        tracing::debug!(%id, "Released for retry");
        self.dispatched.remove(&id);
        self.pending.entry(id).or_insert(instance);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::TemplateInstance> for Index {
    fn apply(&mut self, instance: k8s::TemplateInstance) {
        let Some(namespace) = instance.namespace() else {
            tracing::warn!(name = %instance.name_any(), "Ignoring TemplateInstance without a namespace");
            return;
        };
        let id = ResourceId::new(namespace, instance.name_unchecked());

        if instance.is_terminal() {
            self.pending.remove(&id);
            self.dispatched.remove(&id);
            return;
        }

        // A status write in flight may race with further updates to the
        // same instance. Those must not start a second reconciliation.
        let uid = instance.uid();
        if uid.is_some() && self.dispatched.get(&id) == uid.as_ref() {
            return;
        }

        self.dispatched.remove(&id);
        self.pending.insert(id, instance);
        self.dispatch_pending();
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        self.pending.remove(&id);
        self.dispatched.remove(&id);
    }

    // Since apply only reindexes a single instance at a time, there's no need
    // to handle resets specially.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{
        Requester, Template, TemplateInstanceCondition, TemplateInstanceSpec,
        TemplateInstanceStatus,
    };
    use kubert::index::IndexNamespacedResource;
    use pretty_assertions::assert_eq;

    const TEST_HOSTNAME: &str = "test";

    fn claims(holder: &str) -> (watch::Sender<Arc<Claim>>, watch::Receiver<Arc<Claim>>) {
        let claim = Claim {
            holder: holder.to_string(),
            expiry: chrono::DateTime::<chrono::Utc>::MAX_UTC,
        };
        watch::channel(Arc::new(claim))
    }

    fn instance(name: &str, uid: &str) -> k8s::TemplateInstance {
        let mut ti = k8s::TemplateInstance::new(
            name,
            TemplateInstanceSpec {
                template: Template::default(),
                secret: None,
                requester: Some(Requester {
                    username: "edituser".to_string(),
                    ..Default::default()
                }),
            },
        );
        ti.metadata.namespace = Some("ns-0".to_string());
        ti.metadata.uid = Some(uid.to_string());
        ti
    }

    fn terminal(mut ti: k8s::TemplateInstance) -> k8s::TemplateInstance {
        ti.status = Some(TemplateInstanceStatus {
            conditions: vec![TemplateInstanceCondition {
                type_: k8s::template_instance::CONDITION_READY.to_string(),
                status: "True".to_string(),
                last_transition_time: None,
                reason: Some("Created".to_string()),
                message: None,
            }],
            objects: vec![],
        });
        ti
    }

    fn index(
        holder: &str,
        capacity: usize,
    ) -> (
        SharedIndex,
        watch::Sender<Arc<Claim>>,
        mpsc::Receiver<k8s::TemplateInstance>,
    ) {
        let (claims_tx, claims_rx) = claims(holder);
        let (tx, rx) = mpsc::channel(capacity);
        let index = Index::shared(
            TEST_HOSTNAME,
            claims_rx,
            tx,
            IndexMetrics::register(&mut Default::default()),
        );
        (index, claims_tx, rx)
    }

    #[test]
    fn dispatches_each_instance_once() {
        let (index, _claims, mut rx) = index(TEST_HOSTNAME, 10);

        index.write().apply(instance("ti", "uid-1"));
        assert_eq!(rx.try_recv().unwrap().name_any(), "ti");

        // Later updates to the same instance are ignored until it is deleted.
        index.write().apply(instance("ti", "uid-1"));
        assert!(rx.try_recv().is_err());

        index.write().delete("ns-0".to_string(), "ti".to_string());
        index.write().apply(instance("ti", "uid-2"));
        assert_eq!(rx.try_recv().unwrap().uid().as_deref(), Some("uid-2"));
    }

    #[test]
    fn recreated_instance_is_dispatched() {
        let (index, _claims, mut rx) = index(TEST_HOSTNAME, 10);

        index.write().apply(instance("ti", "uid-1"));
        assert!(rx.try_recv().is_ok());

        // The delete was missed, but the UID shows this is a new object.
        index.write().apply(instance("ti", "uid-2"));
        assert_eq!(rx.try_recv().unwrap().uid().as_deref(), Some("uid-2"));
    }

    #[test]
    fn ignores_terminal_instances() {
        let (index, _claims, mut rx) = index(TEST_HOSTNAME, 10);

        index.write().apply(terminal(instance("ti", "uid-1")));
        assert!(rx.try_recv().is_err());
        assert!(index.read().pending.is_empty());
    }

    #[test]
    fn waits_for_lease() {
        let (index, claims_tx, mut rx) = index("other", 10);

        index.write().apply(instance("ti", "uid-1"));
        assert!(rx.try_recv().is_err());

        claims_tx.send_replace(Arc::new(Claim {
            holder: TEST_HOSTNAME.to_string(),
            expiry: chrono::DateTime::<chrono::Utc>::MAX_UTC,
        }));
        index.write().dispatch_pending();
        assert_eq!(rx.try_recv().unwrap().name_any(), "ti");
    }

    #[test]
    fn retries_when_queue_is_full() {
        let (index, _claims, mut rx) = index(TEST_HOSTNAME, 1);

        index.write().apply(instance("ti-0", "uid-0"));
        index.write().apply(instance("ti-1", "uid-1"));
        assert_eq!(index.read().pending.len(), 1);

        assert!(rx.try_recv().is_ok());
        index.write().dispatch_pending();
        assert!(rx.try_recv().is_ok());
        assert!(index.read().pending.is_empty());
    }

    #[test]
    fn released_instance_is_dispatched_again() {
        let (index, _claims, mut rx) = index(TEST_HOSTNAME, 10);

        index.write().apply(instance("ti", "uid-1"));
        let dispatched = rx.try_recv().unwrap();

        // Nothing is sent until the next tick.
        index.write().release(dispatched);
        assert!(rx.try_recv().is_err());

        index.write().dispatch_pending();
        assert_eq!(rx.try_recv().unwrap().uid().as_deref(), Some("uid-1"));
    }

    #[test]
    fn released_instance_is_dispatched_on_reapply() {
        let (index, _claims, mut rx) = index(TEST_HOSTNAME, 10);

        index.write().apply(instance("ti", "uid-1"));
        let dispatched = rx.try_recv().unwrap();
        index.write().release(dispatched);

        index.write().apply(instance("ti", "uid-1"));
        assert_eq!(rx.try_recv().unwrap().uid().as_deref(), Some("uid-1"));
        assert!(index.read().pending.is_empty());
    }

    #[test]
    fn stale_release_is_ignored() {
        let (index, _claims, mut rx) = index(TEST_HOSTNAME, 10);

        index.write().apply(instance("ti", "uid-1"));
        let stale = rx.try_recv().unwrap();
        index.write().apply(instance("ti", "uid-2"));
        assert!(rx.try_recv().is_ok());

        index.write().release(stale);
        index.write().dispatch_pending();
        assert!(rx.try_recv().is_err());

        // A deleted instance is not brought back either.
        index.write().delete("ns-0".to_string(), "ti".to_string());
        index.write().release(instance("ti", "uid-2"));
        assert!(index.read().pending.is_empty());
    }

    #[test]
    fn deleted_pending_instance_is_dropped() {
        let (index, _claims, mut rx) = index("other", 10);

        index.write().apply(instance("ti", "uid-1"));
        index.write().delete("ns-0".to_string(), "ti".to_string());
        assert!(index.read().pending.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
