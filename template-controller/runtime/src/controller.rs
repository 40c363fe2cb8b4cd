use crate::{
    core::{Instantiator, ObjectStore, Outcome, ParameterSource, TerminalCondition},
    index::SharedIndex,
    k8s::{self, Resource, ResourceExt},
    metrics::ControllerMetrics,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, Semaphore},
    time,
};
use tracing::{debug, error, info, info_span, Instrument};

/// The number of times a status write is attempted when it conflicts with a
/// concurrent update. Object creation is never retried.
const STATUS_WRITE_ATTEMPTS: usize = 3;

/// Receives TemplateInstances from the index and reconciles each one in its
/// own task, bounded by a concurrency limit.
pub struct Controller<S> {
    client: k8s::Client,
    instantiator: Arc<Instantiator<S>>,
    index: SharedIndex,
    instances: mpsc::Receiver<k8s::TemplateInstance>,
    limit: Arc<Semaphore>,
    patch_timeout: time::Duration,
    metrics: ControllerMetrics,
}

struct Reconcile<S> {
    client: k8s::Client,
    instantiator: Arc<Instantiator<S>>,
    index: SharedIndex,
    patch_timeout: time::Duration,
    metrics: ControllerMetrics,
}

// === impl Controller ===

impl<S> Controller<S>
where
    S: ObjectStore + ParameterSource + 'static,
{
    pub fn new(
        client: k8s::Client,
        instantiator: Instantiator<S>,
        index: SharedIndex,
        instances: mpsc::Receiver<k8s::TemplateInstance>,
        max_concurrent: usize,
        patch_timeout: time::Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            instantiator: Arc::new(instantiator),
            index,
            instances,
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
            patch_timeout,
            metrics,
        }
    }

    pub async fn run(mut self) {
        while let Some(instance) = self.instances.recv().await {
            let Ok(permit) = self.limit.clone().acquire_owned().await else {
                return;
            };

            let reconcile = Reconcile {
                client: self.client.clone(),
                instantiator: self.instantiator.clone(),
                index: self.index.clone(),
                patch_timeout: self.patch_timeout,
                metrics: self.metrics.clone(),
            };
            let span = info_span!(
                "reconcile",
                ns = %instance.namespace().unwrap_or_default(),
                name = %instance.name_any(),
                user = %instance
                    .spec
                    .requester
                    .as_ref()
                    .map(|r| r.username.as_str())
                    .unwrap_or_default(),
            );
            tokio::spawn(
                async move {
                    if let Err(error) = reconcile.run(instance).await {
                        error!(%error, "Failed to reconcile TemplateInstance");
                    }
                    drop(permit);
                }
                .instrument(span),
            );
        }
    }
}

// === impl Reconcile ===

impl<S> Reconcile<S>
where
    S: ObjectStore + ParameterSource,
{
    async fn run(&self, instance: k8s::TemplateInstance) -> Result<()> {
        let namespace = instance
            .namespace()
            .ok_or_else(|| anyhow!("TemplateInstance must have a namespace"))?;
        let name = instance.name_any();
        let api = k8s::Api::<k8s::TemplateInstance>::namespaced(self.client.clone(), &namespace);

        // The watch may lag behind the cluster. Re-read so that an instance
        // finished by an earlier reconciliation is never instantiated twice.
        let current = match self.get(&api, &name).await {
            Ok(current) => current,
            Err(error) => {
                // Nothing has been created yet, so the instance may be retried.
                self.index.write().release(instance);
                return Err(error);
            }
        };
        let Some(current) = current else {
            debug!("TemplateInstance no longer exists");
            return Ok(());
        };
        if current.uid() != instance.uid() {
            debug!("TemplateInstance was replaced");
            return Ok(());
        }
        if current.is_terminal() {
            debug!("TemplateInstance already reconciled");
            return Ok(());
        }

        let start = time::Instant::now();
        let outcome = self.instantiator.instantiate(&current).await;
        let condition = TerminalCondition::from_outcome(&outcome);
        self.metrics.record(&condition, &outcome, start.elapsed());

        let result = self
            .write_status(&api, current, &condition, &outcome, Utc::now())
            .await;
        if result.is_err() {
            self.metrics.status_failure();
        }
        result
    }

    async fn get(
        &self,
        api: &k8s::Api<k8s::TemplateInstance>,
        name: &str,
    ) -> Result<Option<k8s::TemplateInstance>> {
        time::timeout(self.patch_timeout, api.get_opt(name))
            .await
            .map_err(|_| anyhow!("timed out reading TemplateInstance"))?
            .map_err(Into::into)
    }

    async fn write_status(
        &self,
        api: &k8s::Api<k8s::TemplateInstance>,
        mut current: k8s::TemplateInstance,
        condition: &TerminalCondition,
        outcome: &Outcome,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let name = current.name_any();
        let params = k8s::PatchParams::default();

        for attempt in 1..=STATUS_WRITE_ATTEMPTS {
            let patch = make_patch(&current, condition, outcome, timestamp);
            match time::timeout(
                self.patch_timeout,
                api.patch_status(&name, &params, &k8s::Patch::Merge(&patch)),
            )
            .await
            {
                Ok(Ok(_)) => {
                    info!(
                        condition = %condition.type_,
                        reason = condition.reason,
                        message = %condition.message,
                        "Reconciled TemplateInstance"
                    );
                    return Ok(());
                }
                Ok(Err(k8s::Error::Api(rsp))) if rsp.code == 409 && attempt < STATUS_WRITE_ATTEMPTS => {
                    debug!(attempt, "Status conflict; re-reading TemplateInstance");
                    self.metrics.status_conflict();
                    match self.get(api, &name).await? {
                        Some(fresh) if fresh.uid() == current.uid() && !fresh.is_terminal() => {
                            current = fresh;
                        }
                        _ => {
                            debug!("TemplateInstance changed underneath; dropping status");
                            return Ok(());
                        }
                    }
                }
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => return Err(anyhow!("timed out writing TemplateInstance status")),
            }
        }

        Err(anyhow!("gave up writing TemplateInstance status after conflicts"))
    }
}

/// Builds a merge patch that appends the terminal condition and records the
/// created objects.
///
/// The patch carries the resource version it was computed against so that
/// the write fails rather than overwriting a concurrent change.
fn make_patch(
    current: &k8s::TemplateInstance,
    condition: &TerminalCondition,
    outcome: &Outcome,
    timestamp: DateTime<Utc>,
) -> serde_json::Value {
    let mut conditions = current
        .status
        .as_ref()
        .map(|status| status.conditions.clone())
        .unwrap_or_default();
    conditions.push(condition.to_status(k8s::Time(timestamp)));

    let status = k8s::TemplateInstanceStatus {
        conditions,
        objects: outcome
            .created()
            .cloned()
            .map(|object_ref| k8s::TemplateInstanceObject { object_ref })
            .collect(),
    };

    serde_json::json!({
        "apiVersion": k8s::TemplateInstance::api_version(&()),
        "kind": k8s::TemplateInstance::kind(&()),
        "metadata": {
            "resourceVersion": current.resource_version(),
        },
        "status": status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{
            CreateError, Identity, InstantiationResult, ObjectReference, Parameters,
            ProcessedManifest, SecretError,
        },
        index::Index,
        k8s::{Requester, Template, TemplateInstanceSpec},
        metrics::IndexMetrics,
    };
    use http_body_util::BodyExt;
    use hyper::http::{self, Method, StatusCode};
    use kubert::lease::Claim;
    use kubert::index::IndexNamespacedResource;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    type BoxError = Box<dyn std::error::Error + Send + Sync>;

    /// Counts create calls without talking to a cluster.
    #[derive(Default)]
    struct CountingStore {
        creates: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ObjectStore for CountingStore {
        async fn create(
            &self,
            _identity: &Identity,
            manifest: &ProcessedManifest,
        ) -> Result<ObjectReference, CreateError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(manifest.object_ref())
        }
    }

    #[async_trait::async_trait]
    impl ParameterSource for CountingStore {
        async fn read_parameters(
            &self,
            _identity: &Identity,
            _namespace: &str,
            secret: &str,
        ) -> Result<Parameters, SecretError> {
            Err(SecretError::NotFound(secret.to_string()))
        }
    }

    #[derive(Clone, Debug)]
    struct Request {
        method: Method,
        body: Vec<u8>,
    }

    /// Serves API requests from `respond`, which is given the method and the
    /// number of earlier requests with that method.
    fn mock_client<F>(respond: F) -> (k8s::Client, Arc<Mutex<Vec<Request>>>)
    where
        F: Fn(&Method, usize) -> (StatusCode, serde_json::Value) + Send + Sync + 'static,
    {
        let requests = Arc::new(Mutex::new(Vec::<Request>::new()));
        let respond = Arc::new(respond);
        let log = requests.clone();
        let svc = tower::service_fn(move |req: http::Request<kube::client::Body>| {
            let log = log.clone();
            let respond = respond.clone();
            async move {
                let (parts, body) = req.into_parts();
                let body = body.collect().await?.to_bytes().to_vec();
                let nth = {
                    let mut log = log.lock();
                    let nth = log.iter().filter(|r| r.method == parts.method).count();
                    log.push(Request {
                        method: parts.method.clone(),
                        body,
                    });
                    nth
                };
                let (status, rsp) = respond(&parts.method, nth);
                let rsp = http::Response::builder()
                    .status(status)
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(kube::client::Body::from(serde_json::to_vec(&rsp)?))?;
                Ok::<_, BoxError>(rsp)
            }
        });
        (kube::Client::new(svc, "ns-0"), requests)
    }

    fn api_status(code: u16, reason: &str) -> (StatusCode, serde_json::Value) {
        (
            StatusCode::from_u16(code).unwrap(),
            json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": format!("{reason} error"),
                "reason": reason,
                "code": code,
            }),
        )
    }

    fn ok(ti: &k8s::TemplateInstance) -> (StatusCode, serde_json::Value) {
        (StatusCode::OK, serde_json::to_value(ti).unwrap())
    }

    fn reconcile(
        client: k8s::Client,
    ) -> (
        Reconcile<CountingStore>,
        SharedIndex,
        mpsc::Receiver<k8s::TemplateInstance>,
        watch::Sender<Arc<Claim>>,
    ) {
        let (claims_tx, claims_rx) = watch::channel(Arc::new(Claim {
            holder: "test".to_string(),
            expiry: DateTime::<Utc>::MAX_UTC,
        }));
        let (tx, rx) = mpsc::channel(10);
        let index = Index::shared(
            "test",
            claims_rx,
            tx,
            IndexMetrics::register(&mut Default::default()),
        );
        let reconcile = Reconcile {
            client,
            instantiator: Arc::new(Instantiator::new(CountingStore::default())),
            index: index.clone(),
            patch_timeout: time::Duration::from_secs(5),
            metrics: ControllerMetrics::register(&mut Default::default()),
        };
        (reconcile, index, rx, claims_tx)
    }

    /// A dispatched instance with a single service to create.
    fn pending(uid: &str, resource_version: &str) -> k8s::TemplateInstance {
        let mut ti = instance();
        ti.metadata.uid = Some(uid.to_string());
        ti.metadata.resource_version = Some(resource_version.to_string());
        ti.spec.template.objects = vec![json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": "svc", "namespace": "ns-0" },
        })];
        ti
    }

    fn terminal(mut ti: k8s::TemplateInstance) -> k8s::TemplateInstance {
        let outcome = Outcome::Attempted {
            total: 0,
            results: vec![],
        };
        let condition = TerminalCondition::from_outcome(&outcome);
        ti.status = Some(k8s::TemplateInstanceStatus {
            conditions: vec![condition.to_status(k8s::Time(DateTime::<Utc>::MIN_UTC))],
            objects: vec![],
        });
        ti
    }

    fn methods(requests: &Mutex<Vec<Request>>) -> Vec<Method> {
        requests.lock().iter().map(|r| r.method.clone()).collect()
    }

    fn instance() -> k8s::TemplateInstance {
        let mut ti = k8s::TemplateInstance::new(
            "ti",
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
        ti.metadata.resource_version = Some("42".to_string());
        ti
    }

    fn service(ns: &str) -> ObjectReference {
        ObjectReference {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            namespace: Some(ns.to_string()),
            name: "service".to_string(),
            uid: Some("svc-uid".to_string()),
        }
    }

    #[test]
    fn patch_records_created_objects() {
        let outcome = Outcome::Attempted {
            total: 2,
            results: vec![
                InstantiationResult::Created(service("ns-0")),
                InstantiationResult::Failed {
                    object: service("default"),
                    error: CreateError::Forbidden(anyhow!("services is forbidden")),
                },
            ],
        };
        let condition = TerminalCondition::from_outcome(&outcome);
        let patch = make_patch(&instance(), &condition, &outcome, DateTime::<Utc>::MIN_UTC);

        assert_eq!(patch["apiVersion"], "template.openshift.io/v1");
        assert_eq!(patch["kind"], "TemplateInstance");
        assert_eq!(patch["metadata"], json!({ "resourceVersion": "42" }));
        assert_eq!(
            patch["status"]["objects"],
            json!([{
                "ref": {
                    "apiVersion": "v1",
                    "kind": "Service",
                    "namespace": "ns-0",
                    "name": "service",
                    "uid": "svc-uid",
                },
            }])
        );

        let conditions = patch["status"]["conditions"].as_array().unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0]["type"], "InstantiateFailure");
        assert_eq!(conditions[0]["status"], "True");
        assert_eq!(conditions[0]["reason"], "Forbidden");
    }

    #[test]
    fn patch_appends_to_existing_conditions() {
        let mut ti = instance();
        ti.status = Some(k8s::TemplateInstanceStatus {
            conditions: vec![k8s::TemplateInstanceCondition {
                type_: "Progressing".to_string(),
                status: "True".to_string(),
                last_transition_time: None,
                reason: None,
                message: None,
            }],
            objects: vec![],
        });
        let outcome = Outcome::Attempted {
            total: 0,
            results: vec![],
        };
        let condition = TerminalCondition::from_outcome(&outcome);
        let patch = make_patch(&ti, &condition, &outcome, DateTime::<Utc>::MIN_UTC);

        let types = patch["status"]["conditions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["type"].as_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(types, vec!["Progressing", "Ready"]);
    }

    #[tokio::test]
    async fn terminal_instance_is_not_instantiated() {
        let current = terminal(pending("uid-1", "2"));
        let (client, requests) = mock_client(move |_, _| ok(&current));
        let (reconcile, _index, _rx, _claims) = reconcile(client);

        reconcile.run(pending("uid-1", "1")).await.unwrap();

        assert_eq!(reconcile.instantiator.store().creates.load(Ordering::SeqCst), 0);
        assert_eq!(methods(&requests), vec![Method::GET]);
    }

    #[tokio::test]
    async fn replaced_instance_is_not_instantiated() {
        let current = pending("uid-2", "2");
        let (client, requests) = mock_client(move |_, _| ok(&current));
        let (reconcile, _index, _rx, _claims) = reconcile(client);

        reconcile.run(pending("uid-1", "1")).await.unwrap();

        assert_eq!(reconcile.instantiator.store().creates.load(Ordering::SeqCst), 0);
        assert_eq!(methods(&requests), vec![Method::GET]);
    }

    #[tokio::test]
    async fn deleted_instance_is_not_instantiated() {
        let (client, requests) = mock_client(|_, _| api_status(404, "NotFound"));
        let (reconcile, _index, _rx, _claims) = reconcile(client);

        reconcile.run(pending("uid-1", "1")).await.unwrap();

        assert_eq!(reconcile.instantiator.store().creates.load(Ordering::SeqCst), 0);
        assert_eq!(methods(&requests), vec![Method::GET]);
    }

    #[tokio::test]
    async fn failed_read_releases_instance() {
        let (client, _requests) = mock_client(|_, _| api_status(500, "InternalError"));
        let (reconcile, index, mut rx, _claims) = reconcile(client);

        index.write().apply(pending("uid-1", "1"));
        let dispatched = rx.try_recv().unwrap();

        reconcile
            .run(dispatched)
            .await
            .expect_err("read must fail");
        assert_eq!(reconcile.instantiator.store().creates.load(Ordering::SeqCst), 0);

        index.write().dispatch_pending();
        assert_eq!(rx.try_recv().unwrap().uid().as_deref(), Some("uid-1"));
    }

    #[tokio::test]
    async fn status_conflict_is_retried_without_recreating() {
        let first = pending("uid-1", "1");
        let second = pending("uid-1", "2");
        let written = terminal(pending("uid-1", "3"));
        let (client, requests) = mock_client(move |method, nth| match (method.as_str(), nth) {
            ("GET", 0) => ok(&first),
            ("GET", _) => ok(&second),
            ("PATCH", 0) => api_status(409, "Conflict"),
            _ => ok(&written),
        });
        let (reconcile, index, mut rx, _claims) = reconcile(client);

        index.write().apply(pending("uid-1", "1"));
        let dispatched = rx.try_recv().unwrap();
        reconcile.run(dispatched).await.unwrap();

        assert_eq!(reconcile.instantiator.store().creates.load(Ordering::SeqCst), 1);
        assert_eq!(
            methods(&requests),
            vec![Method::GET, Method::PATCH, Method::GET, Method::PATCH]
        );

        let patches = requests
            .lock()
            .iter()
            .filter(|r| r.method == Method::PATCH)
            .map(|r| serde_json::from_slice::<serde_json::Value>(&r.body).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(patches[0]["metadata"]["resourceVersion"], "1");
        assert_eq!(patches[1]["metadata"]["resourceVersion"], "2");
        assert_eq!(patches[1]["status"]["conditions"][0]["type"], "Ready");
        assert_eq!(patches[1]["status"]["objects"][0]["ref"]["name"], "svc");

        // A successful reconciliation is not handed back to the index.
        index.write().dispatch_pending();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn status_write_stops_when_instance_finished_elsewhere() {
        let first = pending("uid-1", "1");
        let finished = terminal(pending("uid-1", "2"));
        let (client, requests) = mock_client(move |method, nth| match (method.as_str(), nth) {
            ("GET", 0) => ok(&first),
            ("GET", _) => ok(&finished),
            _ => api_status(409, "Conflict"),
        });
        let (reconcile, _index, _rx, _claims) = reconcile(client);

        reconcile.run(pending("uid-1", "1")).await.unwrap();

        assert_eq!(reconcile.instantiator.store().creates.load(Ordering::SeqCst), 1);
        assert_eq!(
            methods(&requests),
            vec![Method::GET, Method::PATCH, Method::GET]
        );
    }
}
