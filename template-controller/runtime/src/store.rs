use crate::{
    core::{
        CreateError, Identity, ObjectReference, ObjectStore, ParameterSource, Parameters,
        ProcessedManifest, SecretError,
    },
    k8s::{self, ResourceExt},
};
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, bail, Result};
use kube::{
    api::{Api, ApiResource, DynamicObject, GroupVersionKind, PostParams},
    discovery::{self, ApiCapabilities, Scope},
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time;
use tracing::debug;

const FIELD_MANAGER: &str = "template-controller";

/// The number of requester identities whose clients are kept. The cache is
/// emptied once it fills.
const MAX_SESSIONS: usize = 256;

/// Talks to the cluster as whichever identity an instance was requested by.
///
/// The controller's own credentials only ever authenticate the connection;
/// every request carries impersonation headers for the requester. Only the
/// user name and groups are impersonated: the client configuration has no
/// way to carry a requester's uid or extra fields.
pub struct KubeObjectStore {
    config: kube::Config,
    timeout: time::Duration,
    sessions: Mutex<HashMap<Identity, Session>>,
}

/// A client impersonating one identity, along with the kinds it has
/// discovered. Every request of a reconciliation made as the same identity
/// shares one connection pool.
#[derive(Clone)]
struct Session {
    client: k8s::Client,
    kinds: Arc<Mutex<HashMap<GroupVersionKind, (ApiResource, ApiCapabilities)>>>,
}

impl KubeObjectStore {
    pub fn new(config: kube::Config, timeout: time::Duration) -> Self {
        Self {
            config,
            timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn session(&self, identity: &Identity) -> Result<Session, kube::Error> {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(identity) {
            return Ok(session.clone());
        }

        if sessions.len() >= MAX_SESSIONS {
            debug!(sessions = sessions.len(), "Dropping cached requester clients");
            sessions.clear();
        }
        let session = Session {
            client: k8s::Client::try_from(impersonating(self.config.clone(), identity))?,
            kinds: Default::default(),
        };
        sessions.insert(identity.clone(), session.clone());
        Ok(session)
    }

    /// Discovery runs as the requester too, so kinds it cannot see are
    /// reported the same way as kinds that do not exist. Only successful
    /// lookups are cached.
    async fn discover(
        &self,
        session: &Session,
        gvk: &GroupVersionKind,
    ) -> Result<(ApiResource, ApiCapabilities), CreateError> {
        if let Some(found) = session.kinds.lock().get(gvk).cloned() {
            return Ok(found);
        }

        let found = time::timeout(self.timeout, discovery::pinned_kind(&session.client, gvk))
            .await
            .map_err(|_| CreateError::Transport(anyhow!("timed out discovering {}", gvk.kind)))?
            .map_err(create_error)?;
        session.kinds.lock().insert(gvk.clone(), found.clone());
        Ok(found)
    }
}

fn impersonating(mut config: kube::Config, identity: &Identity) -> kube::Config {
    config.auth_info.impersonate = Some(identity.user.clone());
    config.auth_info.impersonate_groups = if identity.groups.is_empty() {
        None
    } else {
        Some(identity.groups.clone())
    };
    config
}

#[async_trait::async_trait]
impl ObjectStore for KubeObjectStore {
    async fn create(
        &self,
        identity: &Identity,
        manifest: &ProcessedManifest,
    ) -> Result<ObjectReference, CreateError> {
        let mut obj = serde_json::from_value::<DynamicObject>(manifest.object().clone())
            .map_err(|error| CreateError::Invalid(error.into()))?;
        let gvk = group_version_kind(&obj).map_err(CreateError::Invalid)?;

        let session = self
            .session(identity)
            .map_err(|error| CreateError::Transport(error.into()))?;
        let (resource, caps) = self.discover(&session, &gvk).await?;

        let client = session.client;
        let api = match caps.scope {
            Scope::Cluster => {
                obj.metadata.namespace = None;
                Api::<DynamicObject>::all_with(client, &resource)
            }
            Scope::Namespaced => {
                let ns = obj.metadata.namespace.clone().unwrap_or_default();
                Api::<DynamicObject>::namespaced_with(client, &ns, &resource)
            }
        };

        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let created = time::timeout(self.timeout, api.create(&params, &obj))
            .await
            .map_err(|_| {
                CreateError::Transport(anyhow!("timed out creating {}", obj.name_any()))
            })?
            .map_err(create_error)?;
        debug!(kind = %resource.kind, name = %created.name_any(), "Created");

        Ok(ObjectReference {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
            namespace: created.metadata.namespace.clone(),
            name: created.name_any(),
            uid: created.metadata.uid.clone(),
        })
    }
}

#[async_trait::async_trait]
impl ParameterSource for KubeObjectStore {
    async fn read_parameters(
        &self,
        identity: &Identity,
        namespace: &str,
        secret: &str,
    ) -> Result<Parameters, SecretError> {
        let session = self
            .session(identity)
            .map_err(|error| SecretError::Transport(error.into()))?;
        let api = k8s::Api::<k8s::Secret>::namespaced(session.client, namespace);

        let found = time::timeout(self.timeout, api.get(secret))
            .await
            .map_err(|_| SecretError::Transport(anyhow!("timed out reading secret {secret}")))?
            .map_err(|error| match api_code(&error) {
                Some(404) => SecretError::NotFound(secret.to_string()),
                Some(401 | 403) => SecretError::Forbidden(error.into()),
                _ => SecretError::Transport(error.into()),
            })?;

        Ok(found
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }
}

fn group_version_kind(obj: &DynamicObject) -> Result<GroupVersionKind> {
    let Some(types) = obj.types.as_ref() else {
        bail!("object has no apiVersion or kind");
    };
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    if version.is_empty() || types.kind.is_empty() {
        bail!("object has no apiVersion or kind");
    }
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

fn api_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(rsp) => Some(rsp.code),
        _ => None,
    }
}

fn create_error(error: kube::Error) -> CreateError {
    match api_code(&error) {
        Some(401 | 403) => CreateError::Forbidden(error.into()),
        Some(code) if code >= 500 => CreateError::Transport(error.into()),
        Some(_) => CreateError::Invalid(error.into()),
        None if matches!(error, kube::Error::Discovery(_)) => CreateError::Invalid(error.into()),
        None => CreateError::Transport(error.into()),
    }
}
