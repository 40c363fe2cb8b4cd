use crate::{
    identity::{self, Identity, IdentityError},
    k8s::{ObjectReference, TemplateInstance},
    template::{self, ParameterError, Parameters, ProcessedManifest},
};
use tracing::{debug, info, warn};

/// Creates objects on behalf of an explicit identity.
///
/// Implementations must issue the request as `identity` and leave the
/// decision to the cluster's access control. There is no ambient identity
/// to fall back on.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create(
        &self,
        identity: &Identity,
        manifest: &ProcessedManifest,
    ) -> Result<ObjectReference, CreateError>;
}

/// Reads parameter values from a secret on behalf of an explicit identity.
#[async_trait::async_trait]
pub trait ParameterSource: Send + Sync {
    async fn read_parameters(
        &self,
        identity: &Identity,
        namespace: &str,
        secret: &str,
    ) -> Result<Parameters, SecretError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    /// The identity may not create the object.
    #[error("forbidden: {0}")]
    Forbidden(#[source] anyhow::Error),

    /// The object was rejected as malformed, unknown or conflicting.
    #[error("invalid: {0}")]
    Invalid(#[source] anyhow::Error),

    /// The cluster could not be reached or did not answer in time.
    #[error("transport: {0}")]
    Transport(#[source] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(#[source] anyhow::Error),

    #[error("transport: {0}")]
    Transport(#[source] anyhow::Error),
}

#[derive(Debug)]
pub enum InstantiationResult {
    Created(ObjectReference),
    Failed {
        object: ObjectReference,
        error: CreateError,
    },
}

/// Failures that end an instantiation before any object is attempted.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

#[derive(Debug)]
pub enum Outcome {
    Rejected(Rejection),

    /// Results are in manifest order. There are fewer results than
    /// manifests only when a transport failure stopped the batch.
    Attempted {
        total: usize,
        results: Vec<InstantiationResult>,
    },
}

/// Runs the instantiation pipeline for a single instance.
#[derive(Clone, Debug)]
pub struct Instantiator<S> {
    store: S,
}

/// Creates each manifest in order as `identity`.
///
/// A rejected object does not stop later objects from being attempted. A
/// transport failure does, since nothing more can be assumed about the
/// cluster. Objects that were created are never rolled back.
pub async fn create_all<S>(
    store: &S,
    manifests: &[ProcessedManifest],
    identity: &Identity,
) -> Vec<InstantiationResult>
where
    S: ObjectStore + ?Sized,
{
    let mut results = Vec::with_capacity(manifests.len());
    for manifest in manifests {
        let object = manifest.object_ref();
        match store.create(identity, manifest).await {
            Ok(created) => {
                info!(object = %created, user = %identity, "Created object");
                results.push(InstantiationResult::Created(created));
            }
            Err(error @ CreateError::Transport(_)) => {
                warn!(%object, %error, "Aborting instantiation");
                results.push(InstantiationResult::Failed { object, error });
                break;
            }
            Err(error) => {
                info!(%object, user = %identity, %error, "Object rejected");
                results.push(InstantiationResult::Failed { object, error });
            }
        }
    }
    results
}

// === impl Instantiator ===

impl<S> Instantiator<S>
where
    S: ObjectStore + ParameterSource,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn instantiate(&self, instance: &TemplateInstance) -> Outcome {
        let namespace = instance.metadata.namespace.as_deref().unwrap_or_default();

        let (identity, manifests) = match self.prepare(instance, namespace).await {
            Ok(prepared) => prepared,
            Err(rejection) => {
                info!(%rejection, "Instantiation rejected");
                return Outcome::Rejected(rejection);
            }
        };
        debug!(user = %identity, manifests = manifests.len(), "Processed template");

        let results = create_all(&self.store, &manifests, &identity).await;
        Outcome::Attempted {
            total: manifests.len(),
            results,
        }
    }

    async fn prepare(
        &self,
        instance: &TemplateInstance,
        namespace: &str,
    ) -> Result<(Identity, Vec<ProcessedManifest>), Rejection> {
        let identity = identity::resolve(instance)?;

        let bindings = match instance.spec.secret.as_ref() {
            Some(secret) => {
                self.store
                    .read_parameters(&identity, namespace, &secret.name)
                    .await?
            }
            None => Parameters::new(),
        };

        let manifests = template::process(&instance.spec.template, &bindings, namespace)?;
        Ok((identity, manifests))
    }
}

// === impl Outcome ===

impl Outcome {
    /// Objects that exist because of this instantiation, in creation order.
    pub fn created(&self) -> impl Iterator<Item = &ObjectReference> {
        self.results().iter().filter_map(|r| match r {
            InstantiationResult::Created(obj) => Some(obj),
            InstantiationResult::Failed { .. } => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ObjectReference, &CreateError)> {
        self.results().iter().filter_map(|r| match r {
            InstantiationResult::Created(_) => None,
            InstantiationResult::Failed { object, error } => Some((object, error)),
        })
    }

    fn results(&self) -> &[InstantiationResult] {
        match self {
            Self::Rejected(_) => &[],
            Self::Attempted { results, .. } => results,
        }
    }

    /// The number of manifests never attempted because the batch was aborted.
    pub fn not_attempted(&self) -> usize {
        match self {
            Self::Rejected(_) => 0,
            Self::Attempted { total, results } => total.saturating_sub(results.len()),
        }
    }
}

// === impl CreateError ===

impl CreateError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Forbidden(_) => crate::condition::reason::FORBIDDEN,
            Self::Invalid(_) => crate::condition::reason::INVALID,
            Self::Transport(_) => crate::condition::reason::TRANSPORT_ERROR,
        }
    }
}
