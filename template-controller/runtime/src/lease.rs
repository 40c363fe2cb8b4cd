use crate::k8s::{self, Deployment, ObjectMeta, Resource};
use anyhow::Result;
use k8s_openapi::api::coordination::v1 as coordv1;
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_NAME: &str = "template-controller-write";

const CLAIM_PARAMS: kubert::lease::ClaimParams = kubert::lease::ClaimParams {
    lease_duration: time::Duration::from_secs(30),
    renew_grace_period: time::Duration::from_secs(1),
};

/// Ensures the write Lease exists and starts competing for it, so that only
/// one replica instantiates templates at a time.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    let deployment = k8s::Api::<Deployment>::namespaced(runtime.client(), ns)
        .get(deployment_name)
        .await?;

    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    let params = k8s::PatchParams {
        field_manager: Some("template-controller".to_string()),
        ..Default::default()
    };
    match api
        .patch(
            LEASE_NAME,
            &params,
            &k8s::Patch::Apply(lease(ns, &deployment)),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(rsp)) if is_conflict(&rsp) => {
            tracing::debug!("Lease already exists")
        }
        Err(error) => return Err(error.into()),
    }

    let (claims, _task) = kubert::lease::LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, CLAIM_PARAMS)
        .await?;
    Ok(claims)
}

/// The Lease is owned by the controller's Deployment so that it is removed
/// along with it. A resource version of "0" only creates the Lease when it is
/// missing.
fn lease(ns: &str, owner: &Deployment) -> coordv1::Lease {
    coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            resource_version: Some("0".to_string()),
            owner_references: owner.controller_owner_ref(&()).map(|oref| vec![oref]),
            labels: Some(
                [
                    ("app.kubernetes.io/name", "template-controller"),
                    ("app.kubernetes.io/part-of", ns),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    }
}

fn is_conflict(rsp: &k8s::ErrorResponse) -> bool {
    rsp.code == 409
}
