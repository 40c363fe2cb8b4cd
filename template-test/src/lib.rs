#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use k8s::api::rbac::v1::{RoleRef, Subject};
use kube::core::NamespaceResourceScope;
use maplit::{btreemap, convert_args};
use serde::{de::DeserializeOwned, Serialize};
use template_controller_k8s_api::{self as k8s, ResourceExt};
use tokio::time;
use tracing::Instrument;

pub const EDIT_USER: &str = "template-test-edituser";
pub const ADMIN_USER: &str = "template-test-adminuser";

const POLL_INTERVAL: time::Duration = time::Duration::from_millis(100);
const POLL_TIMEOUT: time::Duration = time::Duration::from_secs(60);

/// Runs a test with a random namespace that is deleted on test completion
pub async fn with_temp_ns<F, Fut>(test: F)
where
    F: FnOnce(kube::Client, String) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let _tracing = init_tracing();

    let namespace = format!("template-test-{}", random_suffix(6));

    tracing::debug!("initializing client");
    let client = kube::Client::try_default()
        .await
        .expect("failed to initialize k8s client");
    let api = kube::Api::<k8s::Namespace>::all(client.clone());

    tracing::debug!(%namespace, "creating");
    let ns = k8s::Namespace {
        metadata: k8s::ObjectMeta {
            name: Some(namespace.clone()),
            labels: Some(convert_args!(btreemap!(
                "template-test" => std::thread::current().name().unwrap_or(""),
            ))),
            ..Default::default()
        },
        ..Default::default()
    };
    api.create(&post_params(), &ns)
        .await
        .expect("failed to create Namespace");

    tracing::trace!("spawning");
    let test = test(client.clone(), namespace.clone());
    let res = tokio::spawn(test.instrument(tracing::info_span!("test", %namespace))).await;
    if res.is_err() {
        // If the test failed, stop tracing so the log is not polluted with more information about
        // cleanup after the failure was printed.
        drop(_tracing);
    }

    tracing::debug!(%namespace, "deleting");
    api.delete(&namespace, &k8s::DeleteParams::background())
        .await
        .expect("failed to delete Namespace");
    if let Err(err) = res {
        std::panic::resume_unwind(err.into_panic());
    }
}

pub fn random_suffix(len: usize) -> String {
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(len)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

/// Grants `user` the `cluster_role` (e.g. `edit` or `admin`) within `ns` only.
pub async fn bind_user(client: &kube::Client, ns: &str, user: &str, cluster_role: &str) {
    const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

    create(
        client,
        k8s::RoleBinding {
            metadata: k8s::ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(format!("{user}-{cluster_role}")),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: RBAC_GROUP.to_string(),
                kind: "ClusterRole".to_string(),
                name: cluster_role.to_string(),
            },
            subjects: Some(vec![Subject {
                api_group: Some(RBAC_GROUP.to_string()),
                kind: "User".to_string(),
                name: user.to_string(),
                namespace: None,
            }]),
        },
    )
    .await;
}

/// Returns a client that acts as `user`. The test's own credentials must be
/// allowed to impersonate.
pub async fn impersonate(user: &str) -> kube::Client {
    let mut config = kube::Config::infer()
        .await
        .expect("failed to load k8s client configuration");
    config.auth_info.impersonate = Some(user.to_string());
    config.auth_info.impersonate_groups = Some(vec!["system:authenticated".to_string()]);
    kube::Client::try_from(config).expect("failed to build impersonating client")
}

pub async fn create<T>(client: &kube::Client, obj: T) -> T
where
    T: kube::Resource<Scope = NamespaceResourceScope>,
    T: Serialize + DeserializeOwned + Clone + std::fmt::Debug,
    T::DynamicType: Default,
{
    let api = kube::Api::namespaced(client.clone(), &obj.namespace().expect("must have namespace"));
    api.create(&post_params(), &obj)
        .await
        .expect("failed to create resource")
}

pub fn mk_instance(
    ns: &str,
    name: &str,
    objects: Vec<serde_json::Value>,
    parameters: Vec<k8s::Parameter>,
    secret: Option<&str>,
) -> k8s::TemplateInstance {
    k8s::TemplateInstance {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: k8s::TemplateInstanceSpec {
            template: k8s::Template {
                objects,
                parameters,
                ..Default::default()
            },
            secret: secret.map(|name| k8s::SecretReference {
                name: name.to_string(),
            }),
            requester: None,
        },
        status: None,
    }
}

pub fn mk_service(ns: &str, name: &str) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name, "namespace": ns },
        "spec": { "ports": [{ "port": 1 }] },
    })
}

/// Polls the named resource until `test` holds, panicking after a minute.
pub async fn await_condition<T>(
    client: &kube::Client,
    ns: &str,
    name: &str,
    test: impl Fn(Option<&T>) -> bool,
) -> Option<T>
where
    T: kube::Resource<Scope = NamespaceResourceScope>,
    T: DeserializeOwned + Clone + std::fmt::Debug,
    T::DynamicType: Default,
{
    let api = kube::Api::<T>::namespaced(client.clone(), ns);
    let poll = async {
        loop {
            let obj = api.get_opt(name).await.expect("failed to read resource");
            if test(obj.as_ref()) {
                return obj;
            }
            time::sleep(POLL_INTERVAL).await;
        }
    };
    time::timeout(POLL_TIMEOUT, poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {ns}/{name}"))
}

/// Waits for the controller to write a terminal condition.
pub async fn await_terminal(client: &kube::Client, ns: &str, name: &str) -> k8s::TemplateInstance {
    await_condition(client, ns, name, |obj: Option<&k8s::TemplateInstance>| {
        obj.is_some_and(k8s::TemplateInstance::is_terminal)
    })
    .await
    .expect("TemplateInstance must exist")
}

fn post_params() -> k8s::PostParams {
    k8s::PostParams {
        dry_run: false,
        field_manager: Some("template-test".to_string()),
    }
}

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "template=trace,debug".parse().unwrap()),
            )
            .finish(),
    )
}
