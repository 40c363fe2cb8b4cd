use crate::{
    admission::Admission,
    controller::Controller,
    core::Instantiator,
    index::Index,
    k8s, lease,
    metrics::{ControllerMetrics, IndexMetrics},
    store::KubeObjectStore,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    runtime::watcher,
};
use prometheus_client::registry::Registry;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info_span, Instrument};

// The maximum number of instances waiting to be reconciled. Instances that do
// not fit stay pending in the index until the next dispatch tick.
const DISPATCH_QUEUE_SIZE: usize = 1000;

#[derive(Debug, Parser)]
#[clap(name = "template-controller", about = "Instantiates templates as their requesters")]
pub struct Args {
    #[clap(
        long,
        default_value = "template=info,warn",
        env = "TEMPLATE_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "template-controller")]
    controller_namespace: String,

    #[clap(long, default_value = "template-controller")]
    controller_deployment_name: String,

    /// Timeout for each API call made on behalf of a requester.
    #[clap(long, default_value = "10000")]
    request_timeout_ms: u64,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    #[clap(long, default_value = "16")]
    max_concurrent_reconciles: usize,

    /// How often instances held back from dispatch are retried.
    #[clap(
        long,
        default_value = "10000",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    dispatch_period_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        // Requester clients are built from the same kubeconfig selection as
        // the runtime's client. Resolve it before the runtime takes the args.
        let request_timeout = Duration::from_millis(self.request_timeout_ms);
        let requester_config = requester_config(&self.client, request_timeout).await?;

        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            controller_namespace,
            controller_deployment_name,
            request_timeout_ms: _,
            patch_timeout_ms,
            max_concurrent_reconciles,
            dispatch_period_ms,
        } = self;

        let mut prom = <Registry>::default();
        let instance_metrics = prom.sub_registry_with_prefix("templateinstance");
        let controller_metrics = ControllerMetrics::register(instance_metrics);
        let index_metrics = IndexMetrics::register(instance_metrics.sub_registry_with_prefix("index"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            // The admission webhook records who requested each instance, and
            // the controller acts as that requester. There is no mode without it.
            .with_optional_server(Some(server))
            .build()
            .await?;

        let hostname = std::env::var("HOSTNAME").context("failed to read HOSTNAME")?;

        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &controller_deployment_name,
            &hostname,
        )
        .await?;

        let instantiator =
            Instantiator::new(KubeObjectStore::new(requester_config, request_timeout));

        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_QUEUE_SIZE);
        let index = Index::shared(hostname, claims, dispatch_tx, index_metrics);

        let instances = runtime.watch_all::<k8s::TemplateInstance>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), instances)
                .instrument(info_span!("templateinstances")),
        );

        tokio::spawn(
            Index::run(index.clone(), Duration::from_millis(dispatch_period_ms))
                .instrument(info_span!("dispatch")),
        );

        let controller = Controller::new(
            runtime.client(),
            instantiator,
            index,
            dispatch_rx,
            max_concurrent_reconciles,
            Duration::from_millis(patch_timeout_ms),
            controller_metrics,
        );
        tokio::spawn(controller.run().instrument(info_span!("controller")));

        let runtime = runtime.spawn_server(Admission::new);

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Loads the client configuration selected by the runtime's client flags.
/// A kubeconfig is used when one is found, and the in-cluster service account
/// otherwise. Impersonation flags are ignored since every request is
/// impersonated as its requester.
async fn requester_config(
    client: &kubert::ClientArgs,
    timeout: Duration,
) -> Result<kube::Config> {
    let options = KubeConfigOptions {
        context: client.context.clone(),
        cluster: client.cluster.clone(),
        user: client.user.clone(),
    };
    let loaded = match client.kubeconfig.as_ref() {
        Some(path) => match Kubeconfig::read_from(path) {
            Ok(kubeconfig) => kube::Config::from_custom_kubeconfig(kubeconfig, &options).await,
            Err(error) => Err(error),
        },
        None => kube::Config::from_kubeconfig(&options).await,
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(error) => {
            tracing::debug!(%error, "No usable kubeconfig; using in-cluster configuration");
            kube::Config::incluster().context("failed to load Kubernetes client configuration")?
        }
    };
    config.read_timeout = Some(timeout);
    Ok(config)
}
