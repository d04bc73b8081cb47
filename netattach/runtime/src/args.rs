use crate::{
    config::{EndpointsConfig, ServiceConfig},
    controller::{Controller, ControllerMetrics},
    core::{
        scheduler::{self, BoundedFrequency, Params},
        ErrorSink,
    },
    crictl::Crictl,
    errors::LogErrors,
    pods::NodePods,
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::{
    api::{ApiResource, DynamicObject},
    runtime::{watcher, WatchStreamExt},
    Api,
};
use prometheus_client::registry::Registry;
use std::{ffi::OsString, num::NonZeroU32, path::PathBuf, sync::Arc};
use tokio::{sync::watch, time::Duration};
use tracing::{debug, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "netattach",
    about = "Maintains the network namespaces of the workloads on a node"
)]
pub struct Args {
    #[clap(long, default_value = "netattach=info,warn", env = "NETATTACH_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The node whose workloads are tracked.
    #[clap(long, env = "NODE_NAME")]
    node_name: String,

    /// The minimum time between syncs, except when bursting.
    #[clap(long, default_value = "5000")]
    min_sync_period_ms: u64,

    /// The maximum time between syncs.
    #[clap(long, default_value = "10000")]
    sync_period_ms: u64,

    /// The number of syncs that may run back-to-back after an idle period.
    #[clap(long, default_value = "2")]
    burst_syncs: NonZeroU32,

    #[clap(long, default_value = "crictl")]
    crictl_path: PathBuf,

    /// The CRI endpoint passed to crictl. When unset, crictl's own configuration applies.
    #[clap(long)]
    runtime_endpoint: Option<String>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse_from_args(std::env::args_os())?.run().await
    }

    /// Exits for `--help` and `--version`. Invalid arguments are returned as errors so that they
    /// fail startup like any other error.
    fn parse_from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        match Self::try_parse_from(args) {
            Ok(args) => Ok(args),
            Err(error) if !error.use_stderr() => error.exit(),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            node_name,
            min_sync_period_ms,
            sync_period_ms,
            burst_syncs,
            crictl_path,
            runtime_endpoint,
        } = self;

        let mut prom = <Registry>::default();
        let sync_metrics = scheduler::Metrics::register(prom.sub_registry_with_prefix("sync"));
        let errors = LogErrors::register(prom.sub_registry_with_prefix("errors"));
        let netns_metrics = ControllerMetrics::register(prom.sub_registry_with_prefix("netns"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        // Validate the sync parameters before connecting to the cluster.
        let runner = BoundedFrequency::new(
            "sync-runner",
            Params {
                min_period: Duration::from_millis(min_sync_period_ms),
                max_period: Duration::from_millis(sync_period_ms),
                burst: burst_syncs,
            },
            sync_metrics,
        )?;

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let errors: Arc<dyn ErrorSink> = Arc::new(errors);
        let client = runtime.client();
        let controller = Arc::new(Controller::new(
            node_name,
            Arc::new(NodePods::new(client.clone())),
            Arc::new(Crictl::new(crictl_path, runtime_endpoint)),
            errors.clone(),
            runner.trigger(),
            netns_metrics,
        ));

        let mut services = ServiceConfig::new(errors.clone());
        services.register_handler(controller.clone());
        let mut endpoints = EndpointsConfig::new(errors.clone());
        endpoints.register_handler(controller.clone());

        let services_synced = services.synced();
        let endpoints_synced = endpoints.synced();

        tokio::spawn(
            services
                .run(watch_all::<Service>(&client), runtime.shutdown_handle())
                .instrument(info_span!("services")),
        );
        tokio::spawn(
            endpoints
                .run(watch_all::<Endpoints>(&client), runtime.shutdown_handle())
                .instrument(info_span!("endpoints")),
        );

        tokio::spawn(log_published(controller.netns()).instrument(info_span!("netns")));

        // The first sync waits for both caches so that it observes a complete view of the cluster.
        let initialized = runtime.initialized_handle();
        let trigger = runner.trigger();
        let shutdown = runtime.shutdown_handle();
        tokio::spawn(
            async move {
                if !wait_synced(services_synced, endpoints_synced).await {
                    debug!("Stopped before syncing");
                    return;
                }
                info!("Caches synced");
                drop(initialized);
                trigger.request_run();
                runner
                    .run(
                        move || {
                            let controller = controller.clone();
                            async move { controller.reconcile().await }
                        },
                        errors,
                        shutdown,
                    )
                    .await
            }
            .instrument(info_span!("sync")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Watches all resources of a kind across the cluster as untyped objects.
fn watch_all<K>(
    client: &kube::Client,
) -> impl Stream<Item = watcher::Result<watcher::Event<DynamicObject>>> + Send + 'static
where
    K: kube::Resource<DynamicType = ()>,
{
    let api = Api::<DynamicObject>::all_with(client.clone(), &ApiResource::erase::<K>(&()));
    watcher(api, watcher::Config::default()).default_backoff()
}

async fn wait_synced(
    mut services: crate::config::Synced,
    mut endpoints: crate::config::Synced,
) -> bool {
    services.wait().await && endpoints.wait().await
}

async fn log_published(mut netns: watch::Receiver<Arc<crate::core::netns::NetnsMap>>) {
    while netns.changed().await.is_ok() {
        let containers = netns.borrow_and_update().len();
        debug!(containers, "Published network namespaces");
    }
}
