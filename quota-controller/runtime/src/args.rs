use crate::{
    admission::{Admission, Settings},
    core::ObjectCountKinds,
    events::{Recorder, Sweeper},
    metrics::AdmissionMetrics,
    usage::{Exclusions, Extractor, KubeCluster, ScopeResolver},
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{convert::Infallible, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "cluster-quota",
    about = "An admission controller for quotas shared across namespaces"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "cluster_quota=info,warn",
        env = "CLUSTER_QUOTA_LOG"
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

    /// Namespaces carrying this label, with any value, are never governed by
    /// a quota. An empty value disables label-based exclusion.
    #[clap(long, default_value = "clusterquota.io/excluded")]
    exclusion_label: String,

    #[clap(long, default_value = "kube-system,kube-public,kube-node-lease")]
    excluded_namespaces: Names,

    /// Kinds whose object counts may be limited, as `resource[.group][/version]`.
    #[clap(long, default_value = "configmaps,secrets")]
    object_count_resources: ObjectCountKinds,

    /// Extended resources, e.g. `nvidia.com/gpu`, summed from pod requests
    /// and limits in addition to cpu, memory, and ephemeral storage.
    #[clap(long, default_value = "")]
    tracked_resources: Names,

    #[clap(long, default_value = "8000")]
    admission_timeout_ms: u64,

    #[clap(long, default_value = "15")]
    status_staleness_tolerance_secs: u64,

    #[clap(long, default_value = "30")]
    reservation_ttl_secs: u64,

    #[clap(long, default_value = "3600")]
    event_retention_secs: u64,

    #[clap(long, default_value = "300")]
    event_sweep_interval_secs: u64,

    #[clap(long)]
    record_denial_events: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        self.validate()?;
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            exclusion_label,
            excluded_namespaces: Names(excluded_namespaces),
            object_count_resources,
            tracked_resources: Names(tracked_resources),
            admission_timeout_ms,
            status_staleness_tolerance_secs,
            reservation_ttl_secs,
            event_retention_secs,
            event_sweep_interval_secs,
            record_denial_events,
        } = self;

        let mut prom = <Registry>::default();
        let metrics = Arc::new(AdmissionMetrics::register(
            prom.sub_registry_with_prefix("cluster_quota"),
        ));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_server(server)
            .build()
            .await?;

        let client = runtime.client();
        let extractor = Extractor::new(tracked_resources);
        let cluster = Arc::new(KubeCluster::new(
            client.clone(),
            extractor.clone(),
            object_count_resources.clone(),
        ));

        let recorder = if record_denial_events {
            let instance = std::env::var("HOSTNAME").unwrap_or_else(|_| "cluster-quota".to_string());
            Some(Recorder::new(client.clone(), instance))
        } else {
            None
        };

        tokio::spawn(
            Sweeper::new(
                client,
                Duration::from_secs(event_retention_secs),
                Duration::from_secs(event_sweep_interval_secs),
            )
            .run()
            .instrument(info_span!("event_sweeper")),
        );

        let admission = Admission::new(
            cluster,
            metrics,
            Settings {
                resolver: ScopeResolver::new(Exclusions::new(
                    Some(exclusion_label),
                    excluded_namespaces,
                )),
                extractor,
                object_counts: object_count_resources,
                timeout: Duration::from_millis(admission_timeout_ms),
                staleness_tolerance: Duration::from_secs(status_staleness_tolerance_secs),
                reservation_ttl: Duration::from_secs(reservation_ttl_secs),
                recorder,
            },
        );
        info!("Serving admission reviews");
        let runtime = runtime.spawn_server(admission);

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        // A reservation must outlive the window in which status may not yet
        // reflect the usage it stands for.
        if self.reservation_ttl_secs < self.status_staleness_tolerance_secs {
            bail!("--reservation-ttl-secs must be at least --status-staleness-tolerance-secs");
        }
        if self.event_sweep_interval_secs == 0 {
            bail!("--event-sweep-interval-secs must be positive");
        }
        Ok(())
    }
}

/// A comma-separated list of names.
#[derive(Clone, Debug)]
struct Names(Vec<String>);

impl std::str::FromStr for Names {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(
            s.split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }
}
