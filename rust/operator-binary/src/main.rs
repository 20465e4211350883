use std::sync::Arc;

use clap::{crate_description, crate_version, Parser};
use stackable_operator::{logging::TracingTarget, time::Duration, CustomResourceExt};

use crate::{
    backend::{k8s_pki::DEFAULT_CA_LIFETIME, K8sPki},
    controller::ControllerConfig,
    resource::{
        cert::{CertResourceConfig, DEFAULT_EXPIRATION_THRESHOLD},
        metrics::ResourceMetrics,
        retry::RetryPolicy,
    },
    store::{KubePodLister, KubeSecretStore},
    utils::SystemClock,
};

mod backend;
mod controller;
mod crd;
mod resource;
mod store;
mod utils;

pub const APP_NAME: &str = "cert";
pub const OPERATOR_NAME: &str = "cert-operator";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: stackable_operator::cli::Command<CertOperatorRun>,
}

#[derive(clap::Parser)]
struct CertOperatorRun {
    /// Namespace that certificate Secrets are written to
    #[clap(long, env)]
    secret_namespace: String,

    /// Namespace that the CA backend of each cluster is kept in
    #[clap(long, env)]
    pki_namespace: String,

    /// Lifetime of newly generated root CAs
    #[clap(long, env, default_value_t = DEFAULT_CA_LIFETIME)]
    ca_lifetime: Duration,

    /// How long before their expiry certificates are reissued
    #[clap(long, env, default_value_t = DEFAULT_EXPIRATION_THRESHOLD)]
    expiration_threshold: Duration,

    /// How often every CertConfig is reconciled, even when nothing changed
    #[clap(long, env, default_value = "5m")]
    resync_period: Duration,

    /// How soon a reconciliation that had to be skipped is tried again
    #[clap(long, env, default_value = "30s")]
    canceled_requeue_period: Duration,

    /// How many times each failing operation is tried before the reconciliation fails
    #[clap(long, env, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    retry_max_attempts: u32,

    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        stackable_operator::cli::Command::Crd => {
            crd::CertConfig::print_yaml_schema()?;
        }
        stackable_operator::cli::Command::Run(CertOperatorRun {
            secret_namespace,
            pki_namespace,
            ca_lifetime,
            expiration_threshold,
            resync_period,
            canceled_requeue_period,
            retry_max_attempts,
            tracing_target,
        }) => {
            stackable_operator::logging::initialize_logging(
                "CERT_OPERATOR_LOG",
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET.unwrap_or("unknown target"),
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            let client = stackable_operator::client::create_client(Some(
                "certs.stackable.tech".to_string(),
            ))
            .await?;

            // Not exposed yet, but the resources record into it regardless
            let registry = prometheus::Registry::new();
            let metrics = Arc::new(ResourceMetrics::new(&registry)?);
            let chain = controller::resource_chain(
                Arc::new(K8sPki::new(client.clone(), pki_namespace, ca_lifetime)),
                Arc::new(KubeSecretStore::new(client.clone(), OPERATOR_NAME)),
                Arc::new(KubePodLister::new(client.clone())),
                Arc::new(SystemClock),
                CertResourceConfig {
                    expiration_threshold,
                    ..CertResourceConfig::new(secret_namespace, crate_version!())
                },
                &RetryPolicy::with_max_attempts(retry_max_attempts),
                &metrics,
            )?;
            controller::start(
                &client,
                chain,
                ControllerConfig {
                    resync_period: *resync_period,
                    canceled_requeue_period: *canceled_requeue_period,
                },
            )
            .await;
        }
    }
    Ok(())
}
