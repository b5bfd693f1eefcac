// This file is part of wallet-analyzer.
// Copyright (C) 2025 Wallet Analyzer Contributors
// SPDX-License-Identifier: Apache-2.0

//! All services of the wallet analyzer in one process, backed by SQLite and in-process pub/sub.

#[cfg(feature = "standalone")]
#[tokio::main]
async fn main() {
    use analyzer_common::telemetry;
    use log::error;
    use std::panic;

    telemetry::init_logging();
    panic::set_hook(Box::new(|panic| error!(panic:%; "process panicked")));

    if let Err(error) = run().await {
        let backtrace = error.backtrace();
        let error = format!("{error:#}");
        error!(error, backtrace:%; "process exited with ERROR");
        std::process::exit(1);
    }
}

#[cfg(feature = "standalone")]
#[derive(Debug, Clone, serde::Deserialize)]
struct Config {
    #[serde(default = "run_migrations_default")]
    run_migrations: bool,

    #[serde(rename = "sync")]
    sync_config: sync_engine::application::Config,

    #[serde(rename = "analysis")]
    analysis_config: analysis_coordinator::application::Config,

    #[serde(rename = "similarity")]
    similarity_config: similarity_flow::application::Config,

    #[serde(rename = "infra")]
    infra_config: InfraConfig,

    #[serde(rename = "telemetry")]
    telemetry_config: analyzer_common::telemetry::Config,
}

#[cfg(feature = "standalone")]
#[derive(Debug, Clone, serde::Deserialize)]
struct InfraConfig {
    #[serde(rename = "storage")]
    storage_config: analyzer_common::infra::pool::Config,

    #[serde(rename = "provider")]
    provider_config: sync_engine::infra::provider::Config,

    #[serde(rename = "metadata")]
    metadata_config: analysis_coordinator::infra::metadata::Config,

    #[serde(rename = "api")]
    api_config: analyzer_api::infra::api::Config,
}

#[cfg(feature = "standalone")]
fn run_migrations_default() -> bool {
    true
}

#[cfg(feature = "standalone")]
async fn run() -> anyhow::Result<()> {
    use analyzer_api::infra::api::AxumApi;
    use analyzer_common::{
        config::ConfigExt,
        infra::{
            job_store::SqlJobStore,
            lock_store::SqlLockStore,
            migrations,
            pool::Pool,
            pub_sub::in_mem::InMemPubSub,
        },
        telemetry,
    };
    use anyhow::Context;
    use log::{info, warn};
    use tokio::{
        select,
        signal::unix::{Signal, SignalKind, signal},
        task,
    };

    fn sigterm() -> Signal {
        signal(SignalKind::terminate()).expect("SIGTERM handler can be registered")
    }

    let config = Config::load().context("load configuration")?;
    info!(config:?; "starting");

    let Config {
        run_migrations,
        sync_config,
        analysis_config,
        similarity_config,
        infra_config,
        telemetry_config:
            telemetry::Config {
                tracing_config,
                metrics_config,
            },
    } = config;

    telemetry::init_tracing(tracing_config);
    telemetry::init_metrics(metrics_config);

    let pool = Pool::new(infra_config.storage_config)
        .await
        .context("create database pool")?;
    if run_migrations {
        migrations::run(&pool).await.context("run migrations")?;
    }

    let job_store = SqlJobStore::new(pool.clone());
    let lock_store = SqlLockStore::new(pool.clone());
    let pub_sub = InMemPubSub::default();

    let provider = sync_engine::infra::provider::HttpProvider::new(infra_config.provider_config)
        .context("create provider")?;
    let metadata_source =
        analysis_coordinator::infra::metadata::HttpMetadataSource::new(infra_config.metadata_config)
            .context("create metadata source")?;

    let sync_task = task::spawn(sync_engine::application::run(
        sync_config,
        sync_engine::infra::storage::Storage::new(pool.clone()),
        provider,
        job_store.clone(),
        lock_store.clone(),
        pub_sub.clone(),
        sigterm(),
    ));

    let analysis_task = task::spawn(analysis_coordinator::application::run(
        analysis_config,
        analysis_coordinator::infra::storage::Storage::new(pool.clone()),
        metadata_source,
        job_store.clone(),
        lock_store.clone(),
        pub_sub.clone(),
        sigterm(),
    ));

    let similarity_task = task::spawn(similarity_flow::application::run(
        similarity_config,
        similarity_flow::infra::storage::Storage::new(pool.clone()),
        job_store.clone(),
        pub_sub.clone(),
        sigterm(),
    ));

    let api = AxumApi::new(infra_config.api_config, pool, pub_sub.clone());
    let api_task = task::spawn(analyzer_api::application::run(api, sigterm()));

    select! {
        result = sync_task => result
            .context("sync_task panicked")
            .and_then(|r| r.context("sync_task failed")),

        result = analysis_task => result
            .context("analysis_task panicked")
            .and_then(|r| r.context("analysis_task failed")),

        result = similarity_task => result
            .context("similarity_task panicked")
            .and_then(|r| r.context("similarity_task failed")),

        result = api_task => {
            warn!("API task completed");
            result
                .context("api_task panicked")
                .and_then(|r| r.context("api_task failed"))
        }
    }
}

#[cfg(not(feature = "standalone"))]
fn main() {
    unimplemented!("the standalone binary requires the standalone feature")
}
