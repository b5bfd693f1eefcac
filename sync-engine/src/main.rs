// This file is part of wallet-analyzer.
// Copyright (C) 2025 Wallet Analyzer Contributors
// SPDX-License-Identifier: Apache-2.0

#[cfg(feature = "cloud")]
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

#[cfg(feature = "cloud")]
async fn run() -> anyhow::Result<()> {
    use analyzer_common::{
        config::ConfigExt,
        infra::{
            job_store::SqlJobStore,
            lock_store::SqlLockStore,
            migrations,
            pool::Pool,
            pub_sub::nats::NatsPubSub,
        },
        telemetry,
    };
    use anyhow::Context;
    use log::info;
    use sync_engine::{application, config::Config, infra};
    use tokio::signal::unix::{SignalKind, signal};

    let sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler can be registered");
    let config = Config::load().context("load configuration")?;
    info!(config:?; "starting");

    let Config {
        run_migrations,
        application_config,
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

    let storage = infra::storage::Storage::new(pool.clone());
    let job_store = SqlJobStore::new(pool.clone());
    let lock_store = SqlLockStore::new(pool);
    let provider =
        infra::provider::HttpProvider::new(infra_config.provider_config).context("create provider")?;
    let pub_sub = NatsPubSub::new(infra_config.pub_sub_config)
        .await
        .context("connect to NATS")?;

    application::run(
        application_config,
        storage,
        provider,
        job_store,
        lock_store,
        pub_sub,
        sigterm,
    )
    .await
    .context("run sync engine application")
}

#[cfg(not(feature = "cloud"))]
fn main() {
    unimplemented!("build with the cloud feature or use the analyzer-standalone binary")
}
