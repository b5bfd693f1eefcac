// This file is part of wallet-analyzer.
// Copyright (C) 2025 Wallet Analyzer Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::domain::Api;
use anyhow::Context;
use log::warn;
use tokio::{select, signal::unix::Signal, task};

pub async fn run(api: impl Api + Send + 'static, mut sigterm: Signal) -> anyhow::Result<()> {
    let serve_api_task = task::spawn(async move { api.serve().await.context("serving API") });

    select! {
        result = serve_api_task => result
            .context("serve_api_task panicked")
            .and_then(|r| r.context("serve_api_task failed")),

        _ = sigterm.recv() => {
            warn!("SIGTERM received");
            Ok(())
        }
    }
}
