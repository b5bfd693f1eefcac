// This file is part of wallet-analyzer.
// Copyright (C) 2025 Wallet Analyzer Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run_migrations: bool,

    #[serde(rename = "infra")]
    pub infra_config: InfraConfig,

    #[serde(rename = "telemetry")]
    pub telemetry_config: analyzer_common::telemetry::Config,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfraConfig {
    #[cfg(any(feature = "cloud", feature = "standalone"))]
    #[serde(rename = "api")]
    pub api_config: crate::infra::api::Config,

    #[cfg(any(feature = "cloud", feature = "standalone"))]
    #[serde(rename = "storage")]
    pub storage_config: analyzer_common::infra::pool::Config,

    #[cfg(feature = "cloud")]
    #[serde(rename = "pub_sub")]
    pub pub_sub_config: analyzer_common::infra::pub_sub::nats::Config,
}
