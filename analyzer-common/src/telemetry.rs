// This file is part of wallet-analyzer.
// Copyright (C) 2025 Wallet Analyzer Contributors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::InstrumentationScope;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use serde::Deserialize;
use std::{borrow::Cow, net::SocketAddr};

/// Telemetry configuration: tracing and metrics.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "tracing")]
    pub tracing_config: TracingConfig,

    #[serde(rename = "metrics")]
    pub metrics_config: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,

    /// OTLP gRPC endpoint; tracing is disabled if not set.
    #[serde(default)]
    pub otlp_exporter_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus exporter listen address; metrics are disabled if not set.
    #[serde(default)]
    pub listen_address: Option<SocketAddr>,
}

/// Initialize logging to stderr, configured via the `RUST_LOG` environment variable.
pub fn init_logging() {
    logforth::starter_log::stderr().apply();
}

/// Initialize fastrace tracing with an OTLP reporter, unless no endpoint is configured.
pub fn init_tracing(config: TracingConfig) {
    let TracingConfig {
        service_name,
        otlp_exporter_endpoint,
    } = config;

    let Some(endpoint) = otlp_exporter_endpoint else {
        return;
    };

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .expect("OTLP span exporter can be built");

    let reporter = fastrace_opentelemetry::OpenTelemetryReporter::new(
        exporter,
        Cow::Owned(Resource::builder().with_service_name(service_name).build()),
        InstrumentationScope::builder("wallet-analyzer").build(),
    );

    fastrace::set_reporter(reporter, fastrace::collector::Config::default());
}

/// Initialize the Prometheus metrics exporter, unless no listen address is configured.
pub fn init_metrics(config: MetricsConfig) {
    let MetricsConfig { listen_address } = config;

    let Some(listen_address) = listen_address else {
        return;
    };

    PrometheusBuilder::new()
        .with_http_listener(listen_address)
        .install()
        .expect("Prometheus exporter can be installed");
}
