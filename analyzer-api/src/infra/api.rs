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

pub mod v1;

use crate::domain::Api;
use analyzer_common::{
    domain::Subscriber,
    infra::{job_store::SqlJobStore, lock_store::SqlLockStore, pool::Pool},
};
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use log::info;
use serde::Deserialize;
use std::{io, net::IpAddr};
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};

#[derive(Clone)]
pub struct AppState<SB> {
    pub pool: Pool,
    pub job_store: SqlJobStore,
    pub lock_store: SqlLockStore,
    pub subscriber: SB,
}

pub struct AxumApi<SB> {
    config: Config,
    state: AppState<SB>,
}

impl<SB> AxumApi<SB>
where
    SB: Subscriber,
{
    pub fn new(config: Config, pool: Pool, subscriber: SB) -> Self {
        let state = AppState {
            job_store: SqlJobStore::new(pool.clone()),
            lock_store: SqlLockStore::new(pool.clone()),
            pool,
            subscriber,
        };

        Self { config, state }
    }
}

impl<SB> Api for AxumApi<SB>
where
    SB: Subscriber,
{
    type Error = AxumApiError;

    async fn serve(self) -> Result<(), Self::Error> {
        let Config {
            address,
            port,
            request_body_limit,
        } = self.config;

        let app = make_app(self.state, request_body_limit as usize);

        let listener = tokio::net::TcpListener::bind((address, port))
            .await
            .map_err(AxumApiError::Bind)?;
        info!(address:?, port; "listening to TCP connections");

        axum::serve(listener, app)
            .await
            .map_err(AxumApiError::Serve)
    }
}

pub fn make_app<SB>(state: AppState<SB>, request_body_limit: usize) -> Router
where
    SB: Subscriber,
{
    Router::new()
        .route("/ready", get(ready::<SB>))
        .nest("/api/v1", v1::make_app())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(request_body_limit))
                .layer(CorsLayer::permissive()),
        )
}

async fn ready<SB>(
    axum::extract::State(state): axum::extract::State<AppState<SB>>,
) -> impl IntoResponse
where
    SB: Subscriber,
{
    match sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&*state.pool)
        .await
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "database not ready").into_response(),
    }
}

#[derive(Debug, Error)]
pub enum AxumApiError {
    #[error("cannot bind tcp listener")]
    Bind(#[source] io::Error),

    #[error("cannot serve API")]
    Serve(#[source] io::Error),
}

/// Configuration settings for [AxumApi].
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub address: IpAddr,
    pub port: u16,

    #[serde(with = "byte_unit_serde", default = "request_body_limit_default")]
    pub request_body_limit: u64,
}

fn request_body_limit_default() -> u64 {
    64 * 1_024
}
