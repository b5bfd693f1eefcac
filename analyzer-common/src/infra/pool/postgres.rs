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

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use std::{str::FromStr, time::Duration};
use thiserror::Error;

/// New type for a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresPool(sqlx::PgPool);

impl PostgresPool {
    /// Create a new connection pool with the given configuration.
    pub async fn new(config: Config) -> Result<Self, Error> {
        let Config {
            host,
            port,
            dbname,
            user,
            password,
            sslmode,
            max_connections,
            idle_timeout,
            max_lifetime,
        } = config;

        let sslmode = PgSslMode::from_str(&sslmode).map_err(|_| Error::InvalidSslMode(sslmode))?;

        let options = PgConnectOptions::new()
            .host(&host)
            .port(port)
            .database(&dbname)
            .username(&user)
            .password(password.expose_secret())
            .ssl_mode(sslmode);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(idle_timeout)
            .max_lifetime(max_lifetime)
            .connect_with(options)
            .await
            .map_err(Error::Connect)?;

        Ok(Self(pool))
    }
}

impl std::ops::Deref for PostgresPool {
    type Target = sqlx::PgPool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot connect to PostgreSQL")]
    Connect(#[source] sqlx::Error),

    #[error("invalid sslmode {0}")]
    InvalidSslMode(String),
}

/// Configuration settings for [PostgresPool].
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: SecretString,

    #[serde(default = "sslmode_default")]
    pub sslmode: String,

    #[serde(default = "max_connections_default")]
    pub max_connections: u32,

    #[serde(with = "humantime_serde", default = "idle_timeout_default")]
    pub idle_timeout: Duration,

    #[serde(with = "humantime_serde", default = "max_lifetime_default")]
    pub max_lifetime: Duration,
}

fn sslmode_default() -> String {
    "prefer".to_string()
}

fn max_connections_default() -> u32 {
    10
}

fn idle_timeout_default() -> Duration {
    Duration::from_secs(60)
}

fn max_lifetime_default() -> Duration {
    Duration::from_secs(5 * 60)
}
