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

use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::{str::FromStr, time::Duration};
use thiserror::Error;

/// New type for a SQLite connection pool.
#[derive(Debug, Clone)]
pub struct SqlitePool(sqlx::SqlitePool);

impl SqlitePool {
    /// Create a new connection pool with the given configuration.
    pub async fn new(config: Config) -> Result<Self, Error> {
        let Config {
            url,
            max_connections,
            busy_timeout,
        } = config;

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(Error::Connect)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(Error::Connect)?;

        Ok(Self(pool))
    }
}

impl std::ops::Deref for SqlitePool {
    type Target = sqlx::SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot connect to SQLite")]
    Connect(#[source] sqlx::Error),
}

/// Configuration settings for [SqlitePool].
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Connection URL, e.g. `sqlite://analyzer.db` or `sqlite::memory:`.
    pub url: String,

    #[serde(default = "max_connections_default")]
    pub max_connections: u32,

    #[serde(with = "humantime_serde", default = "busy_timeout_default")]
    pub busy_timeout: Duration,
}

fn max_connections_default() -> u32 {
    4
}

fn busy_timeout_default() -> Duration {
    Duration::from_secs(5)
}
