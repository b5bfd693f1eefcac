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

use crate::infra::pool::Pool;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Run the database migrations for the built-in backend.
pub async fn run(pool: &Pool) -> Result<(), Error> {
    #[cfg(feature = "cloud")]
    sqlx::migrate!("migrations/postgres").run(&**pool).await?;

    #[cfg(all(feature = "standalone", not(feature = "cloud")))]
    sqlx::migrate!("migrations/sqlite").run(&**pool).await?;

    Ok(())
}

/// Error possibly returned by [run].
#[derive(Debug, Error)]
#[error("cannot run database migrations")]
pub struct Error(#[from] MigrateError);

#[cfg(all(test, feature = "standalone", not(feature = "cloud")))]
mod tests {
    use crate::infra::{
        migrations,
        pool::{Pool, sqlite},
    };
    use anyhow::Context;

    #[tokio::test]
    async fn test_run() -> anyhow::Result<()> {
        let pool = Pool::new(sqlite::Config {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            busy_timeout: std::time::Duration::from_secs(5),
        })
        .await
        .context("create SQLite pool")?;

        migrations::run(&pool).await.context("run migrations")?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(&*pool)
            .await
            .context("count jobs")?;
        assert_eq!(count, 0);

        Ok(())
    }
}
