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

pub mod in_mem;

#[cfg(any(feature = "cloud", feature = "standalone"))]
pub use sql::*;

#[cfg(any(feature = "cloud", feature = "standalone"))]
mod sql {
    use crate::{
        domain::{LockKey, LockStore, unix_millis},
        infra::pool::Pool,
    };
    use fastrace::trace;
    use indoc::indoc;
    use std::time::Duration;
    use uuid::Uuid;

    /// Unified sqlx-backed lock store for PostgreSQL (cloud) and SQLite (standalone). A lock row
    /// with `expires_at` in the past counts as absent and may be taken over.
    #[derive(Debug, Clone)]
    pub struct SqlLockStore {
        pool: Pool,
    }

    impl SqlLockStore {
        pub fn new(pool: Pool) -> Self {
            Self { pool }
        }
    }

    impl LockStore for SqlLockStore {
        type Error = sqlx::Error;

        #[trace]
        async fn acquire(
            &self,
            key: &LockKey,
            token: Uuid,
            ttl: Duration,
        ) -> Result<bool, Self::Error> {
            let now = unix_millis();

            let query = indoc! {"
                INSERT INTO locks (key, owner_token, expires_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (key) DO UPDATE SET
                    owner_token = excluded.owner_token,
                    expires_at = excluded.expires_at
                WHERE locks.expires_at <= $4
            "};

            let result = sqlx::query(query)
                .bind(key.as_str())
                .bind(token.to_string())
                .bind(now + ttl.as_millis() as i64)
                .bind(now)
                .execute(&*self.pool)
                .await?;

            Ok(result.rows_affected() > 0)
        }

        #[trace]
        async fn release(&self, key: &LockKey, token: Uuid) -> Result<bool, Self::Error> {
            let query = "DELETE FROM locks WHERE key = $1 AND owner_token = $2";

            let result = sqlx::query(query)
                .bind(key.as_str())
                .bind(token.to_string())
                .execute(&*self.pool)
                .await?;

            Ok(result.rows_affected() > 0)
        }

        #[trace]
        async fn extend(
            &self,
            key: &LockKey,
            token: Uuid,
            ttl: Duration,
        ) -> Result<bool, Self::Error> {
            let now = unix_millis();

            let query = indoc! {"
                UPDATE locks SET expires_at = $1
                WHERE key = $2 AND owner_token = $3 AND expires_at > $4
            "};

            let result = sqlx::query(query)
                .bind(now + ttl.as_millis() as i64)
                .bind(key.as_str())
                .bind(token.to_string())
                .bind(now)
                .execute(&*self.pool)
                .await?;

            Ok(result.rows_affected() > 0)
        }

        #[trace]
        async fn locked(&self, key: &LockKey) -> Result<bool, Self::Error> {
            let query = "SELECT COUNT(*) FROM locks WHERE key = $1 AND expires_at > $2";

            let (count,): (i64,) = sqlx::query_as(query)
                .bind(key.as_str())
                .bind(unix_millis())
                .fetch_one(&*self.pool)
                .await?;

            Ok(count > 0)
        }
    }
}

#[cfg(all(test, feature = "standalone", not(feature = "cloud")))]
mod tests {
    use crate::{
        domain::{LockKey, LockStore, WalletAddress},
        infra::{
            lock_store::SqlLockStore,
            migrations,
            pool::{Pool, sqlite},
        },
    };
    use anyhow::Context;
    use std::time::Duration;
    use uuid::Uuid;

    async fn store() -> anyhow::Result<SqlLockStore> {
        let pool = Pool::new(sqlite::Config {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            busy_timeout: Duration::from_secs(5),
        })
        .await
        .context("create SQLite pool")?;
        migrations::run(&pool).await.context("run migrations")?;

        Ok(SqlLockStore::new(pool))
    }

    #[tokio::test]
    async fn test_mutual_exclusion() -> anyhow::Result<()> {
        let store = store().await?;
        let address = "4Nd1mYvDgHcwXvLEvFrMvGdL7ZjPQQsjLsg8jW3hQyi1"
            .parse::<WalletAddress>()
            .expect("valid address");
        let key = LockKey::sync(&address);
        let ttl = Duration::from_secs(60);

        let holder = Uuid::new_v4();
        let contender = Uuid::new_v4();

        assert!(store.acquire(&key, holder, ttl).await?);
        assert!(!store.acquire(&key, contender, ttl).await?);
        assert!(store.locked(&key).await?);

        // Only the holder can release.
        assert!(!store.release(&key, contender).await?);
        assert!(store.release(&key, holder).await?);
        assert!(!store.locked(&key).await?);

        assert!(store.acquire(&key, contender, ttl).await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() -> anyhow::Result<()> {
        let store = store().await?;
        let address = "4Nd1mYvDgHcwXvLEvFrMvGdL7ZjPQQsjLsg8jW3hQyi1"
            .parse::<WalletAddress>()
            .expect("valid address");
        let key = LockKey::pnl(&address);

        let stale = Uuid::new_v4();
        assert!(store.acquire(&key, stale, Duration::ZERO).await?);
        assert!(!store.locked(&key).await?);

        // An expired holder can neither extend nor block a takeover.
        assert!(!store.extend(&key, stale, Duration::from_secs(60)).await?);

        let takeover = Uuid::new_v4();
        assert!(store.acquire(&key, takeover, Duration::from_secs(60)).await?);

        // The stale holder must not be able to release the takeover's lock.
        assert!(!store.release(&key, stale).await?);
        assert!(store.locked(&key).await?);

        Ok(())
    }
}
