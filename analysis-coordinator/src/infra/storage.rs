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

use crate::domain::{BehaviorProfile, PnlTokenResult};
use analyzer_common::{
    domain::{
        FlowDirection, TokenAddress, TokenMetadata, TransactionRecord, WalletAddress, WalletState,
    },
    infra::pool::Pool,
};
use fastrace::trace;
use indoc::indoc;

/// Unified storage implementation for PostgreSQL (cloud) and SQLite (standalone).
#[derive(Debug, Clone)]
pub struct Storage {
    pool: Pool,
}

impl Storage {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn decode_error<E>(error: E) -> sqlx::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    sqlx::Error::Decode(error.into())
}

impl crate::domain::storage::Storage for Storage {
    #[trace]
    async fn get_wallet(
        &self,
        address: &WalletAddress,
    ) -> Result<Option<WalletState>, sqlx::Error> {
        let query = indoc! {"
            SELECT address, newest_processed_signature, newest_processed_timestamp,
                oldest_processed_timestamp, last_successful_fetch_at, last_analyzed_end_ts
            FROM wallets
            WHERE address = $1
        "};

        sqlx::query_as::<
            _,
            (
                String,
                Option<String>,
                Option<i64>,
                Option<i64>,
                Option<i64>,
                Option<i64>,
            ),
        >(query)
        .bind(address.as_str())
        .fetch_optional(&*self.pool)
        .await?
        .map(
            |(address, signature, newest_ts, oldest_ts, fetched_at, analyzed_at)| {
                Ok(WalletState {
                    address: address.parse().map_err(decode_error)?,
                    newest_processed_signature: signature,
                    newest_processed_timestamp: newest_ts,
                    oldest_processed_timestamp: oldest_ts,
                    last_successful_fetch_at: fetched_at,
                    last_analyzed_end_ts: analyzed_at,
                })
            },
        )
        .transpose()
    }

    #[trace]
    async fn get_transactions(
        &self,
        address: &WalletAddress,
    ) -> Result<Vec<TransactionRecord>, sqlx::Error> {
        let query = indoc! {"
            SELECT wallet_address, signature, timestamp, token_address, direction, token_amount,
                sol_amount
            FROM wallet_transactions
            WHERE wallet_address = $1
            ORDER BY timestamp, signature
        "};

        sqlx::query_as::<_, (String, String, i64, String, String, f64, f64)>(query)
            .bind(address.as_str())
            .fetch_all(&*self.pool)
            .await?
            .into_iter()
            .map(
                |(wallet, signature, timestamp, token, direction, token_amount, sol_amount)| {
                    Ok(TransactionRecord {
                        wallet_address: wallet.parse().map_err(decode_error)?,
                        signature,
                        timestamp,
                        token_address: token.parse().map_err(decode_error)?,
                        direction: direction
                            .parse::<FlowDirection>()
                            .map_err(decode_error)?,
                        token_amount,
                        sol_amount,
                    })
                },
            )
            .collect()
    }

    #[trace]
    async fn save_pnl_results(
        &self,
        address: &WalletAddress,
        results: &[PnlTokenResult],
        computed_at: i64,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM pnl_results WHERE wallet_address = $1")
            .bind(address.as_str())
            .execute(&mut *tx)
            .await?;

        let query = indoc! {"
            INSERT INTO pnl_results (
                wallet_address, token_address, total_sol_spent, total_sol_received,
                realized_pnl_sol, tokens_in, tokens_out, trade_count, first_trade_at,
                last_trade_at, computed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "};
        for result in results {
            sqlx::query(query)
                .bind(address.as_str())
                .bind(result.token_address.as_str())
                .bind(result.total_sol_spent)
                .bind(result.total_sol_received)
                .bind(result.realized_pnl_sol)
                .bind(result.tokens_in)
                .bind(result.tokens_out)
                .bind(result.trade_count as i64)
                .bind(result.first_trade_at)
                .bind(result.last_trade_at)
                .bind(computed_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    #[trace]
    async fn save_behavior_profile(
        &self,
        profile: &BehaviorProfile,
        computed_at: i64,
    ) -> Result<(), sqlx::Error> {
        let active_hours =
            serde_json::to_string(&profile.active_hours).map_err(decode_error)?;

        let query = indoc! {"
            INSERT INTO behavior_profiles (
                wallet_address, total_trades, buy_count, sell_count, buy_sell_ratio,
                session_count, median_hold_seconds, active_hours, trading_style, computed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (wallet_address) DO UPDATE SET
                total_trades = excluded.total_trades,
                buy_count = excluded.buy_count,
                sell_count = excluded.sell_count,
                buy_sell_ratio = excluded.buy_sell_ratio,
                session_count = excluded.session_count,
                median_hold_seconds = excluded.median_hold_seconds,
                active_hours = excluded.active_hours,
                trading_style = excluded.trading_style,
                computed_at = excluded.computed_at
        "};

        sqlx::query(query)
            .bind(profile.wallet_address.as_str())
            .bind(profile.total_trades as i64)
            .bind(profile.buy_count as i64)
            .bind(profile.sell_count as i64)
            .bind(profile.buy_sell_ratio)
            .bind(profile.session_count as i64)
            .bind(profile.median_hold_seconds)
            .bind(active_hours)
            .bind(profile.trading_style.as_str())
            .bind(computed_at)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace]
    async fn set_last_analyzed(
        &self,
        address: &WalletAddress,
        analyzed_at: i64,
    ) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            INSERT INTO wallets (address, last_analyzed_end_ts)
            VALUES ($1, $2)
            ON CONFLICT (address) DO UPDATE SET last_analyzed_end_ts = excluded.last_analyzed_end_ts
        "};

        sqlx::query(query)
            .bind(address.as_str())
            .bind(analyzed_at)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace]
    async fn get_result_tokens(
        &self,
        address: &WalletAddress,
    ) -> Result<Vec<TokenAddress>, sqlx::Error> {
        let query = indoc! {"
            SELECT DISTINCT token_address
            FROM pnl_results
            WHERE wallet_address = $1
            ORDER BY token_address
        "};

        sqlx::query_as::<_, (String,)>(query)
            .bind(address.as_str())
            .fetch_all(&*self.pool)
            .await?
            .into_iter()
            .map(|(token,)| token.parse().map_err(decode_error))
            .collect()
    }

    #[trace]
    async fn save_token_metadata(
        &self,
        metadata: &[TokenMetadata],
        enriched_at: i64,
    ) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            INSERT INTO tokens (address, symbol, name, decimals, enriched_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (address) DO UPDATE SET
                symbol = excluded.symbol,
                name = excluded.name,
                decimals = excluded.decimals,
                enriched_at = excluded.enriched_at
        "};

        for entry in metadata {
            sqlx::query(query)
                .bind(entry.token_address.as_str())
                .bind(&entry.symbol)
                .bind(&entry.name)
                .bind(entry.decimals.map(|d| d as i64))
                .bind(enriched_at)
                .execute(&*self.pool)
                .await?;
        }

        Ok(())
    }
}

#[cfg(all(test, feature = "standalone", not(feature = "cloud")))]
mod tests {
    use crate::domain::{
        storage::Storage as _,
        testing::{address, mint, record},
    };
    use analyzer_common::{
        domain::{FlowDirection, TokenMetadata},
        infra::{
            migrations,
            pool::{Pool, sqlite},
        },
    };
    use anyhow::Context;
    use std::time::Duration;

    async fn storage() -> anyhow::Result<super::Storage> {
        let pool = Pool::new(sqlite::Config {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            busy_timeout: Duration::from_secs(5),
        })
        .await
        .context("create SQLite pool")?;
        migrations::run(&pool).await.context("run migrations")?;

        Ok(super::Storage::new(pool))
    }

    #[tokio::test]
    async fn test_pnl_results_roundtrip() -> anyhow::Result<()> {
        let storage = storage().await?;

        let records = vec![
            record("s1", 1_000, FlowDirection::In, 100.0, 2.0),
            record("s2", 2_000, FlowDirection::Out, 50.0, 3.0),
        ];
        let summary = crate::domain::compute_pnl(&address(), &records);

        storage
            .save_pnl_results(&address(), &summary.tokens, 42)
            .await?;
        let tokens = storage.get_result_tokens(&address()).await?;
        assert_eq!(tokens, vec![mint()]);

        // Saving again replaces instead of accumulating.
        storage
            .save_pnl_results(&address(), &summary.tokens, 43)
            .await?;
        let tokens = storage.get_result_tokens(&address()).await?;
        assert_eq!(tokens.len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_behavior_profile_upsert_and_last_analyzed() -> anyhow::Result<()> {
        let storage = storage().await?;

        let records = vec![record("s1", 1_000, FlowDirection::In, 100.0, 2.0)];
        let profile = crate::domain::compute_behavior(&address(), &records, None, &[]);

        storage.save_behavior_profile(&profile, 42).await?;
        storage.save_behavior_profile(&profile, 43).await?;

        storage.set_last_analyzed(&address(), 44).await?;
        let wallet = storage.get_wallet(&address()).await?.expect("wallet exists");
        assert_eq!(wallet.last_analyzed_end_ts, Some(44));

        Ok(())
    }

    #[tokio::test]
    async fn test_token_metadata_upsert() -> anyhow::Result<()> {
        let storage = storage().await?;

        let metadata = vec![TokenMetadata {
            token_address: mint(),
            symbol: Some("SOL".to_string()),
            name: Some("Wrapped SOL".to_string()),
            decimals: Some(9),
        }];
        storage.save_token_metadata(&metadata, 42).await?;
        storage.save_token_metadata(&metadata, 43).await?;

        Ok(())
    }
}
