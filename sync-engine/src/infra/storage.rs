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

use crate::domain::storage::NewestMark;
use analyzer_common::{
    domain::{TokenBalance, TransactionRecord, WalletAddress, WalletState},
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

type WalletRow = (
    String,
    Option<String>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
);

fn wallet_from_row(row: WalletRow) -> Result<WalletState, sqlx::Error> {
    let (address, signature, newest_ts, oldest_ts, fetched_at, analyzed_at) = row;
    let address = address
        .parse::<WalletAddress>()
        .map_err(|error| sqlx::Error::Decode(error.to_string().into()))?;

    Ok(WalletState {
        address,
        newest_processed_signature: signature,
        newest_processed_timestamp: newest_ts,
        oldest_processed_timestamp: oldest_ts,
        last_successful_fetch_at: fetched_at,
        last_analyzed_end_ts: analyzed_at,
    })
}

const WALLET_COLUMNS: &str = indoc! {"
    address, newest_processed_signature, newest_processed_timestamp,
    oldest_processed_timestamp, last_successful_fetch_at, last_analyzed_end_ts
"};

impl crate::domain::storage::Storage for Storage {
    #[trace]
    async fn ensure_wallet(&self, address: &WalletAddress) -> Result<WalletState, sqlx::Error> {
        sqlx::query("INSERT INTO wallets (address) VALUES ($1) ON CONFLICT (address) DO NOTHING")
            .bind(address.as_str())
            .execute(&*self.pool)
            .await?;

        let query = format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE address = $1");
        let row = sqlx::query_as::<_, WalletRow>(&query)
            .bind(address.as_str())
            .fetch_one(&*self.pool)
            .await?;

        wallet_from_row(row)
    }

    #[trace]
    async fn get_wallet(
        &self,
        address: &WalletAddress,
    ) -> Result<Option<WalletState>, sqlx::Error> {
        let query = format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE address = $1");

        sqlx::query_as::<_, WalletRow>(&query)
            .bind(address.as_str())
            .fetch_optional(&*self.pool)
            .await?
            .map(wallet_from_row)
            .transpose()
    }

    #[trace]
    async fn save_transactions(&self, records: &[TransactionRecord]) -> Result<u64, sqlx::Error> {
        let query = indoc! {"
            INSERT INTO wallet_transactions (
                wallet_address, signature, timestamp, token_address, direction, token_amount,
                sol_amount
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (wallet_address, signature) DO NOTHING
        "};

        let mut inserted = 0;
        for record in records {
            let result = sqlx::query(query)
                .bind(record.wallet_address.as_str())
                .bind(&record.signature)
                .bind(record.timestamp)
                .bind(record.token_address.as_str())
                .bind(record.direction.as_str())
                .bind(record.token_amount)
                .bind(record.sol_amount)
                .execute(&*self.pool)
                .await?;
            inserted += result.rows_affected();
        }

        Ok(inserted)
    }

    #[trace]
    async fn count_transactions(&self, address: &WalletAddress) -> Result<u64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM wallet_transactions WHERE wallet_address = $1")
                .bind(address.as_str())
                .fetch_one(&*self.pool)
                .await?;

        Ok(count as u64)
    }

    #[trace]
    async fn update_watermarks(
        &self,
        address: &WalletAddress,
        newest: Option<&NewestMark>,
        oldest_ts: Option<i64>,
        fetched_at: i64,
    ) -> Result<(), sqlx::Error> {
        // The newest watermark only moves forward, the oldest only backward. Parameters appear
        // in strictly increasing order so the query works with both placeholder schemes.
        let query = indoc! {"
            UPDATE wallets SET
                newest_processed_signature = CASE
                    WHEN $1 IS NOT NULL
                        AND (newest_processed_timestamp IS NULL OR $2 >= newest_processed_timestamp)
                    THEN $1 ELSE newest_processed_signature END,
                newest_processed_timestamp = CASE
                    WHEN $2 IS NOT NULL
                        AND (newest_processed_timestamp IS NULL OR $2 >= newest_processed_timestamp)
                    THEN $2 ELSE newest_processed_timestamp END,
                oldest_processed_timestamp = CASE
                    WHEN $3 IS NOT NULL
                        AND (oldest_processed_timestamp IS NULL OR $3 < oldest_processed_timestamp)
                    THEN $3 ELSE oldest_processed_timestamp END,
                last_successful_fetch_at = $4
            WHERE address = $5
        "};

        sqlx::query(query)
            .bind(newest.map(|newest| newest.signature.clone()))
            .bind(newest.map(|newest| newest.timestamp))
            .bind(oldest_ts)
            .bind(fetched_at)
            .bind(address.as_str())
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace]
    async fn save_balances(
        &self,
        address: &WalletAddress,
        balances: &[TokenBalance],
        fetched_at: i64,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM wallet_balances WHERE wallet_address = $1")
            .bind(address.as_str())
            .execute(&mut *tx)
            .await?;

        let query = indoc! {"
            INSERT INTO wallet_balances (wallet_address, token_address, amount, fetched_at)
            VALUES ($1, $2, $3, $4)
        "};
        for balance in balances {
            sqlx::query(query)
                .bind(address.as_str())
                .bind(balance.token_address.as_str())
                .bind(balance.amount)
                .bind(fetched_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(())
    }
}
