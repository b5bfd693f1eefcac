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

use crate::domain::TokenFlow;
use analyzer_common::{
    domain::{FlowDirection, TimeRange, WalletAddress},
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

impl crate::domain::storage::Storage for Storage {
    #[trace]
    async fn token_flows(
        &self,
        address: &WalletAddress,
        time_range: Option<&TimeRange>,
    ) -> Result<Vec<TokenFlow>, sqlx::Error> {
        let query = indoc! {"
            SELECT token_address, direction, SUM(sol_amount), SUM(token_amount), COUNT(*)
            FROM wallet_transactions
            WHERE wallet_address = $1
                AND ($2 IS NULL OR timestamp >= $2)
                AND ($3 IS NULL OR timestamp <= $3)
            GROUP BY token_address, direction
            ORDER BY token_address, direction
        "};

        sqlx::query_as::<_, (String, String, f64, f64, i64)>(query)
            .bind(address.as_str())
            .bind(time_range.map(|range| range.from))
            .bind(time_range.map(|range| range.to))
            .fetch_all(&*self.pool)
            .await?
            .into_iter()
            .map(
                |(token, direction, sol_volume, token_volume, trade_count)| {
                    Ok(TokenFlow {
                        token_address: token
                            .parse()
                            .map_err(|error: analyzer_common::domain::InvalidAddress| {
                                sqlx::Error::Decode(error.to_string().into())
                            })?,
                        direction: direction.parse::<FlowDirection>().map_err(|error| {
                            sqlx::Error::Decode(error.into())
                        })?,
                        sol_volume,
                        token_volume,
                        trade_count: trade_count as u64,
                    })
                },
            )
            .collect()
    }
}
