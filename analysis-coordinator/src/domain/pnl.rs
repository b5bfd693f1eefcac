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

use analyzer_common::domain::{FlowDirection, TokenAddress, TransactionRecord, WalletAddress};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-token profit and loss over the wallet's local transaction store. Realized PNL uses a
/// weighted average cost basis over acquired tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlTokenResult {
    pub token_address: TokenAddress,
    pub total_sol_spent: f64,
    pub total_sol_received: f64,
    pub realized_pnl_sol: f64,
    pub tokens_in: f64,
    pub tokens_out: f64,
    pub trade_count: u64,
    pub first_trade_at: i64,
    pub last_trade_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlSummary {
    pub wallet_address: WalletAddress,
    pub tokens: Vec<PnlTokenResult>,
    pub net_realized_pnl_sol: f64,
    pub trade_count: u64,
}

/// Deterministic: tokens are keyed and emitted in lexicographic order and records are folded in
/// `(timestamp, signature)` order.
pub fn compute_pnl(address: &WalletAddress, records: &[TransactionRecord]) -> PnlSummary {
    let mut records = records.to_vec();
    records.sort_by(|a, b| {
        (a.timestamp, a.signature.as_str()).cmp(&(b.timestamp, b.signature.as_str()))
    });

    let mut by_token: BTreeMap<TokenAddress, PnlTokenResult> = BTreeMap::new();

    for record in &records {
        let entry = by_token
            .entry(record.token_address.clone())
            .or_insert_with(|| PnlTokenResult {
                token_address: record.token_address.clone(),
                total_sol_spent: 0.0,
                total_sol_received: 0.0,
                realized_pnl_sol: 0.0,
                tokens_in: 0.0,
                tokens_out: 0.0,
                trade_count: 0,
                first_trade_at: record.timestamp,
                last_trade_at: record.timestamp,
            });

        match record.direction {
            FlowDirection::In => {
                entry.tokens_in += record.token_amount;
                entry.total_sol_spent += record.sol_amount;
            }

            FlowDirection::Out => {
                entry.tokens_out += record.token_amount;
                entry.total_sol_received += record.sol_amount;
            }
        }

        entry.trade_count += 1;
        entry.first_trade_at = entry.first_trade_at.min(record.timestamp);
        entry.last_trade_at = entry.last_trade_at.max(record.timestamp);
    }

    for result in by_token.values_mut() {
        result.realized_pnl_sol = if result.tokens_in > 0.0 {
            let average_cost = result.total_sol_spent / result.tokens_in;
            let sold = result.tokens_out.min(result.tokens_in);
            result.total_sol_received - average_cost * sold
        } else {
            // Tokens disposed of without a recorded acquisition, e.g. airdrops.
            result.total_sol_received
        };
    }

    let net_realized_pnl_sol = by_token.values().map(|r| r.realized_pnl_sol).sum();
    let trade_count = by_token.values().map(|r| r.trade_count).sum();

    PnlSummary {
        wallet_address: address.clone(),
        tokens: by_token.into_values().collect(),
        net_realized_pnl_sol,
        trade_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::testing::{address, record};

    #[test]
    fn test_compute_pnl_round_trip_trade() {
        // Buy 100 tokens for 2 SOL, sell 50 for 3 SOL: cost basis 0.02 SOL/token, so the sale
        // realizes 3 - 1 = 2 SOL.
        let records = vec![
            record("s1", 1_000, FlowDirection::In, 100.0, 2.0),
            record("s2", 2_000, FlowDirection::Out, 50.0, 3.0),
        ];

        let summary = compute_pnl(&address(), &records);
        assert_eq!(summary.tokens.len(), 1);

        let token = &summary.tokens[0];
        assert_eq!(token.total_sol_spent, 2.0);
        assert_eq!(token.total_sol_received, 3.0);
        assert!((token.realized_pnl_sol - 2.0).abs() < 1e-9);
        assert_eq!(token.trade_count, 2);
        assert_eq!(token.first_trade_at, 1_000);
        assert_eq!(token.last_trade_at, 2_000);
        assert!((summary.net_realized_pnl_sol - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_compute_pnl_airdrop_disposal() {
        let records = vec![record("s1", 1_000, FlowDirection::Out, 10.0, 0.5)];

        let summary = compute_pnl(&address(), &records);
        assert!((summary.tokens[0].realized_pnl_sol - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_compute_pnl_is_order_independent() {
        let records = vec![
            record("s2", 2_000, FlowDirection::Out, 50.0, 3.0),
            record("s1", 1_000, FlowDirection::In, 100.0, 2.0),
        ];
        let mut reversed = records.clone();
        reversed.reverse();

        assert_eq!(
            compute_pnl(&address(), &records),
            compute_pnl(&address(), &reversed)
        );
    }

    #[test]
    fn test_compute_pnl_empty() {
        let summary = compute_pnl(&address(), &[]);
        assert!(summary.tokens.is_empty());
        assert_eq!(summary.trade_count, 0);
        assert_eq!(summary.net_realized_pnl_sol, 0.0);
    }
}
