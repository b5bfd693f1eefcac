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

use analyzer_common::domain::{
    FlowDirection, TimeRange, TokenAddress, TransactionRecord, WalletAddress,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Two trades further apart than this belong to different sessions.
const SESSION_GAP_SECONDS: i64 = 30 * 60;

const HOUR_SECONDS: i64 = 60 * 60;
const DAY_SECONDS: i64 = 24 * HOUR_SECONDS;

/// Trading style derived from the median holding time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TradingStyle {
    Scalper,
    DayTrader,
    SwingTrader,
    PositionHolder,
}

impl TradingStyle {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TradingStyle::Scalper => "scalper",
            TradingStyle::DayTrader => "day-trader",
            TradingStyle::SwingTrader => "swing-trader",
            TradingStyle::PositionHolder => "position-holder",
        }
    }

    fn from_median_hold(median_hold_seconds: Option<i64>) -> Self {
        match median_hold_seconds {
            Some(hold) if hold < HOUR_SECONDS => TradingStyle::Scalper,
            Some(hold) if hold < DAY_SECONDS => TradingStyle::DayTrader,
            Some(hold) if hold < 7 * DAY_SECONDS => TradingStyle::SwingTrader,
            _ => TradingStyle::PositionHolder,
        }
    }
}

impl std::str::FromStr for TradingStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scalper" => Ok(TradingStyle::Scalper),
            "day-trader" => Ok(TradingStyle::DayTrader),
            "swing-trader" => Ok(TradingStyle::SwingTrader),
            "position-holder" => Ok(TradingStyle::PositionHolder),
            other => Err(format!("unknown trading style {other}")),
        }
    }
}

/// Behavioral profile of a wallet: trade mix, session structure, holding pattern and activity
/// distribution over hours of day (UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorProfile {
    pub wallet_address: WalletAddress,
    pub total_trades: u64,
    pub buy_count: u64,
    pub sell_count: u64,
    pub buy_sell_ratio: f64,
    pub session_count: u64,
    pub median_hold_seconds: Option<i64>,
    pub active_hours: Vec<u64>,
    pub trading_style: TradingStyle,
}

/// Deterministic: records are folded in `(timestamp, signature)` order after filtering.
pub fn compute_behavior(
    address: &WalletAddress,
    records: &[TransactionRecord],
    time_range: Option<&TimeRange>,
    exclude_mints: &[TokenAddress],
) -> BehaviorProfile {
    let mut records = records
        .iter()
        .filter(|record| time_range.is_none_or(|range| range.contains(record.timestamp)))
        .filter(|record| !exclude_mints.contains(&record.token_address))
        .cloned()
        .collect::<Vec<_>>();
    records.sort_by(|a, b| {
        (a.timestamp, a.signature.as_str()).cmp(&(b.timestamp, b.signature.as_str()))
    });

    let total_trades = records.len() as u64;
    let buy_count = records
        .iter()
        .filter(|r| r.direction == FlowDirection::In)
        .count() as u64;
    let sell_count = total_trades - buy_count;
    let buy_sell_ratio = buy_count as f64 / (sell_count.max(1)) as f64;

    let session_count = count_sessions(&records);
    let median_hold_seconds = median_hold(&records);

    let mut active_hours = vec![0_u64; 24];
    for record in &records {
        let hour = record.timestamp.rem_euclid(DAY_SECONDS) / HOUR_SECONDS;
        active_hours[hour as usize] += 1;
    }

    BehaviorProfile {
        wallet_address: address.clone(),
        total_trades,
        buy_count,
        sell_count,
        buy_sell_ratio,
        session_count,
        median_hold_seconds,
        active_hours,
        trading_style: TradingStyle::from_median_hold(median_hold_seconds),
    }
}

fn count_sessions(records: &[TransactionRecord]) -> u64 {
    if records.is_empty() {
        return 0;
    }

    let gaps = records
        .iter()
        .tuple_windows()
        .filter(|(previous, next)| next.timestamp - previous.timestamp > SESSION_GAP_SECONDS)
        .count() as u64;

    gaps + 1
}

/// Median time between the first acquisition of a token and its first subsequent disposal.
fn median_hold(records: &[TransactionRecord]) -> Option<i64> {
    let mut first_buy: BTreeMap<&TokenAddress, i64> = BTreeMap::new();
    let mut holds = Vec::new();

    for record in records {
        match record.direction {
            FlowDirection::In => {
                first_buy.entry(&record.token_address).or_insert(record.timestamp);
            }

            FlowDirection::Out => {
                if let Some(bought_at) = first_buy.remove(&record.token_address) {
                    holds.push(record.timestamp - bought_at);
                }
            }
        }
    }

    if holds.is_empty() {
        return None;
    }

    holds.sort_unstable();
    Some(holds[holds.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::testing::{address, record, record_for_mint};

    #[test]
    fn test_compute_behavior_counts_and_style() {
        let records = vec![
            record("s1", 1_000, FlowDirection::In, 100.0, 1.0),
            record("s2", 1_300, FlowDirection::Out, 100.0, 1.2),
            record("s3", 10_000, FlowDirection::In, 50.0, 0.5),
        ];

        let profile = compute_behavior(&address(), &records, None, &[]);
        assert_eq!(profile.total_trades, 3);
        assert_eq!(profile.buy_count, 2);
        assert_eq!(profile.sell_count, 1);
        assert_eq!(profile.buy_sell_ratio, 2.0);
        // 300 second hold makes a scalper.
        assert_eq!(profile.median_hold_seconds, Some(300));
        assert_eq!(profile.trading_style, TradingStyle::Scalper);
        // Gap between s2 and s3 exceeds the session gap.
        assert_eq!(profile.session_count, 2);
    }

    #[test]
    fn test_compute_behavior_never_sold() {
        let records = vec![record("s1", 1_000, FlowDirection::In, 100.0, 1.0)];

        let profile = compute_behavior(&address(), &records, None, &[]);
        assert_eq!(profile.median_hold_seconds, None);
        assert_eq!(profile.trading_style, TradingStyle::PositionHolder);
    }

    #[test]
    fn test_compute_behavior_filters() {
        let excluded: TokenAddress = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"
            .parse()
            .expect("valid mint");
        let records = vec![
            record("s1", 1_000, FlowDirection::In, 100.0, 1.0),
            record_for_mint("s2", 2_000, FlowDirection::In, excluded.clone()),
            record("s3", 500_000, FlowDirection::In, 10.0, 0.1),
        ];

        let range = TimeRange {
            from: 0,
            to: 10_000,
        };
        let profile = compute_behavior(&address(), &records, Some(&range), &[excluded]);
        assert_eq!(profile.total_trades, 1);
    }

    #[test]
    fn test_active_hours_histogram() {
        // 3600 seconds into the day lands in hour 1.
        let records = vec![record("s1", 3_600, FlowDirection::In, 1.0, 0.1)];

        let profile = compute_behavior(&address(), &records, None, &[]);
        assert_eq!(profile.active_hours[1], 1);
        assert_eq!(profile.active_hours.iter().sum::<u64>(), 1);
    }
}
