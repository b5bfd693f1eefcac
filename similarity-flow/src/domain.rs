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

pub mod storage;

use analyzer_common::domain::{FlowDirection, TokenAddress, VectorType, WalletAddress};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregated token flow of one wallet, one row per `(token, direction)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenFlow {
    pub token_address: TokenAddress,
    pub direction: FlowDirection,
    pub sol_volume: f64,
    pub token_volume: f64,
    pub trade_count: u64,
}

/// Feature vector keyed by token; the ordered map makes every fold deterministic.
pub type FeatureVector = BTreeMap<TokenAddress, f64>;

/// Build the wallet's feature vector of the requested type from its aggregated token flows.
pub fn build_vector(flows: &[TokenFlow], vector_type: VectorType) -> FeatureVector {
    let mut vector = FeatureVector::new();

    for flow in flows {
        let value = vector.entry(flow.token_address.clone()).or_insert(0.0);

        match vector_type {
            // Net SOL deployed per token: buys add, sells subtract.
            VectorType::Capital => match flow.direction {
                FlowDirection::In => *value += flow.sol_volume,
                FlowDirection::Out => *value -= flow.sol_volume,
            },

            VectorType::Activity => *value += flow.trade_count as f64,
        }
    }

    vector
}

/// Cosine similarity over the union of token keys; 0 for empty vectors.
pub fn cosine_similarity(a: &FeatureVector, b: &FeatureVector) -> f64 {
    let dot = a
        .iter()
        .filter_map(|(token, value)| b.get(token).map(|other| value * other))
        .sum::<f64>();

    let norm_a = a.values().map(|v| v * v).sum::<f64>().sqrt();
    let norm_b = b.values().map(|v| v * v).sum::<f64>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Similarity of one unordered wallet pair, with the tokens contributing to the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairScore {
    pub wallet_a: WalletAddress,
    pub wallet_b: WalletAddress,
    pub score: f64,
    pub shared_tokens: Vec<TokenAddress>,
}

/// Pairwise similarity over all successful wallets. The pair list is the upper triangle of a
/// symmetric matrix; wallets are ordered lexicographically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityReport {
    pub vector_type: VectorType,
    pub wallets: Vec<WalletAddress>,
    pub pairs: Vec<PairScore>,
}

/// Deterministic given identical vectors: wallets and tokens are iterated in their key order.
pub fn pairwise(
    vectors: &BTreeMap<WalletAddress, FeatureVector>,
    vector_type: VectorType,
) -> SimilarityReport {
    let wallets = vectors.keys().cloned().collect::<Vec<_>>();

    let pairs = wallets
        .iter()
        .tuple_combinations()
        .map(|(wallet_a, wallet_b)| {
            let vector_a = &vectors[wallet_a];
            let vector_b = &vectors[wallet_b];

            let shared_tokens = vector_a
                .keys()
                .filter(|token| vector_b.contains_key(*token))
                .cloned()
                .collect();

            PairScore {
                wallet_a: wallet_a.clone(),
                wallet_b: wallet_b.clone(),
                score: cosine_similarity(vector_a, vector_b),
                shared_tokens,
            }
        })
        .collect();

    SimilarityReport {
        vector_type,
        wallets,
        pairs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINT_A: &str = "So11111111111111111111111111111111111111112";
    const MINT_B: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn mint(s: &str) -> TokenAddress {
        s.parse().expect("valid mint")
    }

    fn flow(token: &str, direction: FlowDirection, sol: f64, count: u64) -> TokenFlow {
        TokenFlow {
            token_address: mint(token),
            direction,
            sol_volume: sol,
            token_volume: 100.0,
            trade_count: count,
        }
    }

    #[test]
    fn test_build_vector_capital() {
        let flows = vec![
            flow(MINT_A, FlowDirection::In, 5.0, 3),
            flow(MINT_A, FlowDirection::Out, 2.0, 1),
            flow(MINT_B, FlowDirection::In, 1.0, 1),
        ];

        let vector = build_vector(&flows, VectorType::Capital);
        assert_eq!(vector[&mint(MINT_A)], 3.0);
        assert_eq!(vector[&mint(MINT_B)], 1.0);
    }

    #[test]
    fn test_build_vector_activity() {
        let flows = vec![
            flow(MINT_A, FlowDirection::In, 5.0, 3),
            flow(MINT_A, FlowDirection::Out, 2.0, 1),
        ];

        let vector = build_vector(&flows, VectorType::Activity);
        assert_eq!(vector[&mint(MINT_A)], 4.0);
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        let mut a = FeatureVector::new();
        a.insert(mint(MINT_A), 2.0);
        a.insert(mint(MINT_B), 1.0);

        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-9);

        let mut orthogonal = FeatureVector::new();
        orthogonal.insert(mint("7fUAJdStEuGbc3sM84cKRL6yYaaSstyLSU4ve5oovLS7"), 1.0);
        assert_eq!(cosine_similarity(&a, &orthogonal), 0.0);

        assert_eq!(cosine_similarity(&a, &FeatureVector::new()), 0.0);
    }

    #[test]
    fn test_pairwise_is_deterministic_and_symmetric() {
        let wallet_a: WalletAddress = "2x3N9tHoNvUZwFQpgb3T1V6DcLYtT3HZVEs2GeE7wZq9"
            .parse()
            .expect("valid address");
        let wallet_b: WalletAddress = "4Nd1mYvDgHcwXvLEvFrMvGdL7ZjPQQsjLsg8jW3hQyi1"
            .parse()
            .expect("valid address");

        let mut vector_a = FeatureVector::new();
        vector_a.insert(mint(MINT_A), 2.0);
        let mut vector_b = FeatureVector::new();
        vector_b.insert(mint(MINT_A), 1.0);
        vector_b.insert(mint(MINT_B), 1.0);

        let mut vectors = BTreeMap::new();
        vectors.insert(wallet_a.clone(), vector_a);
        vectors.insert(wallet_b.clone(), vector_b);

        let report = pairwise(&vectors, VectorType::Capital);
        assert_eq!(report.wallets, vec![wallet_a.clone(), wallet_b.clone()]);
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(report.pairs[0].shared_tokens, vec![mint(MINT_A)]);
        assert!(report.pairs[0].score > 0.0 && report.pairs[0].score <= 1.0);

        // Bit-identical on identical inputs.
        assert_eq!(report, pairwise(&vectors, VectorType::Capital));
    }
}
