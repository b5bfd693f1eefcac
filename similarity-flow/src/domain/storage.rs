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
use analyzer_common::domain::{TimeRange, WalletAddress};

/// Storage abstraction for similarity inputs.
#[trait_variant::make(Send)]
pub trait Storage
where
    Self: Clone + Send + Sync + 'static,
{
    /// The wallet's aggregated token flows within the optional time range, ordered by
    /// `(token, direction)`.
    async fn token_flows(
        &self,
        address: &WalletAddress,
        time_range: Option<&TimeRange>,
    ) -> Result<Vec<TokenFlow>, sqlx::Error>;
}
