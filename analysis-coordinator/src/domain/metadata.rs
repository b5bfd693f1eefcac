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

use analyzer_common::{
    domain::{JobError, TokenAddress, TokenMetadata},
    error::BoxError,
};
use thiserror::Error;

/// Token metadata lookup used by enrichment.
#[trait_variant::make(Send)]
pub trait MetadataSource
where
    Self: Clone + Send + Sync + 'static,
{
    async fn token_metadata(&self, token: &TokenAddress)
    -> Result<TokenMetadata, MetadataError>;
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("transient metadata source failure")]
    Transient(#[source] BoxError),

    #[error("permanent metadata source failure")]
    Permanent(#[source] BoxError),
}

impl From<MetadataError> for JobError {
    fn from(error: MetadataError) -> Self {
        match error {
            MetadataError::Transient(source) => JobError::UpstreamTransient(source),
            MetadataError::Permanent(source) => JobError::UpstreamPermanent(source),
        }
    }
}
