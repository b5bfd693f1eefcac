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

use crate::domain::{MetadataError, MetadataSource};
use analyzer_common::domain::{TokenAddress, TokenMetadata};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// HTTP adapter for a token metadata service.
#[derive(Debug, Clone)]
pub struct HttpMetadataSource {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpMetadataSource {
    /// Create a new metadata client with the given configuration.
    pub fn new(config: Config) -> Result<Self, Error> {
        let Config {
            base_url,
            api_key,
            request_timeout,
        } = config;

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(Error::BuildClient)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
        })
    }
}

impl MetadataSource for HttpMetadataSource {
    async fn token_metadata(&self, token: &TokenAddress) -> Result<TokenMetadata, MetadataError> {
        let url = format!("{}/v1/tokens/{token}", self.base_url);

        let response = self
            .client
            .get(url)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|error| MetadataError::Transient(Box::new(error)))?;

        let status = response.status();
        if !status.is_success() {
            let error = response.error_for_status().expect_err("status is an error");
            return if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                Err(MetadataError::Transient(Box::new(error)))
            } else {
                Err(MetadataError::Permanent(Box::new(error)))
            };
        }

        let metadata = response
            .json::<WireMetadata>()
            .await
            .map_err(|error| MetadataError::Transient(Box::new(error)))?;

        Ok(TokenMetadata {
            token_address: token.clone(),
            symbol: metadata.symbol,
            name: metadata.name,
            decimals: metadata.decimals,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireMetadata {
    symbol: Option<String>,
    name: Option<String>,
    decimals: Option<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot build HTTP client")]
    BuildClient(#[source] reqwest::Error),
}

/// Configuration settings for [HttpMetadataSource].
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub base_url: String,
    pub api_key: String,

    #[serde(with = "humantime_serde", default = "request_timeout_default")]
    pub request_timeout: Duration,
}

fn request_timeout_default() -> Duration {
    Duration::from_secs(30)
}
