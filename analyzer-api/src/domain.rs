// This file is part of wallet-analyzer.
// Copyright (C) 2025 Wallet Analyzer Contributors
// SPDX-License-Identifier: Apache-2.0

use std::error::Error as StdError;

/// API abstraction.
#[trait_variant::make(Send)]
pub trait Api {
    type Error: StdError + Send + Sync + 'static;

    /// Serve the API until shutdown.
    async fn serve(self) -> Result<(), Self::Error>;
}
